//! Library-wide constants.
//!
//! Only the values callers are expected to reference are exported; the
//! clock-skew tolerance and fence thresholds are internal policy and not
//! user-configurable.

/// Default lock time-to-live applied when the caller does not choose one.
pub const DEFAULT_TTL_MS: i64 = 30_000;

/// Maximum UTF-8 byte length of a user-supplied lock key (after NFC
/// normalisation).
pub const MAX_KEY_LENGTH_BYTES: usize = 512;

/// Clock-skew allowance added to `expires_at_ms` before a record is declared
/// expired. Uniform across every backend; not configurable.
pub(crate) const TOLERANCE_MS: i64 = 1_000;

/// Fence counter ceiling. An acquire that would push the counter past this
/// value fails with an internal error and writes no lock record.
pub(crate) const FENCE_MAX: u64 = 900_000_000_000_000;

/// Fence values above this threshold still succeed but log a warning; the
/// counter is within an order of magnitude of [`FENCE_MAX`].
pub(crate) const FENCE_WARN: u64 = 90_000_000_000_000;

/// Width of the zero-padded decimal fence representation. Fifteen digits
/// cover every value up to [`FENCE_MAX`] and make lexicographic order agree
/// with numeric order.
pub(crate) const FENCE_DIGITS: usize = 15;

/// Exact length of a lock ID: 16 random bytes, base64url without padding.
pub(crate) const LOCK_ID_LENGTH: usize = 22;

/// Number of leading SHA-256 bytes kept for sanitised digests (96 bits).
pub(crate) const KEY_HASH_BYTES: usize = 12;

/// Byte budget for derived storage keys across all bundled backends.
pub(crate) const STORAGE_KEY_LIMIT_BYTES: usize = 512;

/// Bytes reserved next to a storage key so the fence-key derivation for the
/// same key also fits the budget (`"fence:"` plus slack).
pub(crate) const STORAGE_KEY_RESERVE_BYTES: usize = 8;
