//! Identifiers, digests, fence formatting, and storage-key derivation.
//!
//! Everything identity-shaped lives here: 128-bit lock IDs, the 96-bit
//! SHA-256 digests used by sanitised diagnostics, the 15-digit fence
//! representation, and the truncation-safe mapping from user keys to
//! substrate keys. Both bundled backend families share these helpers, so a
//! key always digests and truncates the same way no matter where the lock
//! is stored.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use crate::constants::{FENCE_DIGITS, FENCE_MAX, FENCE_WARN, KEY_HASH_BYTES, LOCK_ID_LENGTH};
use crate::error::{LockError, Result};

/// Generates a fresh lock ID: 16 bytes from the thread-local CSPRNG,
/// base64url-encoded without padding. Always exactly 22 characters from
/// `[A-Za-z0-9_-]`.
pub fn generate_lock_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let id = URL_SAFE_NO_PAD.encode(bytes);
    debug_assert_eq!(id.len(), LOCK_ID_LENGTH);
    id
}

/// Digests a user key for sanitised output: NFC-normalise, UTF-8 encode,
/// SHA-256, keep the first 12 bytes as lowercase hex (96 bits).
pub fn hash_key(key: &str) -> String {
    let normalized: String = key.nfc().collect();
    truncated_sha256_hex(normalized.as_bytes())
}

/// Digests a lock ID the same way user keys are digested. Lock IDs are
/// already ASCII so no normalisation applies.
pub fn hash_lock_id(lock_id: &str) -> String {
    truncated_sha256_hex(lock_id.as_bytes())
}

fn truncated_sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest[..KEY_HASH_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Formats a fence counter value as a 15-digit zero-padded decimal string.
///
/// Values above `9*10^14` are rejected with an internal error (the counter
/// must never wrap or widen); values above `9*10^13` succeed but log a
/// warning so operators see the ceiling approaching. Lexicographic order on
/// the output coincides with numeric order.
///
/// # Errors
///
/// [`LockError::Internal`] when `value` exceeds the fence ceiling.
pub fn format_fence(value: u64) -> Result<String> {
    if value > FENCE_MAX {
        return Err(LockError::internal(format!(
            "fence counter overflow: {value} exceeds {FENCE_MAX}"
        )));
    }
    if value > FENCE_WARN {
        warn!(fence = value, "fence counter approaching overflow ceiling");
    }
    Ok(format!("{value:0width$}", width = FENCE_DIGITS))
}

/// Derives the substrate key for a user key.
///
/// When `prefix`, a separating colon, the UTF-8 user key, and `reserve`
/// spare bytes all fit in `byte_limit`, the result is `{prefix}:{user_key}`
/// verbatim (just `{user_key}` when the prefix is empty). Otherwise the full
/// prefixed key is hashed with SHA-256 and the first 16 bytes are
/// base64url-encoded into a 22-character surrogate: `{prefix}:{surrogate}`.
///
/// `reserve` leaves room for sibling keys the backend derives from this one
/// (such as the fence key) so they stay within the same budget.
///
/// # Errors
///
/// [`LockError::InvalidArgument`] when even the hashed surrogate cannot fit
/// alongside `prefix` and `reserve`.
pub fn derive_storage_key(
    prefix: &str,
    user_key: &str,
    byte_limit: usize,
    reserve: usize,
) -> Result<String> {
    let joint = if prefix.is_empty() { 0 } else { 1 };
    let verbatim_len = prefix.len() + joint + user_key.len();
    if verbatim_len + reserve <= byte_limit {
        return Ok(join_prefixed(prefix, user_key));
    }

    let hashed_len = prefix.len() + joint + LOCK_ID_LENGTH;
    if hashed_len + reserve > byte_limit {
        return Err(LockError::invalid_argument(format!(
            "prefix of {} bytes leaves no room for a hashed key within {} bytes (reserve {})",
            prefix.len(),
            byte_limit,
            reserve
        )));
    }

    let digest = Sha256::digest(join_prefixed(prefix, user_key).as_bytes());
    let surrogate = URL_SAFE_NO_PAD.encode(&digest[..16]);
    Ok(join_prefixed(prefix, &surrogate))
}

/// Derives the fence-counter key for a storage key.
///
/// This is a second application of [`derive_storage_key`] to
/// `"fence:" + <storage key suffix>`, which keeps a stable 1:1 mapping
/// between fence counters and lock keys even when the lock key itself was
/// truncated to a hash surrogate.
///
/// # Errors
///
/// [`LockError::InvalidArgument`] propagated from [`derive_storage_key`].
pub fn derive_fence_key(
    prefix: &str,
    storage_key: &str,
    byte_limit: usize,
    reserve: usize,
) -> Result<String> {
    let suffix = if prefix.is_empty() {
        storage_key
    } else {
        storage_key
            .strip_prefix(prefix)
            .and_then(|s| s.strip_prefix(':'))
            .unwrap_or(storage_key)
    };
    derive_storage_key(prefix, &format!("fence:{suffix}"), byte_limit, reserve)
}

fn join_prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}
