//! The backend contract.
//!
//! [`LockBackend`] is the seam between the acquisition machinery and a
//! storage substrate. A backend exposes five operations plus a capability
//! descriptor; everything else in the crate (retry engine, scoped handle,
//! diagnostics, telemetry) is written against this trait.
//!
//! # Contract
//!
//! - `acquire` is a **single attempt**. Contention is reported as
//!   [`AcquireOutcome::Locked`], never as an error; retries belong to the
//!   acquisition engine.
//! - `release` and `extend` are idempotent with respect to absence. Expiry,
//!   wrong ownership, and "never existed" are deliberately
//!   indistinguishable: all three come back as `Absent`. Combined with
//!   atomic ownership verification inside the substrate this makes the
//!   mutations safe under check-then-act races.
//! - `expires_at_ms` in every result is authoritative: it is computed by the
//!   backend's time authority inside the atomic section.
//! - Validation runs before any I/O; a malformed key or lock ID never
//!   reaches the substrate.
//! - Every operation observes its [`CancellationToken`] before issuing I/O
//!   and fails with [`LockError::Aborted`](crate::error::LockError::Aborted)
//!   once it has fired.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{LockError, Result};

/// Where the `now` used by liveness checks comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAuthority {
    /// The storage substrate supplies the clock (Redis `TIME`, SQL `now()`).
    Server,
    /// The calling process supplies the clock.
    Client,
}

/// Compile-time-visible description of what a backend guarantees.
#[derive(Debug, Clone, Copy)]
pub struct BackendCapabilities {
    /// Whether successful acquisitions carry a monotonic fencing token.
    pub supports_fencing: bool,
    /// Whose clock drives expiry decisions.
    pub time_authority: TimeAuthority,
}

/// A successful acquisition as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredLock {
    /// Proof of ownership; required by every subsequent mutation.
    pub lock_id: String,
    /// 15-digit zero-padded fencing token, strictly greater than any fence
    /// previously issued for the same storage key.
    pub fence: String,
    /// When the backend's time authority stamped the acquisition.
    pub acquired_at_ms: i64,
    /// When the lease ends, per the same authority.
    pub expires_at_ms: i64,
}

/// Outcome of a single acquire attempt.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// The lock was taken; the record is live in the substrate.
    Acquired(AcquiredLock),
    /// A live record already holds the key. A result, not an error.
    Locked,
}

impl AcquireOutcome {
    /// Whether this outcome is [`Acquired`](AcquireOutcome::Acquired).
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// Unwraps the acquisition, if any.
    pub fn into_acquired(self) -> Option<AcquiredLock> {
        match self {
            Self::Acquired(lock) => Some(lock),
            Self::Locked => None,
        }
    }
}

/// Outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The record existed, belonged to the caller, was live, and is gone.
    Released,
    /// Expired, wrong owner, or never existed -- indistinguishable.
    Absent,
}

/// Outcome of an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendOutcome {
    /// The lease was renewed in place.
    Extended {
        /// The new deadline, per the backend's time authority.
        expires_at_ms: i64,
    },
    /// Expired, wrong owner, or never existed -- indistinguishable.
    Absent,
}

/// Selector for [`LockBackend::lookup`]: by key xor by lock ID.
#[derive(Debug, Clone)]
pub enum LookupQuery {
    /// Look up the live record for a user key.
    ByKey(String),
    /// Look up the live record owned by a lock ID.
    ByLockId(String),
}

/// Sanitised observation of a live lock, safe for logs and telemetry.
///
/// Raw identifiers are deliberately absent; diagnostics that need them go
/// through [`RawLockInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// 96-bit hex digest of the NFC-normalised user key.
    pub key_hash: String,
    /// 96-bit hex digest of the owning lock ID.
    pub lock_id_hash: String,
    /// Fencing token, present iff the backend supports fencing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fence: Option<String>,
    /// When the lock was acquired.
    pub acquired_at_ms: i64,
    /// When the lease ends.
    pub expires_at_ms: i64,
}

/// A [`LockInfo`] with the raw identifiers attached out-of-band, for the
/// `*_raw` debug helpers. Never serialised wholesale.
#[derive(Debug, Clone)]
pub struct RawLockInfo {
    /// The sanitised observation.
    pub info: LockInfo,
    /// The raw user key.
    pub key: String,
    /// The raw lock ID.
    pub lock_id: String,
}

/// Short-circuits with [`LockError::Aborted`] once `cancel` has fired.
/// Backends call this before every I/O round-trip.
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(LockError::Aborted);
    }
    Ok(())
}

/// A storage substrate that can hold named locks.
///
/// Implementations must be `Send + Sync`; the library issues concurrent
/// requests against a shared backend and relies on the substrate's own
/// concurrency control. The only substrate-shared mutable state is the
/// fence counter, guarded by the substrate's atomicity primitive (script on
/// Redis, transaction elsewhere).
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Describes this backend's guarantees. Synchronous: no I/O involved.
    fn capabilities(&self) -> BackendCapabilities;

    /// Attempts to take the lock named `key` for `ttl_ms` milliseconds.
    ///
    /// A single attempt: returns [`AcquireOutcome::Locked`] when a live
    /// record exists. On success the returned fence is strictly greater
    /// than any fence previously issued for this key.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidArgument`] before I/O on a bad key or TTL;
    /// [`LockError::Aborted`] on cancellation; the transport-shaped variants
    /// on substrate failure; [`LockError::Internal`] on fence overflow (no
    /// record is written in that case).
    async fn acquire(
        &self,
        key: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<AcquireOutcome>;

    /// Releases the lock owned by `lock_id`.
    ///
    /// Ownership and liveness are verified atomically inside the substrate.
    /// Returns [`ReleaseOutcome::Absent`] uniformly when the record is
    /// expired, owned by someone else, or missing. Never touches the fence
    /// counter.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidArgument`] before I/O on a malformed lock ID;
    /// [`LockError::Aborted`] on cancellation; transport variants on
    /// substrate failure.
    async fn release(&self, lock_id: &str, cancel: &CancellationToken) -> Result<ReleaseOutcome>;

    /// Renews the lease owned by `lock_id` to `now + ttl_ms`.
    ///
    /// Same atomic ownership verification and same uniform `Absent`
    /// semantics as [`release`](LockBackend::release).
    ///
    /// # Errors
    ///
    /// As for [`release`](LockBackend::release), plus
    /// [`LockError::InvalidArgument`] on a non-positive TTL.
    async fn extend(
        &self,
        lock_id: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<ExtendOutcome>;

    /// Reports whether a live record currently holds `key`.
    ///
    /// Advisory: by the time the caller acts the answer may be stale. When
    /// the backend was configured with cleanup-in-is-locked it may cull a
    /// non-live record as a side effect; the fence counter is never culled.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidArgument`] before I/O on a bad key;
    /// [`LockError::Aborted`] on cancellation; transport variants on
    /// substrate failure.
    async fn is_locked(&self, key: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Fetches the live record selected by `query`, or `None`.
    ///
    /// Read-only. The by-ID form may be satisfied without multi-key
    /// atomicity; the observation corresponds to some state the key passed
    /// through. Correctness-gating on lookups is forbidden by contract --
    /// the atomic mutations are the only correctness gates.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidArgument`] before I/O on a malformed selector;
    /// [`LockError::Aborted`] on cancellation; transport variants on
    /// substrate failure.
    async fn lookup(
        &self,
        query: &LookupQuery,
        cancel: &CancellationToken,
    ) -> Result<Option<RawLockInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_outcome_accessors() {
        let lock = AcquiredLock {
            lock_id: "A".repeat(22),
            fence: "000000000000001".to_string(),
            acquired_at_ms: 1_000,
            expires_at_ms: 31_000,
        };
        let outcome = AcquireOutcome::Acquired(lock.clone());
        assert!(outcome.is_acquired());
        assert_eq!(outcome.into_acquired(), Some(lock));

        let outcome = AcquireOutcome::Locked;
        assert!(!outcome.is_acquired());
        assert!(outcome.into_acquired().is_none());
    }

    #[test]
    fn lock_info_omits_absent_fence_when_serialised() {
        let info = LockInfo {
            key_hash: "ab".repeat(12),
            lock_id_hash: "cd".repeat(12),
            fence: None,
            acquired_at_ms: 1,
            expires_at_ms: 2,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("fence"));

        let info = LockInfo {
            fence: Some("000000000000007".to_string()),
            ..info
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"fence\":\"000000000000007\""));
    }

    #[test]
    fn cancellation_gate() {
        let token = CancellationToken::new();
        assert!(ensure_not_cancelled(&token).is_ok());
        token.cancel();
        let err = ensure_not_cancelled(&token).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Aborted);
    }
}
