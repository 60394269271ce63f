//! Backend implementations.
//!
//! # Architecture
//!
//! Two substrate families realise the [`LockBackend`](crate::backend::LockBackend)
//! contract:
//!
//! 1. **[`document`]** -- a generic transactional adapter,
//!    [`DocumentBackend<S>`](document::DocumentBackend), over a small
//!    versioned-document trait ([`DocumentStore`](document::DocumentStore)).
//!    All domain logic (ownership verification, expired-record overwrite,
//!    fence side-documents, cleanup guards) lives in the adapter; stores are
//!    dumb. [`memory::MemoryStore`] is the bundled client-time store.
//! 2. **[`redis`]** -- server-time adapter executing Lua scripts against a
//!    single Redis instance (feature `redis`).
//! 3. **[`postgres`]** -- server-time adapter over row transactions
//!    (feature `postgres`).
//!
//! All backends share the identifier, validation, and liveness helpers, so
//! a key digests, truncates, and expires identically everywhere.

pub mod document;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use serde::{Deserialize, Serialize};

use crate::backend::{LockInfo, RawLockInfo};
use crate::keys::{hash_key, hash_lock_id};

/// The lock record as persisted by every bundled backend (JSON in Redis and
/// the document stores, columns in Postgres).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LockRecord {
    pub lock_id: String,
    pub fence: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
    pub key: String,
}

impl LockRecord {
    /// Builds the sanitised-plus-raw observation for lookups.
    pub(crate) fn to_raw_info(&self, supports_fencing: bool) -> RawLockInfo {
        RawLockInfo {
            info: LockInfo {
                key_hash: hash_key(&self.key),
                lock_id_hash: hash_lock_id(&self.lock_id),
                fence: supports_fencing.then(|| self.fence.clone()),
                acquired_at_ms: self.acquired_at_ms,
                expires_at_ms: self.expires_at_ms,
            },
            key: self.key.clone(),
            lock_id: self.lock_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_as_json() {
        let record = LockRecord {
            lock_id: "A".repeat(22),
            fence: "000000000000003".to_string(),
            acquired_at_ms: 1_000,
            expires_at_ms: 31_000,
            key: "payment:1".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"lock_id\""));
        assert!(json.contains("\"expires_at_ms\":31000"));
        let back: LockRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.fence, record.fence);
        assert_eq!(back.key, record.key);
    }

    #[test]
    fn raw_info_is_sanitised() {
        let record = LockRecord {
            lock_id: "B".repeat(22),
            fence: "000000000000001".to_string(),
            acquired_at_ms: 5,
            expires_at_ms: 10,
            key: "user:42".to_string(),
        };
        let raw = record.to_raw_info(true);
        assert_eq!(raw.key, "user:42");
        assert_eq!(raw.lock_id, "B".repeat(22));
        assert_ne!(raw.info.key_hash, raw.key);
        assert_eq!(raw.info.fence.as_deref(), Some("000000000000001"));

        let raw = record.to_raw_info(false);
        assert!(raw.info.fence.is_none());
    }
}
