//! Generic transactional/document adapter.
//!
//! [`DocumentBackend<S>`] implements the full lock contract on top of any
//! store that can offer versioned single-document writes. The store trait is
//! deliberately dumb: `get`/`insert`/`update`/`remove` with version-checked
//! writes, a secondary query by lock ID, and a clock. Everything
//! lock-shaped -- ownership verification, overwrite of expired records in
//! place, the fence side-document, cleanup safety guards, sanitised
//! lookups -- lives here, once, shared by every document-flavoured
//! substrate.
//!
//! # Concurrency model
//!
//! Mutations are compare-and-swap loops: read the document (with its
//! version), decide, write back conditioned on that version. A lost race
//! surfaces as a write conflict; acquire retries a bounded number of times,
//! release/extend map the conflict to `Absent` (the record demonstrably
//! passed through another state, so the caller no longer owns it).
//!
//! # Fence counters
//!
//! The fence document is keyed 1:1 with the lock's storage key and holds the
//! canonical 15-digit decimal string. It is created on first acquire and
//! **never deleted** -- not by release, not by expiry cleanup -- because
//! deleting it would allow fence reuse. A fence increment that wins its CAS
//! but whose acquire subsequently loses the lock-document race is left as a
//! gap in the sequence; gaps are harmless, reuse is not.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{
    ensure_not_cancelled, AcquireOutcome, AcquiredLock, BackendCapabilities, ExtendOutcome,
    LockBackend, LookupQuery, RawLockInfo, ReleaseOutcome, TimeAuthority,
};
use crate::constants::{
    FENCE_MAX, STORAGE_KEY_LIMIT_BYTES, STORAGE_KEY_RESERVE_BYTES, TOLERANCE_MS,
};
use crate::error::{LockError, Result};
use crate::keys::{derive_fence_key, derive_storage_key, format_fence, generate_lock_id};
use crate::store::LockRecord;
use crate::time::is_live;
use crate::validate::{normalize_key, validate_lock_id, validate_ttl_ms};

/// CAS retry budget for a single acquire call. Races beyond this surface as
/// contention, which the acquisition engine already knows how to retry.
const ACQUIRE_CAS_ATTEMPTS: u32 = 3;

/// Extra slack, beyond the tolerance, before a client-time substrate may
/// delete a record it considers expired.
const CLIENT_CLEANUP_SLACK_MS: i64 = 1_000;

/// A document paired with its monotonic version, for conditional writes.
#[derive(Debug, Clone)]
pub struct VersionedDoc {
    /// Serialized document bytes (JSON for the bundled stores).
    pub data: Vec<u8>,
    /// Monotonic version, starting at 1 and incremented on every write.
    pub version: u64,
}

/// Failure modes of a conditional document write.
#[derive(Debug)]
pub enum DocWriteError {
    /// The version precondition failed: the document changed, appeared, or
    /// vanished between read and write.
    Conflict,
    /// The substrate itself failed; already mapped to a [`LockError`].
    Backend(LockError),
}

/// A versioned-document substrate.
///
/// Implementations are dumb: they must not interpret document contents
/// (beyond [`find_by_lock_id`](DocumentStore::find_by_lock_id) matching the
/// indexed `lock_id` field) and must not apply any lock semantics. All
/// domain logic lives in [`DocumentBackend`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Whose clock [`now_ms`](DocumentStore::now_ms) reads.
    fn time_authority(&self) -> TimeAuthority;

    /// Current unix milliseconds per this store's time authority.
    ///
    /// # Errors
    ///
    /// Substrate failures, mapped to transport-shaped [`LockError`]s.
    async fn now_ms(&self) -> Result<i64>;

    /// Reads a document, with its version.
    ///
    /// # Errors
    ///
    /// Substrate failures.
    async fn get(&self, collection: &str, key: &str) -> Result<Option<VersionedDoc>>;

    /// Creates a document that must not exist yet; returns version 1.
    ///
    /// # Errors
    ///
    /// [`DocWriteError::Conflict`] when the document already exists.
    async fn insert(
        &self,
        collection: &str,
        key: &str,
        data: &[u8],
    ) -> std::result::Result<u64, DocWriteError>;

    /// Replaces a document iff its current version is `expected_version`;
    /// returns the new version.
    ///
    /// # Errors
    ///
    /// [`DocWriteError::Conflict`] on version mismatch or a missing
    /// document.
    async fn update(
        &self,
        collection: &str,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> std::result::Result<u64, DocWriteError>;

    /// Deletes a document iff its current version is `expected_version`.
    ///
    /// # Errors
    ///
    /// [`DocWriteError::Conflict`] on version mismatch or a missing
    /// document.
    async fn remove(
        &self,
        collection: &str,
        key: &str,
        expected_version: u64,
    ) -> std::result::Result<(), DocWriteError>;

    /// Secondary query: all documents in `collection` whose `lock_id` field
    /// equals `lock_id`, as `(document key, doc)` pairs.
    ///
    /// # Errors
    ///
    /// Substrate failures.
    async fn find_by_lock_id(
        &self,
        collection: &str,
        lock_id: &str,
    ) -> Result<Vec<(String, VersionedDoc)>>;
}

/// The fence side-document. Carries the canonical decimal string so that
/// substrates without native integers still order fences correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FenceDoc {
    pub fence: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_debug: Option<String>,
}

/// Configuration for a [`DocumentBackend`].
#[derive(Debug, Clone)]
pub struct DocumentBackendConfig {
    /// Collection holding lock documents.
    pub collection: String,
    /// Collection holding fence counters. Must differ from
    /// [`collection`](DocumentBackendConfig::collection).
    pub fence_collection: String,
    /// When set, `is_locked` culls a non-live record as a side effect
    /// (behind the client-time safety guard). Default off.
    pub cleanup_in_is_locked: bool,
}

impl Default for DocumentBackendConfig {
    fn default() -> Self {
        Self {
            collection: "locks".to_string(),
            fence_collection: "fence_counters".to_string(),
            cleanup_in_is_locked: false,
        }
    }
}

/// Lock backend over any [`DocumentStore`].
#[derive(Debug)]
pub struct DocumentBackend<S> {
    store: S,
    config: DocumentBackendConfig,
}

impl<S: DocumentStore> DocumentBackend<S> {
    /// Wraps `store` with the given configuration.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidArgument`] when the lock and fence collections
    /// share a name (the counters must survive lock deletion, so they can
    /// never live among the locks).
    pub fn new(store: S, config: DocumentBackendConfig) -> Result<Self> {
        if config.collection == config.fence_collection {
            return Err(LockError::invalid_argument(
                "lock and fence collections must differ",
            ));
        }
        if config.collection.is_empty() || config.fence_collection.is_empty() {
            return Err(LockError::invalid_argument(
                "collection names must not be empty",
            ));
        }
        Ok(Self { store, config })
    }

    /// Read access to the wrapped store (used by tests and diagnostics).
    pub fn store(&self) -> &S {
        &self.store
    }

    fn storage_key(&self, normalized_key: &str) -> Result<String> {
        derive_storage_key(
            "",
            normalized_key,
            STORAGE_KEY_LIMIT_BYTES,
            STORAGE_KEY_RESERVE_BYTES,
        )
    }

    fn parse_record(&self, storage_key: &str, doc: &VersionedDoc) -> Result<LockRecord> {
        serde_json::from_slice(&doc.data).map_err(|e| LockError::Internal {
            message: format!("malformed lock document at {storage_key}: {e}"),
            key: Some(storage_key.to_string()),
            source: Some(Box::new(e)),
        })
    }

    /// Advances the fence counter for `fence_key` and returns the formatted
    /// token. Counter creation and increment are both version-conditioned;
    /// a conflict bubbles up so the acquire loop can re-read.
    async fn next_fence(
        &self,
        fence_key: &str,
        user_key: &str,
    ) -> std::result::Result<String, DocWriteError> {
        let fences = self.config.fence_collection.as_str();
        let current = self
            .store
            .get(fences, fence_key)
            .await
            .map_err(DocWriteError::Backend)?;

        let (next, expected_version) = match &current {
            None => (1u64, None),
            Some(doc) => {
                let parsed: FenceDoc = serde_json::from_slice(&doc.data).map_err(|e| {
                    DocWriteError::Backend(LockError::Internal {
                        message: format!("malformed fence document at {fence_key}: {e}"),
                        key: Some(fence_key.to_string()),
                        source: Some(Box::new(e)),
                    })
                })?;
                let value: u64 = parsed.fence.parse().map_err(|_| {
                    DocWriteError::Backend(LockError::internal_for_key(
                        format!("non-numeric fence counter at {fence_key}"),
                        fence_key,
                    ))
                })?;
                (value + 1, Some(doc.version))
            },
        };

        if next > FENCE_MAX {
            return Err(DocWriteError::Backend(LockError::internal_for_key(
                format!("fence counter overflow: {next} exceeds {FENCE_MAX}"),
                fence_key,
            )));
        }
        let formatted = format_fence(next).map_err(DocWriteError::Backend)?;

        let doc = FenceDoc {
            fence: formatted.clone(),
            key_debug: Some(user_key.to_string()),
        };
        let bytes = serde_json::to_vec(&doc).map_err(|e| {
            DocWriteError::Backend(LockError::Internal {
                message: format!("fence document serialisation failed: {e}"),
                key: Some(fence_key.to_string()),
                source: Some(Box::new(e)),
            })
        })?;

        match expected_version {
            None => self.store.insert(fences, fence_key, &bytes).await?,
            Some(version) => self.store.update(fences, fence_key, &bytes, version).await?,
        };
        Ok(formatted)
    }

    /// Finds the live record owned by `lock_id`, with its storage key and
    /// version. Warns when duplicates are observed -- the schema allows at
    /// most one live record per lock ID, so duplicates indicate corruption.
    async fn find_owned(
        &self,
        lock_id: &str,
        now_ms: i64,
    ) -> Result<Option<(String, LockRecord, u64)>> {
        let candidates = self
            .store
            .find_by_lock_id(self.config.collection.as_str(), lock_id)
            .await?;

        let mut live: Vec<(String, LockRecord, u64)> = Vec::new();
        for (storage_key, doc) in &candidates {
            let record = self.parse_record(storage_key, doc)?;
            if record.lock_id == lock_id && is_live(now_ms, record.expires_at_ms, TOLERANCE_MS) {
                live.push((storage_key.clone(), record, doc.version));
            }
        }
        if live.len() > 1 {
            warn!(
                lock_id_hash = %crate::keys::hash_lock_id(lock_id),
                count = live.len(),
                "multiple live lock records share one lock ID; data corruption suspected"
            );
        }
        Ok(live.into_iter().next())
    }
}

#[async_trait]
impl<S: DocumentStore> LockBackend for DocumentBackend<S> {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_fencing: true,
            time_authority: self.store.time_authority(),
        }
    }

    async fn acquire(
        &self,
        key: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<AcquireOutcome> {
        let normalized = normalize_key(key)?;
        validate_ttl_ms(ttl_ms)?;
        let storage_key = self.storage_key(&normalized)?;
        let fence_key = derive_fence_key("", &storage_key, STORAGE_KEY_LIMIT_BYTES, 0)?;
        let locks = self.config.collection.as_str();

        for attempt in 0..ACQUIRE_CAS_ATTEMPTS {
            ensure_not_cancelled(cancel)?;
            let now_ms = self.store.now_ms().await?;

            let existing = self.store.get(locks, &storage_key).await?;
            if let Some(doc) = &existing {
                let record = self.parse_record(&storage_key, doc)?;
                if is_live(now_ms, record.expires_at_ms, TOLERANCE_MS) {
                    return Ok(AcquireOutcome::Locked);
                }
            }

            let fence = match self.next_fence(&fence_key, &normalized).await {
                Ok(fence) => fence,
                Err(DocWriteError::Conflict) => {
                    debug!(attempt, "fence counter raced, re-reading");
                    continue;
                },
                Err(DocWriteError::Backend(e)) => return Err(e),
            };

            let record = LockRecord {
                lock_id: generate_lock_id(),
                fence: fence.clone(),
                acquired_at_ms: now_ms,
                expires_at_ms: now_ms + ttl_ms,
                key: normalized.clone(),
            };
            let bytes = serde_json::to_vec(&record).map_err(|e| LockError::Internal {
                message: format!("lock document serialisation failed: {e}"),
                key: Some(storage_key.clone()),
                source: Some(Box::new(e)),
            })?;

            // A non-live record is overwritten in place rather than deleted
            // first, so the write stays a single conditional operation.
            let write = match &existing {
                None => self.store.insert(locks, &storage_key, &bytes).await,
                Some(doc) => {
                    self.store
                        .update(locks, &storage_key, &bytes, doc.version)
                        .await
                },
            };
            match write {
                Ok(_) => {
                    return Ok(AcquireOutcome::Acquired(AcquiredLock {
                        lock_id: record.lock_id,
                        fence,
                        acquired_at_ms: record.acquired_at_ms,
                        expires_at_ms: record.expires_at_ms,
                    }));
                },
                Err(DocWriteError::Conflict) => {
                    debug!(attempt, "lock document raced, re-reading");
                    continue;
                },
                Err(DocWriteError::Backend(e)) => return Err(e),
            }
        }

        // Lost every race in the budget; report contention and let the
        // acquisition engine decide whether to come back.
        Ok(AcquireOutcome::Locked)
    }

    async fn release(&self, lock_id: &str, cancel: &CancellationToken) -> Result<ReleaseOutcome> {
        validate_lock_id(lock_id)?;
        ensure_not_cancelled(cancel)?;
        let now_ms = self.store.now_ms().await?;

        let Some((storage_key, _record, version)) = self.find_owned(lock_id, now_ms).await? else {
            return Ok(ReleaseOutcome::Absent);
        };
        match self
            .store
            .remove(self.config.collection.as_str(), &storage_key, version)
            .await
        {
            Ok(()) => Ok(ReleaseOutcome::Released),
            // The record changed under us: whoever mutated it owns the truth
            // now, which is exactly the uniform-absent contract.
            Err(DocWriteError::Conflict) => Ok(ReleaseOutcome::Absent),
            Err(DocWriteError::Backend(e)) => Err(e),
        }
    }

    async fn extend(
        &self,
        lock_id: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<ExtendOutcome> {
        validate_lock_id(lock_id)?;
        validate_ttl_ms(ttl_ms)?;
        ensure_not_cancelled(cancel)?;
        let now_ms = self.store.now_ms().await?;

        let Some((storage_key, mut record, version)) = self.find_owned(lock_id, now_ms).await?
        else {
            return Ok(ExtendOutcome::Absent);
        };
        record.expires_at_ms = now_ms + ttl_ms;
        let bytes = serde_json::to_vec(&record).map_err(|e| LockError::Internal {
            message: format!("lock document serialisation failed: {e}"),
            key: Some(storage_key.clone()),
            source: Some(Box::new(e)),
        })?;
        match self
            .store
            .update(self.config.collection.as_str(), &storage_key, &bytes, version)
            .await
        {
            Ok(_) => Ok(ExtendOutcome::Extended {
                expires_at_ms: record.expires_at_ms,
            }),
            Err(DocWriteError::Conflict) => Ok(ExtendOutcome::Absent),
            Err(DocWriteError::Backend(e)) => Err(e),
        }
    }

    async fn is_locked(&self, key: &str, cancel: &CancellationToken) -> Result<bool> {
        let normalized = normalize_key(key)?;
        ensure_not_cancelled(cancel)?;
        let storage_key = self.storage_key(&normalized)?;
        let locks = self.config.collection.as_str();

        let Some(doc) = self.store.get(locks, &storage_key).await? else {
            return Ok(false);
        };
        let record = self.parse_record(&storage_key, &doc)?;
        let now_ms = self.store.now_ms().await?;
        let live = is_live(now_ms, record.expires_at_ms, TOLERANCE_MS);

        if !live && self.config.cleanup_in_is_locked {
            // On a client clock, another process may still consider the
            // record live inside the tolerance window; give it extra slack
            // before deleting on its behalf.
            let guard_ms = match self.store.time_authority() {
                TimeAuthority::Client => TOLERANCE_MS + CLIENT_CLEANUP_SLACK_MS,
                TimeAuthority::Server => TOLERANCE_MS,
            };
            if now_ms >= record.expires_at_ms + guard_ms {
                match self.store.remove(locks, &storage_key, doc.version).await {
                    Ok(()) => debug!(key_hash = %crate::keys::hash_key(&normalized), "culled expired lock record"),
                    // Best-effort: a conflict means someone else already
                    // rewrote or removed it.
                    Err(DocWriteError::Conflict) => {},
                    Err(DocWriteError::Backend(e)) => return Err(e),
                }
            }
        }
        Ok(live)
    }

    async fn lookup(
        &self,
        query: &LookupQuery,
        cancel: &CancellationToken,
    ) -> Result<Option<RawLockInfo>> {
        let supports_fencing = self.capabilities().supports_fencing;
        match query {
            LookupQuery::ByKey(key) => {
                let normalized = normalize_key(key)?;
                ensure_not_cancelled(cancel)?;
                let storage_key = self.storage_key(&normalized)?;
                let Some(doc) = self
                    .store
                    .get(self.config.collection.as_str(), &storage_key)
                    .await?
                else {
                    return Ok(None);
                };
                let record = self.parse_record(&storage_key, &doc)?;
                let now_ms = self.store.now_ms().await?;
                if !is_live(now_ms, record.expires_at_ms, TOLERANCE_MS) {
                    return Ok(None);
                }
                Ok(Some(record.to_raw_info(supports_fencing)))
            },
            LookupQuery::ByLockId(lock_id) => {
                validate_lock_id(lock_id)?;
                ensure_not_cancelled(cancel)?;
                let now_ms = self.store.now_ms().await?;
                let found = self.find_owned(lock_id, now_ms).await?;
                Ok(found.map(|(_, record, _)| record.to_raw_info(supports_fencing)))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn equal_collections_are_rejected() {
        let config = DocumentBackendConfig {
            collection: "same".to_string(),
            fence_collection: "same".to_string(),
            cleanup_in_is_locked: false,
        };
        let err = DocumentBackend::new(MemoryStore::new(), config).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn empty_collection_names_are_rejected() {
        let config = DocumentBackendConfig {
            collection: String::new(),
            fence_collection: "fences".to_string(),
            cleanup_in_is_locked: false,
        };
        assert!(DocumentBackend::new(MemoryStore::new(), config).is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(DocumentBackend::new(MemoryStore::new(), DocumentBackendConfig::default()).is_ok());
    }
}
