//! In-memory document store.
//!
//! [`MemoryStore`] is a thread-safe, client-time [`DocumentStore`] over
//! [`DashMap`] -- the bundled stand-in for a Firestore-style substrate and
//! the store the crate's own test suite runs against. Wrap it in
//! [`DocumentBackend`](super::document::DocumentBackend) (or use
//! [`DocumentBackend::in_memory`]) to get a full lock backend with no
//! external dependencies.
//!
//! The store is a dumb versioned map: it never interprets document contents
//! beyond the indexed `lock_id` field used by the secondary query.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::backend::TimeAuthority;
use crate::error::Result;
use crate::store::document::{
    DocWriteError, DocumentBackend, DocumentBackendConfig, DocumentStore, VersionedDoc,
};
use crate::time::wall_clock_ms;

/// Thread-safe in-memory document store with a client time authority.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<(String, String), (Vec<u8>, u64)>,
    /// Test affordance: milliseconds added to the wall clock, so expiry
    /// paths can be exercised without real sleeps.
    clock_offset_ms: AtomicI64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents across all collections.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Shifts this store's clock forward by `ms`. Affects every subsequent
    /// liveness decision made through this store; intended for tests.
    pub fn advance_clock(&self, ms: i64) {
        self.clock_offset_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Whether a document exists, for white-box assertions (e.g. that a
    /// fence counter survived a cleanup).
    pub fn contains(&self, collection: &str, key: &str) -> bool {
        self.docs
            .contains_key(&(collection.to_string(), key.to_string()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn time_authority(&self) -> TimeAuthority {
        TimeAuthority::Client
    }

    async fn now_ms(&self) -> Result<i64> {
        Ok(wall_clock_ms() + self.clock_offset_ms.load(Ordering::SeqCst))
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<VersionedDoc>> {
        Ok(self
            .docs
            .get(&(collection.to_string(), key.to_string()))
            .map(|entry| {
                let (data, version) = entry.value();
                VersionedDoc {
                    data: data.clone(),
                    version: *version,
                }
            }))
    }

    async fn insert(
        &self,
        collection: &str,
        key: &str,
        data: &[u8],
    ) -> std::result::Result<u64, DocWriteError> {
        match self
            .docs
            .entry((collection.to_string(), key.to_string()))
        {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DocWriteError::Conflict),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((data.to_vec(), 1));
                Ok(1)
            },
        }
    }

    async fn update(
        &self,
        collection: &str,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> std::result::Result<u64, DocWriteError> {
        let Some(mut entry) = self
            .docs
            .get_mut(&(collection.to_string(), key.to_string()))
        else {
            return Err(DocWriteError::Conflict);
        };
        let (_, version) = entry.value();
        if *version != expected_version {
            return Err(DocWriteError::Conflict);
        }
        let new_version = expected_version + 1;
        *entry.value_mut() = (data.to_vec(), new_version);
        Ok(new_version)
    }

    async fn remove(
        &self,
        collection: &str,
        key: &str,
        expected_version: u64,
    ) -> std::result::Result<(), DocWriteError> {
        let removed = self.docs.remove_if(
            &(collection.to_string(), key.to_string()),
            |_, (_, version)| *version == expected_version,
        );
        match removed {
            Some(_) => Ok(()),
            None => Err(DocWriteError::Conflict),
        }
    }

    async fn find_by_lock_id(
        &self,
        collection: &str,
        lock_id: &str,
    ) -> Result<Vec<(String, VersionedDoc)>> {
        let matches = self
            .docs
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .filter_map(|entry| {
                let (data, version) = entry.value();
                let value: serde_json::Value = serde_json::from_slice(data).ok()?;
                (value.get("lock_id")?.as_str()? == lock_id).then(|| {
                    (
                        entry.key().1.clone(),
                        VersionedDoc {
                            data: data.clone(),
                            version: *version,
                        },
                    )
                })
            })
            .collect();
        Ok(matches)
    }
}

impl DocumentBackend<MemoryStore> {
    /// A fully in-memory lock backend with the default configuration.
    /// Suitable for tests and single-process embedders.
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new(), DocumentBackendConfig::default())
            .expect("default document config is valid")
    }
}
