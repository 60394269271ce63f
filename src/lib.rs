//! Distributed mutual-exclusion locks with monotonic fencing tokens.
//!
//! A client acquires a named lock on a resource, performs work while holding
//! it, and releases it; if the client crashes, a per-lock TTL frees the
//! resource. The library is backend-agnostic: the same operational contract
//! runs over Redis (server time, script atomicity), Postgres (server time,
//! row transactions), and document stores (client time, versioned-document
//! writes).
//!
//! Locks alone cannot make writes safe under partitions -- two holders may
//! briefly both believe they own a key. Every successful acquire therefore
//! carries a **fencing token**, strictly increasing per key, which
//! downstream writers use to reject stale holders. The token, not the lock,
//! is the correctness mechanism.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use syncguard::engine::{with_lock, AcquireOptions};
//! use syncguard::handle::HandleConfig;
//! use syncguard::store::document::DocumentBackend;
//! use syncguard::LockBackend;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> syncguard::Result<()> {
//! let backend: Arc<dyn LockBackend> = Arc::new(DocumentBackend::in_memory());
//!
//! let total = with_lock(
//!     backend,
//!     "payment:1",
//!     30_000,
//!     &AcquireOptions::default(),
//!     HandleConfig::default(),
//!     |handle| async move {
//!         // Critical section; stamp downstream writes with handle.fence().
//!         assert!(handle.acquired());
//!         Ok::<_, syncguard::LockError>(2 + 2)
//!     },
//! )
//! .await?;
//! assert_eq!(total, 4);
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`backend`] -- the [`LockBackend`] contract: five operations, outcome
//!   types, capability descriptor
//! - [`engine`] -- retry loop with backoff, jitter, deadline, cancellation
//! - [`handle`] -- the scoped handle with at-most-once release
//! - [`store`] -- bundled backends: in-memory document store, Redis
//!   (feature `redis`), Postgres (feature `postgres`)
//! - [`keys`] -- lock IDs, digests, fence formatting, storage-key derivation
//! - [`validate`] / [`time`] / [`constants`] -- input gates, the liveness
//!   predicate, exported constants
//! - [`diagnostics`] -- sanitised by-key/by-id helpers (advisory only)
//! - [`telemetry`] -- per-operation event emission as a backend decorator
//! - [`error`] -- [`LockError`] with stable [`ErrorCode`]s

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod constants;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod handle;
pub mod keys;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod validate;

// Re-exports for ergonomic access
pub use backend::{
    AcquireOutcome, AcquiredLock, BackendCapabilities, ExtendOutcome, LockBackend, LockInfo,
    LookupQuery, RawLockInfo, ReleaseOutcome, TimeAuthority,
};
pub use constants::{DEFAULT_TTL_MS, MAX_KEY_LENGTH_BYTES};
pub use engine::{acquire_with_retry, with_lock, AcquireOptions, Backoff, Jitter};
pub use error::{ErrorCode, LockError, Result};
pub use handle::{HandleConfig, LockHandle, ReleaseErrorContext, ReleaseErrorSource};
pub use store::document::{DocumentBackend, DocumentBackendConfig, DocumentStore};
pub use store::memory::MemoryStore;
pub use telemetry::{EventResult, EventType, InstrumentedBackend, LockEvent};
