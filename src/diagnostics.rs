//! Diagnostic lookups.
//!
//! Thin, read-only wrappers over [`LockBackend::lookup`]. Their use is
//! advisory: by the time a caller acts on an answer, the lock may have
//! changed hands. Gating correctness-relevant writes on these helpers is
//! forbidden by contract -- the atomic mutations (and fencing tokens
//! downstream) are the only correctness gates.
//!
//! The plain helpers return sanitised [`LockInfo`]; the `*_raw` variants
//! additionally surface the raw key and lock ID for interactive debugging.

use tokio_util::sync::CancellationToken;

use crate::backend::{LockBackend, LockInfo, LookupQuery, RawLockInfo};
use crate::error::Result;

/// Sanitised lookup of the live lock on `key`, if any.
///
/// # Errors
///
/// Propagates backend and validation errors.
pub async fn get_by_key(
    backend: &dyn LockBackend,
    key: &str,
    cancel: &CancellationToken,
) -> Result<Option<LockInfo>> {
    let raw = backend
        .lookup(&LookupQuery::ByKey(key.to_string()), cancel)
        .await?;
    Ok(raw.map(|r| r.info))
}

/// Sanitised lookup of the live lock owned by `lock_id`, if any.
///
/// # Errors
///
/// Propagates backend and validation errors.
pub async fn get_by_id(
    backend: &dyn LockBackend,
    lock_id: &str,
    cancel: &CancellationToken,
) -> Result<Option<LockInfo>> {
    let raw = backend
        .lookup(&LookupQuery::ByLockId(lock_id.to_string()), cancel)
        .await?;
    Ok(raw.map(|r| r.info))
}

/// Whether `lock_id` currently owns the live lock on `key`. Advisory only.
///
/// # Errors
///
/// Propagates backend and validation errors.
pub async fn owns(
    backend: &dyn LockBackend,
    key: &str,
    lock_id: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    let raw = backend
        .lookup(&LookupQuery::ByKey(key.to_string()), cancel)
        .await?;
    Ok(raw.is_some_and(|r| r.lock_id == lock_id))
}

/// [`get_by_key`] with the raw identifiers attached. Debug use only; the
/// raw key and lock ID must not end up in logs or metrics.
///
/// # Errors
///
/// Propagates backend and validation errors.
pub async fn get_by_key_raw(
    backend: &dyn LockBackend,
    key: &str,
    cancel: &CancellationToken,
) -> Result<Option<RawLockInfo>> {
    backend
        .lookup(&LookupQuery::ByKey(key.to_string()), cancel)
        .await
}

/// [`get_by_id`] with the raw identifiers attached. Debug use only.
///
/// # Errors
///
/// Propagates backend and validation errors.
pub async fn get_by_id_raw(
    backend: &dyn LockBackend,
    lock_id: &str,
    cancel: &CancellationToken,
) -> Result<Option<RawLockInfo>> {
    backend
        .lookup(&LookupQuery::ByLockId(lock_id.to_string()), cancel)
        .await
}
