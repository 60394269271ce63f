//! Shared test doubles for the integration suites.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use syncguard::{
    AcquireOutcome, AcquiredLock, BackendCapabilities, ExtendOutcome, LockBackend, LockError,
    LookupQuery, RawLockInfo, ReleaseOutcome, Result, TimeAuthority,
};

/// Decorator that counts calls and can be told to delay, fail, or hang
/// releases.
pub struct ObservedBackend {
    inner: Arc<dyn LockBackend>,
    pub acquire_calls: AtomicU32,
    pub release_calls: AtomicU32,
    pub extend_calls: AtomicU32,
    pub fail_release: AtomicBool,
    pub hang_release: AtomicBool,
    /// Sleep this long before a release proceeds; lets tests observe
    /// callers that must wait out an in-flight release.
    pub release_delay_ms: AtomicU64,
}

impl ObservedBackend {
    pub fn new(inner: Arc<dyn LockBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            acquire_calls: AtomicU32::new(0),
            release_calls: AtomicU32::new(0),
            extend_calls: AtomicU32::new(0),
            fail_release: AtomicBool::new(false),
            hang_release: AtomicBool::new(false),
            release_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn release_count(&self) -> u32 {
        self.release_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockBackend for ObservedBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    async fn acquire(
        &self,
        key: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<AcquireOutcome> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire(key, ttl_ms, cancel).await
    }

    async fn release(&self, lock_id: &str, cancel: &CancellationToken) -> Result<ReleaseOutcome> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.release_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.hang_release.load(Ordering::SeqCst) {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(30)) => {},
                () = cancel.cancelled() => return Err(LockError::Aborted),
            }
        }
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(LockError::ServiceUnavailable {
                message: "injected release failure".to_string(),
                source: None,
            });
        }
        self.inner.release(lock_id, cancel).await
    }

    async fn extend(
        &self,
        lock_id: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<ExtendOutcome> {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.extend(lock_id, ttl_ms, cancel).await
    }

    async fn is_locked(&self, key: &str, cancel: &CancellationToken) -> Result<bool> {
        self.inner.is_locked(key, cancel).await
    }

    async fn lookup(
        &self,
        query: &LookupQuery,
        cancel: &CancellationToken,
    ) -> Result<Option<RawLockInfo>> {
        self.inner.lookup(query, cancel).await
    }
}

/// Standalone backend scripted to report contention a fixed number of times
/// before granting the lock. No substrate behind it.
pub struct ContendedBackend {
    locked_attempts: AtomicU32,
    pub acquire_calls: AtomicU32,
    pub fail_with: std::sync::Mutex<Option<LockError>>,
}

impl ContendedBackend {
    /// Reports `Locked` for the first `locked_attempts` acquires, then
    /// grants.
    pub fn new(locked_attempts: u32) -> Arc<Self> {
        Arc::new(Self {
            locked_attempts: AtomicU32::new(locked_attempts),
            acquire_calls: AtomicU32::new(0),
            fail_with: std::sync::Mutex::new(None),
        })
    }

    pub fn failing(error: LockError) -> Arc<Self> {
        let backend = Self::new(0);
        *backend.fail_with.lock().unwrap() = Some(error);
        backend
    }

    pub fn attempts(&self) -> u32 {
        self.acquire_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockBackend for ContendedBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_fencing: true,
            time_authority: TimeAuthority::Client,
        }
    }

    async fn acquire(
        &self,
        _key: &str,
        ttl_ms: i64,
        _cancel: &CancellationToken,
    ) -> Result<AcquireOutcome> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail_with.lock().unwrap().take() {
            return Err(error);
        }
        let remaining = self.locked_attempts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.locked_attempts.store(remaining - 1, Ordering::SeqCst);
            return Ok(AcquireOutcome::Locked);
        }
        Ok(AcquireOutcome::Acquired(AcquiredLock {
            lock_id: "scriptedScriptedScript".to_string(),
            fence: "000000000000001".to_string(),
            acquired_at_ms: 0,
            expires_at_ms: ttl_ms,
        }))
    }

    async fn release(&self, _lock_id: &str, _cancel: &CancellationToken) -> Result<ReleaseOutcome> {
        Ok(ReleaseOutcome::Released)
    }

    async fn extend(
        &self,
        _lock_id: &str,
        ttl_ms: i64,
        _cancel: &CancellationToken,
    ) -> Result<ExtendOutcome> {
        Ok(ExtendOutcome::Extended {
            expires_at_ms: ttl_ms,
        })
    }

    async fn is_locked(&self, _key: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(self.locked_attempts.load(Ordering::SeqCst) > 0)
    }

    async fn lookup(
        &self,
        _query: &LookupQuery,
        _cancel: &CancellationToken,
    ) -> Result<Option<RawLockInfo>> {
        Ok(None)
    }
}
