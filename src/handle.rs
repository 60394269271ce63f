//! The scoped acquisition handle.
//!
//! A [`LockHandle`] wraps the result of an acquire attempt -- successful or
//! contended -- and owns the release lifecycle. Its contract:
//!
//! - **At most one backend-level release** is ever issued, no matter how
//!   many times (or how concurrently) `release`/`dispose` run. The first
//!   caller starts the backend release; every concurrent caller -- manual
//!   or disposal -- awaits that same in-flight future and observes its
//!   outcome; callers arriving after it has completed short-circuit to
//!   [`ReleaseOutcome::Absent`].
//! - **Manual and automatic paths differ on errors.** [`release`] propagates
//!   failures to the caller; [`dispose`] never does -- failures are routed
//!   to the configured [`on_release_error`](HandleConfig::on_release_error)
//!   hook with [`ReleaseErrorSource::Disposal`] and then swallowed.
//! - **Extend is not gated by disposal.** Extending after release delegates
//!   to the backend, which answers `Absent`.
//! - A handle for a **contended** acquisition is inert: `release`/`extend`
//!   answer `Absent` without I/O and disposal does nothing, so handles are
//!   safe to use without checking [`acquired`](LockHandle::acquired) first.
//!
//! Dropping the last clone of a still-held handle spawns a best-effort
//! release when a Tokio runtime is available. Prefer calling
//! [`dispose`](LockHandle::dispose) (or using
//! [`with_lock`](crate::engine::with_lock)) for deterministic cleanup.
//!
//! [`release`]: LockHandle::release
//! [`dispose`]: LockHandle::dispose

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::{
    ensure_not_cancelled, AcquireOutcome, AcquiredLock, ExtendOutcome, LockBackend, ReleaseOutcome,
};
use crate::error::{ErrorCode, LockError, Result};

/// Which path invoked the release that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseErrorSource {
    /// Automatic release at scope exit or drop.
    Disposal,
    /// An explicit `release` call.
    Manual,
}

/// Context handed to the release-error hook alongside the error.
#[derive(Debug, Clone)]
pub struct ReleaseErrorContext {
    /// The lock ID whose release failed.
    pub lock_id: String,
    /// The user key the lock was taken on.
    pub key: String,
    /// The path that triggered the release.
    pub source: ReleaseErrorSource,
}

/// Hook invoked when an automatic release fails. Exceptions inside the hook
/// are trapped; they never unwind into the disposing scope.
pub type ReleaseErrorHook = Arc<dyn Fn(&LockError, &ReleaseErrorContext) + Send + Sync>;

/// Per-handle configuration.
#[derive(Clone, Default)]
pub struct HandleConfig {
    /// Deadline for automatic disposal. When set, disposal races the backend
    /// release against a timer that fires a cancellation into the release
    /// call; the timeout is reported through the error hook.
    pub dispose_timeout_ms: Option<u64>,
    /// Sink for release failures on the automatic path. When absent, a
    /// library-default `tracing::warn!` sink is used.
    pub on_release_error: Option<ReleaseErrorHook>,
}

impl fmt::Debug for HandleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleConfig")
            .field("dispose_timeout_ms", &self.dispose_timeout_ms)
            .field("on_release_error", &self.on_release_error.is_some())
            .finish()
    }
}

struct HandleInner {
    backend: Arc<dyn LockBackend>,
    key: String,
    acquisition: Option<AcquiredLock>,
    config: HandleConfig,
    /// The one-shot release shared by every clone. The first caller runs
    /// the backend release inside the cell's initializer; concurrent
    /// callers wait on the same initialization and read the same outcome.
    release_cell: OnceCell<std::result::Result<ReleaseOutcome, LockError>>,
    /// Set the moment a backend release is issued. Read by `Drop` (which
    /// cannot await the cell) and by the initializer take-over guard.
    release_started: AtomicBool,
    /// One-shot gates so concurrent disposers observing the same failure
    /// (or the same deadline) report it through the hook exactly once.
    timeout_reported: AtomicBool,
    failure_reported: AtomicBool,
}

impl HandleInner {
    fn context(&self, source: ReleaseErrorSource) -> ReleaseErrorContext {
        ReleaseErrorContext {
            lock_id: self
                .acquisition
                .as_ref()
                .map(|a| a.lock_id.clone())
                .unwrap_or_default(),
            key: self.key.clone(),
            source,
        }
    }

    /// Reports a failed disposal release, at most once across all clones.
    fn report_release_failure(&self, error: &LockError) {
        if self.failure_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        report_release_error(
            self.config.on_release_error.as_ref(),
            error,
            &self.context(ReleaseErrorSource::Disposal),
        );
    }

    /// Reports a disposal deadline, at most once across all clones.
    fn report_release_timeout(&self, error: &LockError) {
        if self.timeout_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        report_release_error(
            self.config.on_release_error.as_ref(),
            error,
            &self.context(ReleaseErrorSource::Disposal),
        );
    }
}

fn report_release_error(
    hook: Option<&ReleaseErrorHook>,
    error: &LockError,
    ctx: &ReleaseErrorContext,
) {
    match hook {
        Some(hook) => {
            let hook = Arc::clone(hook);
            // The hook must not unwind into the disposing scope.
            let result = catch_unwind(AssertUnwindSafe(|| hook(error, ctx)));
            if result.is_err() {
                warn!(key = %ctx.key, "release error hook panicked");
            }
        },
        None => {
            warn!(
                key = %ctx.key,
                source = ?ctx.source,
                error = %error,
                "lock release failed"
            );
        },
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.acquisition.is_none() || self.release_started.load(Ordering::Acquire) {
            return;
        }
        // Last clone of a still-held handle went away without dispose().
        // Best-effort: release on the runtime if one is alive.
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "lock handle dropped outside a runtime; lock will expire by TTL");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let hook = self.config.on_release_error.clone();
        let key = self.key.clone();
        let lock_id = self
            .acquisition
            .as_ref()
            .map(|a| a.lock_id.clone())
            .unwrap_or_default();
        rt.spawn(async move {
            let cancel = CancellationToken::new();
            if let Err(error) = backend.release(&lock_id, &cancel).await {
                let ctx = ReleaseErrorContext {
                    lock_id,
                    key,
                    source: ReleaseErrorSource::Disposal,
                };
                report_release_error(hook.as_ref(), &error, &ctx);
            }
        });
    }
}

/// Handle to an acquire attempt; see the [module docs](self) for the
/// contract. Cloning is cheap and all clones share the one-shot release
/// future.
#[derive(Clone)]
pub struct LockHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.inner.key)
            .field("acquired", &self.inner.acquisition.is_some())
            .field("released", &self.inner.release_cell.initialized())
            .finish()
    }
}

impl LockHandle {
    /// Wraps a successful acquisition.
    pub fn from_acquired(
        backend: Arc<dyn LockBackend>,
        key: impl Into<String>,
        acquisition: AcquiredLock,
        config: HandleConfig,
    ) -> Self {
        Self::build(backend, key.into(), Some(acquisition), config)
    }

    /// Builds the inert handle for a contended acquisition.
    pub fn contended(
        backend: Arc<dyn LockBackend>,
        key: impl Into<String>,
        config: HandleConfig,
    ) -> Self {
        Self::build(backend, key.into(), None, config)
    }

    /// Makes a single acquire attempt and wraps the outcome either way.
    ///
    /// # Errors
    ///
    /// Propagates backend errors; contention is not an error and yields an
    /// inert handle.
    pub async fn try_acquire(
        backend: Arc<dyn LockBackend>,
        key: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
        config: HandleConfig,
    ) -> Result<Self> {
        match backend.acquire(key, ttl_ms, cancel).await? {
            AcquireOutcome::Acquired(acquisition) => {
                Ok(Self::from_acquired(backend, key, acquisition, config))
            },
            AcquireOutcome::Locked => Ok(Self::contended(backend, key, config)),
        }
    }

    fn build(
        backend: Arc<dyn LockBackend>,
        key: String,
        acquisition: Option<AcquiredLock>,
        config: HandleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                backend,
                key,
                acquisition,
                config,
                release_cell: OnceCell::new(),
                release_started: AtomicBool::new(false),
                timeout_reported: AtomicBool::new(false),
                failure_reported: AtomicBool::new(false),
            }),
        }
    }

    /// Whether the acquisition succeeded.
    pub fn acquired(&self) -> bool {
        self.inner.acquisition.is_some()
    }

    /// The user key this handle was acquired (or contended) on.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The owning lock ID, when acquired.
    pub fn lock_id(&self) -> Option<&str> {
        self.inner.acquisition.as_ref().map(|a| a.lock_id.as_str())
    }

    /// The fencing token, when acquired.
    pub fn fence(&self) -> Option<&str> {
        self.inner.acquisition.as_ref().map(|a| a.fence.as_str())
    }

    /// The lease deadline reported at acquisition. Not refreshed by
    /// [`extend`](LockHandle::extend); the backend's answer is authoritative.
    pub fn expires_at_ms(&self) -> Option<i64> {
        self.inner.acquisition.as_ref().map(|a| a.expires_at_ms)
    }

    /// Starts the shared backend release, or joins the in-flight one.
    /// Every caller receives the outcome of the single release that ran;
    /// errors are surfaced per caller via a shallow copy (the boxed cause
    /// stays with the stored original).
    async fn join_release(
        &self,
        lock_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ReleaseOutcome> {
        let inner = &self.inner;
        let result = inner
            .release_cell
            .get_or_init(|| async {
                if inner.release_started.swap(true, Ordering::AcqRel) {
                    // A previous initializer was dropped mid-flight; its
                    // backend call was already issued, so never issue a
                    // second one.
                    return Ok(ReleaseOutcome::Absent);
                }
                inner.backend.release(lock_id, cancel).await
            })
            .await;
        match result {
            Ok(outcome) => Ok(*outcome),
            Err(error) => Err(error.clone_shallow()),
        }
    }

    /// Manually releases the lock, propagating any backend error.
    ///
    /// The first caller issues the backend release; callers arriving while
    /// it is in flight await the same release and observe the same outcome.
    /// Calls made after the release has completed return
    /// [`ReleaseOutcome::Absent`] without touching the backend.
    ///
    /// # Errors
    ///
    /// [`LockError::Aborted`] if `cancel` fired before the release was
    /// joined (the one-shot is not consumed in that case); the shared
    /// release's backend error otherwise.
    pub async fn release(&self, cancel: Option<&CancellationToken>) -> Result<ReleaseOutcome> {
        let Some(acquisition) = self.inner.acquisition.as_ref() else {
            return Ok(ReleaseOutcome::Absent);
        };
        if let Some(cancel) = cancel {
            ensure_not_cancelled(cancel)?;
        }
        if self.inner.release_cell.initialized() {
            return Ok(ReleaseOutcome::Absent);
        }
        let own_cancel = CancellationToken::new();
        let cancel = cancel.unwrap_or(&own_cancel);
        self.join_release(&acquisition.lock_id, cancel).await
    }

    /// Renews the lease. Not gated by disposal: after a release the backend
    /// simply answers [`ExtendOutcome::Absent`]. An inert handle answers
    /// `Absent` without I/O.
    ///
    /// # Errors
    ///
    /// Backend errors; [`LockError::Aborted`] on cancellation.
    pub async fn extend(
        &self,
        ttl_ms: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExtendOutcome> {
        let Some(acquisition) = self.inner.acquisition.as_ref() else {
            return Ok(ExtendOutcome::Absent);
        };
        let own_cancel = CancellationToken::new();
        let cancel = cancel.unwrap_or(&own_cancel);
        self.inner
            .backend
            .extend(&acquisition.lock_id, ttl_ms, cancel)
            .await
    }

    /// Automatic release at scope exit. Never fails: errors are routed to
    /// the configured hook with [`ReleaseErrorSource::Disposal`] and
    /// swallowed. Concurrent disposals join the same in-flight release, so
    /// each returns only once its outcome is known, and exactly one backend
    /// release is issued; a shared failure is reported once.
    ///
    /// With a [`dispose_timeout_ms`](HandleConfig::dispose_timeout_ms), the
    /// release races a timer; on timeout a cancellation is fired into the
    /// in-flight release, the deadline is reported through the hook, and a
    /// later real failure of that same release is reported as well.
    pub async fn dispose(&self) {
        let Some(acquisition) = self.inner.acquisition.as_ref() else {
            return;
        };
        if self.inner.release_cell.initialized() {
            return;
        }

        match self.inner.config.dispose_timeout_ms {
            None => {
                let cancel = CancellationToken::new();
                if let Err(error) = self.join_release(&acquisition.lock_id, &cancel).await {
                    self.inner.report_release_failure(&error);
                }
            },
            Some(timeout_ms) => {
                let child = CancellationToken::new();
                let driver_token = child.clone();
                let driver = self.clone();
                let lock_id = acquisition.lock_id.clone();
                // Fire-and-forget: the driver task outlives the deadline
                // race, keeps the shared release running, and reports its
                // eventual failure.
                let task = tokio::spawn(async move {
                    if let Err(error) = driver.join_release(&lock_id, &driver_token).await {
                        // The Aborted produced by our own deadline cancel is
                        // already reported as the timeout itself.
                        if error.code() != ErrorCode::Aborted {
                            driver.inner.report_release_failure(&error);
                        }
                    }
                });
                let deadline = Duration::from_millis(timeout_ms);
                if tokio::time::timeout(deadline, task).await.is_err() {
                    child.cancel();
                    let error = LockError::NetworkTimeout {
                        message: format!("disposal release exceeded {timeout_ms} ms"),
                        source: None,
                    };
                    self.inner.report_release_timeout(&error);
                }
            },
        }
    }
}
