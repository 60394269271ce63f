//! The acquisition engine: retry, backoff, jitter, deadline, cancellation.
//!
//! A backend's `acquire` is a single attempt; this module turns it into a
//! deadline-bounded loop. The engine retries **only contention** -- substrate
//! errors propagate immediately, on the principle that a backend outage is
//! not going to clear in a few hundred milliseconds of lock-scoped backoff.
//!
//! The loop keeps a monotonic start instant, checks the deadline and the
//! cancellation token before every attempt and before every sleep, and
//! clamps each sleep to the remaining budget. Exhaustion of either retries
//! or time yields
//! [`LockError::AcquisitionTimeout`](crate::error::LockError::AcquisitionTimeout).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ensure_not_cancelled, AcquireOutcome, AcquiredLock, LockBackend};
use crate::error::{LockError, Result};
use crate::handle::{HandleConfig, LockHandle};

/// How the base delay grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Every retry waits the base delay.
    Fixed,
    /// Attempt `i` (0-indexed) waits `base * 2^i`.
    Exponential,
}

/// How the base delay is randomised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No randomisation: sleep exactly the base delay.
    None,
    /// Sleep a uniform fraction of the base delay: `[0, d)`.
    Full,
    /// Keep half, randomise half: `[d/2, d]`.
    Equal,
}

/// Options for the retry loop. The defaults match the library contract:
/// ten retries beyond the first attempt, 100 ms base delay, exponential
/// backoff with equal jitter, a 5 s overall deadline, and a fresh (never
/// fired) cancellation token.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Attempts beyond the first.
    pub max_retries: u32,
    /// Base delay in milliseconds.
    pub retry_delay_ms: u64,
    /// Growth strategy.
    pub backoff: Backoff,
    /// Randomisation strategy.
    pub jitter: Jitter,
    /// Overall deadline for the whole loop, in milliseconds.
    pub timeout_ms: u64,
    /// Cooperative cancellation signal, observed before every attempt and
    /// every sleep.
    pub cancel: CancellationToken,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay_ms: 100,
            backoff: Backoff::Exponential,
            jitter: Jitter::Equal,
            timeout_ms: 5_000,
            cancel: CancellationToken::new(),
        }
    }
}

/// Base delay for 0-indexed `attempt`, before jitter. Saturates instead of
/// overflowing on absurd attempt counts.
pub fn base_delay_ms(retry_delay_ms: u64, attempt: u32, backoff: Backoff) -> u64 {
    match backoff {
        Backoff::Fixed => retry_delay_ms,
        Backoff::Exponential => {
            let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
            retry_delay_ms.saturating_mul(factor)
        },
    }
}

/// Applies a jitter strategy to a base delay. `unit` is a uniform sample
/// from `[0, 1)`, injected so the transform stays a pure function (and so
/// the documented sleep bounds are directly testable).
pub fn apply_jitter(base_ms: u64, jitter: Jitter, unit: f64) -> u64 {
    debug_assert!((0.0..1.0).contains(&unit));
    let base = base_ms as f64;
    let jittered = match jitter {
        Jitter::None => base,
        Jitter::Full => unit * base,
        Jitter::Equal => base / 2.0 + unit * (base / 2.0),
    };
    jittered as u64
}

fn next_delay(options: &AcquireOptions, attempt: u32) -> Duration {
    let base = base_delay_ms(options.retry_delay_ms, attempt, options.backoff);
    let unit = rand::rng().random::<f64>();
    Duration::from_millis(apply_jitter(base, options.jitter, unit))
}

fn timeout_error(attempts: u32, start: Instant, key: &str) -> LockError {
    LockError::AcquisitionTimeout {
        attempts,
        elapsed_ms: start.elapsed().as_millis() as u64,
        key: Some(key.to_string()),
    }
}

/// Runs the retry loop against `backend` until the lock is acquired, the
/// budget runs out, or the token fires.
///
/// # Errors
///
/// [`LockError::AcquisitionTimeout`] on exhaustion of retries or time;
/// [`LockError::Aborted`] on cancellation; any substrate error from the
/// underlying attempts, propagated without retry.
pub async fn acquire_with_retry(
    backend: &dyn LockBackend,
    key: &str,
    ttl_ms: i64,
    options: &AcquireOptions,
) -> Result<AcquiredLock> {
    let start = Instant::now();
    let budget = Duration::from_millis(options.timeout_ms);
    let mut attempts: u32 = 0;

    loop {
        ensure_not_cancelled(&options.cancel)?;
        if start.elapsed() >= budget {
            return Err(timeout_error(attempts, start, key));
        }

        attempts += 1;
        match backend.acquire(key, ttl_ms, &options.cancel).await? {
            AcquireOutcome::Acquired(lock) => return Ok(lock),
            AcquireOutcome::Locked => {},
        }

        if attempts > options.max_retries {
            return Err(timeout_error(attempts, start, key));
        }

        ensure_not_cancelled(&options.cancel)?;
        let Some(remaining) = budget.checked_sub(start.elapsed()) else {
            return Err(timeout_error(attempts, start, key));
        };
        if remaining.is_zero() {
            return Err(timeout_error(attempts, start, key));
        }

        // Attempt index is 0-based for backoff purposes.
        let delay = next_delay(options, attempts - 1).min(remaining);
        debug!(key, attempt = attempts, delay_ms = delay.as_millis() as u64, "lock contended, backing off");
        tokio::select! {
            () = tokio::time::sleep(delay) => {},
            () = options.cancel.cancelled() => return Err(LockError::Aborted),
        }
    }
}

/// Acquires the lock with retries, runs `work` with a [`LockHandle`], and
/// releases exactly once on any outcome.
///
/// The work function receives a clone of the handle (so it can `extend` or
/// release early); the engine disposes the shared handle afterwards either
/// way. Release failures during that disposal are routed to the handle's
/// [`on_release_error`](HandleConfig::on_release_error) hook and swallowed:
/// they never mask the work function's own outcome.
///
/// # Errors
///
/// Acquisition errors (see [`acquire_with_retry`]), converted into `E`, and
/// whatever error the work function itself returns, unchanged.
pub async fn with_lock<T, E, F, Fut>(
    backend: Arc<dyn LockBackend>,
    key: &str,
    ttl_ms: i64,
    options: &AcquireOptions,
    config: HandleConfig,
    work: F,
) -> std::result::Result<T, E>
where
    E: From<LockError>,
    F: FnOnce(LockHandle) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let acquired = acquire_with_retry(backend.as_ref(), key, ttl_ms, options).await?;
    let handle = LockHandle::from_acquired(backend, key, acquired, config);
    let result = work(handle.clone()).await;
    handle.dispose().await;
    result
}
