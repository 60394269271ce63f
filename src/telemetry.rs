//! Telemetry decorator.
//!
//! [`InstrumentedBackend`] wraps any [`LockBackend`] and emits one
//! [`LockEvent`] per operation, after the operation's outcome is determined.
//! Emission never alters the result: the sink is invoked with a value, its
//! return is ignored, and a panicking sink is trapped. Raw identifiers are
//! redacted unless the decorator was built with
//! [`include_raw(true)`](InstrumentedBackend::include_raw).

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::{
    AcquireOutcome, BackendCapabilities, ExtendOutcome, LockBackend, LookupQuery, RawLockInfo,
    ReleaseOutcome,
};
use crate::error::Result;
use crate::keys::{hash_key, hash_lock_id};

/// Which operation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// A single acquire attempt.
    Acquire,
    /// A release.
    Release,
    /// An extension.
    Extend,
    /// A liveness probe.
    IsLocked,
    /// A lookup, by key or by ID.
    Lookup,
}

/// Whether the operation completed or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventResult {
    /// The operation returned a result (including contention and absence,
    /// which are results, not failures).
    Ok,
    /// The operation returned an error.
    Fail,
}

/// Raw identifiers, attached only on explicit opt-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawIdentifiers {
    /// The raw user key, when the operation had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// The raw lock ID, when the operation had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
}

/// One telemetry event, emitted after an operation's outcome is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    /// The operation.
    pub event_type: EventType,
    /// Outcome classification.
    pub result: EventResult,
    /// Sanitised key digest, when the operation had a key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_hash: Option<String>,
    /// Sanitised lock-ID digest, when the operation had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id_hash: Option<String>,
    /// `"locked"`, `"absent"`, or an error code name -- whatever explains a
    /// non-success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Raw identifiers; absent unless the decorator opted in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawIdentifiers>,
}

/// Sink for telemetry events. Must not block; events are delivered on the
/// calling task after the operation completes.
pub type TelemetrySink = Arc<dyn Fn(LockEvent) + Send + Sync>;

/// A [`LockBackend`] decorator that reports every operation to a sink.
pub struct InstrumentedBackend<B> {
    inner: B,
    sink: TelemetrySink,
    include_raw: bool,
}

impl<B> fmt::Debug for InstrumentedBackend<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedBackend")
            .field("include_raw", &self.include_raw)
            .finish()
    }
}

impl<B: LockBackend> InstrumentedBackend<B> {
    /// Wraps `inner`, reporting to `sink` with raw identifiers redacted.
    pub fn new(inner: B, sink: TelemetrySink) -> Self {
        Self {
            inner,
            sink,
            include_raw: false,
        }
    }

    /// Opts in to attaching raw identifiers to every event (builder style).
    pub fn include_raw(mut self, include: bool) -> Self {
        self.include_raw = include;
        self
    }

    fn emit(&self, mut event: LockEvent, raw: RawIdentifiers) {
        if self.include_raw {
            event.raw = Some(raw);
        }
        let sink = Arc::clone(&self.sink);
        if catch_unwind(AssertUnwindSafe(|| sink(event))).is_err() {
            warn!("telemetry sink panicked; event dropped");
        }
    }
}

fn classify<T>(result: &Result<T>) -> (EventResult, Option<String>) {
    match result {
        Ok(_) => (EventResult::Ok, None),
        Err(error) => (EventResult::Fail, Some(error.code().to_string())),
    }
}

#[async_trait]
impl<B: LockBackend> LockBackend for InstrumentedBackend<B> {
    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    async fn acquire(
        &self,
        key: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<AcquireOutcome> {
        let result = self.inner.acquire(key, ttl_ms, cancel).await;
        let (event_result, mut reason) = classify(&result);
        let mut lock_id_hash = None;
        let mut raw_lock_id = None;
        match &result {
            Ok(AcquireOutcome::Acquired(lock)) => {
                lock_id_hash = Some(hash_lock_id(&lock.lock_id));
                raw_lock_id = Some(lock.lock_id.clone());
            },
            Ok(AcquireOutcome::Locked) => reason = Some("locked".to_string()),
            Err(_) => {},
        }
        self.emit(
            LockEvent {
                event_type: EventType::Acquire,
                result: event_result,
                key_hash: Some(hash_key(key)),
                lock_id_hash,
                reason,
                raw: None,
            },
            RawIdentifiers {
                key: Some(key.to_string()),
                lock_id: raw_lock_id,
            },
        );
        result
    }

    async fn release(&self, lock_id: &str, cancel: &CancellationToken) -> Result<ReleaseOutcome> {
        let result = self.inner.release(lock_id, cancel).await;
        let (event_result, mut reason) = classify(&result);
        if let Ok(ReleaseOutcome::Absent) = &result {
            reason = Some("absent".to_string());
        }
        self.emit(
            LockEvent {
                event_type: EventType::Release,
                result: event_result,
                key_hash: None,
                lock_id_hash: Some(hash_lock_id(lock_id)),
                reason,
                raw: None,
            },
            RawIdentifiers {
                key: None,
                lock_id: Some(lock_id.to_string()),
            },
        );
        result
    }

    async fn extend(
        &self,
        lock_id: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<ExtendOutcome> {
        let result = self.inner.extend(lock_id, ttl_ms, cancel).await;
        let (event_result, mut reason) = classify(&result);
        if let Ok(ExtendOutcome::Absent) = &result {
            reason = Some("absent".to_string());
        }
        self.emit(
            LockEvent {
                event_type: EventType::Extend,
                result: event_result,
                key_hash: None,
                lock_id_hash: Some(hash_lock_id(lock_id)),
                reason,
                raw: None,
            },
            RawIdentifiers {
                key: None,
                lock_id: Some(lock_id.to_string()),
            },
        );
        result
    }

    async fn is_locked(&self, key: &str, cancel: &CancellationToken) -> Result<bool> {
        let result = self.inner.is_locked(key, cancel).await;
        let (event_result, reason) = classify(&result);
        self.emit(
            LockEvent {
                event_type: EventType::IsLocked,
                result: event_result,
                key_hash: Some(hash_key(key)),
                lock_id_hash: None,
                reason,
                raw: None,
            },
            RawIdentifiers {
                key: Some(key.to_string()),
                lock_id: None,
            },
        );
        result
    }

    async fn lookup(
        &self,
        query: &LookupQuery,
        cancel: &CancellationToken,
    ) -> Result<Option<RawLockInfo>> {
        let result = self.inner.lookup(query, cancel).await;
        let (event_result, reason) = classify(&result);
        let (key_hash, lock_id_hash, raw) = match query {
            LookupQuery::ByKey(key) => (
                Some(hash_key(key)),
                None,
                RawIdentifiers {
                    key: Some(key.clone()),
                    lock_id: None,
                },
            ),
            LookupQuery::ByLockId(lock_id) => (
                None,
                Some(hash_lock_id(lock_id)),
                RawIdentifiers {
                    key: None,
                    lock_id: Some(lock_id.clone()),
                },
            ),
        };
        self.emit(
            LockEvent {
                event_type: EventType::Lookup,
                result: event_result,
                key_hash,
                lock_id_hash,
                reason,
                raw: None,
            },
            raw,
        );
        result
    }
}
