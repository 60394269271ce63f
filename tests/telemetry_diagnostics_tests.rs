//! Telemetry decorator and diagnostic helper behavior.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use syncguard::diagnostics::{get_by_id, get_by_key, get_by_key_raw, owns};
use syncguard::keys::{hash_key, hash_lock_id};
use syncguard::{
    DocumentBackend, EventResult, EventType, InstrumentedBackend, LockBackend, LockEvent,
};

type Events = Arc<std::sync::Mutex<Vec<LockEvent>>>;

fn instrumented(include_raw: bool) -> (InstrumentedBackend<DocumentBackend<syncguard::MemoryStore>>, Events) {
    let events: Events = Arc::default();
    let sink = Arc::clone(&events);
    let backend = InstrumentedBackend::new(
        DocumentBackend::in_memory(),
        Arc::new(move |event| sink.lock().unwrap().push(event)),
    )
    .include_raw(include_raw);
    (backend, events)
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

// ---- telemetry ----

#[tokio::test]
async fn one_event_per_operation_with_sanitised_identifiers() {
    let (backend, events) = instrumented(false);
    let cancel = token();

    let lock = backend
        .acquire("payment:1", 30_000, &cancel)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();
    backend.is_locked("payment:1", &cancel).await.unwrap();
    backend.release(&lock.lock_id, &cancel).await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);

    let acquire = &events[0];
    assert_eq!(acquire.event_type, EventType::Acquire);
    assert_eq!(acquire.result, EventResult::Ok);
    assert_eq!(acquire.key_hash.as_deref(), Some(hash_key("payment:1").as_str()));
    assert_eq!(
        acquire.lock_id_hash.as_deref(),
        Some(hash_lock_id(&lock.lock_id).as_str())
    );
    assert!(acquire.reason.is_none());
    assert!(acquire.raw.is_none(), "raw identifiers are redacted by default");

    assert_eq!(events[1].event_type, EventType::IsLocked);
    assert_eq!(events[2].event_type, EventType::Release);
}

#[tokio::test]
async fn contention_and_absence_are_ok_events_with_reasons() {
    let (backend, events) = instrumented(false);
    let cancel = token();

    backend.acquire("payment:1", 30_000, &cancel).await.unwrap();
    backend.acquire("payment:1", 30_000, &cancel).await.unwrap();
    let stranger = syncguard::keys::generate_lock_id();
    backend.release(&stranger, &cancel).await.unwrap();

    let events = events.lock().unwrap();
    let contended = &events[1];
    assert_eq!(contended.result, EventResult::Ok, "contention is a result");
    assert_eq!(contended.reason.as_deref(), Some("locked"));

    let absent = &events[2];
    assert_eq!(absent.result, EventResult::Ok, "absence is a result");
    assert_eq!(absent.reason.as_deref(), Some("absent"));
}

#[tokio::test]
async fn failures_carry_the_error_code() {
    let (backend, events) = instrumented(false);
    let cancel = token();
    let _ = backend.acquire("", 30_000, &cancel).await.unwrap_err();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].result, EventResult::Fail);
    assert_eq!(events[0].reason.as_deref(), Some("InvalidArgument"));
}

#[tokio::test]
async fn raw_identifiers_require_opt_in() {
    let (backend, events) = instrumented(true);
    let cancel = token();
    let lock = backend
        .acquire("payment:1", 30_000, &cancel)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();

    let events = events.lock().unwrap();
    let raw = events[0].raw.as_ref().expect("opted in");
    assert_eq!(raw.key.as_deref(), Some("payment:1"));
    assert_eq!(raw.lock_id.as_deref(), Some(lock.lock_id.as_str()));
}

#[tokio::test]
async fn panicking_sink_does_not_alter_results() {
    let backend = InstrumentedBackend::new(
        DocumentBackend::in_memory(),
        Arc::new(|_| panic!("sink bug")),
    );
    let cancel = token();
    let outcome = backend.acquire("payment:1", 30_000, &cancel).await.unwrap();
    assert!(outcome.is_acquired(), "emission must never change the result");
}

// ---- diagnostics ----

#[tokio::test]
async fn lookup_helpers_sanitise_and_agree() {
    let backend = DocumentBackend::in_memory();
    let cancel = token();
    let lock = backend
        .acquire("payment:1", 30_000, &cancel)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();

    let by_key = get_by_key(&backend, "payment:1", &cancel)
        .await
        .unwrap()
        .expect("live lock visible");
    assert_eq!(by_key.key_hash, hash_key("payment:1"));
    assert_eq!(by_key.lock_id_hash, hash_lock_id(&lock.lock_id));
    assert_eq!(by_key.fence.as_deref(), Some(lock.fence.as_str()));

    let by_id = get_by_id(&backend, &lock.lock_id, &cancel)
        .await
        .unwrap()
        .expect("live lock visible");
    assert_eq!(by_id, by_key);

    assert!(get_by_key(&backend, "unlocked", &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn owns_matches_only_the_holder() {
    let backend = DocumentBackend::in_memory();
    let cancel = token();
    let lock = backend
        .acquire("payment:1", 30_000, &cancel)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();

    assert!(owns(&backend, "payment:1", &lock.lock_id, &cancel).await.unwrap());
    let stranger = syncguard::keys::generate_lock_id();
    assert!(!owns(&backend, "payment:1", &stranger, &cancel).await.unwrap());
    assert!(!owns(&backend, "unlocked", &lock.lock_id, &cancel).await.unwrap());
}

#[tokio::test]
async fn raw_helpers_surface_raw_identifiers() {
    let backend = DocumentBackend::in_memory();
    let cancel = token();
    let lock = backend
        .acquire("payment:1", 30_000, &cancel)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();

    let raw = get_by_key_raw(&backend, "payment:1", &cancel)
        .await
        .unwrap()
        .expect("live lock visible");
    assert_eq!(raw.key, "payment:1");
    assert_eq!(raw.lock_id, lock.lock_id);
    assert_eq!(raw.info.key_hash, hash_key("payment:1"));
}
