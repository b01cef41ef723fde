//! Session lifecycle tests against a fake engine and real heap images

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{eventually, flag_probe, sample_image, test_config, FakeControl, FakeEngine};
use heapscope::domain::{Address, Pid, SessionError, Target};
use heapscope::engine::image::FieldSpec;
use heapscope::engine::HeapImageBuilder;
use heapscope::materialize::{FieldValue, Primitive};
use heapscope::session::Milestone;
use heapscope::symbols::SymbolPathMode;
use heapscope::{DetachReason, ObjectView, Session, SessionState};
use heapscope_common::{ElementType, Engine, EngineError, ReaderKind, Tid};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn fake_session(cache: &TempDir) -> (Session, Arc<FakeControl>, u64) {
    let (image, obj) = sample_image();
    let control = Arc::new(FakeControl::default());
    let session = Session::new(
        test_config(cache.path()),
        FakeEngine::loader(image, Arc::clone(&control)),
    );
    (session, control, obj)
}

fn record_detaches(session: &Session) -> Arc<Mutex<Vec<DetachReason>>> {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    session.on_detach(move |reason| sink.lock().unwrap().push(reason));
    reasons
}

#[tokio::test]
async fn test_attach_then_detach() {
    let cache = TempDir::new().unwrap();
    let (session, control, _) = fake_session(&cache);
    let reasons = record_detaches(&session);

    let handles = session.attach_to_process(Pid(4242), None).await.unwrap();
    assert_eq!(session.state(), SessionState::Attached);
    assert_eq!(session.target(), Some(Target::Process(Pid(4242))));
    assert!(handles.is_valid());

    assert!(session.detach().await);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(session.target(), None);
    assert!(!handles.is_valid());
    assert!(matches!(handles.runtime(), Err(SessionError::StaleHandles)));
    assert!(matches!(handles.heap(), Err(SessionError::StaleHandles)));
    assert_eq!(control.dropped(), 1);
    assert_eq!(*reasons.lock().unwrap(), vec![DetachReason::Requested]);
}

#[tokio::test]
async fn test_detach_is_idempotent() {
    let cache = TempDir::new().unwrap();
    let (session, _control, _) = fake_session(&cache);
    let reasons = record_detaches(&session);

    assert!(!session.detach().await);
    session.attach_to_process(Pid(4242), None).await.unwrap();
    assert!(session.detach().await);
    assert!(!session.detach().await);
    assert_eq!(reasons.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_attach_is_rejected() {
    let cache = TempDir::new().unwrap();
    let (session, _control, _) = fake_session(&cache);

    session.attach_to_process(Pid(4242), None).await.unwrap();
    let err = session.attach_to_process(Pid(4343), None).await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyConnected(Target::Process(Pid(4242)))));
    assert_eq!(session.state(), SessionState::Attached);
}

#[tokio::test]
async fn test_no_runtime_leaves_session_disconnected() {
    let cache = TempDir::new().unwrap();
    let (session, control, _) = fake_session(&cache);
    control.no_runtime.store(true, Ordering::SeqCst);

    let err = session.attach_to_process(Pid(4242), None).await.unwrap_err();
    assert!(matches!(err, SessionError::Engine(EngineError::NoManagedRuntime(_))));
    assert_eq!(err.to_string(), "No managed runtime found in PID:4242");
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.handles(), Err(SessionError::NotAttached)));
    assert_eq!(control.dropped(), 1);

    // Retry after the runtime shows up
    control.no_runtime.store(false, Ordering::SeqCst);
    session.attach_to_process(Pid(4242), None).await.unwrap();
    assert_eq!(session.state(), SessionState::Attached);
}

#[tokio::test]
async fn test_attach_timeout_releases_late_target() {
    let cache = TempDir::new().unwrap();
    let (session, control, _) = fake_session(&cache);
    control.delay_ms.store(300, Ordering::SeqCst);

    let err = session
        .attach_to_process(Pid(4242), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout(_)));
    assert_eq!(session.state(), SessionState::Disconnected);

    // The worker finishes the open after the caller gave up and drops it
    assert!(eventually(|| control.dropped() == 1).await);

    control.delay_ms.store(0, Ordering::SeqCst);
    session.attach_to_process(Pid(4242), None).await.unwrap();
    assert_eq!(session.state(), SessionState::Attached);
}

#[tokio::test]
async fn test_process_exit_detaches() {
    let cache = TempDir::new().unwrap();
    let (image, _) = sample_image();
    let control = Arc::new(FakeControl::default());
    let alive = Arc::new(AtomicBool::new(true));
    let config = heapscope::SessionConfig {
        liveness_probe: flag_probe(&alive),
        ..test_config(cache.path())
    };
    let session = Session::new(config, FakeEngine::loader(image, Arc::clone(&control)));
    let reasons = record_detaches(&session);

    let handles = session.attach_to_process(Pid(4242), None).await.unwrap();
    alive.store(false, Ordering::SeqCst);

    assert!(eventually(|| !reasons.lock().unwrap().is_empty()).await);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!handles.is_valid());
    assert!(eventually(|| control.dropped() == 1).await);
    assert_eq!(*reasons.lock().unwrap(), vec![DetachReason::ProcessExited]);

    // A later explicit detach has nothing to do
    assert!(!session.detach().await);
    assert_eq!(reasons.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_target_lost_detaches() {
    let cache = TempDir::new().unwrap();
    let (session, control, obj) = fake_session(&cache);
    let reasons = record_detaches(&session);
    session.attach_to_process(Pid(4242), None).await.unwrap();

    let bytes = session.read_memory(Address(obj + 8), 4).await.unwrap();
    assert_eq!(bytes, 42i32.to_le_bytes());

    control.lose_target.store(true, Ordering::SeqCst);
    let err = session.read_memory(Address(obj + 8), 4).await.unwrap_err();
    assert!(matches!(err, SessionError::Engine(EngineError::TargetLost(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(*reasons.lock().unwrap(), vec![DetachReason::TargetLost]);
}

#[tokio::test]
async fn test_queries_require_attach() {
    let cache = TempDir::new().unwrap();
    let (session, _control, _) = fake_session(&cache);

    let err = session.execute(|_| ()).await.unwrap_err();
    assert!(matches!(err, SessionError::NotAttached));
    assert!(matches!(session.threads().await, Err(SessionError::NotAttached)));
}

#[tokio::test]
async fn test_reader_kind_selects_execution_context() {
    let cache = TempDir::new().unwrap();
    let (session, _control, _) = fake_session(&cache);

    session.load_snapshot(cache.path(), ReaderKind::Direct).await.unwrap_err();

    let snapshot = cache.path().join("app.heap.json");
    std::fs::write(&snapshot, b"{}").unwrap();

    session.load_snapshot(&snapshot, ReaderKind::Direct).await.unwrap();
    let caller = std::thread::current().id();
    let ran_on = session.execute(|_| std::thread::current().id()).await.unwrap();
    assert_eq!(ran_on, caller);
    session.detach().await;

    session.load_snapshot(&snapshot, ReaderKind::DebugEngine).await.unwrap();
    let name = session
        .execute(|_| std::thread::current().name().map(str::to_string))
        .await
        .unwrap();
    assert_eq!(name.as_deref(), Some("heapscope-session"));
}

#[tokio::test]
async fn test_panicking_query_leaves_session_usable() {
    let cache = TempDir::new().unwrap();
    let (session, _control, obj) = fake_session(&cache);
    session.attach_to_process(Pid(4242), None).await.unwrap();

    let err = session
        .execute(|_| -> u32 { panic!("corrupt descriptor") })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::QueryPanicked(ref m) if m == "corrupt descriptor"));
    assert!(err.is_recoverable());
    assert_eq!(session.state(), SessionState::Attached);

    // The worker thread survived and keeps serving queries
    let name = session
        .execute(|_| std::thread::current().name().map(str::to_string))
        .await
        .unwrap();
    assert_eq!(name.as_deref(), Some("heapscope-session"));
    assert!(session.heap_statistics().await.is_ok());
    let records = session
        .inspect_object(Address(obj), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(records[1].value, FieldValue::Primitive(Primitive::I32(42)));
}

#[tokio::test]
async fn test_panicking_inline_query_is_reported() {
    let cache = TempDir::new().unwrap();
    let (session, _control, _) = fake_session(&cache);
    let snapshot = cache.path().join("app.heap.json");
    std::fs::write(&snapshot, b"{}").unwrap();
    session.load_snapshot(&snapshot, ReaderKind::Direct).await.unwrap();

    let err = session.execute(|_| -> u32 { panic!("bad offset {}", 16) }).await.unwrap_err();
    assert_eq!(err.to_string(), "Query aborted: bad offset 16");
    assert_eq!(session.state(), SessionState::Attached);
    assert_eq!(session.execute(|_| 7).await.unwrap(), 7);
}

#[tokio::test]
async fn test_handles_go_stale_on_detach() {
    let cache = TempDir::new().unwrap();
    let (session, _control, obj) = fake_session(&cache);
    let handles = session.attach_to_process(Pid(4242), None).await.unwrap();
    let view = ObjectView::from_handles(&handles, obj, None, CancellationToken::new()).unwrap();
    assert_eq!(view.records().unwrap()[0].type_name, "App.Counter");
    session.detach().await;

    assert!(matches!(handles.runtime(), Err(SessionError::StaleHandles)));
    assert!(matches!(
        ObjectView::from_handles(&handles, obj, None, CancellationToken::new()),
        Err(SessionError::StaleHandles)
    ));
    assert_eq!(handles.reader_kind(), ReaderKind::DebugEngine);
}

#[tokio::test]
async fn test_engine_load_failure_is_permanent() {
    let session = Session::new(
        heapscope::SessionConfig::default(),
        Box::new(|| -> Result<Box<dyn Engine>, EngineError> {
            Err(EngineError::ModuleLoad("libheapscope-engine.so".to_string()))
        }),
    );
    assert!(!session.is_available());

    let err = session.attach_to_process(Pid(1), None).await.unwrap_err();
    assert!(matches!(err, SessionError::EngineUnavailable(_)));
    assert!(!err.is_recoverable());

    let err = session.set_symbol_path("srv*cache", SymbolPathMode::Append).await.unwrap_err();
    assert!(matches!(err, SessionError::EngineUnavailable(_)));
    assert!(!session.detach().await);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_symbol_path_append_and_replace() {
    let cache = TempDir::new().unwrap();
    let (image, _) = sample_image();
    let control = Arc::new(FakeControl::default());
    let config = heapscope::SessionConfig {
        symbol_path: "srv*https://symbols.example.com".to_string(),
        ..test_config(cache.path())
    };
    let session = Session::new(config, FakeEngine::loader(image, Arc::clone(&control)));

    let appended = session.set_symbol_path("/opt/app/pdb", SymbolPathMode::Append).await.unwrap();
    assert_eq!(appended.search_path(), "srv*https://symbols.example.com;/opt/app/pdb");
    assert_eq!(appended.cache_dir(), cache.path());
    assert_eq!(control.last_search_path().as_deref(), Some(appended.search_path()));

    let replaced = session.set_symbol_path("/a;;/b", SymbolPathMode::Replace).await.unwrap();
    assert_eq!(replaced.search_path(), "/a;/b");
    assert_eq!(session.symbol_config().search_path(), "/a;/b");
    assert_eq!(control.last_search_path().as_deref(), Some("/a;/b"));
}

#[tokio::test]
async fn test_progress_milestones() {
    let cache = TempDir::new().unwrap();
    let (session, _control, _) = fake_session(&cache);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.set_progress_observer(Some(Arc::new(move |m: &Milestone| {
        sink.lock().unwrap().push(m.clone());
    })));

    session.attach_to_process(Pid(4242), None).await.unwrap();
    session.detach().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0], Milestone::Connecting(Target::Process(Pid(4242))));
    assert!(matches!(seen[1], Milestone::RuntimeSelected(_)));
    assert_eq!(seen[2], Milestone::HeapVerified);
    assert_eq!(seen[3], Milestone::Attached(Target::Process(Pid(4242))));
    assert_eq!(seen[4], Milestone::Detached(DetachReason::Requested));
}

// ============================================================================
// Default engine with heap image snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_inspection_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (image, obj) = sample_image();
    let path = dir.path().join("app.heap.json");
    image.save(&path).unwrap();

    let session = Session::with_default_engine(test_config(dir.path()));
    let handles = session.load_snapshot(&path, ReaderKind::Direct).await.unwrap();
    assert_eq!(handles.reader_kind(), ReaderKind::Direct);

    let records = session
        .inspect_object(Address(obj), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(records[0].type_name, "App.Counter");
    assert_eq!(records[1].field_name.as_deref(), Some("value"));
    assert_eq!(records[1].value, FieldValue::Primitive(Primitive::I32(42)));

    let threads = session.threads().await.unwrap();
    assert_eq!(threads.len(), 1);
    assert!(threads[0].likely_blocked);
    assert!(threads[0].stack.contains("System.Threading.Monitor.Enter"));

    let blocking = session
        .inspect_thread_blocking(Tid(4242), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(blocking[0].kind, "Monitor");

    let histogram = session.type_histogram(CancellationToken::new()).await.unwrap();
    assert_eq!(histogram[0].name, "App.Counter");
}

#[tokio::test]
async fn test_unknown_object_is_materialize_error() {
    let dir = TempDir::new().unwrap();
    let (image, _) = sample_image();
    let path = dir.path().join("app.heap.json");
    image.save(&path).unwrap();

    let session = Session::with_default_engine(test_config(dir.path()));
    session.load_snapshot(&path, ReaderKind::DebugEngine).await.unwrap();
    let err = session
        .inspect_object(Address(0x10), None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Materialize(_)));
    assert_eq!(session.state(), SessionState::Attached);
}

#[tokio::test]
async fn test_corrupt_string_pointer_stays_in_the_result() {
    let dir = TempDir::new().unwrap();
    let mut b = HeapImageBuilder::new();
    let ty = b.class_type(
        "App.Holder",
        &[FieldSpec::new("name", ElementType::String), FieldSpec::new("id", ElementType::I4)],
    );
    let obj = b.alloc_object(ty);
    b.set_field(obj, ty, "name", &0xffff_ffff_ffff_fffcu64.to_le_bytes());
    b.set_field(obj, ty, "id", &5i32.to_le_bytes());
    let path = dir.path().join("corrupt.heap.json");
    b.build().save(&path).unwrap();

    let session = Session::with_default_engine(test_config(dir.path()));
    session.load_snapshot(&path, ReaderKind::DebugEngine).await.unwrap();
    let records = session
        .inspect_object(Address(obj), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert!(records[1].value.is_error());
    assert_eq!(records[2].value, FieldValue::Primitive(Primitive::I32(5)));

    assert_eq!(session.state(), SessionState::Attached);
    assert!(session.heap_statistics().await.is_ok());
}

#[tokio::test]
async fn test_snapshot_with_bad_pointer_size_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut image = HeapImageBuilder::new().build();
    image.pointer_size = 16;
    let path = dir.path().join("wide.heap.json");
    image.save(&path).unwrap();

    let session = Session::with_default_engine(test_config(dir.path()));
    let err = session.load_snapshot(&path, ReaderKind::Direct).await.unwrap_err();
    assert!(matches!(err, SessionError::Engine(EngineError::SnapshotCorrupt(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_missing_snapshot() {
    let dir = TempDir::new().unwrap();
    let session = Session::with_default_engine(test_config(dir.path()));
    let err = session
        .load_snapshot(dir.path().join("absent.heap.json"), ReaderKind::Direct)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Engine(EngineError::SnapshotMissing(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_unwalkable_snapshot_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut builder = HeapImageBuilder::new();
    builder.set_walkable(false);
    let path = dir.path().join("gc.heap.json");
    builder.build().save(&path).unwrap();

    let session = Session::with_default_engine(test_config(dir.path()));
    let err = session.load_snapshot(&path, ReaderKind::Direct).await.unwrap_err();
    assert!(matches!(err, SessionError::Engine(EngineError::HeapNotWalkable)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_drop_while_attached_reports_shutdown() {
    let cache = TempDir::new().unwrap();
    let (session, control, _) = fake_session(&cache);
    let reasons = record_detaches(&session);
    session.attach_to_process(Pid(4242), None).await.unwrap();

    drop(session);
    assert_eq!(*reasons.lock().unwrap(), vec![DetachReason::Shutdown]);
    assert_eq!(control.dropped(), 1);
}
