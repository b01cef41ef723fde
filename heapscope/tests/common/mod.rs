//! Shared fakes for session integration tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use heapscope::engine::image::{managed_frame, FieldSpec};
use heapscope::engine::{EngineLoader, HeapImage, HeapImageBuilder};
use heapscope::domain::Pid;
use heapscope::session::LivenessProbe;
use heapscope::SessionConfig;
use heapscope_common::{
    DataTarget, DomainId, DomainInfo, ElementType, Engine, EngineError, FieldInfo, FrameInfo, Heap,
    HeapObject, ReaderKind, Runtime, RuntimeVersion, SegmentInfo, SyncBlockInfo, ThreadInfo, Tid,
    TypeHandle, TypeInfo,
};

/// Knobs and counters shared between a test and its [`FakeEngine`]
#[derive(Default)]
pub struct FakeControl {
    /// Delay inside every attach/open call, in milliseconds
    pub delay_ms: AtomicUsize,
    /// Report no managed runtime
    pub no_runtime: AtomicBool,
    /// Reads fail with `TargetLost`
    pub lose_target: AtomicBool,
    /// Data targets dropped so far
    pub dropped: AtomicUsize,
    /// Data targets opened so far
    pub opened: AtomicUsize,
    /// Last `(search_path, cache_dir)` handed to the engine
    pub symbols: Mutex<Option<(String, String)>>,
}

impl FakeControl {
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn last_search_path(&self) -> Option<String> {
        self.symbols.lock().unwrap().as_ref().map(|(search, _)| search.clone())
    }
}

/// Engine serving a fixed heap image for both attach and snapshot open
pub struct FakeEngine {
    image: HeapImage,
    control: Arc<FakeControl>,
}

impl FakeEngine {
    pub fn loader(image: HeapImage, control: Arc<FakeControl>) -> EngineLoader {
        Box::new(move || {
            Ok::<_, EngineError>(Box::new(FakeEngine { image, control }) as Box<dyn Engine>)
        })
    }

    fn open(&self, reader: ReaderKind) -> Box<dyn DataTarget> {
        let delay = self.control.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay as u64));
        }
        self.control.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeTarget {
            inner: self.image.clone().into_target(reader),
            control: Arc::clone(&self.control),
        })
    }
}

impl Engine for FakeEngine {
    fn attach(
        &mut self,
        _pid: u32,
        _timeout: Duration,
    ) -> Result<Box<dyn DataTarget>, EngineError> {
        Ok(self.open(ReaderKind::DebugEngine))
    }

    fn open_snapshot(
        &mut self,
        _path: &Path,
        reader: ReaderKind,
    ) -> Result<Box<dyn DataTarget>, EngineError> {
        Ok(self.open(reader))
    }

    fn set_symbol_path(&mut self, search_path: &str, cache_dir: &Path) -> Result<(), EngineError> {
        *self.control.symbols.lock().unwrap() =
            Some((search_path.to_string(), cache_dir.display().to_string()));
        Ok(())
    }
}

pub struct FakeTarget {
    inner: heapscope::engine::image::ImageTarget,
    control: Arc<FakeControl>,
}

impl Drop for FakeTarget {
    fn drop(&mut self) {
        self.control.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl DataTarget for FakeTarget {
    fn reader_kind(&self) -> ReaderKind {
        self.inner.reader_kind()
    }

    fn runtime_versions(&self) -> Vec<RuntimeVersion> {
        if self.control.no_runtime.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.inner.runtime_versions()
    }

    fn create_runtime(
        &mut self,
        version: &RuntimeVersion,
    ) -> Result<Arc<dyn Runtime>, EngineError> {
        let runtime = self.inner.create_runtime(version)?;
        Ok(Arc::new(FakeRuntime {
            inner: runtime,
            control: Arc::clone(&self.control),
        }))
    }
}

struct FakeRuntime {
    inner: Arc<dyn Runtime>,
    control: Arc<FakeControl>,
}

impl Runtime for FakeRuntime {
    fn heap(&self) -> Arc<dyn Heap> {
        Arc::new(FakeHeap {
            inner: self.inner.heap(),
            control: Arc::clone(&self.control),
        })
    }

    fn threads(&self) -> Vec<ThreadInfo> {
        self.inner.threads()
    }

    fn domains(&self) -> Vec<DomainInfo> {
        self.inner.domains()
    }

    fn stack_trace(&self, thread: Tid) -> Result<Vec<FrameInfo>, EngineError> {
        self.inner.stack_trace(thread)
    }

    fn sync_blocks(&self) -> Vec<SyncBlockInfo> {
        self.inner.sync_blocks()
    }
}

struct FakeHeap {
    inner: Arc<dyn Heap>,
    control: Arc<FakeControl>,
}

impl Heap for FakeHeap {
    fn can_walk(&self) -> bool {
        self.inner.can_walk()
    }

    fn pointer_size(&self) -> usize {
        self.inner.pointer_size()
    }

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), EngineError> {
        if self.control.lose_target.load(Ordering::SeqCst) {
            return Err(EngineError::TargetLost("debuggee went away".to_string()));
        }
        self.inner.read_memory(address, buf)
    }

    fn type_by_handle(&self, handle: TypeHandle) -> Option<Arc<TypeInfo>> {
        self.inner.type_by_handle(handle)
    }

    fn object_type(&self, address: u64) -> Option<Arc<TypeInfo>> {
        self.inner.object_type(address)
    }

    fn objects(&self) -> Box<dyn Iterator<Item = HeapObject> + '_> {
        self.inner.objects()
    }

    fn segments(&self) -> Vec<SegmentInfo> {
        self.inner.segments()
    }

    fn static_field_address(
        &self,
        owner: TypeHandle,
        field: &FieldInfo,
        domain: DomainId,
    ) -> Option<u64> {
        self.inner.static_field_address(owner, field, domain)
    }

    fn thread_static_field_address(
        &self,
        owner: TypeHandle,
        field: &FieldInfo,
        domain: DomainId,
        thread: Tid,
    ) -> Option<u64> {
        self.inner.thread_static_field_address(owner, field, domain, thread)
    }
}

/// Liveness probe driven by a flag
pub fn flag_probe(alive: &Arc<AtomicBool>) -> LivenessProbe {
    let alive = Arc::clone(alive);
    Arc::new(move |_: Pid| alive.load(Ordering::SeqCst))
}

/// Config with short timeouts and an always-alive target
pub fn test_config(cache: &Path) -> SessionConfig {
    SessionConfig {
        attach_timeout: Duration::from_secs(2),
        exit_poll_interval: Duration::from_millis(10),
        liveness_probe: Arc::new(|_: Pid| true),
        symbol_path: String::new(),
        symbol_cache: Some(cache.to_path_buf()),
    }
}

/// Small image: one counter object, one thread in `Monitor.Enter`
pub fn sample_image() -> (HeapImage, u64) {
    let mut b = HeapImageBuilder::new();
    let ty = b.class_type("App.Counter", &[FieldSpec::new("value", ElementType::I4)]);
    let obj = b.alloc_object(ty);
    b.set_field(obj, ty, "value", &42i32.to_le_bytes());
    b.add_thread(
        4242,
        1,
        vec![
            managed_frame("System.Threading.Monitor", "Enter"),
            managed_frame("App.Program", "Main"),
        ],
    );
    (b.build(), obj)
}

/// Poll `cond` every 10ms for up to two seconds
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
