//! # Session Manager
//!
//! A [`Session`] owns the attach/detach lifecycle of one target and is the
//! only path into the introspection engine. The engine and its data target
//! live on a dedicated worker thread (see [`worker`]); every public operation
//! is `async` and may be called from any task or thread.
//!
//! ## Reader kinds
//!
//! Queries against a [`ReaderKind::Direct`] target run immediately on the
//! caller's context. Queries against a [`ReaderKind::DebugEngine`] target are
//! queued to the worker and run one at a time, in submission order.
//!
//! ## Failure model
//!
//! - Engine load failure is permanent: every operation returns
//!   [`SessionError::EngineUnavailable`]
//! - Attach/load failures leave the session `Disconnected`; retry is safe
//! - Query failures are returned to the caller and do not change state,
//!   except [`EngineError::TargetLost`] from [`Session::try_execute`], which
//!   detaches
//! - A watched process exiting detaches automatically

mod inspect;
mod state;
mod watcher;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use heapscope_common::{EngineError, ReaderKind};
use log::{debug, error, info, warn};
use tokio::sync::oneshot;

pub use inspect::ThreadSummary;
pub use state::{
    DetachReason, Milestone, ProgressObserver, QueryContext, SessionHandles, SessionState,
};
pub use watcher::{proc_liveness, LivenessProbe};

use self::watcher::ExitWatcher;
use self::worker::{guarded, Command, Connected, Job, OpenTarget};
use crate::domain::{Pid, SessionError, Target};
use crate::engine::{DefaultEngine, EngineLoader};
use crate::symbols::{SymbolConfig, SymbolPathMode};

/// Default time allowed for attach and snapshot load
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between target liveness checks
pub const DEFAULT_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Detach notification callback
pub type DetachCallback = Arc<dyn Fn(DetachReason) + Send + Sync>;

/// Session defaults
#[derive(Clone)]
pub struct SessionConfig {
    /// Used when an attach does not specify its own timeout
    pub attach_timeout: Duration,
    pub exit_poll_interval: Duration,
    pub liveness_probe: LivenessProbe,
    /// Initial `;`-separated symbol search path
    pub symbol_path: String,
    /// Symbol cache directory, platform default when `None`
    pub symbol_cache: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            exit_poll_interval: DEFAULT_EXIT_POLL_INTERVAL,
            liveness_probe: proc_liveness(),
            symbol_path: String::new(),
            symbol_cache: None,
        }
    }
}

struct Connection {
    target: Target,
    handles: SessionHandles,
    watcher: Option<ExitWatcher>,
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    connection: Option<Connection>,
}

/// State shared with the exit watcher
struct Shared {
    jobs: Option<Sender<Command>>,
    unavailable: Option<String>,
    inner: Mutex<Inner>,
    epoch: AtomicU64,
    symbols: Mutex<SymbolConfig>,
    on_detach: Mutex<Option<DetachCallback>>,
    progress: Mutex<Option<Arc<dyn ProgressObserver>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn sender(&self) -> Result<&Sender<Command>, SessionError> {
        match (&self.jobs, &self.unavailable) {
            (Some(jobs), _) => Ok(jobs),
            (None, Some(reason)) => Err(SessionError::EngineUnavailable(reason.clone())),
            (None, None) => Err(SessionError::WorkerGone),
        }
    }

    fn submit(&self, job: Job) -> Result<(), SessionError> {
        self.sender()?.send(Command::Run(job)).map_err(|_| SessionError::WorkerGone)
    }

    fn notify(&self, milestone: &Milestone) {
        let observer = lock(&self.progress).clone();
        if let Some(observer) = observer {
            observer.milestone(milestone);
        }
    }

    fn set_state(&self, state: SessionState) {
        lock(&self.inner).state = state;
    }

    /// Attached → Detaching, invalidating the handles
    ///
    /// With `epoch`, only detaches the attach that produced it.
    fn begin_detach(&self, epoch: Option<u64>) -> Option<Connection> {
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::Attached {
            return None;
        }
        let current = inner.connection.as_ref().map(|c| c.handles.epoch());
        if epoch.is_some() && epoch != current {
            return None;
        }
        let connection = inner.connection.take()?;
        connection.handles.invalidate();
        inner.state = SessionState::Detaching;
        Some(connection)
    }

    /// Queue release of the worker's data target
    fn release_target(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |worker| {
            worker.release();
            let _ = tx.send(());
        });
        self.submit(job).ok()?;
        Some(rx)
    }

    /// Detaching → Disconnected, then notify
    fn finish_detach(&self, connection: Connection, reason: DetachReason) {
        self.set_state(SessionState::Disconnected);
        let Connection {
            target,
            watcher,
            ..
        } = connection;
        drop(watcher);
        info!("Detached from {target} ({reason})");
        self.notify(&Milestone::Detached(reason));
        let callback = lock(&self.on_detach).clone();
        if let Some(callback) = callback {
            callback(reason);
        }
    }

    /// Detach from a plain thread (exit watcher)
    fn detach_blocking(&self, epoch: u64, reason: DetachReason) -> bool {
        let Some(connection) = self.begin_detach(Some(epoch)) else {
            return false;
        };
        if let Some(done) = self.release_target() {
            let _ = done.blocking_recv();
        }
        self.finish_detach(connection, reason);
        true
    }
}

/// The introspection session
pub struct Session {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    config: SessionConfig,
}

impl Session {
    /// Start a session, loading the engine on the session thread
    ///
    /// Engine load failure is logged once and leaves the session permanently
    /// unavailable.
    #[must_use]
    pub fn new(config: SessionConfig, loader: EngineLoader) -> Self {
        let (jobs, worker, unavailable) = match worker::spawn(loader) {
            Ok((jobs, worker)) => (Some(jobs), Some(worker), None),
            Err(reason) => {
                error!("Introspection engine failed to load: {reason}");
                (None, None, Some(reason))
            }
        };

        let symbols = SymbolConfig::new(&config.symbol_path, config.symbol_cache.clone());

        let session = Self {
            shared: Arc::new(Shared {
                jobs,
                unavailable,
                inner: Mutex::new(Inner::default()),
                epoch: AtomicU64::new(0),
                symbols: Mutex::new(symbols.clone()),
                on_detach: Mutex::new(None),
                progress: Mutex::new(None),
            }),
            worker,
            config,
        };

        if session.is_available() {
            let search = symbols.search_path().to_string();
            let cache = symbols.cache_dir();
            let job: Job = Box::new(move |worker| {
                if let Err(e) = worker.set_symbol_path(&search, &cache) {
                    warn!("Engine rejected initial symbol path: {e}");
                }
            });
            if let Err(e) = session.shared.submit(job) {
                warn!("Cannot configure symbols: {e}");
            }
        }
        session
    }

    /// Session backed by the bundled [`DefaultEngine`]
    #[must_use]
    pub fn with_default_engine(config: SessionConfig) -> Self {
        Self::new(config, DefaultEngine::loader())
    }

    /// Returns false if the engine failed to load
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.shared.jobs.is_some()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.shared.inner).state
    }

    /// Current target, if attached
    #[must_use]
    pub fn target(&self) -> Option<Target> {
        lock(&self.shared.inner).connection.as_ref().map(|c| c.target.clone())
    }

    /// Handles of the current attach
    ///
    /// # Errors
    /// Returns [`SessionError::NotAttached`] outside the `Attached` state
    pub fn handles(&self) -> Result<SessionHandles, SessionError> {
        let inner = lock(&self.shared.inner);
        match (&inner.state, &inner.connection) {
            (SessionState::Attached, Some(connection)) => Ok(connection.handles.clone()),
            _ => Err(SessionError::NotAttached),
        }
    }

    /// Register the callback invoked once per completed detach
    pub fn on_detach<F>(&self, callback: F)
    where
        F: Fn(DetachReason) + Send + Sync + 'static,
    {
        *lock(&self.shared.on_detach) = Some(Arc::new(callback));
    }

    pub fn set_progress_observer(&self, observer: Option<Arc<dyn ProgressObserver>>) {
        *lock(&self.shared.progress) = observer;
    }

    #[must_use]
    pub fn symbol_config(&self) -> SymbolConfig {
        lock(&self.shared.symbols).clone()
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    /// Attach to a live process
    ///
    /// Uses the configured attach timeout when `timeout` is `None`. On success
    /// the process is watched and the session detaches when it exits.
    ///
    /// # Errors
    /// Fails if already connected, or if the process cannot be attached; the
    /// session is left `Disconnected` in that case
    pub async fn attach_to_process(
        &self,
        pid: Pid,
        timeout: Option<Duration>,
    ) -> Result<SessionHandles, SessionError> {
        let timeout = timeout.unwrap_or(self.config.attach_timeout);
        let open: OpenTarget = Box::new(move |engine| engine.attach(pid.0, timeout));
        self.connect(Target::Process(pid), timeout, open).await
    }

    /// Open a snapshot file with the given reader
    ///
    /// # Errors
    /// Fails if the file does not exist, if already connected, or if the
    /// snapshot cannot be opened; the session is left `Disconnected`
    pub async fn load_snapshot(
        &self,
        path: impl AsRef<Path>,
        reader: ReaderKind,
    ) -> Result<SessionHandles, SessionError> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(EngineError::SnapshotMissing(path.display().to_string()).into());
        }
        let timeout = self.config.attach_timeout;
        let snapshot = path.clone();
        let open: OpenTarget = Box::new(move |engine| engine.open_snapshot(&snapshot, reader));
        self.connect(Target::Snapshot(path), timeout, open).await
    }

    async fn connect(
        &self,
        target: Target,
        timeout: Duration,
        open: OpenTarget,
    ) -> Result<SessionHandles, SessionError> {
        self.shared.sender()?;
        self.begin_connect()?;
        info!("Connecting to {target}");
        self.shared.notify(&Milestone::Connecting(target.clone()));

        let (tx, rx) = oneshot::channel::<Result<Connected, SessionError>>();
        let progress = lock(&self.shared.progress).clone();
        let description = target.clone();
        let job: Job = Box::new(move |worker| {
            let result = guarded("Connect", || {
                worker.connect(&description, open, progress.as_deref())
            })
            .and_then(|connected| connected.map_err(SessionError::from));
            if let Err(Ok(_)) = tx.send(result) {
                warn!("Connect completed after the caller gave up; releasing target");
                worker.release();
            }
        });
        if let Err(e) = self.shared.submit(job) {
            self.shared.set_state(SessionState::Disconnected);
            return Err(e);
        }

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::WorkerGone),
            Err(_) => {
                // The reply may still be in flight; release whatever the
                // worker ends up holding
                let job: Job = Box::new(|worker| worker.release());
                let _ = self.shared.submit(job);
                Err(SessionError::Timeout(timeout))
            }
        };

        match outcome {
            Ok(connected) => self.finish_connect(target, connected),
            Err(e) => {
                warn!("Failed to connect to {target}: {e}");
                self.shared.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    fn begin_connect(&self) -> Result<(), SessionError> {
        let mut inner = lock(&self.shared.inner);
        match inner.state {
            SessionState::Disconnected => {
                inner.state = SessionState::Connecting;
                Ok(())
            }
            SessionState::Attached => match &inner.connection {
                Some(connection) => Err(SessionError::AlreadyConnected(connection.target.clone())),
                None => Err(SessionError::Busy("attached")),
            },
            SessionState::Connecting => Err(SessionError::Busy("connecting")),
            SessionState::Detaching => Err(SessionError::Busy("detaching")),
        }
    }

    fn finish_connect(
        &self,
        target: Target,
        connected: Connected,
    ) -> Result<SessionHandles, SessionError> {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let handles =
            SessionHandles::new(connected.runtime, connected.heap, connected.reader, epoch);
        {
            let mut inner = lock(&self.shared.inner);
            inner.connection = Some(Connection {
                target: target.clone(),
                handles: handles.clone(),
                watcher: None,
            });
            inner.state = SessionState::Attached;
        }
        info!("Attached to {target} ({} reader)", connected.reader);

        if let Target::Process(pid) = target {
            self.watch(pid, epoch);
        }
        self.shared.notify(&Milestone::Attached(target));
        Ok(handles)
    }

    fn watch(&self, pid: Pid, epoch: u64) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let spawned = ExitWatcher::spawn(
            pid,
            self.config.exit_poll_interval,
            Arc::clone(&self.config.liveness_probe),
            move || {
                if let Some(shared) = weak.upgrade() {
                    shared.detach_blocking(epoch, DetachReason::ProcessExited);
                }
            },
        );
        match spawned {
            Ok(watcher) => {
                let mut inner = lock(&self.shared.inner);
                if let Some(connection) =
                    inner.connection.as_mut().filter(|c| c.handles.epoch() == epoch)
                {
                    connection.watcher = Some(watcher);
                }
            }
            Err(e) => warn!("Cannot watch {pid} for exit: {e}"),
        }
    }

    // ------------------------------------------------------------------------
    // Detach
    // ------------------------------------------------------------------------

    /// Detach from the current target
    ///
    /// Returns false (and does nothing) if no target is attached.
    pub async fn detach(&self) -> bool {
        self.detach_with(DetachReason::Requested, None).await
    }

    async fn detach_with(&self, reason: DetachReason, epoch: Option<u64>) -> bool {
        let Some(connection) = self.shared.begin_detach(epoch) else {
            debug!("Detach ignored: session is {}", self.state());
            return false;
        };
        if let Some(done) = self.shared.release_target() {
            let _ = done.await;
        }
        self.shared.finish_detach(connection, reason);
        true
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Run a read-only query against the current runtime and heap
    ///
    /// # Errors
    /// Returns [`SessionError::NotAttached`] outside the `Attached` state,
    /// [`SessionError::StaleHandles`] if the session detached before a queued
    /// query ran, and [`SessionError::QueryPanicked`] if the query panicked.
    /// A panicking query leaves the session attached.
    pub async fn execute<T, F>(&self, query: F) -> Result<T, SessionError>
    where
        F: FnOnce(&QueryContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared.sender()?;
        let handles = self.handles()?;
        if handles.reader_kind().is_concurrent_safe() {
            return guarded("Query", || query(&handles.context()));
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |_worker| {
            let result = if handles.is_valid() {
                guarded("Query", || query(&handles.context()))
            } else {
                Err(SessionError::StaleHandles)
            };
            let _ = tx.send(result);
        });
        self.shared.submit(job)?;
        rx.await.map_err(|_| SessionError::WorkerGone)?
    }

    /// Like [`Session::execute`] for fallible queries
    ///
    /// A query failing with [`EngineError::TargetLost`] detaches the session.
    ///
    /// # Errors
    /// Returns the query's engine error, or any error of [`Session::execute`]
    pub async fn try_execute<T, F>(&self, query: F) -> Result<T, SessionError>
    where
        F: FnOnce(&QueryContext) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let epoch = self.handles().map(|h| h.epoch()).ok();
        match self.execute(query).await? {
            Ok(value) => Ok(value),
            Err(EngineError::TargetLost(reason)) => {
                warn!("Target lost: {reason}");
                self.detach_with(DetachReason::TargetLost, epoch).await;
                Err(EngineError::TargetLost(reason).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------------
    // Symbols
    // ------------------------------------------------------------------------

    /// Update the symbol search path and hand it to the engine
    ///
    /// # Errors
    /// Returns an error if the engine rejects the path
    pub async fn set_symbol_path(
        &self,
        paths: &str,
        mode: SymbolPathMode,
    ) -> Result<SymbolConfig, SessionError> {
        self.shared.sender()?;
        let config = {
            let mut symbols = lock(&self.shared.symbols);
            symbols.apply(paths, mode);
            symbols.clone()
        };
        let search = config.search_path().to_string();
        let cache = config.cache_dir();
        info!("Symbol path: {search} (cache {})", cache.display());

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |worker| {
            let _ = tx.send(worker.set_symbol_path(&search, &cache));
        });
        self.shared.submit(job)?;
        rx.await.map_err(|_| SessionError::WorkerGone)??;
        Ok(config)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(connection) = self.shared.begin_detach(None) {
            let _ = self.shared.release_target();
            self.shared.finish_detach(connection, DetachReason::Shutdown);
        }
        if let Some(jobs) = &self.shared.jobs {
            let _ = jobs.send(Command::Stop);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
