//! The session's serialized execution context
//!
//! One named thread owns the engine and the open data target. Every call into
//! either happens here, in submission order, so engines with strict thread
//! affinity stay on the thread that created them.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use heapscope_common::{DataTarget, Engine, EngineError, Heap, ReaderKind, Runtime};
use log::{debug, error, info, warn};

use super::state::{Milestone, ProgressObserver};
use crate::domain::{SessionError, Target};
use crate::engine::EngineLoader;
use crate::symbols;

/// Work run on the session thread
pub(crate) type Job = Box<dyn FnOnce(&mut Worker) + Send>;

/// Opens a data target with the engine
pub(crate) type OpenTarget =
    Box<dyn FnOnce(&mut dyn Engine) -> Result<Box<dyn DataTarget>, EngineError> + Send>;

pub(crate) enum Command {
    Run(Job),
    Stop,
}

/// Handles produced by a successful connect
pub(crate) struct Connected {
    pub runtime: Arc<dyn Runtime>,
    pub heap: Arc<dyn Heap>,
    pub reader: ReaderKind,
}

pub(crate) struct Worker {
    engine: Box<dyn Engine>,
    target: Option<Box<dyn DataTarget>>,
}

/// Start the session thread and load the engine on it
///
/// Blocks until the engine has loaded. On failure the thread has exited and
/// the error describes why.
pub(crate) fn spawn(loader: EngineLoader) -> Result<(Sender<Command>, JoinHandle<()>), String> {
    let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded::<Command>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);

    let handle = thread::Builder::new()
        .name("heapscope-session".to_string())
        .spawn(move || {
            let engine = match loader() {
                Ok(engine) => {
                    let _ = ready_tx.send(Ok(()));
                    engine
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            Worker {
                engine,
                target: None,
            }
            .run(&jobs_rx);
        })
        .map_err(|e| format!("failed to start session thread: {e}"))?;

    let ready = ready_rx
        .recv()
        .unwrap_or_else(|_| Err("session thread exited while loading the engine".to_string()));
    match ready {
        Ok(()) => Ok((jobs_tx, handle)),
        Err(reason) => {
            let _ = handle.join();
            Err(reason)
        }
    }
}

impl Worker {
    fn run(mut self, jobs: &Receiver<Command>) {
        debug!("Session thread started");
        while let Ok(command) = jobs.recv() {
            match command {
                Command::Run(job) => {
                    // Jobs guard their own work; this keeps the thread alive
                    // for the ones that don't
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut self))) {
                        error!("Session job panicked: {}", panic_message(payload.as_ref()));
                    }
                }
                Command::Stop => break,
            }
        }
        self.release();
        debug!("Session thread stopped");
    }

    /// Open a target, select its first runtime and verify the heap
    ///
    /// On failure nothing is retained.
    pub(crate) fn connect(
        &mut self,
        description: &Target,
        open: OpenTarget,
        progress: Option<&dyn ProgressObserver>,
    ) -> Result<Connected, EngineError> {
        self.release();
        let mut target = open(self.engine.as_mut())?;

        let version = target
            .runtime_versions()
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::NoManagedRuntime(description.to_string()))?;
        let runtime = target.create_runtime(&version)?;
        info!("Using runtime {version}");
        if let Some(observer) = progress {
            observer.milestone(&Milestone::RuntimeSelected(version));
        }

        let heap = runtime.heap();
        if !heap.can_walk() {
            return Err(EngineError::HeapNotWalkable);
        }
        if let Some(observer) = progress {
            observer.milestone(&Milestone::HeapVerified);
        }

        let reader = target.reader_kind();
        self.target = Some(target);
        Ok(Connected {
            runtime,
            heap,
            reader,
        })
    }

    /// Drop the open target and every native resource behind it
    pub(crate) fn release(&mut self) {
        if self.target.take().is_some() {
            debug!("Released data target");
        }
    }

    pub(crate) fn set_symbol_path(
        &mut self,
        search_path: &str,
        cache_dir: &Path,
    ) -> Result<(), EngineError> {
        if let Err(e) = symbols::ensure_cache_dir(cache_dir) {
            warn!("Cannot create symbol cache {}: {e}", cache_dir.display());
        }
        self.engine.set_symbol_path(search_path, cache_dir)
    }
}

/// Run `work`, turning a panic into [`SessionError::QueryPanicked`]
///
/// The session and its worker stay usable afterwards; only the caller whose
/// work panicked sees the failure.
pub(crate) fn guarded<T>(what: &str, work: impl FnOnce() -> T) -> Result<T, SessionError> {
    panic::catch_unwind(AssertUnwindSafe(work)).map_err(|payload| {
        let reason = panic_message(payload.as_ref());
        error!("{what} panicked: {reason}");
        SessionError::QueryPanicked(reason)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_passes_values_through() {
        assert_eq!(guarded("sum", || 2 + 2).unwrap(), 4);
    }

    #[test]
    fn test_guarded_reports_panic_message() {
        let err = guarded("query", || -> u32 { panic!("read past the end") }).unwrap_err();
        assert!(matches!(err, SessionError::QueryPanicked(ref m) if m == "read past the end"));

        let owned = guarded("query", || -> u32 { panic!("bad offset {}", 7) }).unwrap_err();
        assert_eq!(owned.to_string(), "Query aborted: bad offset 7");
    }
}
