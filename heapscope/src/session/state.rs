//! Session lifecycle types

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use heapscope_common::{Heap, ReaderKind, Runtime, RuntimeVersion};

use crate::domain::{SessionError, Target};

/// Lifecycle state of a [`Session`](super::Session)
///
/// ```text
/// Disconnected ──► Connecting ──► Attached ──► Detaching ──► Disconnected
///                      │
///                      └──(failure)──► Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Attached,
    Detaching,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Attached => "attached",
            SessionState::Detaching => "detaching",
        };
        f.write_str(name)
    }
}

/// Why a session detached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// The caller asked for it
    Requested,
    /// The monitored process exited
    ProcessExited,
    /// A query hit an unrecoverable I/O failure
    TargetLost,
    /// The session was dropped while attached
    Shutdown,
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DetachReason::Requested => "requested",
            DetachReason::ProcessExited => "process exited",
            DetachReason::TargetLost => "target lost",
            DetachReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Coarse progress of a connect/detach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Milestone {
    Connecting(Target),
    RuntimeSelected(RuntimeVersion),
    HeapVerified,
    Attached(Target),
    Detached(DetachReason),
}

/// Receives [`Milestone`]s as a session makes progress
///
/// Called from the session worker as well as from callers' contexts.
pub trait ProgressObserver: Send + Sync {
    fn milestone(&self, milestone: &Milestone);
}

impl<F> ProgressObserver for F
where
    F: Fn(&Milestone) + Send + Sync,
{
    fn milestone(&self, milestone: &Milestone) {
        self(milestone);
    }
}

/// Runtime and heap handles of an attached session
///
/// Cloneable and shareable, but only valid until the session detaches; every
/// accessor rejects handles from a previous attach.
#[derive(Clone)]
pub struct SessionHandles {
    runtime: Arc<dyn Runtime>,
    heap: Arc<dyn Heap>,
    reader: ReaderKind,
    epoch: u64,
    live: Arc<AtomicBool>,
}

impl SessionHandles {
    pub(crate) fn new(
        runtime: Arc<dyn Runtime>,
        heap: Arc<dyn Heap>,
        reader: ReaderKind,
        epoch: u64,
    ) -> Self {
        Self {
            runtime,
            heap,
            reader,
            epoch,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns false once the session that issued these handles detached
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// # Errors
    /// Returns [`SessionError::StaleHandles`] after detach
    pub fn runtime(&self) -> Result<&Arc<dyn Runtime>, SessionError> {
        self.check()?;
        Ok(&self.runtime)
    }

    /// # Errors
    /// Returns [`SessionError::StaleHandles`] after detach
    pub fn heap(&self) -> Result<&Arc<dyn Heap>, SessionError> {
        self.check()?;
        Ok(&self.heap)
    }

    #[must_use]
    pub fn reader_kind(&self) -> ReaderKind {
        self.reader
    }

    /// Attach generation these handles belong to
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn invalidate(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub(crate) fn context(&self) -> QueryContext {
        QueryContext {
            runtime: Arc::clone(&self.runtime),
            heap: Arc::clone(&self.heap),
        }
    }

    fn check(&self) -> Result<(), SessionError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(SessionError::StaleHandles)
        }
    }
}

impl fmt::Debug for SessionHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandles")
            .field("reader", &self.reader)
            .field("epoch", &self.epoch)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

/// What a query sees: the current runtime and heap
pub struct QueryContext {
    pub runtime: Arc<dyn Runtime>,
    pub heap: Arc<dyn Heap>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::default().to_string(), "disconnected");
        assert_eq!(DetachReason::ProcessExited.to_string(), "process exited");
    }

    #[test]
    fn test_closure_observer() {
        let seen = std::sync::Mutex::new(Vec::new());
        let observer = |m: &Milestone| seen.lock().unwrap().push(m.clone());
        observer.milestone(&Milestone::HeapVerified);
        assert_eq!(seen.lock().unwrap().as_slice(), &[Milestone::HeapVerified]);
    }
}
