//! Synchronization API tables used by the blocking heuristics.
//!
//! # Matching Strategy
//!
//! 1. **Stack text** - a rendered frame containing one of [`STACK_PATTERNS`]
//!    names the primitive family the thread is waiting in
//!    - `Monitor.Enter` → Monitor
//!    - `WaitHandle.WaitOne` → WaitHandle
//!
//! 2. **Locking frames** - frames whose method or declaring type mention one
//!    of [`LOCK_KEYWORDS`] are candidates for sync-block correlation
//!
//! 3. **Heap types** - objects whose type is one of [`SYNC_TYPE_NAMES`] are
//!    synchronization primitives regardless of which thread uses them

use heapscope_common::FrameInfo;

/// Stack-text pattern and the primitive family it implies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackPattern {
    pub needle: &'static str,
    pub kind: &'static str,
}

const fn pattern(needle: &'static str, kind: &'static str) -> StackPattern {
    StackPattern { needle, kind }
}

// ============================================================================
// STACK PATTERNS
// ============================================================================

/// Blocking API call sites, most specific first
pub const STACK_PATTERNS: &[StackPattern] = &[
    // === MONITOR / LOCK ===
    pattern("Monitor.Enter", "Monitor"),
    pattern("Monitor.ReliableEnter", "Monitor"),
    pattern("Monitor.TryEnter", "Monitor"),
    pattern("Monitor.Wait", "Monitor"),
    pattern("Lock.Enter", "Monitor"),
    // === WAIT HANDLES ===
    pattern("WaitHandle.WaitOne", "WaitHandle"),
    pattern("WaitHandle.WaitAny", "WaitHandle"),
    pattern("WaitHandle.WaitAll", "WaitHandle"),
    pattern("WaitHandle.WaitMultiple", "WaitHandle"),
    // === MUTEX / SEMAPHORE ===
    pattern("Mutex.WaitOne", "Mutex"),
    pattern("SemaphoreSlim.Wait", "Semaphore"),
    pattern("Semaphore.WaitOne", "Semaphore"),
    // === EVENTS ===
    pattern("ManualResetEventSlim.Wait", "ResetEvent"),
    pattern("ManualResetEvent.WaitOne", "ResetEvent"),
    pattern("AutoResetEvent.WaitOne", "ResetEvent"),
    // === TASKS / THREADS ===
    pattern("Task.Wait", "Task"),
    pattern("Task.InternalWait", "Task"),
    pattern("TaskAwaiter.GetResult", "Task"),
    pattern("Thread.Join", "ThreadJoin"),
    // === READER-WRITER LOCKS ===
    pattern("ReaderWriterLockSlim.TryEnterReadLock", "ReaderWriterLock"),
    pattern("ReaderWriterLockSlim.TryEnterWriteLock", "ReaderWriterLock"),
    pattern("ReaderWriterLockSlim.TryEnterUpgradeableReadLock", "ReaderWriterLock"),
    pattern("ReaderWriterLock.AcquireReaderLock", "ReaderWriterLock"),
    pattern("ReaderWriterLock.AcquireWriterLock", "ReaderWriterLock"),
    // === BARRIERS ===
    pattern("Barrier.SignalAndWait", "Barrier"),
    pattern("CountdownEvent.Wait", "Barrier"),
];

/// First pattern contained in `line`
#[must_use]
pub fn match_stack_line(line: &str) -> Option<&'static StackPattern> {
    STACK_PATTERNS.iter().find(|p| line.contains(p.needle))
}

// ============================================================================
// LOCKING FRAMES
// ============================================================================

/// Name fragments of methods and types involved in locking
pub const LOCK_KEYWORDS: &[&str] = &["Monitor", "Lock", "Enter", "Mutex", "Semaphore", "Wait"];

/// Returns true if the frame's method or declaring type mentions locking
#[must_use]
pub fn is_locking_frame(frame: &FrameInfo) -> bool {
    [frame.method.as_deref(), frame.declaring_type.as_deref()]
        .into_iter()
        .flatten()
        .any(|name| LOCK_KEYWORDS.iter().any(|k| name.contains(k)))
}

// ============================================================================
// HEAP TYPES
// ============================================================================

/// Fully qualified names of synchronization primitive types
pub const SYNC_TYPE_NAMES: &[&str] = &[
    "System.Threading.Mutex",
    "System.Threading.Semaphore",
    "System.Threading.SemaphoreSlim",
    "System.Threading.ManualResetEvent",
    "System.Threading.AutoResetEvent",
    "System.Threading.ManualResetEventSlim",
    "System.Threading.ReaderWriterLock",
    "System.Threading.ReaderWriterLockSlim",
    "System.Threading.Barrier",
    "System.Threading.CountdownEvent",
    "System.Threading.Lock",
];

/// Short kind for a synchronization type name (`System.Threading.Mutex` → `Mutex`)
#[must_use]
pub fn sync_type_kind(type_name: &str) -> Option<&str> {
    SYNC_TYPE_NAMES
        .iter()
        .any(|name| *name == type_name)
        .then(|| type_name.rsplit('.').next().unwrap_or(type_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_line_matches() {
        let line = "#0  0x00007ff9a0001234 System.Threading.Monitor.Enter";
        assert_eq!(match_stack_line(line).map(|p| p.kind), Some("Monitor"));
        assert_eq!(
            match_stack_line("#3 System.Threading.SemaphoreSlim.Wait").map(|p| p.kind),
            Some("Semaphore")
        );
        assert_eq!(match_stack_line("#1 App.Program.Main"), None);
    }

    #[test]
    fn test_every_family_is_covered() {
        for kind in [
            "Monitor",
            "WaitHandle",
            "Mutex",
            "Semaphore",
            "ResetEvent",
            "Task",
            "ThreadJoin",
            "ReaderWriterLock",
            "Barrier",
        ] {
            assert!(STACK_PATTERNS.iter().any(|p| p.kind == kind), "{kind} has no pattern");
        }
    }

    #[test]
    fn test_locking_frame() {
        let frame = FrameInfo {
            method: Some("EnterWriteLock".to_string()),
            declaring_type: Some("App.Cache".to_string()),
            ..FrameInfo::default()
        };
        assert!(is_locking_frame(&frame));
        assert!(!is_locking_frame(&FrameInfo::default()));
    }

    #[test]
    fn test_sync_type_kind() {
        assert_eq!(sync_type_kind("System.Threading.SemaphoreSlim"), Some("SemaphoreSlim"));
        assert_eq!(sync_type_kind("System.Threading.Thread"), None);
    }
}
