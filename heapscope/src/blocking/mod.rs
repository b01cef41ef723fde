//! # Blocking-Object Heuristic Detector
//!
//! The introspection interface cannot report an owner/waiter graph, so this
//! module approximates which synchronization primitives a thread is blocked
//! on. The result is a best-effort hint, not ground truth.
//!
//! Three independent analyses are unioned and de-duplicated by
//! `(address, kind)`:
//!
//! 1. **Stack text** - the thread's rendered stack is matched against
//!    [`patterns::STACK_PATTERNS`]. Addresses cannot be recovered from text,
//!    so these records carry address 0 and the thread as owner.
//! 2. **Sync blocks** - when the stack has locking frames, monitors the
//!    runtime reports as owned by the thread are added with their object
//!    address. Engines that do not enumerate sync blocks contribute nothing,
//!    and a thread waiting to enter a monitor owns nothing, so this is often
//!    empty.
//! 3. **Heap scan** - the first [`MAX_HEAP_CANDIDATES`] objects of a known
//!    synchronization type on the whole heap, with unknown ownership. Not
//!    scoped to the thread.
//!
//! No analysis fails the request: each one logs and contributes nothing on
//! error. Results are recomputed on every call.

pub mod patterns;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use heapscope_common::{FrameInfo, Heap, Runtime, Tid};
use log::debug;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::stack::render_stack;

/// Heap scan stops after this many matches
pub const MAX_HEAP_CANDIDATES: usize = 10;

/// A synchronization primitive implicated in a thread's blocking state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockingObjectRecord {
    /// Object address, 0 when unknown
    pub address: u64,
    pub kind: String,
    pub reason: String,
    pub has_single_owner: bool,
    pub owner: Option<Tid>,
    pub waiters: BTreeSet<Tid>,
}

impl BlockingObjectRecord {
    fn key(&self) -> (u64, String) {
        (self.address, self.kind.clone())
    }
}

impl fmt::Display for BlockingObjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner =
            self.owner.map_or_else(|| "unknown owner".to_string(), |t| format!("owner {t}"));
        write!(f, "{:<16} 0x{:016x} {owner}: {}", self.kind, self.address, self.reason)
    }
}

/// Ordered union keyed by `(address, kind)`; the first record for a key wins
#[derive(Default)]
struct RecordSet {
    seen: HashSet<(u64, String)>,
    records: Vec<BlockingObjectRecord>,
}

impl RecordSet {
    fn insert(&mut self, record: BlockingObjectRecord) {
        if self.seen.insert(record.key()) {
            self.records.push(record);
        }
    }
}

/// Runs the blocking heuristics against one runtime
pub struct BlockingDetector {
    runtime: Arc<dyn Runtime>,
    heap: Arc<dyn Heap>,
}

impl BlockingDetector {
    #[must_use]
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        let heap = runtime.heap();
        Self { runtime, heap }
    }

    /// Union of all three analyses for `thread`
    #[must_use]
    pub fn blocking_objects(
        &self,
        thread: Tid,
        cancel: &CancellationToken,
    ) -> Vec<BlockingObjectRecord> {
        let frames = self.frames(thread);
        let mut found = RecordSet::default();
        for record in stack_patterns(thread, &frames, cancel) {
            found.insert(record);
        }
        for record in self.sync_block_correlation(thread, &frames, cancel) {
            found.insert(record);
        }
        for record in self.heap_scan(cancel) {
            found.insert(record);
        }
        debug!("{thread}: {} blocking candidates", found.records.len());
        found.records
    }

    #[must_use]
    pub fn is_blocked(&self, thread: Tid, cancel: &CancellationToken) -> bool {
        !self.blocking_objects(thread, cancel).is_empty()
    }

    /// Stack-text analysis only, for cheap pre-filtering
    #[must_use]
    pub fn is_likely_blocked(&self, thread: Tid, cancel: &CancellationToken) -> bool {
        !stack_patterns(thread, &self.frames(thread), cancel).is_empty()
    }

    fn frames(&self, thread: Tid) -> Vec<FrameInfo> {
        self.runtime.stack_trace(thread).unwrap_or_else(|e| {
            debug!("No stack for {thread}: {e}");
            Vec::new()
        })
    }

    fn sync_block_correlation(
        &self,
        thread: Tid,
        frames: &[FrameInfo],
        cancel: &CancellationToken,
    ) -> Vec<BlockingObjectRecord> {
        let mut locking_frame = None;
        for frame in frames {
            if cancel.is_cancelled() {
                return Vec::new();
            }
            if patterns::is_locking_frame(frame) {
                locking_frame = Some(frame);
                break;
            }
        }
        let Some(frame) = locking_frame else {
            return Vec::new();
        };

        self.runtime
            .sync_blocks()
            .into_iter()
            .filter(|block| block.owner == Some(thread) && block.object != 0)
            .map(|block| {
                let type_name = self
                    .heap
                    .object_type(block.object)
                    .map_or_else(|| "<unknown>".to_string(), |t| t.name.clone());
                BlockingObjectRecord {
                    address: block.object,
                    kind: "Monitor".to_string(),
                    reason: format!(
                        "Monitor on {type_name} held while in {}",
                        frame.display_name()
                    ),
                    has_single_owner: true,
                    owner: Some(thread),
                    waiters: BTreeSet::new(),
                }
            })
            .collect()
    }

    fn heap_scan(&self, cancel: &CancellationToken) -> Vec<BlockingObjectRecord> {
        if !self.heap.can_walk() {
            debug!("Heap not walkable, skipping synchronization type scan");
            return Vec::new();
        }
        let mut found = Vec::new();
        for object in self.heap.objects() {
            if cancel.is_cancelled() || found.len() >= MAX_HEAP_CANDIDATES {
                break;
            }
            let Some(ty) = self.heap.type_by_handle(object.type_handle) else {
                continue;
            };
            if let Some(kind) = patterns::sync_type_kind(&ty.name) {
                found.push(BlockingObjectRecord {
                    address: object.address,
                    kind: kind.to_string(),
                    reason: format!("{} instance on the heap", ty.name),
                    has_single_owner: false,
                    owner: None,
                    waiters: BTreeSet::new(),
                });
            }
        }
        found
    }
}

/// Stack-text analysis: one record per matched primitive family
fn stack_patterns(
    thread: Tid,
    frames: &[FrameInfo],
    cancel: &CancellationToken,
) -> Vec<BlockingObjectRecord> {
    let stack = render_stack(frames);
    let mut found = RecordSet::default();
    for line in stack.lines() {
        if cancel.is_cancelled() {
            break;
        }
        if let Some(pattern) = patterns::match_stack_line(line) {
            found.insert(BlockingObjectRecord {
                address: 0,
                kind: pattern.kind.to_string(),
                reason: format!("Stack contains {}", pattern.needle),
                has_single_owner: true,
                owner: Some(thread),
                waiters: BTreeSet::new(),
            });
        }
    }
    found.records
}
