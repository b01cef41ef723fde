//! Heap size statistics and per-type histogram.
//!
//! # Architecture
//!
//! - **`heap_statistics()`** - Segment sizes by generation, no heap walk
//! - **`type_histogram()`** - Full heap walk aggregating objects by type
//!
//! # Performance
//!
//! - `heap_statistics()`: O(segments)
//! - `type_histogram()`: O(objects) + O(t log t) where t = distinct types

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;

use heapscope_common::{Generation, Heap, TypeHandle};
use log::debug;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

// =============================================================================
// HEAP STATISTICS
// =============================================================================

/// Committed managed heap size by generation, in bytes
///
/// ```text
/// total     100,000,000
/// gen0       10,000,000
/// gen1        5,000,000
/// gen2       50,000,000
/// loh        35,000,000
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStatistics {
    pub total: u64,
    pub gen0: u64,
    pub gen1: u64,
    pub gen2: u64,
    /// Large object heap
    pub loh: u64,
}

/// Sum segment lengths by generation
///
/// Pinned and frozen segments count toward the total only.
#[must_use]
pub fn heap_statistics(heap: &dyn Heap) -> HeapStatistics {
    let mut stats = HeapStatistics::default();
    for segment in heap.segments() {
        stats.total += segment.length;
        match segment.generation {
            Generation::Gen0 => stats.gen0 += segment.length,
            Generation::Gen1 => stats.gen1 += segment.length,
            Generation::Gen2 => stats.gen2 += segment.length,
            Generation::LargeObject => stats.loh += segment.length,
            Generation::Pinned | Generation::Frozen => {}
        }
    }
    stats
}

// =============================================================================
// TYPE HISTOGRAM
// =============================================================================

/// Objects of one type on the heap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeStat {
    pub type_handle: TypeHandle,
    pub name: String,
    pub count: usize,
    pub total_size: u64,
    /// Share of all walked bytes (0.0 - 100.0)
    pub percentage: f64,
}

/// Aggregate heap objects by type, largest total size first
///
/// A cancelled walk returns the histogram of the objects seen so far. An
/// unwalkable heap yields an empty histogram.
#[must_use]
pub fn type_histogram(heap: &dyn Heap, cancel: &CancellationToken) -> Vec<TypeStat> {
    if !heap.can_walk() {
        debug!("Heap not walkable, empty histogram");
        return Vec::new();
    }

    let mut by_type: HashMap<TypeHandle, (usize, u64)> = HashMap::new();
    let mut walked = 0u64;
    for object in heap.objects() {
        if cancel.is_cancelled() {
            debug!("Histogram cancelled after {walked} bytes");
            break;
        }
        let entry = by_type.entry(object.type_handle).or_default();
        entry.0 += 1;
        entry.1 += object.size;
        walked += object.size;
    }

    let mut stats: Vec<TypeStat> = by_type
        .into_iter()
        .map(|(handle, (count, total_size))| TypeStat {
            type_handle: handle,
            name: heap
                .type_by_handle(handle)
                .map_or_else(|| format!("<unknown {handle}>"), |t| t.name.clone()),
            count,
            total_size,
            percentage: if walked > 0 { total_size as f64 / walked as f64 * 100.0 } else { 0.0 },
        })
        .collect();

    // Sort by size descending, then name for a stable order
    stats.sort_by(|a, b| b.total_size.cmp(&a.total_size).then_with(|| a.name.cmp(&b.name)));
    stats
}
