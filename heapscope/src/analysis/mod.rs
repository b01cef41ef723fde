//! Analysis over a connected heap
//!
//! Pure functions over the [`Heap`](heapscope_common::Heap) interface,
//! separated from the session plumbing that schedules them.

pub mod heap_stats;

pub use heap_stats::{heap_statistics, type_histogram, HeapStatistics, TypeStat};
