//! # heapscope - Managed Heap Introspection
//!
//! heapscope connects to a managed runtime, either a live process or a
//! snapshot file, and answers read-only questions about it: what does this
//! object contain, which threads exist and what are they doing, and which
//! synchronization objects is a thread likely waiting on.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Caller (CLI, tests, embedders)                 │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ async operations
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Session                                │
//! │  • attach / load snapshot / detach state machine                │
//! │  • exit watcher (auto-detach when the process goes away)        │
//! │  • symbol path configuration                                    │
//! └───────────┬───────────────────────────────────┬─────────────────┘
//!             │ Direct reader: inline             │ DebugEngine reader:
//!             │                                   │ session worker thread
//!             ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Engine → DataTarget → Runtime → Heap               │
//! │        (heapscope-common traits, engine/ implementations)       │
//! └───────────┬──────────────────┬──────────────────┬───────────────┘
//!             ▼                  ▼                  ▼
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │ Materializer │   │   Blocking   │   │   Analysis   │
//!     │ (ObjectView) │   │   Detector   │   │ (heap stats) │
//!     └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`session`]: the session manager; the only path into the engine
//! - [`engine`]: engine implementations
//!   - `image`: JSON heap images, used for offline analysis and tests
//!   - `live`: `/proc`-based runtime discovery for live processes
//! - [`materialize`]: turns one object into a flat list of value records
//! - [`blocking`]: heuristics for the objects a thread is blocked on
//! - [`analysis`]: heap statistics and type histograms
//! - [`stack`]: call stack rendering
//! - [`symbols`]: symbol search path and cache directory
//! - [`preflight`], [`process_lookup`]: CLI checks before attaching
//! - [`cli`]: command-line argument parsing
//! - [`domain`]: core domain types (Pid, Address, Target) and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Heap size by generation from a snapshot
//! heapscope --snapshot app.heap.json --stats
//!
//! # Materialize one object
//! heapscope --snapshot app.heap.json --object 0x20000001008 --json
//!
//! # What is thread 4242 waiting on?
//! heapscope --snapshot app.heap.json --blocking 4242
//! ```

pub mod analysis;
pub mod blocking;
pub mod cli;
pub mod domain;
pub mod engine;
pub mod materialize;
pub mod preflight;
pub mod process_lookup;
pub mod session;
pub mod stack;
pub mod symbols;

pub use blocking::{BlockingDetector, BlockingObjectRecord};
pub use materialize::{FieldValue, ObjectValueRecord, ObjectView};
pub use session::{DetachReason, Session, SessionConfig, SessionHandles, SessionState};
