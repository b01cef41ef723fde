//! # Native Introspection Interface
//!
//! Defines the seam between heapscope and the native engine that actually
//! reads a managed process (live or from a snapshot). Everything behind these
//! traits is a black box to heapscope: process attach, snapshot parsing, raw
//! memory reads and runtime/heap/type/thread enumeration.
//!
//! ## Thread affinity
//!
//! [`Engine`] and [`DataTarget`] objects are created and used on a single
//! execution context and are deliberately not required to be `Send`. The
//! [`Runtime`] and [`Heap`] handles they produce are `Send + Sync` so that a
//! reader which tolerates concurrent access ([`ReaderKind::Direct`]) can be
//! queried from any thread. Callers must still route every call for a
//! [`ReaderKind::DebugEngine`] target through the owning context.
//!
//! ## Key Types
//!
//! - [`TypeInfo`] / [`FieldInfo`] - Runtime type descriptors
//! - [`ElementType`] - Primitive/reference classification of a field or type
//! - [`ThreadInfo`] / [`FrameInfo`] - Managed thread and stack frame metadata
//! - [`SegmentInfo`] / [`SyncBlockInfo`] - Heap segment and monitor metadata
//! - [`EngineError`] - Failures reported by the engine

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Identifiers
// ============================================================================

/// Runtime type handle (method table address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct TypeHandle(pub u64);

impl fmt::Display for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Execution domain (application domain) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct DomainId(pub u64);

/// Operating system thread ID
///
/// Managed threads also carry a runtime-assigned managed ID; all heapscope
/// queries are keyed by the OS ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

// ============================================================================
// Reader Selection
// ============================================================================

/// Native snapshot/process reader backing a [`DataTarget`]
///
/// - `DebugEngine`: debugger-engine reader, every call must happen on the
///   thread that created it
/// - `Direct`: in-process reader that supports concurrent reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum ReaderKind {
    #[default]
    DebugEngine,
    Direct,
}

impl ReaderKind {
    /// Returns true if handles from this reader may be used from any thread
    #[must_use]
    pub fn is_concurrent_safe(self) -> bool {
        matches!(self, ReaderKind::Direct)
    }
}

impl fmt::Display for ReaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderKind::DebugEngine => f.write_str("debug-engine"),
            ReaderKind::Direct => f.write_str("direct"),
        }
    }
}

/// A managed runtime found in the target
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RuntimeVersion {
    /// Runtime flavor, e.g. `CoreCLR`
    pub flavor: String,
    pub version: String,
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.flavor, self.version)
    }
}

// ============================================================================
// Type Descriptors
// ============================================================================

/// Element type of a runtime type or field (mirrors the runtime's own
/// element-type encoding)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ElementType {
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    NativeInt,
    NativeUInt,
    Pointer,
    FnPtr,
    String,
    Class,
    Object,
    Struct,
    SzArray,
    Array,
    #[default]
    Unknown,
}

impl ElementType {
    /// Returns true for types whose value is stored inline and read directly
    #[must_use]
    pub fn is_primitive(self) -> bool {
        matches!(
            self,
            ElementType::Boolean
                | ElementType::Char
                | ElementType::I1
                | ElementType::U1
                | ElementType::I2
                | ElementType::U2
                | ElementType::I4
                | ElementType::U4
                | ElementType::I8
                | ElementType::U8
                | ElementType::R4
                | ElementType::R8
                | ElementType::NativeInt
                | ElementType::NativeUInt
                | ElementType::Pointer
                | ElementType::FnPtr
        )
    }

    /// Returns true for types stored as a pointer to a heap object
    #[must_use]
    pub fn is_object_reference(self) -> bool {
        matches!(
            self,
            ElementType::String
                | ElementType::Class
                | ElementType::Object
                | ElementType::SzArray
                | ElementType::Array
        )
    }

    /// Size in bytes of an inline value of this type, if fixed
    #[must_use]
    pub fn size(self, pointer_size: usize) -> Option<usize> {
        match self {
            ElementType::Boolean | ElementType::I1 | ElementType::U1 => Some(1),
            ElementType::Char | ElementType::I2 | ElementType::U2 => Some(2),
            ElementType::I4 | ElementType::U4 | ElementType::R4 => Some(4),
            ElementType::I8 | ElementType::U8 | ElementType::R8 => Some(8),
            ElementType::NativeInt
            | ElementType::NativeUInt
            | ElementType::Pointer
            | ElementType::FnPtr => Some(pointer_size),
            t if t.is_object_reference() => Some(pointer_size),
            _ => None,
        }
    }
}

/// Declared field of a runtime type
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldInfo {
    pub name: String,
    /// Metadata token of the field definition
    pub token: i32,
    /// Offset from the start of the instance data (after the object header)
    pub offset: u32,
    pub element_type: ElementType,
    /// Descriptor of the field's declared type, if the engine could load it
    #[cfg_attr(feature = "serde", serde(default))]
    pub type_handle: Option<TypeHandle>,
    pub type_name: String,
}

impl FieldInfo {
    /// Address of this field within `object`
    ///
    /// `interior` is true when `object` already points at instance data (an
    /// unboxed value type embedded in another object or array); otherwise the
    /// object header pointer is skipped first.
    #[must_use]
    pub fn address(&self, object: u64, interior: bool, pointer_size: usize) -> u64 {
        let header = if interior { 0 } else { pointer_size as u64 };
        object.wrapping_add(header).wrapping_add(u64::from(self.offset))
    }
}

/// Runtime type descriptor
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TypeInfo {
    pub handle: TypeHandle,
    pub name: String,
    pub element_type: ElementType,
    /// Size of an instance (for arrays/strings: the fixed part only)
    #[cfg_attr(feature = "serde", serde(default))]
    pub base_size: u32,
    /// Size of one array element
    #[cfg_attr(feature = "serde", serde(default))]
    pub component_size: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub component_type: Option<TypeHandle>,
    /// Owning execution domain, when the engine can resolve it
    #[cfg_attr(feature = "serde", serde(default))]
    pub domain: Option<DomainId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub fields: Vec<FieldInfo>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub static_fields: Vec<FieldInfo>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub thread_static_fields: Vec<FieldInfo>,
}

impl TypeInfo {
    #[must_use]
    pub fn is_string(&self) -> bool {
        self.element_type == ElementType::String
    }

    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self.element_type, ElementType::SzArray | ElementType::Array)
    }

    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.element_type == ElementType::Struct || self.element_type.is_primitive()
    }
}

// ============================================================================
// Threads, Stacks and Heap Layout
// ============================================================================

/// Managed thread metadata
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThreadInfo {
    pub os_id: Tid,
    pub managed_id: u32,
    pub is_alive: bool,
    /// Number of monitors the runtime believes this thread holds
    #[cfg_attr(feature = "serde", serde(default))]
    pub lock_count: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub domain: Option<DomainId>,
}

/// One frame of a managed call stack
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FrameInfo {
    pub instruction_pointer: u64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub stack_pointer: u64,
    /// Method name, `None` for runtime-internal frames
    #[cfg_attr(feature = "serde", serde(default))]
    pub method: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub declaring_type: Option<String>,
}

impl FrameInfo {
    /// `Type.Method`, `Method`, or a runtime placeholder
    #[must_use]
    pub fn display_name(&self) -> String {
        match (&self.declaring_type, &self.method) {
            (Some(ty), Some(method)) => format!("{ty}.{method}"),
            (None, Some(method)) => method.clone(),
            _ => "[Runtime]".to_string(),
        }
    }
}

/// Execution domain metadata
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DomainInfo {
    pub id: DomainId,
    pub name: String,
}

/// Generation a heap segment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Generation {
    Gen0,
    Gen1,
    Gen2,
    LargeObject,
    Pinned,
    Frozen,
}

/// A contiguous range of the managed heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SegmentInfo {
    pub start: u64,
    pub length: u64,
    pub generation: Generation,
}

/// An object found while walking the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HeapObject {
    pub address: u64,
    pub type_handle: TypeHandle,
    pub size: u64,
}

/// Monitor state attached to an object
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SyncBlockInfo {
    pub object: u64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub owner: Option<Tid>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub recursion: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub waiting: u32,
}

// ============================================================================
// Errors
// ============================================================================

/// Failures reported by the native engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to load native engine module: {0}")]
    ModuleLoad(String),

    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    #[error("Access denied to process {pid}: {reason}")]
    AccessDenied { pid: u32, reason: String },

    #[error("No managed runtime found in {0}")]
    NoManagedRuntime(String),

    #[error("Managed heap is not walkable")]
    HeapNotWalkable,

    #[error("Snapshot not found: {0}")]
    SnapshotMissing(String),

    #[error("Snapshot is corrupt or unreadable: {0}")]
    SnapshotCorrupt(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Thread {0} not found")]
    ThreadNotFound(Tid),

    #[error("Connection to target lost: {0}")]
    TargetLost(String),

    #[error("Failed to read {len} bytes at 0x{address:016x}")]
    Read { address: u64, len: usize },
}

// ============================================================================
// Interface Traits
// ============================================================================

/// Entry point of the native introspection engine
///
/// Created on, and only ever called from, the session's serialized context.
pub trait Engine {
    /// Attach to a live process
    ///
    /// # Errors
    /// Returns an error if the process cannot be attached within `timeout`
    fn attach(&mut self, pid: u32, timeout: Duration) -> Result<Box<dyn DataTarget>, EngineError>;

    /// Open a snapshot file with the given reader
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or parsed by `reader`
    fn open_snapshot(
        &mut self,
        path: &Path,
        reader: ReaderKind,
    ) -> Result<Box<dyn DataTarget>, EngineError>;

    /// Configure symbol resolution
    ///
    /// # Errors
    /// Returns an error if the engine rejects the search path
    fn set_symbol_path(&mut self, search_path: &str, cache_dir: &Path) -> Result<(), EngineError>;
}

/// An opened target (live process or snapshot)
///
/// Dropping the target releases every native resource behind it.
pub trait DataTarget {
    fn reader_kind(&self) -> ReaderKind;

    /// Managed runtimes loaded in the target, in load order
    fn runtime_versions(&self) -> Vec<RuntimeVersion>;

    /// Create a runtime handle for `version`
    ///
    /// # Errors
    /// Returns an error if the runtime's data access component is unavailable
    fn create_runtime(&mut self, version: &RuntimeVersion)
        -> Result<Arc<dyn Runtime>, EngineError>;
}

/// Handle to a connected managed runtime
pub trait Runtime: Send + Sync {
    fn heap(&self) -> Arc<dyn Heap>;

    fn threads(&self) -> Vec<ThreadInfo>;

    fn domains(&self) -> Vec<DomainInfo>;

    /// Managed call stack of `thread`, innermost frame first
    ///
    /// # Errors
    /// Returns an error if the thread is unknown or its stack cannot be walked
    fn stack_trace(&self, thread: Tid) -> Result<Vec<FrameInfo>, EngineError>;

    /// Monitors currently associated with heap objects
    ///
    /// Engines that cannot enumerate sync blocks report none.
    fn sync_blocks(&self) -> Vec<SyncBlockInfo> {
        Vec::new()
    }
}

/// Handle to the managed heap of a connected runtime
pub trait Heap: Send + Sync {
    /// Returns false if the GC was mid-collection when the target was captured
    fn can_walk(&self) -> bool;

    fn pointer_size(&self) -> usize;

    /// Fill `buf` with target memory starting at `address`
    ///
    /// # Errors
    /// Returns [`EngineError::Read`] if any byte of the range is unreadable
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), EngineError>;

    fn type_by_handle(&self, handle: TypeHandle) -> Option<Arc<TypeInfo>>;

    /// Type of the object at `address`, from its header
    fn object_type(&self, address: u64) -> Option<Arc<TypeInfo>>;

    /// Walk every object on the heap in address order
    fn objects(&self) -> Box<dyn Iterator<Item = HeapObject> + '_>;

    fn segments(&self) -> Vec<SegmentInfo>;

    /// Address of a static field's storage in `domain`
    fn static_field_address(
        &self,
        owner: TypeHandle,
        field: &FieldInfo,
        domain: DomainId,
    ) -> Option<u64>;

    /// Address of a thread-static field's storage for `thread` in `domain`
    fn thread_static_field_address(
        &self,
        owner: TypeHandle,
        field: &FieldInfo,
        domain: DomainId,
        thread: Tid,
    ) -> Option<u64>;

    /// Read a target pointer at `address`
    ///
    /// # Errors
    /// Returns [`EngineError::Read`] if the pointer is unreadable
    fn read_pointer(&self, address: u64) -> Result<u64, EngineError> {
        let mut buf = [0u8; 8];
        let size = self.pointer_size().min(8);
        self.read_memory(address, &mut buf[..size])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a little-endian `u32` at `address`
    ///
    /// # Errors
    /// Returns [`EngineError::Read`] if the value is unreadable
    fn read_u32(&self, address: u64) -> Result<u32, EngineError> {
        let mut buf = [0u8; 4];
        self.read_memory(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_address_skips_header_for_objects() {
        let field = FieldInfo {
            name: "_count".to_string(),
            token: 0x0400_0001,
            offset: 8,
            element_type: ElementType::I4,
            type_handle: None,
            type_name: "System.Int32".to_string(),
        };
        assert_eq!(field.address(0x1000, false, 8), 0x1010);
        assert_eq!(field.address(0x1000, true, 8), 0x1008);
    }

    #[test]
    fn test_element_type_sizes() {
        assert_eq!(ElementType::Boolean.size(8), Some(1));
        assert_eq!(ElementType::R8.size(8), Some(8));
        assert_eq!(ElementType::NativeInt.size(4), Some(4));
        assert_eq!(ElementType::String.size(8), Some(8));
        assert_eq!(ElementType::Struct.size(8), None);
    }

    #[test]
    fn test_reader_kind_concurrency() {
        assert!(ReaderKind::Direct.is_concurrent_safe());
        assert!(!ReaderKind::DebugEngine.is_concurrent_safe());
        assert_eq!(ReaderKind::default(), ReaderKind::DebugEngine);
    }

    #[test]
    fn test_frame_display_name() {
        let frame = FrameInfo {
            instruction_pointer: 0x7ff0,
            method: Some("Enter".to_string()),
            declaring_type: Some("System.Threading.Monitor".to_string()),
            ..FrameInfo::default()
        };
        assert_eq!(frame.display_name(), "System.Threading.Monitor.Enter");
        assert_eq!(FrameInfo::default().display_name(), "[Runtime]");
    }
}
