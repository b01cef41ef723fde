//! # Heap Images
//!
//! A heap image is a self-contained, serializable model of a managed heap:
//! raw memory regions plus the type, thread, segment and monitor metadata a
//! native engine would report for them. Images are stored as JSON snapshot
//! files and served through the same [`DataTarget`]/[`Runtime`]/[`Heap`]
//! interface as any native reader, so everything above the engine seam works
//! unchanged against them.
//!
//! ## Object Layout
//!
//! Objects follow the runtime's in-memory layout:
//!
//! ```text
//! object ──► [ type handle ][ instance fields ...            ]
//! string ──► [ type handle ][ u32 length ][ UTF-16 chars ... ]
//! array  ──► [ type handle ][ u32 length + pad ][ elements ... ]
//! ```
//!
//! [`HeapImageBuilder`] lays objects out this way so images can be produced
//! programmatically (tests, tooling) as well as loaded from disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use heapscope_common::{
    DataTarget, DomainId, DomainInfo, ElementType, EngineError, FieldInfo, FrameInfo, Generation,
    Heap, HeapObject, ReaderKind, Runtime, RuntimeVersion, SegmentInfo, SyncBlockInfo, ThreadInfo,
    Tid, TypeHandle, TypeInfo,
};
use serde::{Deserialize, Serialize};

/// Base address of the builder's object region
const HEAP_BASE: u64 = 0x0000_0200_0000_0000;

/// First type handle the builder hands out
const TYPE_HANDLE_BASE: u64 = 0x0000_7ff8_0000_1000;

/// Metadata token table for field definitions
const FIELD_TOKEN_TABLE: i32 = 0x0400_0000;

// =============================================================================
// SERIALIZED MODEL
// =============================================================================

/// A readable range of target memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u64,
    #[serde(with = "hex::serde")]
    pub bytes: Vec<u8>,
}

impl MemoryRegion {
    fn end(&self) -> u64 {
        self.start.saturating_add(self.bytes.len() as u64)
    }
}

/// A managed thread and its captured call stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageThread {
    #[serde(flatten)]
    pub info: ThreadInfo,
    #[serde(default)]
    pub frames: Vec<FrameInfo>,
}

/// Storage location of a static (or thread-static, when `thread` is set) field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticSlot {
    pub owner: TypeHandle,
    pub field: String,
    pub domain: DomainId,
    #[serde(default)]
    pub thread: Option<Tid>,
    pub address: u64,
}

fn walkable_default() -> bool {
    true
}

/// Serializable heap model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapImage {
    pub pointer_size: usize,
    pub runtime: RuntimeVersion,
    #[serde(default = "walkable_default")]
    pub walkable: bool,
    #[serde(default)]
    pub regions: Vec<MemoryRegion>,
    #[serde(default)]
    pub types: Vec<TypeInfo>,
    #[serde(default)]
    pub objects: Vec<HeapObject>,
    #[serde(default)]
    pub segments: Vec<SegmentInfo>,
    #[serde(default)]
    pub domains: Vec<DomainInfo>,
    #[serde(default)]
    pub threads: Vec<ImageThread>,
    #[serde(default)]
    pub sync_blocks: Vec<SyncBlockInfo>,
    #[serde(default)]
    pub statics: Vec<StaticSlot>,
}

impl HeapImage {
    /// Load a heap image snapshot from a JSON file
    ///
    /// # Errors
    /// Returns [`EngineError::SnapshotMissing`] if the file does not exist and
    /// [`EngineError::SnapshotCorrupt`] if it cannot be parsed or declares a
    /// pointer size other than 4 or 8
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::SnapshotMissing(path.display().to_string())
            } else {
                EngineError::SnapshotCorrupt(format!("{}: {e}", path.display()))
            }
        })?;
        let image: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| EngineError::SnapshotCorrupt(format!("{}: {e}", path.display())))?;
        if !matches!(image.pointer_size, 4 | 8) {
            return Err(EngineError::SnapshotCorrupt(format!(
                "{}: pointer size {} is neither 4 nor 8",
                path.display(),
                image.pointer_size
            )));
        }
        Ok(image)
    }

    /// Write the image as a JSON snapshot file
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create snapshot {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), self).context("Failed to write snapshot")?;
        Ok(())
    }

    /// Open the image as a data target served by `reader`
    #[must_use]
    pub fn into_target(self, reader: ReaderKind) -> ImageTarget {
        ImageTarget {
            data: Arc::new(ImageData::new(self)),
            reader,
        }
    }
}

// =============================================================================
// INTERFACE IMPLEMENTATION
// =============================================================================

/// Indexed, immutable view of a heap image shared by all handles
#[derive(Debug)]
struct ImageData {
    image: HeapImage,
    types: HashMap<TypeHandle, Arc<TypeInfo>>,
}

impl ImageData {
    fn new(mut image: HeapImage) -> Self {
        image.regions.sort_by_key(|r| r.start);
        image.objects.sort_by_key(|o| o.address);
        let types = image.types.iter().map(|t| (t.handle, Arc::new(t.clone()))).collect();
        Self { image, types }
    }
}

/// [`DataTarget`] over a heap image
pub struct ImageTarget {
    data: Arc<ImageData>,
    reader: ReaderKind,
}

impl DataTarget for ImageTarget {
    fn reader_kind(&self) -> ReaderKind {
        self.reader
    }

    fn runtime_versions(&self) -> Vec<RuntimeVersion> {
        vec![self.data.image.runtime.clone()]
    }

    fn create_runtime(
        &mut self,
        version: &RuntimeVersion,
    ) -> Result<Arc<dyn Runtime>, EngineError> {
        if *version != self.data.image.runtime {
            return Err(EngineError::Unsupported(format!("runtime {version} is not in this image")));
        }
        let heap = Arc::new(ImageHeap {
            data: Arc::clone(&self.data),
        });
        Ok(Arc::new(ImageRuntime {
            data: Arc::clone(&self.data),
            heap,
        }))
    }
}

struct ImageRuntime {
    data: Arc<ImageData>,
    heap: Arc<ImageHeap>,
}

impl Runtime for ImageRuntime {
    fn heap(&self) -> Arc<dyn Heap> {
        self.heap.clone()
    }

    fn threads(&self) -> Vec<ThreadInfo> {
        self.data.image.threads.iter().map(|t| t.info.clone()).collect()
    }

    fn domains(&self) -> Vec<DomainInfo> {
        self.data.image.domains.clone()
    }

    fn stack_trace(&self, thread: Tid) -> Result<Vec<FrameInfo>, EngineError> {
        self.data
            .image
            .threads
            .iter()
            .find(|t| t.info.os_id == thread)
            .map(|t| t.frames.clone())
            .ok_or(EngineError::ThreadNotFound(thread))
    }

    fn sync_blocks(&self) -> Vec<SyncBlockInfo> {
        self.data.image.sync_blocks.clone()
    }
}

struct ImageHeap {
    data: Arc<ImageData>,
}

impl Heap for ImageHeap {
    fn can_walk(&self) -> bool {
        self.data.image.walkable
    }

    fn pointer_size(&self) -> usize {
        self.data.image.pointer_size
    }

    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), EngineError> {
        let fault = EngineError::Read {
            address,
            len: buf.len(),
        };
        let regions = &self.data.image.regions;
        let idx = regions.partition_point(|r| r.start <= address);
        if idx == 0 {
            return Err(fault);
        }
        let region = &regions[idx - 1];
        let offset = usize::try_from(address - region.start).map_err(|_| fault.clone())?;
        let end = offset.checked_add(buf.len()).ok_or_else(|| fault.clone())?;
        let src = region.bytes.get(offset..end).ok_or(fault)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn type_by_handle(&self, handle: TypeHandle) -> Option<Arc<TypeInfo>> {
        self.data.types.get(&handle).cloned()
    }

    fn object_type(&self, address: u64) -> Option<Arc<TypeInfo>> {
        let handle = self.read_pointer(address).ok()?;
        self.type_by_handle(TypeHandle(handle))
    }

    fn objects(&self) -> Box<dyn Iterator<Item = HeapObject> + '_> {
        Box::new(self.data.image.objects.iter().copied())
    }

    fn segments(&self) -> Vec<SegmentInfo> {
        self.data.image.segments.clone()
    }

    fn static_field_address(
        &self,
        owner: TypeHandle,
        field: &FieldInfo,
        domain: DomainId,
    ) -> Option<u64> {
        self.data
            .image
            .statics
            .iter()
            .find(|s| {
                s.owner == owner
                    && s.field == field.name
                    && s.domain == domain
                    && s.thread.is_none()
            })
            .map(|s| s.address)
    }

    fn thread_static_field_address(
        &self,
        owner: TypeHandle,
        field: &FieldInfo,
        domain: DomainId,
        thread: Tid,
    ) -> Option<u64> {
        self.data
            .image
            .statics
            .iter()
            .find(|s| {
                s.owner == owner
                    && s.field == field.name
                    && s.domain == domain
                    && s.thread == Some(thread)
            })
            .map(|s| s.address)
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Declared field of a type under construction
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec<'a> {
    pub name: &'a str,
    pub element_type: ElementType,
    pub field_type: Option<TypeHandle>,
}

impl<'a> FieldSpec<'a> {
    #[must_use]
    pub fn new(name: &'a str, element_type: ElementType) -> Self {
        Self {
            name,
            element_type,
            field_type: None,
        }
    }

    /// Field whose declared type is a type defined in the builder
    #[must_use]
    pub fn of_type(name: &'a str, element_type: ElementType, field_type: TypeHandle) -> Self {
        Self {
            name,
            element_type,
            field_type: Some(field_type),
        }
    }
}

/// Builds a [`HeapImage`] object by object
pub struct HeapImageBuilder {
    image: HeapImage,
    heap: Vec<u8>,
    types: HashMap<TypeHandle, TypeInfo>,
    type_names: HashMap<String, TypeHandle>,
    /// Instance data size of value types (what an embedding field occupies)
    value_sizes: HashMap<TypeHandle, u32>,
    next_handle: u64,
    next_token: i32,
}

impl HeapImageBuilder {
    /// Create an empty 64-bit image with a default runtime
    #[must_use]
    pub fn new() -> Self {
        Self::with_pointer_size(8)
    }

    #[must_use]
    pub fn with_pointer_size(pointer_size: usize) -> Self {
        Self {
            image: HeapImage {
                pointer_size,
                runtime: RuntimeVersion {
                    flavor: "CoreCLR".to_string(),
                    version: "8.0.0".to_string(),
                },
                walkable: true,
                regions: Vec::new(),
                types: Vec::new(),
                objects: Vec::new(),
                segments: Vec::new(),
                domains: Vec::new(),
                threads: Vec::new(),
                sync_blocks: Vec::new(),
                statics: Vec::new(),
            },
            heap: Vec::new(),
            types: HashMap::new(),
            type_names: HashMap::new(),
            value_sizes: HashMap::new(),
            next_handle: TYPE_HANDLE_BASE,
            next_token: 1,
        }
    }

    fn ptr(&self) -> u64 {
        self.image.pointer_size as u64
    }

    // -------------------------------------------------------------------------
    // Types
    // -------------------------------------------------------------------------

    fn register(&mut self, mut ty: TypeInfo) -> TypeHandle {
        if let Some(&existing) = self.type_names.get(&ty.name) {
            return existing;
        }
        let handle = TypeHandle(self.next_handle);
        self.next_handle += 0x40;
        ty.handle = handle;
        self.type_names.insert(ty.name.clone(), handle);
        self.types.insert(handle, ty);
        handle
    }

    fn empty_type(name: &str, element_type: ElementType) -> TypeInfo {
        TypeInfo {
            handle: TypeHandle(0),
            name: name.to_string(),
            element_type,
            base_size: 0,
            component_size: 0,
            component_type: None,
            domain: None,
            fields: Vec::new(),
            static_fields: Vec::new(),
            thread_static_fields: Vec::new(),
        }
    }

    /// Look up a type defined earlier by name
    #[must_use]
    pub fn type_named(&self, name: &str) -> Option<TypeHandle> {
        self.type_names.get(name).copied()
    }

    /// Define (or look up) a primitive type such as `System.Int32`
    pub fn primitive_type(&mut self, name: &str, element_type: ElementType) -> TypeHandle {
        let size = element_type.size(self.image.pointer_size).unwrap_or(0) as u32;
        let mut ty = Self::empty_type(name, element_type);
        ty.base_size = size + 2 * self.ptr() as u32;
        let handle = self.register(ty);
        self.value_sizes.insert(handle, size);
        handle
    }

    /// Define (or look up) `System.String`
    pub fn string_type(&mut self) -> TypeHandle {
        if let Some(handle) = self.type_named("System.String") {
            return handle;
        }
        let mut ty = Self::empty_type("System.String", ElementType::String);
        ty.base_size = 2 * self.ptr() as u32 + 6;
        ty.component_size = 2;
        ty.fields = vec![
            self.field_info("_stringLength", ElementType::I4, 0, None),
            self.field_info("_firstChar", ElementType::Char, 4, None),
        ];
        self.register(ty)
    }

    /// Define a reference type with sequentially laid out fields
    pub fn class_type(&mut self, name: &str, fields: &[FieldSpec<'_>]) -> TypeHandle {
        let (fields, data_size) = self.layout(fields);
        let mut ty = Self::empty_type(name, ElementType::Class);
        ty.fields = fields;
        ty.base_size = (data_size + 2 * self.ptr()).max(3 * self.ptr()) as u32;
        self.register(ty)
    }

    /// Define a value type with sequentially laid out fields
    pub fn struct_type(&mut self, name: &str, fields: &[FieldSpec<'_>]) -> TypeHandle {
        let (fields, data_size) = self.layout(fields);
        let mut ty = Self::empty_type(name, ElementType::Struct);
        ty.fields = fields;
        ty.base_size = (data_size + 2 * self.ptr()) as u32;
        let handle = self.register(ty);
        self.value_sizes.insert(handle, data_size as u32);
        handle
    }

    /// Define (or look up) the single-dimension array type of `component`
    pub fn array_type(&mut self, component: TypeHandle) -> TypeHandle {
        let (name, component_size) = match self.types.get(&component) {
            Some(c) if c.element_type == ElementType::Struct || c.element_type.is_primitive() => {
                (format!("{}[]", c.name), self.value_sizes.get(&component).copied().unwrap_or(0))
            }
            Some(c) => (format!("{}[]", c.name), self.ptr() as u32),
            None => ("System.Object[]".to_string(), self.ptr() as u32),
        };
        let mut ty = Self::empty_type(&name, ElementType::SzArray);
        ty.base_size = 3 * self.ptr() as u32;
        ty.component_size = component_size;
        ty.component_type = Some(component);
        self.register(ty)
    }

    /// Assign `ty` to an execution domain, creating the domain if needed
    pub fn set_type_domain(&mut self, ty: TypeHandle, domain: DomainId) {
        self.ensure_domain(domain);
        if let Some(info) = self.types.get_mut(&ty) {
            info.domain = Some(domain);
        }
    }

    fn ensure_domain(&mut self, domain: DomainId) {
        if !self.image.domains.iter().any(|d| d.id == domain) {
            let name = if domain.0 == 1 {
                "DefaultDomain".to_string()
            } else {
                format!("Domain{}", domain.0)
            };
            self.image.domains.push(DomainInfo { id: domain, name });
        }
    }

    /// Declare a static field on `owner` whose storage lives at `address`
    pub fn add_static_field(
        &mut self,
        owner: TypeHandle,
        spec: FieldSpec<'_>,
        domain: DomainId,
        address: u64,
    ) {
        let field = self.field_info(spec.name, spec.element_type, 0, spec.field_type);
        if let Some(info) = self.types.get_mut(&owner) {
            info.static_fields.push(field);
        }
        self.image.statics.push(StaticSlot {
            owner,
            field: spec.name.to_string(),
            domain,
            thread: None,
            address,
        });
    }

    /// Declare a thread-static field on `owner` whose storage for `thread`
    /// lives at `address`
    pub fn add_thread_static_field(
        &mut self,
        owner: TypeHandle,
        spec: FieldSpec<'_>,
        domain: DomainId,
        thread: Tid,
        address: u64,
    ) {
        let field = self.field_info(spec.name, spec.element_type, 0, spec.field_type);
        if let Some(info) = self.types.get_mut(&owner) {
            if !info.thread_static_fields.iter().any(|f| f.name == field.name) {
                info.thread_static_fields.push(field);
            }
        }
        self.image.statics.push(StaticSlot {
            owner,
            field: spec.name.to_string(),
            domain,
            thread: Some(thread),
            address,
        });
    }

    fn field_info(
        &mut self,
        name: &str,
        element_type: ElementType,
        offset: u32,
        field_type: Option<TypeHandle>,
    ) -> FieldInfo {
        let token = FIELD_TOKEN_TABLE | self.next_token;
        self.next_token += 1;
        let type_name = field_type
            .and_then(|h| self.types.get(&h).map(|t| t.name.clone()))
            .unwrap_or_else(|| element_type_name(element_type).to_string());
        FieldInfo {
            name: name.to_string(),
            token,
            offset,
            element_type,
            type_handle: field_type,
            type_name,
        }
    }

    fn field_size(&self, spec: &FieldSpec<'_>) -> u64 {
        if spec.element_type == ElementType::Struct {
            return spec
                .field_type
                .and_then(|h| self.value_sizes.get(&h))
                .map_or(self.ptr(), |&s| u64::from(s));
        }
        spec.element_type.size(self.image.pointer_size).map_or(self.ptr(), |s| s as u64)
    }

    fn layout(&mut self, specs: &[FieldSpec<'_>]) -> (Vec<FieldInfo>, u64) {
        let mut fields = Vec::with_capacity(specs.len());
        let mut cursor = 0u64;
        for spec in specs {
            let size = self.field_size(spec);
            let align = if size >= self.ptr() {
                self.ptr()
            } else if size >= 4 {
                4
            } else if size >= 2 {
                2
            } else {
                1
            };
            let offset = cursor.next_multiple_of(align);
            cursor = offset + size;
            let field =
                self.field_info(spec.name, spec.element_type, offset as u32, spec.field_type);
            fields.push(field);
        }
        (fields, cursor.next_multiple_of(self.ptr()))
    }

    /// Offset-resolved address of a declared instance field of `object`
    #[must_use]
    pub fn field_address(&self, object: u64, ty: TypeHandle, field: &str) -> Option<u64> {
        let info = self.types.get(&ty)?;
        let field = info.fields.iter().find(|f| f.name == field)?;
        let interior = info.element_type == ElementType::Struct;
        Some(field.address(object, interior, self.image.pointer_size))
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    /// Write raw bytes anywhere in the target address space
    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) {
        let heap_end = HEAP_BASE + self.heap.len() as u64;
        if address >= HEAP_BASE && address + bytes.len() as u64 <= heap_end {
            let start = (address - HEAP_BASE) as usize;
            self.heap[start..start + bytes.len()].copy_from_slice(bytes);
            return;
        }
        if let Some(region) = self
            .image
            .regions
            .iter_mut()
            .find(|r| address >= r.start && address + bytes.len() as u64 <= r.end())
        {
            let start = (address - region.start) as usize;
            region.bytes[start..start + bytes.len()].copy_from_slice(bytes);
            return;
        }
        self.image.regions.push(MemoryRegion {
            start: address,
            bytes: bytes.to_vec(),
        });
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        self.write_bytes(address, &value.to_le_bytes());
    }

    /// Write a target pointer (sized by the image's pointer size)
    pub fn write_pointer(&mut self, address: u64, value: u64) {
        let size = self.image.pointer_size.min(8);
        self.write_bytes(address, &value.to_le_bytes()[..size]);
    }

    /// Write `bytes` into a named instance field of `object`
    ///
    /// Returns false if `ty` has no such field.
    pub fn set_field(&mut self, object: u64, ty: TypeHandle, field: &str, bytes: &[u8]) -> bool {
        match self.field_address(object, ty, field) {
            Some(address) => {
                self.write_bytes(address, bytes);
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    fn alloc_raw(&mut self, ty: TypeHandle, size: u64) -> u64 {
        let ptr = self.ptr();
        let size = size.next_multiple_of(ptr).max(3 * ptr);
        // Leave room for the object header word that precedes every object
        let header = self.heap.len() as u64 + ptr;
        let address = HEAP_BASE + header;
        self.heap.resize((header + size) as usize, 0);
        self.write_pointer(address, ty.0);
        self.image.objects.push(HeapObject {
            address,
            type_handle: ty,
            size,
        });
        address
    }

    /// Allocate a zeroed instance of `ty`
    pub fn alloc_object(&mut self, ty: TypeHandle) -> u64 {
        let size = self.types.get(&ty).map_or(3 * self.ptr(), |t| u64::from(t.base_size));
        self.alloc_raw(ty, size)
    }

    /// Allocate a string object holding `text`
    pub fn alloc_string(&mut self, text: &str) -> u64 {
        let ty = self.string_type();
        let units: Vec<u16> = text.encode_utf16().collect();
        let ptr = self.ptr();
        let size = ptr + 4 + 2 * (units.len() as u64 + 1);
        let address = self.alloc_raw(ty, size);
        self.write_u32(address + ptr, units.len() as u32);
        let chars: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
        self.write_bytes(address + ptr + 4, &chars);
        address
    }

    /// Allocate a zeroed single-dimension array of `len` elements
    pub fn alloc_array(&mut self, component: TypeHandle, len: usize) -> u64 {
        self.alloc_array_with_length(component, len, len)
    }

    /// Allocate an array backed by `backed_len` elements whose header reports
    /// `reported_len`
    ///
    /// Reads past the backed elements fault as long as nothing is allocated
    /// after this array.
    pub fn alloc_array_with_length(
        &mut self,
        component: TypeHandle,
        backed_len: usize,
        reported_len: usize,
    ) -> u64 {
        let ty = self.array_type(component);
        let component_size =
            self.types.get(&ty).map_or(self.ptr(), |t| u64::from(t.component_size));
        let ptr = self.ptr();
        let address = self.alloc_raw(ty, 2 * ptr + component_size * backed_len as u64);
        self.write_u32(address + ptr, reported_len as u32);
        address
    }

    /// Address of element `index` of an array allocated by this builder
    #[must_use]
    pub fn element_address(&self, array: u64, component: TypeHandle, index: usize) -> u64 {
        let component_size = match self.types.get(&component) {
            Some(c) if c.element_type == ElementType::Struct || c.element_type.is_primitive() => {
                self.value_sizes.get(&component).map_or(self.ptr(), |&s| u64::from(s))
            }
            _ => self.ptr(),
        };
        array + 2 * self.ptr() + component_size * index as u64
    }

    // -------------------------------------------------------------------------
    // Runtime metadata
    // -------------------------------------------------------------------------

    /// Add a managed thread with its call stack (innermost frame first)
    pub fn add_thread(&mut self, os_id: u32, managed_id: u32, frames: Vec<FrameInfo>) -> Tid {
        let tid = Tid(os_id);
        self.image.threads.push(ImageThread {
            info: ThreadInfo {
                os_id: tid,
                managed_id,
                is_alive: true,
                lock_count: 0,
                domain: None,
            },
            frames,
        });
        tid
    }

    /// Record that `owner` holds the monitor of `object`
    pub fn add_sync_block(&mut self, object: u64, owner: Option<Tid>) {
        if let Some(tid) = owner {
            if let Some(thread) = self.image.threads.iter_mut().find(|t| t.info.os_id == tid) {
                thread.info.lock_count += 1;
            }
        }
        self.image.sync_blocks.push(SyncBlockInfo {
            object,
            owner,
            recursion: 1,
            waiting: 0,
        });
    }

    pub fn add_segment(&mut self, start: u64, length: u64, generation: Generation) {
        self.image.segments.push(SegmentInfo {
            start,
            length,
            generation,
        });
    }

    pub fn set_walkable(&mut self, walkable: bool) {
        self.image.walkable = walkable;
    }

    pub fn set_runtime(&mut self, flavor: &str, version: &str) {
        self.image.runtime = RuntimeVersion {
            flavor: flavor.to_string(),
            version: version.to_string(),
        };
    }

    /// Finish the image
    #[must_use]
    pub fn build(mut self) -> HeapImage {
        if !self.heap.is_empty() {
            self.image.regions.push(MemoryRegion {
                start: HEAP_BASE,
                bytes: self.heap,
            });
        }
        let mut types: Vec<TypeInfo> = self.types.into_values().collect();
        types.sort_by_key(|t| t.handle);
        self.image.types = types;
        self.image.regions.sort_by_key(|r| r.start);
        self.image
    }
}

impl Default for HeapImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A managed frame `declaring_type.method`
#[must_use]
pub fn managed_frame(declaring_type: &str, method: &str) -> FrameInfo {
    FrameInfo {
        instruction_pointer: 0x7ff9_0000_0000
            + (declaring_type.len() * 0x100 + method.len()) as u64,
        stack_pointer: 0,
        method: Some(method.to_string()),
        declaring_type: Some(declaring_type.to_string()),
    }
}

/// Framework type name of a primitive element type
#[must_use]
pub fn element_type_name(element_type: ElementType) -> &'static str {
    match element_type {
        ElementType::Boolean => "System.Boolean",
        ElementType::Char => "System.Char",
        ElementType::I1 => "System.SByte",
        ElementType::U1 => "System.Byte",
        ElementType::I2 => "System.Int16",
        ElementType::U2 => "System.UInt16",
        ElementType::I4 => "System.Int32",
        ElementType::U4 => "System.UInt32",
        ElementType::I8 => "System.Int64",
        ElementType::U8 => "System.UInt64",
        ElementType::R4 => "System.Single",
        ElementType::R8 => "System.Double",
        ElementType::NativeInt => "System.IntPtr",
        ElementType::NativeUInt => "System.UIntPtr",
        ElementType::String => "System.String",
        ElementType::SzArray | ElementType::Array => "System.Array",
        ElementType::Pointer | ElementType::FnPtr => "Pointer",
        ElementType::Class | ElementType::Object => "System.Object",
        ElementType::Struct => "System.ValueType",
        ElementType::Unknown => "<unknown>",
    }
}
