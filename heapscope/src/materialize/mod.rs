//! # Heap Materializer
//!
//! Turns an object address plus its runtime type into a flat, ordered list of
//! [`ObjectValueRecord`]s:
//!
//! ```text
//! [identity] [field] [field] [nested.field] [nested.field] [field] ... [static] [thread-static]
//! ```
//!
//! Inline value-type fields are expanded depth-first right after their own
//! record, so the output reads in declaration order at every nesting level.
//! Array roots produce one record per element (plus nested records for
//! value-type elements) up to [`MAX_ARRAY_ELEMENTS`].
//!
//! Target memory may be live, mutating or partially corrupt, so read failures
//! never abort a materialization: a failed field becomes
//! [`FieldValue::Error`], a failed array element ends the array scan, and a
//! failed static is skipped. Only a missing root type is an error.
//!
//! Cancellation is cooperative and checked once per array element and once
//! per field. A cancelled view keeps whatever it produced before the signal;
//! the result is final and is not resumed by later calls.

mod record;
mod value;

use std::sync::{Arc, OnceLock};

use heapscope_common::{ElementType, FieldInfo, Heap, Runtime, Tid, TypeHandle, TypeInfo};
use log::debug;
use tokio_util::sync::CancellationToken;

pub use record::ObjectValueRecord;
pub use value::{read_text, FieldValue, Primitive, MAX_TEXT_CHARS};

use crate::domain::{Address, MaterializeError, SessionError};
use crate::session::SessionHandles;

/// Array elements materialized before the scan stops
pub const MAX_ARRAY_ELEMENTS: usize = 1_000_000;

/// Largest array element read; bigger descriptors are treated as corrupt
pub const MAX_ELEMENT_SIZE: u64 = 64 * 1024;

/// Deepest chain of inline value types expanded
pub const MAX_NESTING_DEPTH: usize = 32;

/// Lazily materialized view of one object
///
/// The records are computed on the first call to [`ObjectView::records`] and
/// cached for the lifetime of the view.
pub struct ObjectView {
    heap: Arc<dyn Heap>,
    address: u64,
    ty: Option<Arc<TypeInfo>>,
    thread: Option<Tid>,
    cancel: CancellationToken,
    records: OnceLock<Vec<ObjectValueRecord>>,
}

impl ObjectView {
    #[must_use]
    pub fn new(
        heap: Arc<dyn Heap>,
        address: u64,
        ty: Option<Arc<TypeInfo>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            heap,
            address,
            ty,
            thread: None,
            cancel,
            records: OnceLock::new(),
        }
    }

    /// Thread used to resolve thread-static fields
    #[must_use]
    pub fn with_thread(mut self, thread: Option<Tid>) -> Self {
        self.thread = thread;
        self
    }

    /// View of the object at `address` on `runtime`'s heap
    ///
    /// With no `type_handle` the type is read from the object header.
    /// Thread statics resolve against the runtime's first thread.
    #[must_use]
    pub fn resolve(
        runtime: &dyn Runtime,
        address: u64,
        type_handle: Option<TypeHandle>,
        cancel: CancellationToken,
    ) -> Self {
        let heap = runtime.heap();
        let ty = match type_handle {
            Some(handle) => heap.type_by_handle(handle),
            None => heap.object_type(address),
        };
        let thread = runtime.threads().first().map(|t| t.os_id);
        Self::new(heap, address, ty, cancel).with_thread(thread)
    }

    /// Like [`ObjectView::resolve`], rejecting handles from a detached session
    ///
    /// # Errors
    /// Returns [`SessionError::StaleHandles`] if the handles were invalidated
    pub fn from_handles(
        handles: &SessionHandles,
        address: u64,
        type_handle: Option<TypeHandle>,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        let runtime = handles.runtime()?;
        Ok(Self::resolve(runtime.as_ref(), address, type_handle, cancel))
    }

    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[must_use]
    pub fn type_info(&self) -> Option<&Arc<TypeInfo>> {
        self.ty.as_ref()
    }

    /// Materialized records, computed on first call
    ///
    /// # Errors
    /// Returns [`MaterializeError::MissingType`] if the root type is unknown
    pub fn records(&self) -> Result<&[ObjectValueRecord], MaterializeError> {
        let ty = self.ty.as_ref().ok_or(MaterializeError::MissingType(Address(self.address)))?;
        let records = self.records.get_or_init(|| {
            Walk {
                heap: self.heap.as_ref(),
                pointer_size: self.heap.pointer_size() as u64,
                root: self.address,
                cancel: &self.cancel,
                out: Vec::new(),
            }
            .run(ty, self.thread)
        });
        Ok(records)
    }
}

/// Pending expansion of one instance's declared fields
struct Frame {
    ty: Arc<TypeInfo>,
    base: u64,
    interior: bool,
    prefix: String,
    offset: u64,
    next: usize,
}

struct Walk<'a> {
    heap: &'a dyn Heap,
    pointer_size: u64,
    root: u64,
    cancel: &'a CancellationToken,
    out: Vec<ObjectValueRecord>,
}

impl Walk<'_> {
    fn run(mut self, ty: &Arc<TypeInfo>, thread: Option<Tid>) -> Vec<ObjectValueRecord> {
        if ty.is_string() {
            let value = match read_text(self.heap, self.root) {
                Ok(text) => FieldValue::Text(text),
                Err(e) => FieldValue::Error(format!("unable to read string: {e}")),
            };
            self.identity(ty, value);
            self.expand(self.instance(ty));
        } else if ty.is_array() {
            self.identity(ty, FieldValue::pointer(self.root));
            self.array(ty);
        } else {
            self.identity(ty, FieldValue::pointer(self.root));
            self.expand(self.instance(ty));
        }

        if !ty.is_array() {
            self.statics(ty, thread);
        }
        self.out
    }

    fn instance(&self, ty: &Arc<TypeInfo>) -> Frame {
        Frame {
            ty: Arc::clone(ty),
            base: self.root,
            interior: false,
            prefix: String::new(),
            offset: 0,
            next: 0,
        }
    }

    fn identity(&mut self, ty: &TypeInfo, value: FieldValue) {
        self.out.push(ObjectValueRecord {
            address: self.root,
            base_name: String::new(),
            field_name: None,
            byte_offset: 0,
            type_name: ty.name.clone(),
            value,
            metadata_token: 0,
            is_static: false,
            is_thread_static: false,
        });
    }

    /// Emit the fields of `root` and, depth-first, of every inline value type
    /// reached from it
    fn expand(&mut self, root: Frame) {
        let mut stack = vec![root];
        while let Some(frame) = stack.last_mut() {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(field) = frame.ty.fields.get(frame.next).cloned() else {
                stack.pop();
                continue;
            };
            frame.next += 1;
            let address = field.address(frame.base, frame.interior, self.pointer_size as usize);
            let offset = frame.offset + u64::from(field.offset);
            let prefix = frame.prefix.clone();

            let value = self.field_value(&field, address);
            self.out.push(ObjectValueRecord {
                address,
                base_name: prefix.clone(),
                field_name: Some(field.name.clone()),
                byte_offset: offset,
                type_name: field.type_name.clone(),
                value,
                metadata_token: field.token,
                is_static: false,
                is_thread_static: false,
            });

            if field.element_type != ElementType::Struct {
                continue;
            }
            if stack.len() >= MAX_NESTING_DEPTH {
                debug!("Not expanding {}: nesting deeper than {MAX_NESTING_DEPTH}", field.name);
                continue;
            }
            if let Some(inner) = field.type_handle.and_then(|h| self.heap.type_by_handle(h)) {
                stack.push(Frame {
                    ty: inner,
                    base: address,
                    interior: true,
                    prefix: join_path(&prefix, &field.name),
                    offset,
                    next: 0,
                });
            }
        }
    }

    fn array(&mut self, ty: &TypeInfo) {
        let Some(data) = self.root.checked_add(2 * self.pointer_size) else {
            debug!("Array at 0x{:016x} runs past the address space", self.root);
            return;
        };
        let len = match self.heap.read_u32(self.root + self.pointer_size) {
            Ok(len) => len as usize,
            Err(e) => {
                debug!("Array length unreadable at 0x{:016x}: {e}", self.root);
                return;
            }
        };
        let component = ty.component_type.and_then(|h| self.heap.type_by_handle(h));
        let element_type = component.as_ref().map_or(ElementType::Class, |c| c.element_type);
        let component_name =
            component.as_ref().map_or_else(|| "<unknown>".to_string(), |c| c.name.clone());
        let size = if ty.component_size > 0 {
            u64::from(ty.component_size)
        } else {
            element_type.size(self.pointer_size as usize).map_or(self.pointer_size, |s| s as u64)
        };
        if size > MAX_ELEMENT_SIZE {
            debug!("Array element size {size} exceeds {MAX_ELEMENT_SIZE} bytes; not scanning");
            return;
        }

        let count = len.min(MAX_ARRAY_ELEMENTS);
        if len > MAX_ARRAY_ELEMENTS {
            debug!("Array of {len} elements capped at {MAX_ARRAY_ELEMENTS}");
        }

        let mut buf = vec![0u8; usize::try_from(size).unwrap_or(0)];
        for index in 0..count {
            if self.cancel.is_cancelled() {
                debug!("Array scan cancelled at element {index}");
                break;
            }
            let offset = index as u64 * size;
            let Some(address) = data.checked_add(offset) else {
                debug!("Array scan ended at element {index}: past the address space");
                break;
            };
            if let Err(e) = self.heap.read_memory(address, &mut buf) {
                debug!("Array scan ended at element {index}: {e}");
                break;
            }

            let name = format!("[{index}]");
            let value = self.element_value(element_type, address, &buf);
            self.out.push(ObjectValueRecord {
                address,
                base_name: String::new(),
                field_name: Some(name.clone()),
                byte_offset: offset,
                type_name: component_name.clone(),
                value,
                metadata_token: 0,
                is_static: false,
                is_thread_static: false,
            });

            if let Some(component) =
                component.as_ref().filter(|_| element_type == ElementType::Struct)
            {
                self.expand(Frame {
                    ty: Arc::clone(component),
                    base: address,
                    interior: true,
                    prefix: name,
                    offset,
                    next: 0,
                });
            }
        }
    }

    fn element_value(&self, element_type: ElementType, address: u64, bytes: &[u8]) -> FieldValue {
        if element_type.is_primitive() {
            return Primitive::decode(element_type, bytes).map_or_else(
                || FieldValue::Error(format!("cannot decode {element_type:?}")),
                FieldValue::Primitive,
            );
        }
        if element_type == ElementType::Struct {
            return FieldValue::Address(address);
        }
        let pointer = decode_pointer(bytes);
        match element_type {
            ElementType::String if pointer != 0 => read_text(self.heap, pointer)
                .map_or_else(FieldValue::from, FieldValue::Text),
            _ => FieldValue::pointer(pointer),
        }
    }

    fn field_value(&self, field: &FieldInfo, address: u64) -> FieldValue {
        match field.element_type {
            t if t.is_primitive() => Primitive::read(self.heap, address, t)
                .map_or_else(FieldValue::from, FieldValue::Primitive),
            ElementType::String => match self.heap.read_pointer(address) {
                Ok(0) => FieldValue::Null,
                Ok(pointer) => {
                    read_text(self.heap, pointer).map_or_else(FieldValue::from, FieldValue::Text)
                }
                Err(e) => e.into(),
            },
            t if t.is_object_reference() => {
                self.heap.read_pointer(address).map_or_else(FieldValue::from, FieldValue::pointer)
            }
            // Inline value types and unknown shapes: where the value lives
            _ => FieldValue::Address(address),
        }
    }

    /// Static and thread-static fields; unresolvable ones are skipped
    fn statics(&mut self, ty: &TypeInfo, thread: Option<Tid>) {
        let Some(domain) = ty.domain else {
            return;
        };

        for field in &ty.static_fields {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(address) = self.heap.static_field_address(ty.handle, field, domain) else {
                continue;
            };
            self.push_static(field, address, false);
        }

        let Some(thread) = thread else {
            return;
        };
        for field in &ty.thread_static_fields {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(address) =
                self.heap.thread_static_field_address(ty.handle, field, domain, thread)
            else {
                continue;
            };
            self.push_static(field, address, true);
        }
    }

    fn push_static(&mut self, field: &FieldInfo, address: u64, thread_static: bool) {
        let value = self.field_value(field, address);
        if let FieldValue::Error(reason) = &value {
            debug!("Skipping static {}: {reason}", field.name);
            return;
        }
        self.out.push(ObjectValueRecord {
            address,
            base_name: String::new(),
            field_name: Some(field.name.clone()),
            byte_offset: 0,
            type_name: field.type_name.clone(),
            value,
            metadata_token: field.token,
            is_static: !thread_static,
            is_thread_static: thread_static,
        });
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn decode_pointer(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::image::{FieldSpec, HeapImageBuilder};
    use heapscope_common::{DataTarget, ReaderKind};

    fn runtime(builder: HeapImageBuilder) -> Arc<dyn Runtime> {
        let mut target = builder.build().into_target(ReaderKind::Direct);
        let version = target.runtime_versions().remove(0);
        target.create_runtime(&version).unwrap()
    }

    #[test]
    fn test_missing_type_is_the_only_error() {
        let rt = runtime(HeapImageBuilder::new());
        let view = ObjectView::resolve(rt.as_ref(), 0xdead_0000, None, CancellationToken::new());
        assert_eq!(
            view.records().unwrap_err(),
            MaterializeError::MissingType(Address(0xdead_0000))
        );
    }

    #[test]
    fn test_records_are_computed_once() {
        let mut b = HeapImageBuilder::new();
        let ty = b.class_type("App.Counter", &[FieldSpec::new("value", ElementType::I4)]);
        let obj = b.alloc_object(ty);
        b.set_field(obj, ty, "value", &7i32.to_le_bytes());
        let rt = runtime(b);

        let view = ObjectView::resolve(rt.as_ref(), obj, None, CancellationToken::new());
        let first = view.records().unwrap().as_ptr();
        let second = view.records().unwrap().as_ptr();
        assert_eq!(first, second);
        assert_eq!(view.records().unwrap()[1].value, FieldValue::Primitive(Primitive::I32(7)));
    }

    #[test]
    fn test_unreadable_field_becomes_error_value() {
        let mut b = HeapImageBuilder::new();
        let ty = b.class_type(
            "App.Holder",
            &[FieldSpec::new("name", ElementType::String), FieldSpec::new("id", ElementType::I4)],
        );
        let obj = b.alloc_object(ty);
        // Dangling string pointer
        b.set_field(obj, ty, "name", &0x10u64.to_le_bytes());
        let rt = runtime(b);

        let view = ObjectView::resolve(rt.as_ref(), obj, None, CancellationToken::new());
        let records = view.records().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[1].value.is_error());
        assert_eq!(records[2].value, FieldValue::Primitive(Primitive::I32(0)));
    }

    #[test]
    fn test_self_nesting_struct_is_bounded() {
        let mut b = HeapImageBuilder::new();
        let node = b.struct_type("App.Node", &[FieldSpec::new("tag", ElementType::I4)]);
        let holder =
            b.class_type("App.Holder", &[FieldSpec::of_type("node", ElementType::Struct, node)]);
        let obj = b.alloc_object(holder);
        let mut image = b.build();
        // Corrupt descriptor: the struct contains itself
        if let Some(info) = image.types.iter_mut().find(|t| t.handle == node) {
            let mut cyclic = info.fields[0].clone();
            cyclic.name = "self".to_string();
            cyclic.element_type = ElementType::Struct;
            cyclic.type_handle = Some(node);
            info.fields.push(cyclic);
        }
        let mut target = image.into_target(ReaderKind::Direct);
        let version = target.runtime_versions().remove(0);
        let rt = target.create_runtime(&version).unwrap();

        let view = ObjectView::resolve(rt.as_ref(), obj, None, CancellationToken::new());
        let records = view.records().unwrap();
        assert!(records.len() < 4 * MAX_NESTING_DEPTH);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "inner"), "inner");
        assert_eq!(join_path("inner", "point"), "inner.point");
    }
}
