use std::fmt;

use serde::Serialize;

use super::value::FieldValue;

/// One flattened identity, field, element or static entry of an object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectValueRecord {
    pub address: u64,
    /// Traversal path of the owner (`""` at the root, `inner.point` when
    /// nested, `[3]` for array elements)
    pub base_name: String,
    /// `None` for identity records
    pub field_name: Option<String>,
    /// Offset of the value from the root's instance data
    pub byte_offset: u64,
    pub type_name: String,
    pub value: FieldValue,
    pub metadata_token: i32,
    pub is_static: bool,
    pub is_thread_static: bool,
}

impl ObjectValueRecord {
    /// Full dotted path of this record, e.g. `inner.point.x`
    #[must_use]
    pub fn path(&self) -> String {
        match (&self.field_name, self.base_name.is_empty()) {
            (Some(field), true) => field.clone(),
            (Some(field), false) => format!("{}.{field}", self.base_name),
            (None, _) => self.base_name.clone(),
        }
    }
}

impl fmt::Display for ObjectValueRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path();
        let name = if path.is_empty() { "<this>" } else { path.as_str() };
        let marker = if self.is_thread_static {
            " [thread-static]"
        } else if self.is_static {
            " [static]"
        } else {
            ""
        };
        write!(
            f,
            "+0x{:04x} 0x{:016x} {:<32} {:<24} {}{marker}",
            self.byte_offset, self.address, name, self.type_name, self.value
        )
    }
}
