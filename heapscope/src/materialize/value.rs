//! Tagged values read out of target memory

use std::fmt;

use heapscope_common::{ElementType, EngineError, Heap};
use serde::Serialize;

/// Longest string decoded in full; longer (or corrupt) lengths are truncated
pub const MAX_TEXT_CHARS: u32 = 1 << 20;

/// An inline primitive value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Primitive {
    Bool(bool),
    Char(char),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Native-width integer or raw pointer, widened to 64 bits
    Native(u64),
}

impl Primitive {
    /// Decode a primitive of `element_type` from little-endian `bytes`
    ///
    /// Returns `None` if `element_type` is not primitive or `bytes` is short.
    #[must_use]
    pub fn decode(element_type: ElementType, bytes: &[u8]) -> Option<Self> {
        fn take<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
            bytes.get(..N)?.try_into().ok()
        }
        let value = match element_type {
            ElementType::Boolean => Primitive::Bool(*bytes.first()? != 0),
            ElementType::Char => {
                let unit = u16::from_le_bytes(take(bytes)?);
                let c = char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER);
                Primitive::Char(c)
            }
            ElementType::I1 => Primitive::I8(i8::from_le_bytes(take(bytes)?)),
            ElementType::U1 => Primitive::U8(*bytes.first()?),
            ElementType::I2 => Primitive::I16(i16::from_le_bytes(take(bytes)?)),
            ElementType::U2 => Primitive::U16(u16::from_le_bytes(take(bytes)?)),
            ElementType::I4 => Primitive::I32(i32::from_le_bytes(take(bytes)?)),
            ElementType::U4 => Primitive::U32(u32::from_le_bytes(take(bytes)?)),
            ElementType::I8 => Primitive::I64(i64::from_le_bytes(take(bytes)?)),
            ElementType::U8 => Primitive::U64(u64::from_le_bytes(take(bytes)?)),
            ElementType::R4 => Primitive::F32(f32::from_le_bytes(take(bytes)?)),
            ElementType::R8 => Primitive::F64(f64::from_le_bytes(take(bytes)?)),
            ElementType::NativeInt
            | ElementType::NativeUInt
            | ElementType::Pointer
            | ElementType::FnPtr => match bytes.len() {
                4 => Primitive::Native(u64::from(u32::from_le_bytes(take(bytes)?))),
                _ => Primitive::Native(u64::from_le_bytes(take(bytes)?)),
            },
            _ => return None,
        };
        Some(value)
    }

    /// Read a primitive of `element_type` at `address`
    ///
    /// # Errors
    /// Returns [`EngineError::Read`] if the value is unreadable and
    /// [`EngineError::Unsupported`] if `element_type` is not primitive
    pub fn read(
        heap: &dyn Heap,
        address: u64,
        element_type: ElementType,
    ) -> Result<Self, EngineError> {
        let size = element_type
            .size(heap.pointer_size())
            .filter(|_| element_type.is_primitive())
            .ok_or_else(|| EngineError::Unsupported(format!("{element_type:?} is not primitive")))?;
        let mut buf = [0u8; 8];
        let bytes = buf.get_mut(..size).ok_or_else(|| {
            EngineError::Unsupported(format!("{size}-byte {element_type:?} values"))
        })?;
        heap.read_memory(address, bytes)?;
        Self::decode(element_type, bytes)
            .ok_or_else(|| EngineError::Unsupported(format!("{element_type:?} is not primitive")))
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Bool(v) => write!(f, "{v}"),
            Primitive::Char(v) => write!(f, "'{v}'"),
            Primitive::I8(v) => write!(f, "{v}"),
            Primitive::U8(v) => write!(f, "{v}"),
            Primitive::I16(v) => write!(f, "{v}"),
            Primitive::U16(v) => write!(f, "{v}"),
            Primitive::I32(v) => write!(f, "{v}"),
            Primitive::U32(v) => write!(f, "{v}"),
            Primitive::I64(v) => write!(f, "{v}"),
            Primitive::U64(v) => write!(f, "{v}"),
            Primitive::F32(v) => write!(f, "{v}"),
            Primitive::F64(v) => write!(f, "{v}"),
            Primitive::Native(v) => write!(f, "0x{v:016x}"),
        }
    }
}

/// Value of one materialized record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Primitive(Primitive),
    Text(String),
    Address(u64),
    Null,
    /// The value could not be read; carries the reason
    Error(String),
}

impl FieldValue {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, FieldValue::Error(_))
    }

    /// Pointer value, `Null` for zero
    #[must_use]
    pub fn pointer(address: u64) -> Self {
        if address == 0 {
            FieldValue::Null
        } else {
            FieldValue::Address(address)
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Primitive(p) => write!(f, "{p}"),
            FieldValue::Text(text) => f.write_str(text),
            FieldValue::Address(address) => write!(f, "0x{address:016x}"),
            FieldValue::Null => f.write_str("null"),
            FieldValue::Error(reason) => write!(f, "<error: {reason}>"),
        }
    }
}

impl From<EngineError> for FieldValue {
    fn from(err: EngineError) -> Self {
        FieldValue::Error(err.to_string())
    }
}

/// Decode the string object at `address`
///
/// Layout: type handle, `u32` length, then UTF-16 code units.
///
/// # Errors
/// Returns [`EngineError::Read`] if the length or characters are unreadable
pub fn read_text(heap: &dyn Heap, address: u64) -> Result<String, EngineError> {
    let length_at = address.checked_add(heap.pointer_size() as u64);
    let chars_at = length_at.and_then(|a| a.checked_add(4));
    let (Some(length_at), Some(chars_at)) = (length_at, chars_at) else {
        return Err(EngineError::Read { address, len: 4 });
    };
    let len = heap.read_u32(length_at)?.min(MAX_TEXT_CHARS) as usize;
    let mut bytes = vec![0u8; len * 2];
    heap.read_memory(chars_at, &mut bytes)?;
    let units: Vec<u16> =
        bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).collect();
    Ok(String::from_utf16_lossy(&units))
}
