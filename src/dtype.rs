//! Element types of distributed-array payloads.

use crate::error::{report, Error, Result};

/// Element type of a variable, as stored and as transported.
///
/// The numeric types carry the classic self-describing-format default
/// fill values; `Opaque` elements have a size but no defaultable fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Fixed-size element with no intrinsic interpretation.
    Opaque(usize),
}

impl ElemType {
    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            ElemType::I8 | ElemType::U8 => 1,
            ElemType::I16 | ElemType::U16 => 2,
            ElemType::I32 | ElemType::U32 | ElemType::F32 => 4,
            ElemType::I64 | ElemType::U64 | ElemType::F64 => 8,
            ElemType::Opaque(n) => n,
        }
    }

    /// The default fill value in native byte order.
    ///
    /// Fails with [`Error::BadElementType`] for `Opaque` elements,
    /// which have no defaultable fill.
    pub fn default_fill(self) -> Result<Vec<u8>> {
        let bytes = match self {
            ElemType::I8 => (-127i8).to_ne_bytes().to_vec(),
            ElemType::U8 => 255u8.to_ne_bytes().to_vec(),
            ElemType::I16 => (-32767i16).to_ne_bytes().to_vec(),
            ElemType::U16 => 65535u16.to_ne_bytes().to_vec(),
            ElemType::I32 => (-2147483647i32).to_ne_bytes().to_vec(),
            ElemType::U32 => 4294967295u32.to_ne_bytes().to_vec(),
            ElemType::I64 => (-9223372036854775806i64).to_ne_bytes().to_vec(),
            ElemType::U64 => 18446744073709551614u64.to_ne_bytes().to_vec(),
            ElemType::F32 => 9.9692099683868690e36f32.to_ne_bytes().to_vec(),
            ElemType::F64 => 9.9692099683868690e36f64.to_ne_bytes().to_vec(),
            ElemType::Opaque(n) => {
                return Err(report(Error::BadElementType(format!("opaque[{n}]"))))
            }
        };
        Ok(bytes)
    }
}
