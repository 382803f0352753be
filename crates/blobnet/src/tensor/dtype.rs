//! Enumerates the scalar element types a tensor blob can hold.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier stored alongside every tensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 32-bit signed integer, used for timestep blobs and index buffers.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Raw bytes with no numeric interpretation.
    U8,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    /// Produces a stable tag used for untyped shape/type introspection.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::I32 => 1,
            DType::I64 => 2,
            DType::U8 => 3,
        }
    }

    /// Reconstructs a `DType` from its tag representation.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::I32),
            2 => Some(DType::I64),
            3 => Some(DType::U8),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
        }
    }
}

/// Scalar types that can be read from and written into tensor storage.
///
/// Storage is a plain little-endian byte buffer, so elements are converted
/// on the way in and out instead of reinterpreting possibly unaligned memory.
pub trait Element: Copy + Default + Send + Sync + 'static {
    const DTYPE: DType;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_element!(f32, DType::F32);
impl_element!(i32, DType::I32);
impl_element!(i64, DType::I64);
impl_element!(u8, DType::U8);
