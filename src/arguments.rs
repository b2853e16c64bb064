//! Kernel argument marshalling.
//!
//! Parameter blocks are packed host-side with C struct alignment rules and
//! handed to the launcher as raw bytes.

use half::{bf16, f16};
use thiserror::Error;

use crate::c_types::{bytes_of, CStruct};
use crate::library::DataType;
use crate::memory::DevicePtr;

/// Largest parameter block a kernel launch accepts.
pub const MAX_PARAM_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("Scalar of type {0} is not supported")]
    UnsupportedScalar(DataType),

    #[error("Invalid problem: {0}")]
    InvalidProblem(String),

    #[error("Invalid operation descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("{what} = {value} is not a multiple of alignment {alignment}")]
    Misaligned {
        what: &'static str,
        value: i64,
        alignment: u32,
    },

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Parameter block of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// A scalar converted to the element type a kernel expects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    F16(f16),
    BF16(bf16),
    F32(f32),
    F64(f64),
    S32(i32),
}

impl ScalarValue {
    /// Convert `value` to `dtype`. TF32 scalars travel as f32.
    pub fn from_f64(dtype: DataType, value: f64) -> Result<Self, ArgumentError> {
        Ok(match dtype {
            DataType::F16 => Self::F16(f16::from_f64(value)),
            DataType::BF16 => Self::BF16(bf16::from_f64(value)),
            DataType::F32 | DataType::TF32 => Self::F32(value as f32),
            DataType::F64 => Self::F64(value),
            DataType::S32 => Self::S32(value as i32),
            other => return Err(ArgumentError::UnsupportedScalar(other)),
        })
    }

    pub fn size(&self) -> usize {
        match self {
            Self::F16(_) | Self::BF16(_) => 2,
            Self::F32(_) | Self::S32(_) => 4,
            Self::F64(_) => 8,
        }
    }

    fn to_ne_bytes(self) -> Vec<u8> {
        match self {
            Self::F16(v) => v.to_ne_bytes().to_vec(),
            Self::BF16(v) => v.to_ne_bytes().to_vec(),
            Self::F32(v) => v.to_ne_bytes().to_vec(),
            Self::F64(v) => v.to_ne_bytes().to_vec(),
            Self::S32(v) => v.to_ne_bytes().to_vec(),
        }
    }
}

/// Byte buffer that lays out fields like a C struct.
#[derive(Debug, Default, Clone)]
pub struct ArgumentBuffer {
    bytes: Vec<u8>,
    max_align: usize,
}

impl ArgumentBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(256),
            max_align: 1,
        }
    }

    fn align_to(&mut self, align: usize) {
        self.max_align = self.max_align.max(align);
        let padded = self.bytes.len().div_ceil(align) * align;
        self.bytes.resize(padded, 0);
    }

    fn push_raw(&mut self, data: &[u8], align: usize) -> &mut Self {
        self.align_to(align);
        self.bytes.extend_from_slice(data);
        self
    }

    /// Append a C descriptor at its natural alignment.
    pub fn push<T: CStruct>(&mut self, value: &T) -> &mut Self {
        self.push_raw(bytes_of(value), std::mem::align_of::<T>())
    }

    pub fn push_ptr(&mut self, ptr: DevicePtr) -> &mut Self {
        self.push_raw(&ptr.addr().to_ne_bytes(), 8)
    }

    pub fn push_i32(&mut self, value: i32) -> &mut Self {
        self.push_raw(&value.to_ne_bytes(), 4)
    }

    pub fn push_i64(&mut self, value: i64) -> &mut Self {
        self.push_raw(&value.to_ne_bytes(), 8)
    }

    pub fn push_scalar(&mut self, value: ScalarValue) -> &mut Self {
        let size = value.size();
        self.push_raw(&value.to_ne_bytes(), size)
    }

    /// Current offset, i.e. where the next byte-aligned field would land.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Pad the tail to the strictest alignment seen and return the block.
    pub fn finish(mut self) -> Result<Vec<u8>, ArgumentError> {
        let align = self.max_align;
        self.align_to(align);
        if self.bytes.len() > MAX_PARAM_BYTES {
            return Err(ArgumentError::TooLarge {
                size: self.bytes.len(),
                limit: MAX_PARAM_BYTES,
            });
        }
        Ok(self.bytes)
    }
}

/// Check that `value` is a multiple of `alignment`.
pub(crate) fn check_aligned(what: &'static str, value: i64, alignment: u32) -> Result<(), ArgumentError> {
    if alignment > 1 && value % alignment as i64 != 0 {
        return Err(ArgumentError::Misaligned {
            what,
            value,
            alignment,
        });
    }
    Ok(())
}
