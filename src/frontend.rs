//! Host tensor frontend.
//!
//! Moves typed host slices into pooled device buffers and back, keeping the
//! element type and shape alongside the buffer so operation arguments can be
//! filled from a tensor.

use half::{bf16, f16};

use crate::error::BackendError;
use crate::library::{DataType, LayoutType};
use crate::memory::{DeviceBuffer, DevicePtr, MemoryError, PoolMemoryManager};

/// A host scalar type with a device counterpart.
pub trait HostElement: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! host_element {
    ($ty:ty, $dtype:expr) => {
        impl HostElement for $ty {
            const DTYPE: DataType = $dtype;

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

host_element!(f32, DataType::F32);
host_element!(f64, DataType::F64);
host_element!(f16, DataType::F16);
host_element!(bf16, DataType::BF16);
host_element!(i8, DataType::S8);
host_element!(u8, DataType::U8);
host_element!(i32, DataType::S32);

/// A dense tensor living in pooled device memory.
#[derive(Debug)]
pub struct DeviceTensor {
    buffer: DeviceBuffer,
    dtype: DataType,
    shape: Vec<usize>,
}

impl DeviceTensor {
    /// Copy `data` to the device. `shape` must describe exactly `data.len()`
    /// elements.
    pub fn upload<T: HostElement>(
        pool: &PoolMemoryManager,
        data: &[T],
        shape: &[usize],
    ) -> Result<Self, BackendError> {
        let numel = checked_numel(shape)?;
        if numel != data.len() {
            return Err(MemoryError::InvalidSize(data.len()).into());
        }
        let mut bytes = Vec::with_capacity(numel * T::DTYPE.size_bytes());
        for &v in data {
            v.write_le(&mut bytes);
        }
        let buffer = pool.allocate(bytes.len())?;
        buffer.copy_from_host(&bytes)?;
        Ok(Self {
            buffer,
            dtype: T::DTYPE,
            shape: shape.to_vec(),
        })
    }

    /// Zero-filled tensor of `dtype`, e.g. for kernel outputs.
    pub fn zeros(
        pool: &PoolMemoryManager,
        dtype: DataType,
        shape: &[usize],
    ) -> Result<Self, BackendError> {
        let bytes = checked_numel(shape)? * dtype.size_bytes();
        let buffer = pool.allocate(bytes)?;
        buffer.copy_from_host(&vec![0u8; bytes])?;
        Ok(Self {
            buffer,
            dtype,
            shape: shape.to_vec(),
        })
    }

    /// Copy the tensor back to the host as `T`.
    pub fn download<T: HostElement>(&self) -> Result<Vec<T>, BackendError> {
        if T::DTYPE != self.dtype {
            return Err(BackendError::DTypeMismatch {
                actual: self.dtype,
                requested: T::DTYPE,
            });
        }
        let bytes = self.buffer.to_vec()?;
        Ok(bytes
            .chunks_exact(self.dtype.size_bytes())
            .map(T::read_le)
            .collect())
    }

    pub fn ptr(&self) -> DevicePtr {
        self.buffer.ptr()
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Leading dimension when viewed as a matrix in `layout`.
    ///
    /// All but the innermost dimension fold into rows, so an NHWC tensor's
    /// leading dimension is its channel count.
    pub fn leading_dim(&self, layout: LayoutType) -> usize {
        let cols = self.shape.last().copied().unwrap_or(1);
        let rows = self.numel() / cols.max(1);
        layout.leading_dim(rows, cols)
    }
}

fn checked_numel(shape: &[usize]) -> Result<usize, MemoryError> {
    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or(MemoryError::InvalidSize(usize::MAX))?;
    if shape.is_empty() || numel == 0 {
        return Err(MemoryError::InvalidSize(0));
    }
    Ok(numel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HostDeviceAllocator, PoolConfig};
    use std::sync::Arc;

    fn pool() -> PoolMemoryManager {
        let allocator = Arc::new(HostDeviceAllocator::new(1 << 20, 0));
        let config = PoolConfig {
            init_pool_size: 64 * 1024,
            max_pool_size: 1 << 20,
            grow_size: 64 * 1024,
        };
        PoolMemoryManager::new(allocator, config).unwrap()
    }

    #[test]
    fn test_upload_download_f32() {
        let pool = pool();
        let data: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();
        let t = DeviceTensor::upload(&pool, &data, &[3, 4]).unwrap();
        assert_eq!(t.dtype(), DataType::F32);
        assert_eq!(t.numel(), 12);
        assert_eq!(t.size_bytes(), 48);
        assert_eq!(t.download::<f32>().unwrap(), data);
        assert!(!t.ptr().is_null());
    }

    #[test]
    fn test_half_elements() {
        let pool = pool();
        let data = [f16::from_f32(1.5), f16::from_f32(-2.0)];
        let t = DeviceTensor::upload(&pool, &data, &[2]).unwrap();
        assert_eq!(t.dtype(), DataType::F16);
        assert_eq!(t.size_bytes(), 4);
        assert_eq!(t.download::<f16>().unwrap(), data);

        let b = DeviceTensor::upload(&pool, &[bf16::from_f32(3.0)], &[1]).unwrap();
        assert_eq!(b.download::<bf16>().unwrap()[0].to_f32(), 3.0);
    }

    #[test]
    fn test_download_checks_dtype() {
        let pool = pool();
        let t = DeviceTensor::upload(&pool, &[1i32, 2, 3], &[3]).unwrap();
        assert!(matches!(
            t.download::<f32>(),
            Err(BackendError::DTypeMismatch {
                actual: DataType::S32,
                requested: DataType::F32
            })
        ));
    }

    #[test]
    fn test_shape_must_match_data() {
        let pool = pool();
        assert!(DeviceTensor::upload(&pool, &[1u8, 2, 3], &[2, 2]).is_err());
        assert!(DeviceTensor::upload::<u8>(&pool, &[], &[0]).is_err());
    }

    #[test]
    fn test_leading_dim() {
        let pool = pool();
        let m = DeviceTensor::zeros(&pool, DataType::F16, &[8, 16]).unwrap();
        assert_eq!(m.leading_dim(LayoutType::RowMajor), 16);
        assert_eq!(m.leading_dim(LayoutType::ColumnMajor), 8);

        let act = DeviceTensor::zeros(&pool, DataType::F16, &[2, 5, 5, 32]).unwrap();
        assert_eq!(act.leading_dim(LayoutType::TensorNhwc), 32);
        assert_eq!(act.download::<f16>().unwrap().len(), 2 * 5 * 5 * 32);
    }

    #[test]
    fn test_drop_returns_memory() {
        let pool = pool();
        {
            let _t = DeviceTensor::zeros(&pool, DataType::F64, &[100]).unwrap();
            assert_eq!(pool.stats().live_allocations, 1);
        }
        assert_eq!(pool.stats().live_allocations, 0);
    }
}
