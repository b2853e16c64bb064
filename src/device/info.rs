// Copyright 2024-2026 Kernel Forge Contributors
// Licensed under the Apache License, Version 2.0

//! Device descriptions and capability checks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::Operation;

/// Device API family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// NVIDIA CUDA
    Cuda,
    /// SYCL (Intel Xe)
    Sycl,
    /// Host fallback; launches are recorded, not executed
    #[default]
    Cpu,
}

impl fmt::Display for DeviceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceBackend::Cuda => write!(f, "CUDA"),
            DeviceBackend::Sycl => write!(f, "SYCL"),
            DeviceBackend::Cpu => write!(f, "CPU"),
        }
    }
}

impl FromStr for DeviceBackend {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" => Ok(Self::Cuda),
            "sycl" | "xe" => Ok(Self::Sycl),
            "cpu" | "host" => Ok(Self::Cpu),
            other => Err(DeviceError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No devices available for backend {0}")]
    NoDevicesAvailable(DeviceBackend),

    #[error("Device not found: {0}")]
    DeviceNotFound(usize),

    #[error("Unknown device backend: {0}")]
    UnknownBackend(String),

    #[error("Kernel for arch {required} cannot run on {backend} device with capability {available}")]
    UnsupportedArch {
        backend: DeviceBackend,
        required: u32,
        available: u32,
    },

    #[error("Kernel needs {required} bytes of shared memory, device allows {available}")]
    SharedMemoryExceeded { required: u32, available: u32 },
}

/// Capabilities of one compute device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub backend: DeviceBackend,
    /// Index on multi-device systems
    pub index: usize,
    pub name: String,
    pub total_memory: u64,
    /// `major * 10 + minor` for CUDA; architecture id for SYCL (11 = Xe-HPC)
    pub compute_capability: u32,
    pub multiprocessor_count: u32,
    pub max_shared_memory_per_block: u32,
}

impl DeviceInfo {
    /// Host fallback device.
    pub fn cpu() -> Self {
        Self {
            backend: DeviceBackend::Cpu,
            index: 0,
            name: "CPU".to_string(),
            total_memory: 0,
            compute_capability: 0,
            multiprocessor_count: num_cpus::get() as u32,
            max_shared_memory_per_block: u32::MAX,
        }
    }

    /// Whether kernels compiled for `arch` can run here.
    ///
    /// CUDA binaries run on the same or newer capability. SYCL kernels are
    /// built for one architecture and only run there. The CPU fallback
    /// accepts everything because it only records launches.
    pub fn supports_arch(&self, arch: u32) -> bool {
        match self.backend {
            DeviceBackend::Cuda => arch <= self.compute_capability,
            DeviceBackend::Sycl => arch == self.compute_capability,
            DeviceBackend::Cpu => true,
        }
    }

    /// Check architecture and shared memory limits for `op`.
    pub fn check_operation(&self, op: &dyn Operation) -> Result<(), DeviceError> {
        if !self.supports_arch(op.arch()) {
            return Err(DeviceError::UnsupportedArch {
                backend: self.backend,
                required: op.arch(),
                available: self.compute_capability,
            });
        }
        let smem = op.shared_memory_bytes();
        if smem > self.max_shared_memory_per_block {
            return Err(DeviceError::SharedMemoryExceeded {
                required: smem,
                available: self.max_shared_memory_per_block,
            });
        }
        Ok(())
    }
}

/// Compute capability of `device`, as used to pick kernel architectures.
pub fn device_cc(device: &DeviceInfo) -> u32 {
    device.compute_capability
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cuda(cc: u32) -> DeviceInfo {
        DeviceInfo {
            backend: DeviceBackend::Cuda,
            index: 0,
            name: "test".into(),
            total_memory: 1 << 30,
            compute_capability: cc,
            multiprocessor_count: 108,
            max_shared_memory_per_block: 164 * 1024,
        }
    }

    #[test]
    fn test_cuda_arch_is_forward_compatible() {
        let dev = cuda(86);
        assert!(dev.supports_arch(80));
        assert!(dev.supports_arch(86));
        assert!(!dev.supports_arch(90));
        assert_eq!(device_cc(&dev), 86);
    }

    #[test]
    fn test_sycl_arch_must_match() {
        let dev = DeviceInfo {
            backend: DeviceBackend::Sycl,
            compute_capability: 11,
            ..cuda(0)
        };
        assert!(dev.supports_arch(11));
        assert!(!dev.supports_arch(12));
        assert!(!dev.supports_arch(10));
    }

    #[test]
    fn test_cpu_accepts_any_arch() {
        assert!(DeviceInfo::cpu().supports_arch(90));
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("CUDA".parse::<DeviceBackend>().unwrap(), DeviceBackend::Cuda);
        assert_eq!("xe".parse::<DeviceBackend>().unwrap(), DeviceBackend::Sycl);
        assert!("rocm".parse::<DeviceBackend>().is_err());
    }
}
