// Copyright 2024-2026 Kernel Forge Contributors
// Licensed under the Apache License, Version 2.0

//! Device Manager - detection and selection of the active device.

use std::sync::Arc;

use tracing::{info, warn};

use super::info::{DeviceBackend, DeviceError, DeviceInfo};

/// Description of the device to target.
///
/// There is no driver binding in this crate, so GPU devices are described
/// by configuration rather than detected.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub backend: DeviceBackend,
    pub device_index: usize,
    pub compute_capability: u32,
    pub total_memory: u64,
    pub multiprocessor_count: u32,
    pub max_shared_memory_per_block: u32,
    /// Refuse to start instead of falling back to CPU.
    pub require_gpu: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::Cpu,
            device_index: 0,
            compute_capability: 0,
            total_memory: 16 * 1024 * 1024 * 1024, // 16 GiB
            multiprocessor_count: 1,
            max_shared_memory_per_block: 48 * 1024,
            require_gpu: false,
        }
    }
}

impl DeviceConfig {
    /// A CUDA device of the given capability.
    pub fn cuda(compute_capability: u32, multiprocessor_count: u32) -> Self {
        Self {
            backend: DeviceBackend::Cuda,
            compute_capability,
            multiprocessor_count,
            max_shared_memory_per_block: if compute_capability >= 80 { 163 * 1024 } else { 48 * 1024 },
            ..Default::default()
        }
    }

    /// An Intel Xe device driven through SYCL.
    pub fn sycl(arch: u32, multiprocessor_count: u32) -> Self {
        Self {
            backend: DeviceBackend::Sycl,
            compute_capability: arch,
            multiprocessor_count,
            max_shared_memory_per_block: 128 * 1024,
            ..Default::default()
        }
    }

    fn describe(&self) -> Option<DeviceInfo> {
        if self.backend == DeviceBackend::Cpu || self.compute_capability == 0 {
            return None;
        }
        Some(DeviceInfo {
            backend: self.backend,
            index: self.device_index,
            name: format!("{} device {} (cc {})", self.backend, self.device_index, self.compute_capability),
            total_memory: self.total_memory,
            compute_capability: self.compute_capability,
            multiprocessor_count: self.multiprocessor_count.max(1),
            max_shared_memory_per_block: self.max_shared_memory_per_block,
        })
    }
}

/// Tracks available devices and the active one.
pub struct DeviceManager {
    devices: Vec<DeviceInfo>,
    config: DeviceConfig,
    active_device: Arc<DeviceInfo>,
}

impl DeviceManager {
    pub fn new(config: DeviceConfig) -> Result<Self, DeviceError> {
        let devices = Self::detect_devices(&config);
        let active_device = Arc::new(Self::select_device(&devices, &config)?);
        info!(
            backend = %active_device.backend,
            cc = active_device.compute_capability,
            sms = active_device.multiprocessor_count,
            "active device selected"
        );
        Ok(Self {
            devices,
            config,
            active_device,
        })
    }

    fn detect_devices(config: &DeviceConfig) -> Vec<DeviceInfo> {
        let mut devices = vec![DeviceInfo::cpu()];
        devices.extend(config.describe());
        devices
    }

    fn select_device(devices: &[DeviceInfo], config: &DeviceConfig) -> Result<DeviceInfo, DeviceError> {
        let device = devices
            .iter()
            .find(|d| d.backend == config.backend && d.index == config.device_index)
            .cloned();

        match device {
            Some(d) => Ok(d),
            None if config.require_gpu => Err(DeviceError::NoDevicesAvailable(config.backend)),
            None if config.backend != DeviceBackend::Cpu => {
                warn!(requested = %config.backend, "requested device unavailable, using CPU fallback");
                Ok(DeviceInfo::cpu())
            }
            None => Err(DeviceError::DeviceNotFound(config.device_index)),
        }
    }

    pub fn active_device(&self) -> &Arc<DeviceInfo> {
        &self.active_device
    }

    pub fn available_devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn is_gpu_available(&self) -> bool {
        self.devices.iter().any(|d| d.backend != DeviceBackend::Cpu)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }
}
