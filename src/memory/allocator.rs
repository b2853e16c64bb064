// Copyright 2024-2026 Kernel Forge Contributors
// Licensed under the Apache License, Version 2.0

//! Device allocator trait and the host-backed implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

/// Raw device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn addr(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer advanced by `bytes`.
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Errors from device allocation and the pool built on top of it.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Out of device memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Invalid allocation size: {0}")]
    InvalidSize(usize),

    #[error("Double free or unknown allocation at {0}")]
    DoubleFree(DevicePtr),

    #[error("Access of {len} bytes at {ptr} is outside any allocation")]
    OutOfBounds { ptr: DevicePtr, len: usize },

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Device allocator failure: {0}")]
    Device(String),
}

/// A block of memory handed out by a `DeviceAllocator`.
#[derive(Debug, Clone)]
pub struct DeviceAllocation {
    pub ptr: DevicePtr,
    pub size: usize,
    pub device_index: usize,
}

/// Raw device memory provider underneath the pool.
pub trait DeviceAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<DeviceAllocation, MemoryError>;
    fn deallocate(&self, allocation: &DeviceAllocation) -> Result<(), MemoryError>;
    fn copy_to_device(&self, dst: DevicePtr, data: &[u8]) -> Result<(), MemoryError>;
    fn copy_from_device(&self, src: DevicePtr, out: &mut [u8]) -> Result<(), MemoryError>;
    fn allocated_bytes(&self) -> usize;
    fn device_index(&self) -> usize;
}

/// First address handed out, keeps `DevicePtr::NULL` unused.
const BASE_ADDRESS: u64 = 0x1_0000_0000;
/// Address granularity of the host-backed allocator.
const ADDRESS_ALIGNMENT: u64 = 256;

struct HostState {
    allocations: BTreeMap<u64, Vec<u8>>,
    total: usize,
}

/// Device allocator backed by host vectors.
///
/// Used for tests and as the CPU fallback device. Addresses are synthetic but
/// unique and never reused, so stale pointers are always detected.
pub struct HostDeviceAllocator {
    capacity: usize,
    device_index: usize,
    next_addr: AtomicU64,
    state: Mutex<HostState>,
}

impl HostDeviceAllocator {
    pub fn new(capacity: usize, device_index: usize) -> Self {
        Self {
            capacity,
            device_index,
            next_addr: AtomicU64::new(BASE_ADDRESS),
            state: Mutex::new(HostState {
                allocations: BTreeMap::new(),
                total: 0,
            }),
        }
    }

    /// Count of live (un-freed) allocations.
    pub fn leak_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Locate the allocation holding `[ptr, ptr + len)`; returns (base, offset).
fn locate(state: &HostState, ptr: DevicePtr, len: usize) -> Result<(u64, usize), MemoryError> {
    let (&base, buf) = state
        .allocations
        .range(..=ptr.0)
        .next_back()
        .ok_or(MemoryError::OutOfBounds { ptr, len })?;
    let offset = (ptr.0 - base) as usize;
    if offset + len > buf.len() {
        return Err(MemoryError::OutOfBounds { ptr, len });
    }
    Ok((base, offset))
}

impl DeviceAllocator for HostDeviceAllocator {
    fn allocate(&self, size: usize) -> Result<DeviceAllocation, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let mut s = self.state.lock();
        if s.total + size > self.capacity {
            return Err(MemoryError::OutOfMemory {
                requested: size,
                available: self.capacity - s.total,
            });
        }
        let span = (size as u64).div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        let addr = self.next_addr.fetch_add(span, Ordering::Relaxed);
        s.allocations.insert(addr, vec![0u8; size]);
        s.total += size;
        Ok(DeviceAllocation {
            ptr: DevicePtr(addr),
            size,
            device_index: self.device_index,
        })
    }

    fn deallocate(&self, allocation: &DeviceAllocation) -> Result<(), MemoryError> {
        let mut s = self.state.lock();
        match s.allocations.remove(&allocation.ptr.0) {
            Some(buf) => {
                s.total -= buf.len();
                Ok(())
            }
            None => Err(MemoryError::DoubleFree(allocation.ptr)),
        }
    }

    fn copy_to_device(&self, dst: DevicePtr, data: &[u8]) -> Result<(), MemoryError> {
        let mut s = self.state.lock();
        let (base, offset) = locate(&s, dst, data.len())?;
        if let Some(buf) = s.allocations.get_mut(&base) {
            buf[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn copy_from_device(&self, src: DevicePtr, out: &mut [u8]) -> Result<(), MemoryError> {
        let s = self.state.lock();
        let (base, offset) = locate(&s, src, out.len())?;
        if let Some(buf) = s.allocations.get(&base) {
            out.copy_from_slice(&buf[offset..offset + out.len()]);
        }
        Ok(())
    }

    fn allocated_bytes(&self) -> usize {
        self.state.lock().total
    }

    fn device_index(&self) -> usize {
        self.device_index
    }
}
