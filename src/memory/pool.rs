//! Pool memory manager for device buffers.
//!
//! Segments are requested from a `DeviceAllocator` and carved into aligned
//! blocks. Freed blocks coalesce with their free neighbours inside the same
//! segment, so long-running workloads do not fragment into unusable slivers.
//! Uses parking_lot::Mutex for fast synchronous locking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::allocator::{DeviceAllocation, DeviceAllocator, DevicePtr, MemoryError};
use crate::telemetry;

/// Block granularity and alignment of every pooled buffer.
pub const POOL_ALIGNMENT: usize = 256;

/// Configuration for the pool memory manager.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bytes reserved up front as the first segment (0 = lazy).
    pub init_pool_size: usize,
    /// Hard ceiling on bytes held from the device.
    pub max_pool_size: usize,
    /// Minimum size of segments added when the pool grows.
    pub grow_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            init_pool_size: 64 * 1024 * 1024,      // 64 MiB
            max_pool_size: 4 * 1024 * 1024 * 1024, // 4 GiB
            grow_size: 32 * 1024 * 1024,           // 32 MiB
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub reserved_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub segments: usize,
    pub live_allocations: usize,
    pub peak_used_bytes: usize,
    pub total_allocations: u64,
    pub reused_allocations: u64,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    size: usize,
    segment: u64,
}

#[derive(Default)]
struct PoolState {
    segments: BTreeMap<u64, DeviceAllocation>,
    free: BTreeMap<u64, Block>,
    live: HashMap<u64, Block>,
    reserved: usize,
    used: usize,
    peak_used: usize,
    total_allocations: u64,
    reused_allocations: u64,
}

impl PoolState {
    /// Smallest free block that fits, split if larger than needed.
    fn take_best_fit(&mut self, size: usize) -> Option<u64> {
        let (&ptr, &block) = self
            .free
            .iter()
            .filter(|(_, b)| b.size >= size)
            .min_by_key(|(ptr, b)| (b.size, **ptr))?;
        self.free.remove(&ptr);
        if block.size > size {
            self.free.insert(
                ptr + size as u64,
                Block {
                    size: block.size - size,
                    segment: block.segment,
                },
            );
        }
        self.live.insert(
            ptr,
            Block {
                size,
                segment: block.segment,
            },
        );
        self.used += size;
        self.peak_used = self.peak_used.max(self.used);
        self.total_allocations += 1;
        Some(ptr)
    }

    /// Return a block to the free map, merging with adjacent free blocks.
    fn release(&mut self, ptr: u64) -> Result<(), MemoryError> {
        let block = self
            .live
            .remove(&ptr)
            .ok_or(MemoryError::DoubleFree(DevicePtr(ptr)))?;
        self.used -= block.size;

        let mut start = ptr;
        let mut size = block.size;

        let next_ptr = ptr + size as u64;
        if let Some(next) = self.free.get(&next_ptr).copied() {
            if next.segment == block.segment {
                self.free.remove(&next_ptr);
                size += next.size;
            }
        }

        let prev = self
            .free
            .range(..ptr)
            .next_back()
            .map(|(&p, &b)| (p, b));
        if let Some((prev_ptr, prev_block)) = prev {
            if prev_block.segment == block.segment && prev_ptr + prev_block.size as u64 == ptr {
                self.free.remove(&prev_ptr);
                start = prev_ptr;
                size += prev_block.size;
            }
        }

        self.free.insert(
            start,
            Block {
                size,
                segment: block.segment,
            },
        );
        Ok(())
    }

    fn free_bytes(&self) -> usize {
        self.free.values().map(|b| b.size).sum()
    }

    /// Segments whose whole range is a single free block.
    fn idle_segments(&self) -> Vec<u64> {
        self.segments
            .iter()
            .filter(|(base, seg)| {
                self.free
                    .get(base)
                    .map(|b| b.size == seg.size)
                    .unwrap_or(false)
            })
            .map(|(base, _)| *base)
            .collect()
    }
}

struct PoolInner {
    allocator: Arc<dyn DeviceAllocator>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn add_segment(&self, state: &mut PoolState, size: usize) -> Result<(), MemoryError> {
        let allocation = self.allocator.allocate(size)?;
        let base = allocation.ptr.addr();
        state.free.insert(
            base,
            Block {
                size,
                segment: base,
            },
        );
        state.reserved += size;
        state.segments.insert(base, allocation);
        debug!(segment = %DevicePtr(base), size, reserved = state.reserved, "pool segment added");
        Ok(())
    }

    fn trim_locked(&self, state: &mut PoolState) -> usize {
        let mut released = 0;
        for base in state.idle_segments() {
            let Some(segment) = state.segments.remove(&base) else {
                continue;
            };
            state.free.remove(&base);
            if let Err(e) = self.allocator.deallocate(&segment) {
                warn!(segment = %segment.ptr, error = %e, "failed to release pool segment");
            }
            state.reserved -= segment.size;
            released += segment.size;
        }
        released
    }

    /// Segment size to add for a request of `size` bytes, if the ceiling allows.
    fn growth_for(&self, state: &PoolState, size: usize) -> Option<usize> {
        let headroom = self.config.max_pool_size.saturating_sub(state.reserved);
        if headroom < size {
            return None;
        }
        let wanted = size.max(round_up(self.config.grow_size));
        Some(wanted.min(headroom))
    }

    /// Add a segment that can hold `size`: a full growth step first, then
    /// exactly `size` if the device refuses the step. Returns `false` when
    /// neither the ceiling nor the device has room. The smallest amount the
    /// device reported free is kept in `device_free`.
    fn grow(
        &self,
        state: &mut PoolState,
        size: usize,
        device_free: &mut Option<usize>,
    ) -> Result<bool, MemoryError> {
        let Some(step) = self.growth_for(state, size) else {
            return Ok(false);
        };
        let candidates = if step > size { vec![step, size] } else { vec![step] };
        for candidate in candidates {
            match self.add_segment(state, candidate) {
                Ok(()) => return Ok(true),
                Err(MemoryError::OutOfMemory { available, .. }) => {
                    debug!(segment = candidate, available, "device refused pool segment");
                    *device_free = Some(device_free.map_or(available, |f| f.min(available)));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    fn allocate(&self, size: usize) -> Result<u64, MemoryError> {
        let mut state = self.state.lock();

        if let Some(ptr) = state.take_best_fit(size) {
            state.reused_allocations += 1;
            telemetry::record_memory_pool(state.reserved, state.used);
            return Ok(ptr);
        }

        let mut device_free = None;
        let mut grown = self.grow(&mut state, size, &mut device_free)?;
        if !grown {
            let released = self.trim_locked(&mut state);
            if released > 0 {
                debug!(released, "pool trimmed to make room");
                grown = self.grow(&mut state, size, &mut device_free)?;
            }
        }

        if !grown {
            let headroom = self.config.max_pool_size.saturating_sub(state.reserved);
            let available = device_free.map_or(headroom, |f| f.min(headroom)) + state.free_bytes();
            warn!(requested = size, available, "pool exhausted");
            return Err(MemoryError::OutOfMemory {
                requested: size,
                available,
            });
        }

        let ptr = state.take_best_fit(size).ok_or(MemoryError::OutOfMemory {
            requested: size,
            available: state.free_bytes(),
        })?;
        telemetry::record_memory_pool(state.reserved, state.used);
        Ok(ptr)
    }

    fn release(&self, ptr: u64) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        state.release(ptr)?;
        telemetry::record_memory_pool(state.reserved, state.used);
        Ok(())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, segment) in std::mem::take(&mut state.segments) {
            if let Err(e) = self.allocator.deallocate(&segment) {
                warn!(segment = %segment.ptr, error = %e, "failed to release pool segment on drop");
            }
        }
    }
}

fn round_up(size: usize) -> usize {
    size.div_ceil(POOL_ALIGNMENT) * POOL_ALIGNMENT
}

/// A device buffer borrowed from the pool. Dropping returns it.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
    pool: Arc<PoolInner>,
}

impl DeviceBuffer {
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Requested size in bytes (the underlying block may be larger).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` to the start of this buffer.
    pub fn copy_from_host(&self, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() > self.len {
            return Err(MemoryError::OutOfBounds {
                ptr: self.ptr,
                len: data.len(),
            });
        }
        self.pool.allocator.copy_to_device(self.ptr, data)
    }

    /// Copy the start of this buffer into `out`.
    pub fn copy_to_host(&self, out: &mut [u8]) -> Result<(), MemoryError> {
        if out.len() > self.len {
            return Err(MemoryError::OutOfBounds {
                ptr: self.ptr,
                len: out.len(),
            });
        }
        self.pool.allocator.copy_from_device(self.ptr, out)
    }

    /// Read the whole buffer back.
    pub fn to_vec(&self) -> Result<Vec<u8>, MemoryError> {
        let mut out = vec![0u8; self.len];
        self.copy_to_host(&mut out)?;
        Ok(out)
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release(self.ptr.addr()) {
            warn!(ptr = %self.ptr, error = %e, "device buffer release failed");
        }
    }
}

/// Pool-based device memory manager.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct PoolMemoryManager {
    inner: Arc<PoolInner>,
}

impl PoolMemoryManager {
    pub fn new(allocator: Arc<dyn DeviceAllocator>, config: PoolConfig) -> Result<Self, MemoryError> {
        if config.max_pool_size == 0 {
            return Err(MemoryError::InvalidConfig("max_pool_size must be non-zero".into()));
        }
        if config.init_pool_size > config.max_pool_size {
            return Err(MemoryError::InvalidConfig(format!(
                "init_pool_size {} exceeds max_pool_size {}",
                config.init_pool_size, config.max_pool_size
            )));
        }

        let init = round_up(config.init_pool_size).min(config.max_pool_size);
        let inner = Arc::new(PoolInner {
            allocator,
            config,
            state: Mutex::new(PoolState::default()),
        });

        if init > 0 {
            let mut state = inner.state.lock();
            inner.add_segment(&mut state, init)?;
        }

        Ok(Self { inner })
    }

    /// Borrow `size` bytes of device memory.
    pub fn allocate(&self, size: usize) -> Result<DeviceBuffer, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let ptr = self.inner.allocate(round_up(size))?;
        Ok(DeviceBuffer {
            ptr: DevicePtr(ptr),
            len: size,
            pool: self.inner.clone(),
        })
    }

    /// Release every fully idle segment back to the device. Returns bytes freed.
    pub fn trim(&self) -> usize {
        let mut state = self.inner.state.lock();
        let released = self.inner.trim_locked(&mut state);
        telemetry::record_memory_pool(state.reserved, state.used);
        released
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            reserved_bytes: state.reserved,
            used_bytes: state.used,
            free_bytes: state.free_bytes(),
            segments: state.segments.len(),
            live_allocations: state.live.len(),
            peak_used_bytes: state.peak_used,
            total_allocations: state.total_allocations,
            reused_allocations: state.reused_allocations,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.inner.allocator
    }
}

/// Create a pool with `init_pool_size` bytes reserved up front, capped at
/// `max_pool_size`.
pub fn create_memory_pool(
    allocator: Arc<dyn DeviceAllocator>,
    init_pool_size: usize,
    max_pool_size: usize,
) -> Result<PoolMemoryManager, MemoryError> {
    let config = PoolConfig {
        init_pool_size,
        max_pool_size,
        ..PoolConfig::default()
    };
    PoolMemoryManager::new(allocator, config)
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
