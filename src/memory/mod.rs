//! Device memory management.
//!
//! Provides the raw allocator abstraction and the pool memory manager that
//! reuses device buffers across kernel launches.

mod allocator;
mod pool;

pub use allocator::{DeviceAllocation, DeviceAllocator, DevicePtr, HostDeviceAllocator, MemoryError};
pub use pool::{create_memory_pool, DeviceBuffer, PoolConfig, PoolMemoryManager, PoolStats, POOL_ALIGNMENT};
