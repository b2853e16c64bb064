//! Integration tests for the pool memory manager.

use std::sync::Arc;
use std::thread;

use kernel_forge::memory::{
    create_memory_pool, DeviceAllocator, HostDeviceAllocator, MemoryError, PoolConfig,
    PoolMemoryManager, POOL_ALIGNMENT,
};

const KB: usize = 1024;

fn pool_with(init: usize, max: usize, grow: usize) -> (Arc<HostDeviceAllocator>, PoolMemoryManager) {
    let allocator = Arc::new(HostDeviceAllocator::new(64 * 1024 * KB, 0));
    let pool = PoolMemoryManager::new(
        allocator.clone(),
        PoolConfig {
            init_pool_size: init,
            max_pool_size: max,
            grow_size: grow,
        },
    )
    .unwrap();
    (allocator, pool)
}

#[test]
fn create_memory_pool_reserves_initial_segment() {
    let allocator = Arc::new(HostDeviceAllocator::new(16 * 1024 * KB, 0));
    let pool = create_memory_pool(allocator.clone(), 256 * KB, 4 * 1024 * KB).unwrap();

    let stats = pool.stats();
    assert_eq!(stats.reserved_bytes, 256 * KB);
    assert_eq!(stats.segments, 1);
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(allocator.allocated_bytes(), 256 * KB);
}

#[test]
fn init_larger_than_max_is_rejected() {
    let allocator = Arc::new(HostDeviceAllocator::new(KB * KB, 0));
    let result = create_memory_pool(allocator, 8 * KB, 4 * KB);
    assert!(matches!(result, Err(MemoryError::InvalidConfig(_))));
}

#[test]
fn buffers_are_aligned_and_reused() {
    let (_, pool) = pool_with(64 * KB, 64 * KB, 16 * KB);

    let a = pool.allocate(100).unwrap();
    let b = pool.allocate(3000).unwrap();
    assert_eq!(a.ptr().addr() % POOL_ALIGNMENT as u64, 0);
    assert_eq!(b.ptr().addr() % POOL_ALIGNMENT as u64, 0);
    assert_eq!(a.len(), 100);
    let first = a.ptr();
    drop(a);

    let c = pool.allocate(200).unwrap();
    assert_eq!(c.ptr(), first, "freed block is handed out again");

    let stats = pool.stats();
    assert_eq!(stats.live_allocations, 2);
    assert_eq!(stats.total_allocations, 3);
    assert_eq!(stats.reused_allocations, 3);
    assert_eq!(stats.segments, 1);
}

#[test]
fn pool_grows_to_ceiling_then_reports_oom() {
    let (_, pool) = pool_with(0, 64 * KB, 16 * KB);

    let first = pool.allocate(KB).unwrap();
    assert_eq!(pool.stats().reserved_bytes, 16 * KB, "grows by grow_size");

    let big = pool.allocate(40 * KB).unwrap();
    let stats = pool.stats();
    assert_eq!(stats.segments, 2);
    assert_eq!(stats.reserved_bytes, 56 * KB);

    // 8 KiB of headroom plus 15 KiB free in the first segment.
    match pool.allocate(20 * KB) {
        Err(MemoryError::OutOfMemory { requested, available }) => {
            assert_eq!(requested, 20 * KB);
            assert_eq!(available, 8 * KB + 15 * KB);
        }
        other => panic!("expected OutOfMemory, got {:?}", other),
    }

    drop(big);
    drop(first);
    assert_eq!(pool.stats().used_bytes, 0);
}

#[test]
fn trim_releases_idle_segments() {
    let (allocator, pool) = pool_with(16 * KB, 128 * KB, 32 * KB);

    let held = pool.allocate(8 * KB).unwrap();
    let grown = pool.allocate(32 * KB).unwrap();
    assert_eq!(pool.stats().segments, 2);
    drop(grown);

    let released = pool.trim();
    assert_eq!(released, 32 * KB);
    let stats = pool.stats();
    assert_eq!(stats.segments, 1, "segment with a live buffer is kept");
    assert_eq!(allocator.allocated_bytes(), 16 * KB);
    drop(held);

    assert_eq!(pool.trim(), 16 * KB);
    assert_eq!(pool.stats().reserved_bytes, 0);
}

#[test]
fn exhausted_pool_trims_before_failing() {
    let (_, pool) = pool_with(0, 8 * KB, 4 * KB);

    let a = pool.allocate(4 * KB).unwrap();
    let b = pool.allocate(4 * KB).unwrap();
    assert_eq!(pool.stats().segments, 2);
    drop(a);
    drop(b);

    // Two idle 4 KiB segments cannot hold 8 KiB, but releasing them can.
    let whole = pool.allocate(8 * KB).unwrap();
    let stats = pool.stats();
    assert_eq!(stats.segments, 1);
    assert_eq!(stats.reserved_bytes, 8 * KB);
    assert_eq!(whole.len(), 8 * KB);
}

#[test]
fn host_copies_round_trip_and_are_bounds_checked() {
    let (_, pool) = pool_with(4 * KB, 4 * KB, 4 * KB);
    let buf = pool.allocate(16).unwrap();
    let data: Vec<u8> = (0..16).collect();
    buf.copy_from_host(&data).unwrap();
    assert_eq!(buf.to_vec().unwrap(), data);

    let mut head = [0u8; 4];
    buf.copy_to_host(&mut head).unwrap();
    assert_eq!(head, [0, 1, 2, 3]);

    assert!(matches!(
        buf.copy_from_host(&[0u8; 17]),
        Err(MemoryError::OutOfBounds { len: 17, .. })
    ));
}

#[test]
fn zero_sized_allocation_is_rejected() {
    let (_, pool) = pool_with(4 * KB, 4 * KB, 4 * KB);
    assert!(matches!(pool.allocate(0), Err(MemoryError::InvalidSize(0))));
}

#[test]
fn allocator_detects_double_free() {
    let allocator = HostDeviceAllocator::new(KB, 3);
    let allocation = allocator.allocate(128).unwrap();
    assert_eq!(allocation.device_index, 3);
    allocator.deallocate(&allocation).unwrap();
    assert!(matches!(
        allocator.deallocate(&allocation),
        Err(MemoryError::DoubleFree(_))
    ));
    assert_eq!(allocator.leak_count(), 0);
}

#[test]
fn concurrent_allocations_balance_out() {
    let (_, pool) = pool_with(256 * KB, 1024 * KB, 64 * KB);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let buf = pool.allocate(256 + (t * 100 + i) % 2048).unwrap();
                    buf.copy_from_host(&[t as u8; 16]).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.total_allocations, 800);
    assert_eq!(stats.free_bytes, stats.reserved_bytes);
}

#[test]
fn dropping_the_pool_returns_every_segment() {
    let (allocator, pool) = pool_with(16 * KB, 128 * KB, 16 * KB);
    let grown = pool.allocate(20 * KB).unwrap();
    assert!(allocator.allocated_bytes() > 16 * KB);
    drop(grown);
    drop(pool);
    assert_eq!(allocator.allocated_bytes(), 0);
    assert_eq!(allocator.leak_count(), 0);
}
