//! Binding Set Allocator Tests
//!
//! Tests for:
//! - Content-keyed cache: hits skip native allocation, reset clears the cache
//! - Pool blocks: growth on demand, monotonic block count, grown-to-fit blocks
//! - Failure handling: deactivation on native failure, exhaustion on a fresh block
//! - Statistics: per-epoch counters and peaks

use std::sync::Arc;

use sortie::core::device::headless::HeadlessDevice;
use sortie::core::device::{
    DescriptorCounts, DescriptorKind, DescriptorWrite, LayoutBinding, NativeImageView,
    PoolCapacity,
};
use sortie::render::binding::{BindingCacheKey, BindingSetAllocator, DescriptorSetLayout};

fn uniform_layout(device: &Arc<HeadlessDevice>, count: u32) -> DescriptorSetLayout {
    let bindings: Vec<LayoutBinding> = (0..count)
        .map(|b| LayoutBinding::new(b, DescriptorKind::UniformBuffer, wgpu::ShaderStages::VERTEX))
        .collect();
    DescriptorSetLayout::new(device.clone(), &bindings).unwrap()
}

fn small_capacity(max_sets: u32, uniform_buffers: u32) -> PoolCapacity {
    PoolCapacity::new(
        max_sets,
        DescriptorCounts::new().with(DescriptorKind::UniformBuffer, uniform_buffers),
    )
}

// ============================================================================
// Cache
// ============================================================================

#[test]
fn cache_hit_returns_same_set_without_native_allocation() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 1);
    let mut alloc = BindingSetAllocator::new(device.clone(), PoolCapacity::default());

    let key = BindingCacheKey::builder(&layout)
        .image(NativeImageView(7))
        .value(42)
        .build();

    let first = alloc.allocate_descriptor_set(&layout, Some(key)).unwrap();
    let allocated_before = device.stats().descriptor_sets_allocated;
    let second = alloc.allocate_descriptor_set(&layout, Some(key)).unwrap();

    assert!(first.fresh);
    assert!(!second.fresh);
    assert_eq!(first.set, second.set);
    assert_eq!(device.stats().descriptor_sets_allocated, allocated_before);

    let stats = alloc.cache_statistics();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn different_content_misses_the_cache() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 1);
    let mut alloc = BindingSetAllocator::new(device.clone(), PoolCapacity::default());

    let a = BindingCacheKey::builder(&layout).value(1).build();
    let b = BindingCacheKey::builder(&layout).value(2).build();
    let sa = alloc.allocate_descriptor_set(&layout, Some(a)).unwrap();
    let sb = alloc.allocate_descriptor_set(&layout, Some(b)).unwrap();

    assert_ne!(sa.set, sb.set);
    assert_eq!(alloc.cache_statistics().cached_sets, 2);
}

#[test]
fn reset_clears_cache_before_reuse() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 1);
    let mut alloc = BindingSetAllocator::new(device.clone(), PoolCapacity::default());
    let key = BindingCacheKey::builder(&layout).value(9).build();

    let before = alloc.allocate_descriptor_set(&layout, Some(key)).unwrap();
    alloc.update_descriptor_set(
        before.set,
        &[DescriptorWrite::UniformBuffer {
            binding: 0,
            buffer: sortie::core::device::NativeBuffer(3),
            offset: 0,
            range: 64,
        }],
    );

    alloc.reset_pool();
    assert_eq!(alloc.cache_statistics().cached_sets, 0);

    // The set from the previous epoch is gone; the same key allocates anew.
    let after = alloc.allocate_descriptor_set(&layout, Some(key)).unwrap();
    assert!(after.fresh);
    assert_eq!(alloc.cache_statistics().hits, 0);
    assert!(device.descriptor_writes(after.set).is_empty());
}

#[test]
fn unkeyed_requests_bypass_the_cache() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 1);
    let mut alloc = BindingSetAllocator::new(device.clone(), PoolCapacity::default());

    let a = alloc.allocate_descriptor_set(&layout, None).unwrap();
    let b = alloc.allocate_descriptor_set(&layout, None).unwrap();
    assert_ne!(a.set, b.set);
    assert_eq!(alloc.cache_statistics().requests, 0);
}

// ============================================================================
// Pool growth
// ============================================================================

#[test]
fn allocator_is_lazy() {
    let device = Arc::new(HeadlessDevice::new());
    let alloc = BindingSetAllocator::new(device.clone(), PoolCapacity::default());
    assert_eq!(alloc.block_count(), 0);
    assert_eq!(device.live().descriptor_pools, 0);
}

#[test]
fn block_count_grows_and_never_shrinks_before_shutdown() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 1);
    let mut alloc = BindingSetAllocator::new(device.clone(), small_capacity(2, 4));

    let mut last = 0;
    for epoch in 0..4 {
        let sets = 3 + epoch * 2;
        for _ in 0..sets {
            assert!(alloc.allocate_descriptor_set(&layout, None).is_some());
            assert!(alloc.block_count() >= last);
            last = alloc.block_count();
        }
        alloc.reset_pool();
        assert_eq!(alloc.block_count(), last, "reset must not destroy blocks");
    }

    // 9 sets at 2 per block in the largest epoch.
    assert_eq!(alloc.block_count(), 5);
    assert_eq!(alloc.pool_statistics().peak_pool_count, 5);
    assert!(alloc.blocks().iter().all(|b| b.is_active()));

    alloc.shutdown();
    assert_eq!(alloc.block_count(), 0);
    assert_eq!(device.live().descriptor_pools, 0);
}

#[test]
fn steady_state_reuses_blocks() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 1);
    let mut alloc = BindingSetAllocator::new(device.clone(), small_capacity(4, 8));

    for _ in 0..6 {
        alloc.allocate_descriptor_set(&layout, None).unwrap();
    }
    let pools_created = device.stats().descriptor_pools_created;

    for _ in 0..10 {
        alloc.reset_pool();
        for _ in 0..6 {
            alloc.allocate_descriptor_set(&layout, None).unwrap();
        }
    }
    assert_eq!(device.stats().descriptor_pools_created, pools_created);
}

#[test]
fn exhausted_block_stops_accepting() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 1);
    let mut alloc = BindingSetAllocator::new(device.clone(), small_capacity(2, 10));

    alloc.allocate_descriptor_set(&layout, None).unwrap();
    alloc.allocate_descriptor_set(&layout, None).unwrap();

    let block = &alloc.blocks()[0];
    assert!(!block.is_active());
    assert_eq!(block.current_capacity().max_sets, 0);
    assert_eq!(
        block.current_capacity().descriptors.get(DescriptorKind::UniformBuffer),
        8
    );
    assert_eq!(
        block.original_capacity().descriptors.get(DescriptorKind::UniformBuffer),
        10
    );
}

#[test]
fn oversized_requirement_gets_grown_block() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 6);
    let mut alloc = BindingSetAllocator::new(device.clone(), small_capacity(4, 4));

    let set = alloc.allocate_descriptor_set(&layout, None);
    assert!(set.is_some());

    let block = &alloc.blocks()[0];
    assert!(
        block
            .original_capacity()
            .descriptors
            .get(DescriptorKind::UniformBuffer)
            >= 6
    );
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn native_failure_deactivates_block_and_moves_on() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 1);
    let mut alloc = BindingSetAllocator::new(device.clone(), PoolCapacity::default());

    alloc.allocate_descriptor_set(&layout, None).unwrap();
    device.fail_descriptor_set_allocations(1);

    assert!(alloc.allocate_descriptor_set(&layout, None).is_some());
    assert_eq!(alloc.block_count(), 2);
    assert!(!alloc.blocks()[0].is_active());

    alloc.reset_pool();
    assert!(alloc.blocks().iter().all(|b| b.is_active()));
}

#[test]
fn failure_on_fresh_block_is_exhaustion() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 1);
    let mut alloc = BindingSetAllocator::new(device.clone(), PoolCapacity::default());

    device.fail_descriptor_set_allocations(1);
    assert!(alloc.allocate_descriptor_set(&layout, None).is_none());
    assert!(alloc.allocate_descriptor_set(&layout, None).is_some());
}

// ============================================================================
// Statistics
// ============================================================================

#[test]
fn statistics_track_epochs_and_peaks() {
    let device = Arc::new(HeadlessDevice::new());
    let layout = uniform_layout(&device, 2);
    let mut alloc = BindingSetAllocator::new(device.clone(), PoolCapacity::default());

    for _ in 0..5 {
        alloc.allocate_descriptor_set(&layout, None).unwrap();
    }
    alloc.reset_pool();
    for _ in 0..3 {
        alloc.allocate_descriptor_set(&layout, None).unwrap();
    }

    let stats = alloc.pool_statistics();
    assert_eq!(stats.total_allocations, 8);
    assert_eq!(stats.pool_resets, 1);
    assert_eq!(stats.epoch_allocations, 3);
    assert_eq!(stats.peak_concurrent_sets, 5);
    assert_eq!(stats.peak_usage.get(DescriptorKind::UniformBuffer), 10);
    assert_eq!(stats.epoch_usage.get(DescriptorKind::UniformBuffer), 6);
}
