//! Binding Set Allocator
//!
//! Hands out binding sets from a growable list of native pool blocks and
//! caches them by content for the duration of one pool epoch.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   BindingSetAllocator                        │
//! │                                                              │
//! │  cache:  FxHashMap<BindingCacheKey, DescriptorSetId>         │
//! │  blocks: [BindingPoolBlock]   ←── round-robin from last used │
//! │                                                              │
//! │  allocate_descriptor_set() → cache hit? → scan blocks        │
//! │                              → grow by one block             │
//! │  reset_pool()              → clear cache, reset every block  │
//! │  shutdown()                → destroy every block             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Epochs
//!
//! Every frame slot owns one allocator. The slot resets it right after its
//! fence signals, so all sets of the previous use of that slot are known to
//! be idle on the GPU. Blocks are never destroyed by a reset; the block count
//! only shrinks at [`BindingSetAllocator::shutdown`].

use std::sync::Arc;

use rustc_hash::FxHashMap;
use sortie_core::device::{DescriptorSetId, DescriptorWrite, GpuDevice, PoolCapacity};

use super::{
    BindingCacheKey, BindingPoolBlock, CacheStatistics, DescriptorSetLayout, PoolStatistics,
};

/// Result of a successful allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatedSet {
    pub set: DescriptorSetId,
    /// `true` when the set was just allocated and still needs its writes;
    /// `false` for a cache hit whose contents are already in place.
    pub fresh: bool,
}

pub struct BindingSetAllocator {
    device: Arc<dyn GpuDevice>,
    block_capacity: PoolCapacity,
    blocks: Vec<BindingPoolBlock>,
    last_used: usize,
    cache: FxHashMap<BindingCacheKey, DescriptorSetId>,
    pool_stats: PoolStatistics,
    cache_stats: CacheStatistics,
}

impl BindingSetAllocator {
    /// Creates an allocator whose blocks hold `block_capacity` each.
    ///
    /// No native pool is created until the first allocation.
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>, block_capacity: PoolCapacity) -> Self {
        Self {
            device,
            block_capacity,
            blocks: Vec::new(),
            last_used: 0,
            cache: FxHashMap::default(),
            pool_stats: PoolStatistics::default(),
            cache_stats: CacheStatistics::default(),
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Returns a binding set for `layout`.
    ///
    /// With a `key`, an identical request earlier in the same epoch returns
    /// the cached set without touching the device. `None` means the device
    /// could not provide a set even from a brand-new block.
    pub fn allocate_descriptor_set(
        &mut self,
        layout: &DescriptorSetLayout,
        key: Option<BindingCacheKey>,
    ) -> Option<AllocatedSet> {
        if let Some(key) = key {
            self.cache_stats.requests += 1;
            if let Some(&set) = self.cache.get(&key) {
                self.cache_stats.hits += 1;
                return Some(AllocatedSet { set, fresh: false });
            }
            self.cache_stats.misses += 1;
        }

        let set = self
            .allocate_from_existing(layout)
            .or_else(|| self.allocate_from_new_block(layout))?;

        self.pool_stats.record_allocation(layout.requirement());
        if let Some(key) = key {
            self.cache.insert(key, set);
            self.cache_stats.cached_sets = self.cache.len();
        }
        Some(AllocatedSet { set, fresh: true })
    }

    fn allocate_from_existing(&mut self, layout: &DescriptorSetLayout) -> Option<DescriptorSetId> {
        let required = layout.requirement();
        let count = self.blocks.len();

        for step in 0..count {
            let index = (self.last_used + step) % count;
            let block = &mut self.blocks[index];
            if !block.can_allocate(required) {
                continue;
            }
            match self.device.allocate_descriptor_set(block.pool, layout.id()) {
                Ok(set) => {
                    block.consume(required);
                    self.last_used = index;
                    return Some(set);
                }
                Err(e) => {
                    log::debug!("Binding pool block {index} refused an allocation ({e}), deactivating");
                    block.is_active = false;
                }
            }
        }
        None
    }

    fn allocate_from_new_block(&mut self, layout: &DescriptorSetLayout) -> Option<DescriptorSetId> {
        let required = layout.requirement();
        let capacity = if self.block_capacity.can_allocate(required) {
            self.block_capacity
        } else {
            log::debug!("Layout requirement ({required}) exceeds the block capacity, growing block to fit");
            self.block_capacity.grown_to_fit(required)
        };

        let pool = match self.device.create_descriptor_pool(&capacity) {
            Ok(pool) => pool,
            Err(e) => {
                log::error!("Failed to create binding pool block: {e}");
                return None;
            }
        };

        let mut block = BindingPoolBlock::new(pool, capacity);
        let index = self.blocks.len();
        let result = match self.device.allocate_descriptor_set(pool, layout.id()) {
            Ok(set) => {
                block.consume(required);
                self.last_used = index;
                Some(set)
            }
            Err(e) => {
                log::warn!("Binding set allocation failed on a fresh pool block: {e}");
                block.is_active = false;
                None
            }
        };

        self.blocks.push(block);
        self.pool_stats.peak_pool_count = self.pool_stats.peak_pool_count.max(self.blocks.len());
        log::debug!("Binding allocator grew to {} pool blocks", self.blocks.len());
        result
    }

    /// Writes descriptors into a freshly allocated set.
    pub fn update_descriptor_set(&self, set: DescriptorSetId, writes: &[DescriptorWrite]) {
        self.device.update_descriptor_set(set, writes);
    }

    // ========================================================================
    // Epoch management
    // ========================================================================

    /// Returns every set to its block and starts a new epoch.
    ///
    /// The cache is cleared first so no stale set can be handed out.
    pub fn reset_pool(&mut self) {
        self.cache.clear();
        self.cache_stats.cached_sets = 0;

        for block in &mut self.blocks {
            if let Err(e) = self.device.reset_descriptor_pool(block.pool) {
                log::warn!("Failed to reset binding pool block: {e}");
            }
            block.restore();
        }
        self.last_used = 0;
        self.pool_stats.begin_epoch();
    }

    /// Destroys every pool block. The allocator can still be used afterwards
    /// and grows again on demand.
    pub fn shutdown(&mut self) {
        self.cache.clear();
        self.cache_stats.cached_sets = 0;
        for block in self.blocks.drain(..) {
            self.device.destroy_descriptor_pool(block.pool);
        }
        self.last_used = 0;
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn blocks(&self) -> &[BindingPoolBlock] {
        &self.blocks
    }

    #[inline]
    #[must_use]
    pub fn block_capacity(&self) -> &PoolCapacity {
        &self.block_capacity
    }

    #[must_use]
    pub fn pool_statistics(&self) -> PoolStatistics {
        self.pool_stats
    }

    #[must_use]
    pub fn cache_statistics(&self) -> CacheStatistics {
        self.cache_stats
    }

    pub fn log_statistics(&self) {
        let p = &self.pool_stats;
        let c = &self.cache_stats;
        log::info!(
            "Binding pool: {} blocks (peak {}), {} allocations, {} resets, peak {} sets/epoch, peak usage [{}]",
            self.blocks.len(),
            p.peak_pool_count,
            p.total_allocations,
            p.pool_resets,
            p.peak_concurrent_sets,
            p.peak_usage
        );
        log::info!(
            "Binding cache: {} requests, {} hits, {} misses, {} cached, hit rate {:.1}%",
            c.requests,
            c.hits,
            c.misses,
            c.cached_sets,
            c.hit_rate() * 100.0
        );
    }
}

impl Drop for BindingSetAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortie_core::device::headless::HeadlessDevice;
    use sortie_core::device::{DescriptorCounts, DescriptorKind, LayoutBinding};

    fn setup(capacity: PoolCapacity) -> (Arc<HeadlessDevice>, BindingSetAllocator, DescriptorSetLayout) {
        let device = Arc::new(HeadlessDevice::new());
        let layout = DescriptorSetLayout::new(
            device.clone(),
            &[LayoutBinding::new(
                0,
                DescriptorKind::UniformBuffer,
                wgpu::ShaderStages::VERTEX,
            )],
        )
        .unwrap();
        let allocator = BindingSetAllocator::new(device.clone(), capacity);
        (device, allocator, layout)
    }

    fn small_capacity(sets: u32) -> PoolCapacity {
        PoolCapacity::new(
            sets,
            DescriptorCounts::new().with(DescriptorKind::UniformBuffer, sets),
        )
    }

    #[test]
    fn first_allocation_creates_a_block() {
        let (_device, mut alloc, layout) = setup(PoolCapacity::default());
        assert_eq!(alloc.block_count(), 0);

        let a = alloc.allocate_descriptor_set(&layout, None).unwrap();
        assert!(a.fresh);
        assert_eq!(alloc.block_count(), 1);
        assert_eq!(
            alloc.blocks()[0].current_capacity().descriptors[DescriptorKind::UniformBuffer],
            399
        );
    }

    #[test]
    fn exhausted_block_grows_a_new_one() {
        let (device, mut alloc, layout) = setup(small_capacity(2));
        for _ in 0..5 {
            assert!(alloc.allocate_descriptor_set(&layout, None).is_some());
        }
        assert_eq!(alloc.block_count(), 3);
        assert_eq!(device.live().descriptor_pools, 3);
        assert!(!alloc.blocks()[0].is_active());
    }

    #[test]
    fn cache_hit_skips_native_allocation() {
        let (device, mut alloc, layout) = setup(PoolCapacity::default());
        let key = BindingCacheKey::builder(&layout).value(7).build();

        let first = alloc.allocate_descriptor_set(&layout, Some(key)).unwrap();
        let native_before = device.stats().descriptor_sets_allocated;
        let second = alloc.allocate_descriptor_set(&layout, Some(key)).unwrap();

        assert!(first.fresh);
        assert!(!second.fresh);
        assert_eq!(first.set, second.set);
        assert_eq!(device.stats().descriptor_sets_allocated, native_before);
        let c = alloc.cache_statistics();
        assert_eq!((c.requests, c.hits, c.misses, c.cached_sets), (2, 1, 1, 1));
    }

    #[test]
    fn reset_clears_cache_and_restores_blocks() {
        let (_device, mut alloc, layout) = setup(small_capacity(1));
        let key = BindingCacheKey::builder(&layout).value(1).build();
        alloc.allocate_descriptor_set(&layout, Some(key)).unwrap();
        alloc.allocate_descriptor_set(&layout, None).unwrap();
        assert_eq!(alloc.block_count(), 2);

        alloc.reset_pool();
        assert_eq!(alloc.cache_statistics().cached_sets, 0);
        assert!(alloc.blocks().iter().all(BindingPoolBlock::is_active));
        assert_eq!(alloc.block_count(), 2);

        let again = alloc.allocate_descriptor_set(&layout, Some(key)).unwrap();
        assert!(again.fresh);
        assert_eq!(alloc.pool_statistics().pool_resets, 1);
    }

    #[test]
    fn oversized_requirement_gets_a_fitted_block() {
        let device = Arc::new(HeadlessDevice::new());
        let big = DescriptorSetLayout::new(
            device.clone(),
            &[LayoutBinding {
                count: 1000,
                ..LayoutBinding::new(0, DescriptorKind::SampledImage, wgpu::ShaderStages::FRAGMENT)
            }],
        )
        .unwrap();
        let mut alloc = BindingSetAllocator::new(device.clone(), PoolCapacity::default());

        assert!(alloc.allocate_descriptor_set(&big, None).is_some());
        assert_eq!(
            alloc.blocks()[0].original_capacity().descriptors[DescriptorKind::SampledImage],
            1000
        );
    }

    #[test]
    fn native_failure_on_fresh_block_is_exhaustion() {
        let (device, mut alloc, layout) = setup(PoolCapacity::default());
        device.fail_descriptor_set_allocations(1);
        assert!(alloc.allocate_descriptor_set(&layout, None).is_none());
        assert_eq!(alloc.block_count(), 1);
        assert!(!alloc.blocks()[0].is_active());

        // The inactive block is skipped and a new one takes over.
        assert!(alloc.allocate_descriptor_set(&layout, None).is_some());
        assert_eq!(alloc.block_count(), 2);
    }

    #[test]
    fn statistics_track_peaks_across_epochs() {
        let (_device, mut alloc, layout) = setup(PoolCapacity::default());
        for _ in 0..3 {
            alloc.allocate_descriptor_set(&layout, None);
        }
        alloc.reset_pool();
        alloc.allocate_descriptor_set(&layout, None);

        let p = alloc.pool_statistics();
        assert_eq!(p.total_allocations, 4);
        assert_eq!(p.peak_concurrent_sets, 3);
        assert_eq!(p.epoch_allocations, 1);
        assert_eq!(p.peak_usage[DescriptorKind::UniformBuffer], 3);
        assert_eq!(p.epoch_usage[DescriptorKind::UniformBuffer], 1);
    }

    #[test]
    fn shutdown_destroys_blocks() {
        let (device, mut alloc, layout) = setup(small_capacity(1));
        alloc.allocate_descriptor_set(&layout, None);
        alloc.allocate_descriptor_set(&layout, None);
        alloc.shutdown();
        assert_eq!(alloc.block_count(), 0);
        assert_eq!(device.live().descriptor_pools, 0);
    }
}
