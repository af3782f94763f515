use sortie_core::device::DescriptorCounts;

/// Pool-level counters of a [`BindingSetAllocator`](super::BindingSetAllocator).
///
/// `epoch_*` fields cover the sets handed out since the last reset; the
/// `peak_*` fields are maxima over all epochs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    pub total_allocations: u64,
    pub pool_resets: u64,
    pub peak_pool_count: usize,
    pub peak_concurrent_sets: u32,
    pub peak_usage: DescriptorCounts,
    pub epoch_allocations: u32,
    pub epoch_usage: DescriptorCounts,
}

impl PoolStatistics {
    pub(crate) fn record_allocation(&mut self, required: &DescriptorCounts) {
        self.total_allocations += 1;
        self.epoch_allocations += 1;
        self.epoch_usage.add_assign(required);
        self.peak_concurrent_sets = self.peak_concurrent_sets.max(self.epoch_allocations);
        self.peak_usage.max_assign(&self.epoch_usage);
    }

    pub(crate) fn begin_epoch(&mut self) {
        self.pool_resets += 1;
        self.epoch_allocations = 0;
        self.epoch_usage = DescriptorCounts::new();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub cached_sets: usize,
}

impl CacheStatistics {
    /// Hits over requests, 0.0 before the first request.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64
        }
    }
}
