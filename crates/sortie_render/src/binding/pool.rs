use sortie_core::device::{DescriptorCounts, DescriptorPoolId, PoolCapacity};

/// One native descriptor pool plus the allocator's view of what is left in it.
///
/// `current` never exceeds `original` on any kind. A block stops accepting
/// allocations once its set budget is spent or the device reports it
/// fragmented; sets already issued stay valid until the next reset.
#[derive(Debug)]
pub struct BindingPoolBlock {
    pub(crate) pool: DescriptorPoolId,
    pub(crate) original: PoolCapacity,
    pub(crate) current: PoolCapacity,
    pub(crate) is_active: bool,
}

impl BindingPoolBlock {
    pub(crate) fn new(pool: DescriptorPoolId, capacity: PoolCapacity) -> Self {
        Self {
            pool,
            original: capacity,
            current: capacity,
            is_active: true,
        }
    }

    #[inline]
    #[must_use]
    pub fn pool(&self) -> DescriptorPoolId {
        self.pool
    }

    #[inline]
    #[must_use]
    pub fn original_capacity(&self) -> &PoolCapacity {
        &self.original
    }

    #[inline]
    #[must_use]
    pub fn current_capacity(&self) -> &PoolCapacity {
        &self.current
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub(crate) fn can_allocate(&self, required: &DescriptorCounts) -> bool {
        self.is_active && self.current.can_allocate(required)
    }

    pub(crate) fn consume(&mut self, required: &DescriptorCounts) {
        self.current.consume(required);
        if self.current.max_sets == 0 {
            self.is_active = false;
        }
    }

    pub(crate) fn restore(&mut self) {
        self.current = self.original;
        self.is_active = true;
    }
}
