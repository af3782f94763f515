//! Descriptor Vocabulary
//!
//! Binding kinds, per-kind counts and pool capacities shared by the device
//! interface and the binding-set allocator.
//!
//! A [`DescriptorCounts`] is a fixed array indexed by [`DescriptorKind`], so
//! aggregate arithmetic (requirement checks, decrements, peak tracking) is a
//! straight loop over eleven slots with no hashing.

use std::fmt;
use std::ops::{Index, IndexMut};

use smallvec::SmallVec;

/// Every binding kind a binding-set layout can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DescriptorKind {
    Sampler = 0,
    CombinedImageSampler = 1,
    SampledImage = 2,
    StorageImage = 3,
    UniformTexelBuffer = 4,
    StorageTexelBuffer = 5,
    UniformBuffer = 6,
    StorageBuffer = 7,
    UniformBufferDynamic = 8,
    StorageBufferDynamic = 9,
    InputAttachment = 10,
}

impl DescriptorKind {
    /// Number of distinct kinds.
    pub const COUNT: usize = 11;

    /// All kinds, in index order.
    pub const ALL: [DescriptorKind; Self::COUNT] = [
        Self::Sampler,
        Self::CombinedImageSampler,
        Self::SampledImage,
        Self::StorageImage,
        Self::UniformTexelBuffer,
        Self::StorageTexelBuffer,
        Self::UniformBuffer,
        Self::StorageBuffer,
        Self::UniformBufferDynamic,
        Self::StorageBufferDynamic,
        Self::InputAttachment,
    ];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sampler => "sampler",
            Self::CombinedImageSampler => "combined_image_sampler",
            Self::SampledImage => "sampled_image",
            Self::StorageImage => "storage_image",
            Self::UniformTexelBuffer => "uniform_texel_buffer",
            Self::StorageTexelBuffer => "storage_texel_buffer",
            Self::UniformBuffer => "uniform_buffer",
            Self::StorageBuffer => "storage_buffer",
            Self::UniformBufferDynamic => "uniform_buffer_dynamic",
            Self::StorageBufferDynamic => "storage_buffer_dynamic",
            Self::InputAttachment => "input_attachment",
        }
    }
}

// ============================================================================
// DescriptorCounts
// ============================================================================

/// Per-kind descriptor counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorCounts([u32; DescriptorKind::COUNT]);

impl DescriptorCounts {
    pub const ZERO: Self = Self([0; DescriptorKind::COUNT]);

    #[must_use]
    pub fn new() -> Self {
        Self::ZERO
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, kind: DescriptorKind, count: u32) -> Self {
        self.0[kind.index()] = count;
        self
    }

    #[inline]
    #[must_use]
    pub fn get(&self, kind: DescriptorKind) -> u32 {
        self.0[kind.index()]
    }

    #[inline]
    pub fn set(&mut self, kind: DescriptorKind, count: u32) {
        self.0[kind.index()] = count;
    }

    pub fn add(&mut self, kind: DescriptorKind, count: u32) {
        let slot = &mut self.0[kind.index()];
        *slot = slot.saturating_add(count);
    }

    /// Returns `true` if every per-kind count in `self` is at least the one in `required`.
    #[must_use]
    pub fn covers(&self, required: &DescriptorCounts) -> bool {
        self.0.iter().zip(required.0.iter()).all(|(have, need)| have >= need)
    }

    pub fn saturating_sub_assign(&mut self, other: &DescriptorCounts) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a = a.saturating_sub(*b);
        }
    }

    pub fn add_assign(&mut self, other: &DescriptorCounts) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a = a.saturating_add(*b);
        }
    }

    /// Component-wise maximum.
    pub fn max_assign(&mut self, other: &DescriptorCounts) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a = (*a).max(*b);
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().map(|&c| u64::from(c)).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&c| c == 0)
    }

    /// Iterates the non-zero entries.
    pub fn iter(&self) -> impl Iterator<Item = (DescriptorKind, u32)> + '_ {
        DescriptorKind::ALL
            .iter()
            .map(|&k| (k, self.0[k.index()]))
            .filter(|&(_, c)| c > 0)
    }
}

impl Index<DescriptorKind> for DescriptorCounts {
    type Output = u32;

    fn index(&self, kind: DescriptorKind) -> &u32 {
        &self.0[kind.index()]
    }
}

impl IndexMut<DescriptorKind> for DescriptorCounts {
    fn index_mut(&mut self, kind: DescriptorKind) -> &mut u32 {
        &mut self.0[kind.index()]
    }
}

impl fmt::Display for DescriptorCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (kind, count) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}={count}", kind.name())?;
            first = false;
        }
        if first {
            f.write_str("<none>")?;
        }
        Ok(())
    }
}

// ============================================================================
// PoolCapacity
// ============================================================================

/// Capacity of one descriptor pool: a set budget plus per-kind descriptor counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolCapacity {
    pub max_sets: u32,
    pub descriptors: DescriptorCounts,
}

impl PoolCapacity {
    #[must_use]
    pub fn new(max_sets: u32, descriptors: DescriptorCounts) -> Self {
        Self {
            max_sets,
            descriptors,
        }
    }

    /// Whether one more set with requirement `required` fits.
    #[must_use]
    pub fn can_allocate(&self, required: &DescriptorCounts) -> bool {
        self.max_sets > 0 && self.descriptors.covers(required)
    }

    /// Consumes one set worth of `required`. Callers check [`Self::can_allocate`] first.
    pub fn consume(&mut self, required: &DescriptorCounts) {
        self.max_sets = self.max_sets.saturating_sub(1);
        self.descriptors.saturating_sub_assign(required);
    }

    /// Returns a capacity at least as large as `self` on every kind and large
    /// enough to hold one set of `required`.
    #[must_use]
    pub fn grown_to_fit(&self, required: &DescriptorCounts) -> PoolCapacity {
        let mut descriptors = self.descriptors;
        descriptors.max_assign(required);
        PoolCapacity {
            max_sets: self.max_sets.max(1),
            descriptors,
        }
    }
}

impl Default for PoolCapacity {
    fn default() -> Self {
        Self {
            max_sets: 200,
            descriptors: DescriptorCounts::new()
                .with(DescriptorKind::UniformBuffer, 400)
                .with(DescriptorKind::CombinedImageSampler, 400)
                .with(DescriptorKind::SampledImage, 200)
                .with(DescriptorKind::Sampler, 100)
                .with(DescriptorKind::StorageBuffer, 100),
        }
    }
}

// ============================================================================
// Layout bindings & writes
// ============================================================================

/// One binding slot of a binding-set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub visibility: wgpu::ShaderStages,
}

impl LayoutBinding {
    #[must_use]
    pub fn new(binding: u32, kind: DescriptorKind, visibility: wgpu::ShaderStages) -> Self {
        Self {
            binding,
            kind,
            count: 1,
            visibility,
        }
    }
}

/// Aggregates the per-kind requirement of a list of layout bindings.
#[must_use]
pub fn aggregate_requirement(bindings: &[LayoutBinding]) -> DescriptorCounts {
    let mut counts = DescriptorCounts::new();
    for b in bindings {
        counts.add(b.kind, b.count);
    }
    counts
}

/// One write into an allocated binding set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorWrite {
    CombinedImageSampler {
        binding: u32,
        view: super::NativeImageView,
        sampler: super::NativeSampler,
    },
    SampledImage {
        binding: u32,
        view: super::NativeImageView,
    },
    Sampler {
        binding: u32,
        sampler: super::NativeSampler,
    },
    UniformBuffer {
        binding: u32,
        buffer: super::NativeBuffer,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        binding: u32,
        buffer: super::NativeBuffer,
        offset: u64,
        range: u64,
    },
}

impl DescriptorWrite {
    #[must_use]
    pub fn binding(&self) -> u32 {
        match *self {
            Self::CombinedImageSampler { binding, .. }
            | Self::SampledImage { binding, .. }
            | Self::Sampler { binding, .. }
            | Self::UniformBuffer { binding, .. }
            | Self::StorageBuffer { binding, .. } => binding,
        }
    }
}

/// Inline list of writes used when updating a single set.
pub type DescriptorWrites = SmallVec<[DescriptorWrite; 4]>;
