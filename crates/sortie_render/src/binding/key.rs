//! Binding Cache Keys
//!
//! A [`BindingCacheKey`] identifies the *content* of a binding set: the layout
//! plus every native object written into it. Two requests with the same key
//! within one pool epoch receive the same set.
//!
//! # Design
//!
//! The builder collects tagged `u64` words in insertion order and hashes them
//! with xxh3 in one shot. Tags keep `image(5)` and `buffer(5)` distinct.

use smallvec::SmallVec;
use sortie_core::device::{DescriptorSetLayoutId, NativeBuffer, NativeImageView, NativeSampler};
use xxhash_rust::xxh3::xxh3_64;

use super::DescriptorSetLayout;

const TAG_IMAGE: u64 = 1 << 56;
const TAG_BUFFER: u64 = 2 << 56;
const TAG_SAMPLER: u64 = 3 << 56;
const TAG_VALUE: u64 = 4 << 56;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingCacheKey {
    layout: DescriptorSetLayoutId,
    content: u64,
}

impl BindingCacheKey {
    /// Key from a layout and a precomputed content hash.
    #[must_use]
    pub fn new(layout: DescriptorSetLayoutId, content: u64) -> Self {
        Self { layout, content }
    }

    #[must_use]
    pub fn builder(layout: &DescriptorSetLayout) -> BindingCacheKeyBuilder {
        BindingCacheKeyBuilder {
            layout: layout.id(),
            words: SmallVec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn layout(&self) -> DescriptorSetLayoutId {
        self.layout
    }

    #[inline]
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        self.content
    }
}

pub struct BindingCacheKeyBuilder {
    layout: DescriptorSetLayoutId,
    words: SmallVec<[u64; 16]>,
}

impl BindingCacheKeyBuilder {
    #[must_use]
    pub fn image(mut self, view: NativeImageView) -> Self {
        self.words.push(TAG_IMAGE);
        self.words.push(view.raw());
        self
    }

    #[must_use]
    pub fn buffer(mut self, buffer: NativeBuffer) -> Self {
        self.words.push(TAG_BUFFER);
        self.words.push(buffer.raw());
        self
    }

    #[must_use]
    pub fn sampler(mut self, sampler: NativeSampler) -> Self {
        self.words.push(TAG_SAMPLER);
        self.words.push(sampler.raw());
        self
    }

    /// Any extra discriminator (offsets, ranges, user ids).
    #[must_use]
    pub fn value(mut self, value: u64) -> Self {
        self.words.push(TAG_VALUE);
        self.words.push(value);
        self
    }

    #[must_use]
    pub fn build(self) -> BindingCacheKey {
        let bytes: &[u8] = bytemuck::cast_slice(self.words.as_slice());
        BindingCacheKey {
            layout: self.layout,
            content: xxh3_64(bytes),
        }
    }
}
