use std::sync::Arc;

use smallvec::SmallVec;
use sortie_core::device::{
    DescriptorCounts, DescriptorSetLayoutId, DeviceResult, GpuDevice, LayoutBinding,
    aggregate_requirement,
};

/// A native binding-set layout together with its aggregated per-kind
/// requirement, which is what pool blocks are checked against.
pub struct DescriptorSetLayout {
    device: Arc<dyn GpuDevice>,
    id: DescriptorSetLayoutId,
    bindings: SmallVec<[LayoutBinding; 8]>,
    requirement: DescriptorCounts,
}

impl DescriptorSetLayout {
    pub fn new(device: Arc<dyn GpuDevice>, bindings: &[LayoutBinding]) -> DeviceResult<Self> {
        let id = device.create_descriptor_set_layout(bindings)?;
        Ok(Self {
            device,
            id,
            bindings: SmallVec::from_slice(bindings),
            requirement: aggregate_requirement(bindings),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> DescriptorSetLayoutId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    /// Descriptors consumed by one set of this layout.
    #[inline]
    #[must_use]
    pub fn requirement(&self) -> &DescriptorCounts {
        &self.requirement
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.id);
    }
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("id", &self.id)
            .field("requirement", &self.requirement)
            .finish_non_exhaustive()
    }
}
