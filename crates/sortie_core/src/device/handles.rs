//! Native Handles
//!
//! Opaque, copyable identifiers for objects that live on the device side.
//! The value `0` is reserved as the null handle for every type.

macro_rules! native_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
            #[repr(transparent)]
            pub struct $name(pub u64);

            impl $name {
                /// Null handle
                pub const NULL: Self = Self(0);

                #[inline]
                #[must_use]
                pub const fn raw(self) -> u64 {
                    self.0
                }

                #[inline]
                #[must_use]
                pub const fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

native_handle! {
    /// Native buffer object (no memory attached).
    NativeBuffer;
    /// Native image object (no memory attached).
    NativeImage;
    /// View over a native image.
    NativeImageView;
    /// Native sampler object.
    NativeSampler;
    /// A device memory allocation.
    DeviceMemory;
    /// CPU-waitable fence signalled by a queue submission.
    Fence;
    /// GPU-GPU binary semaphore.
    Semaphore;
    /// Native command buffer (primary or secondary).
    CommandBufferId;
    /// Native descriptor pool.
    DescriptorPoolId;
    /// Binding set allocated from a descriptor pool.
    DescriptorSetId;
    /// Native descriptor set layout.
    DescriptorSetLayoutId;
    /// Loaded shader binary.
    ShaderModuleId;
    /// Graphics pipeline (including its pipeline layout).
    PipelineId;
}
