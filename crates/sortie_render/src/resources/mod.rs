//! GPU resource tracking with deferred destruction.

mod manager;

pub use manager::{
    GpuResource, HostMapping, ImageInfo, ResourceHandle, ResourceKind, ResourceManager,
    ResourceStats, SharedResourceManager,
};
