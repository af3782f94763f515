//! Binding-set (descriptor) allocation: layouts, pooled allocation and
//! content-keyed caching.

mod allocator;
mod key;
mod layout;
mod pool;
mod stats;

pub use allocator::{AllocatedSet, BindingSetAllocator};
pub use key::{BindingCacheKey, BindingCacheKeyBuilder};
pub use layout::DescriptorSetLayout;
pub use pool::BindingPoolBlock;
pub use stats::{CacheStatistics, PoolStatistics};
