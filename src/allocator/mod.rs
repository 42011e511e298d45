//! The caching allocator
//!
//! Layered bottom-up: blocks and pools, the per-device event cache and
//! statistics, the per-device allocator holding the algorithms, and the
//! multi-device dispatcher other code talks to.

pub mod block;
pub mod callbacks;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod events;
pub mod stats;

pub use block::{alloc_size, round_size, PoolKind};
pub use callbacks::{FreeMemoryCallback, FreeMemoryCallbackRegistry};
pub use config::{AllocatorConfig, ALLOC_CONF_ENV};
pub use device::{AllocatedBlock, DeviceCachingAllocator};
pub use dispatcher::{
    install_process_allocator, process_allocator, DeviceAllocation, NpuCachingAllocator,
};
#[cfg(feature = "acl")]
pub use dispatcher::init;
pub use events::{EventPool, PooledEvent};
pub use stats::{format_size, BlockInfo, DeviceStats, SegmentInfo, Stat, StatType};
