//! npualloc - Caching device-memory allocator for NPU accelerators
//!
//! A deep-learning runtime allocates and frees device tensors at very high
//! rates, while the driver allocator is slow and synchronizes. This crate
//! sits between the two: freed blocks are cached in per-device, per-size
//! pools and recycled on later requests, with completion events keeping
//! recycling safe when allocations are consumed by multiple execution
//! streams.
//!
//! - Allocations are associated with a stream. Once freed, blocks can be
//!   re-allocated on the same stream, but not on any other stream, unless
//!   the work using them is known to be complete.
//! - Small (<= 1 MiB) requests pack into 2 MiB buffers; mid-size requests
//!   split 20 MiB buffers; big requests round to 2 MiB multiples.
//! - On memory pressure the allocator runs registered callbacks, garbage
//!   collects aged cached blocks, releases oversize blocks, and finally
//!   purges the whole cache before reporting out-of-memory.
//!
//! The device runtime is reached through the [`driver::NpuDriver`] trait;
//! `driver::acl::AclDriver` (cargo feature `acl`) binds the Ascend CL
//! runtime, and [`driver::mock::MockDriver`] simulates one in host memory
//! for tests.

pub mod allocator;
pub mod driver;
pub mod error;
pub mod logging;

pub use allocator::{
    install_process_allocator, process_allocator, AllocatorConfig, DeviceAllocation, DeviceStats,
    FreeMemoryCallback, NpuCachingAllocator, SegmentInfo, ALLOC_CONF_ENV,
};
#[cfg(feature = "acl")]
pub use allocator::init;
pub use driver::{DeviceIndex, DevicePtr, NpuDriver, NpuStream, StreamHandle};
pub use error::{AllocResult, ErrorCategory, NpuAllocError};
pub use logging::init_logging;
