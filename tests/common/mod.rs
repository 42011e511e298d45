//! Common test fixtures for caching-allocator integration tests
//!
//! Builds a dispatcher over a [`MockDriver`] so every scenario runs on the
//! host without accelerator hardware.
#![allow(dead_code)]

use std::sync::Arc;

use npualloc::allocator::AllocatorConfig;
use npualloc::driver::mock::MockDriver;
use npualloc::driver::{NpuDriver, NpuStream, StreamHandle};
use npualloc::NpuCachingAllocator;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;
pub const GIB: usize = 1024 * 1024 * 1024;

/// Single-device allocator over a mock driver with `total` bytes of device
/// memory.
pub fn setup(total: usize, config: AllocatorConfig) -> (Arc<MockDriver>, NpuCachingAllocator) {
    let driver = Arc::new(MockDriver::new(1, total));
    let allocator =
        NpuCachingAllocator::with_config(driver.clone() as Arc<dyn NpuDriver>, config);
    allocator.init().unwrap();
    (driver, allocator)
}

/// Multi-device variant of [`setup`].
pub fn setup_devices(
    devices: u32,
    total: usize,
    config: AllocatorConfig,
) -> (Arc<MockDriver>, NpuCachingAllocator) {
    let driver = Arc::new(MockDriver::new(devices, total));
    let allocator =
        NpuCachingAllocator::with_config(driver.clone() as Arc<dyn NpuDriver>, config);
    allocator.init().unwrap();
    (driver, allocator)
}

/// A device-0 stream with a distinct fake handle. `stream(0)` matches the
/// mock driver's default stream for device 0.
pub fn stream(n: usize) -> NpuStream {
    NpuStream::new(0, StreamHandle(0x100 + n))
}
