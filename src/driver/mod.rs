//! Driver seam for the caching allocator
//!
//! The allocator never talks to the NPU runtime directly; everything goes
//! through the [`NpuDriver`] trait. The real binding to the Ascend CL
//! runtime lives in [`acl`] behind the `acl` cargo feature, and a host-side
//! simulation lives in [`mock`] for tests and embedders without hardware.
//!
//! Pointers, streams, and events are opaque to the allocator. It orders and
//! hashes them, adds offsets to device pointers during block splitting, and
//! hands them back to the driver, but never dereferences anything.

#[cfg(feature = "acl")]
pub mod acl;
pub mod mock;

use thiserror::Error;

/// Device index. `-1` means "resolve the current device via the driver".
pub type DeviceIndex = i32;

/// Raw device memory address. Only the driver may dereference it.
pub type DevicePtr = usize;

/// Opaque stream handle as handed out by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub usize);

/// Opaque completion-event handle as handed out by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// An execution stream bound to a device.
///
/// Allocations are affine to the stream they were allocated on; the pool
/// order and the outstanding-event queues key on this type, so it carries a
/// total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NpuStream {
    device: DeviceIndex,
    handle: StreamHandle,
}

impl NpuStream {
    pub fn new(device: DeviceIndex, handle: StreamHandle) -> Self {
        NpuStream { device, handle }
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle
    }
}

/// Free and total physical memory of a device, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct DeviceMemoryInfo {
    pub free: usize,
    pub total: usize,
}

/// Errors surfaced by driver operations.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// The device allocator could not satisfy the request. This variant is
    /// what the caching allocator's recovery ladder keys on.
    #[error("device out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Device index rejected by the runtime.
    #[error("invalid device index: {0}")]
    InvalidDevice(DeviceIndex),

    /// Any other runtime failure, with the runtime's own description.
    #[error("{0}")]
    Failure(String),
}

/// Result alias for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Contract between the caching allocator and the device runtime.
///
/// Implementations must be callable from arbitrary threads. Every call may
/// block; `synchronize_device` and `synchronize_event` may block
/// indefinitely.
pub trait NpuDriver: Send + Sync {
    /// Number of visible devices.
    fn device_count(&self) -> DriverResult<u32>;

    /// Device the calling thread is currently bound to.
    fn current_device(&self) -> DriverResult<DeviceIndex>;

    /// Bind the calling thread to `device`.
    fn set_device(&self, device: DeviceIndex) -> DriverResult<()>;

    /// Free/total physical memory of the current device.
    fn memory_info(&self) -> DriverResult<DeviceMemoryInfo>;

    /// The stream new work on `device` is submitted to.
    fn current_stream(&self, device: DeviceIndex) -> DriverResult<NpuStream>;

    /// Allocate `size` bytes of device memory on the current device.
    fn alloc(&self, size: usize) -> DriverResult<DevicePtr>;

    /// Return `ptr` to the device allocator.
    fn free(&self, ptr: DevicePtr) -> DriverResult<()>;

    /// Block until all submitted work on the current device has completed.
    fn synchronize_device(&self) -> DriverResult<()>;

    /// Create a reusable completion event on `device`.
    fn create_event(&self, device: DeviceIndex) -> DriverResult<EventHandle>;

    /// Destroy an event previously created with [`NpuDriver::create_event`].
    fn destroy_event(&self, event: EventHandle) -> DriverResult<()>;

    /// Record `event` on `stream`; the event completes once all work
    /// submitted to the stream before this call has finished.
    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> DriverResult<()>;

    /// Non-blocking completion query.
    fn query_event(&self, event: EventHandle) -> DriverResult<bool>;

    /// Block until `event` has completed.
    fn synchronize_event(&self, event: EventHandle) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_ordering_is_device_then_handle() {
        let a = NpuStream::new(0, StreamHandle(9));
        let b = NpuStream::new(1, StreamHandle(1));
        let c = NpuStream::new(1, StreamHandle(2));

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::OutOfMemory { requested: 1024 };
        assert_eq!(err.to_string(), "device out of memory allocating 1024 bytes");
    }
}
