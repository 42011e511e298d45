//! Ascend CL runtime driver
//!
//! Raw FFI binding to `libascendcl` implementing [`NpuDriver`]. Compiled
//! only with the `acl` cargo feature so the rest of the crate (and its
//! tests) build on machines without the runtime installed.

use std::ffi::c_void;
use std::ptr;

use super::{
    DeviceIndex, DeviceMemoryInfo, DevicePtr, DriverError, DriverResult, EventHandle, NpuDriver,
    NpuStream, StreamHandle,
};

// ACL FFI bindings
#[link(name = "ascendcl")]
extern "C" {
    fn aclrtGetDeviceCount(count: *mut u32) -> i32;
    fn aclrtGetDevice(device: *mut i32) -> i32;
    fn aclrtSetDevice(device: i32) -> i32;
    fn aclrtMalloc(ptr: *mut *mut c_void, size: usize, policy: i32) -> i32;
    fn aclrtFree(ptr: *mut c_void) -> i32;
    fn aclrtGetMemInfo(attr: i32, free: *mut usize, total: *mut usize) -> i32;
    fn aclrtSynchronizeDevice() -> i32;
    fn aclrtCreateEvent(event: *mut *mut c_void) -> i32;
    fn aclrtDestroyEvent(event: *mut c_void) -> i32;
    fn aclrtRecordEvent(event: *mut c_void, stream: *mut c_void) -> i32;
    fn aclrtQueryEvent(event: *mut c_void, status: *mut i32) -> i32;
    fn aclrtSynchronizeEvent(event: *mut c_void) -> i32;
}

// ACL constants
const ACL_SUCCESS: i32 = 0;
const ACL_ERROR_RT_MEMORY_ALLOCATION: i32 = 207001;
const ACL_MEM_MALLOC_HUGE_FIRST: i32 = 0;
const ACL_HBM_MEM: i32 = 1;
const ACL_EVENT_STATUS_COMPLETE: i32 = 0;

fn check(ret: i32, what: &str) -> DriverResult<()> {
    if ret == ACL_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::Failure(format!("{} failed with code {}", what, ret)))
    }
}

/// Driver backed by the Ascend CL runtime.
///
/// Stateless: every handle it returns is owned by the runtime. Safe to share
/// across threads; the runtime's per-thread device binding is what
/// `set_device`/`current_device` manipulate.
#[derive(Debug, Default)]
pub struct AclDriver;

impl AclDriver {
    pub fn new() -> Self {
        AclDriver
    }
}

impl NpuDriver for AclDriver {
    fn device_count(&self) -> DriverResult<u32> {
        let mut count: u32 = 0;
        check(unsafe { aclrtGetDeviceCount(&mut count) }, "aclrtGetDeviceCount")?;
        Ok(count)
    }

    fn current_device(&self) -> DriverResult<DeviceIndex> {
        let mut device: i32 = 0;
        check(unsafe { aclrtGetDevice(&mut device) }, "aclrtGetDevice")?;
        Ok(device)
    }

    fn set_device(&self, device: DeviceIndex) -> DriverResult<()> {
        let ret = unsafe { aclrtSetDevice(device) };
        if ret != ACL_SUCCESS {
            return Err(DriverError::InvalidDevice(device));
        }
        Ok(())
    }

    fn memory_info(&self) -> DriverResult<DeviceMemoryInfo> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        check(
            unsafe { aclrtGetMemInfo(ACL_HBM_MEM, &mut free, &mut total) },
            "aclrtGetMemInfo",
        )?;
        Ok(DeviceMemoryInfo { free, total })
    }

    fn current_stream(&self, device: DeviceIndex) -> DriverResult<NpuStream> {
        // ACL has no notion of a thread-current stream; the null handle is
        // the device's default stream. Runtimes with their own stream pools
        // should call the *_with_stream entry points instead.
        Ok(NpuStream::new(device, StreamHandle(0)))
    }

    fn alloc(&self, size: usize) -> DriverResult<DevicePtr> {
        let mut raw: *mut c_void = ptr::null_mut();
        let ret = unsafe { aclrtMalloc(&mut raw, size, ACL_MEM_MALLOC_HUGE_FIRST) };
        if ret == ACL_ERROR_RT_MEMORY_ALLOCATION {
            return Err(DriverError::OutOfMemory { requested: size });
        }
        check(ret, "aclrtMalloc")?;
        if raw.is_null() {
            return Err(DriverError::Failure(format!(
                "aclrtMalloc returned null pointer for {} bytes",
                size
            )));
        }
        Ok(raw as DevicePtr)
    }

    fn free(&self, ptr: DevicePtr) -> DriverResult<()> {
        check(unsafe { aclrtFree(ptr as *mut c_void) }, "aclrtFree")
    }

    fn synchronize_device(&self) -> DriverResult<()> {
        check(unsafe { aclrtSynchronizeDevice() }, "aclrtSynchronizeDevice")
    }

    fn create_event(&self, _device: DeviceIndex) -> DriverResult<EventHandle> {
        let mut event: *mut c_void = ptr::null_mut();
        check(unsafe { aclrtCreateEvent(&mut event) }, "aclrtCreateEvent")?;
        Ok(EventHandle(event as u64))
    }

    fn destroy_event(&self, event: EventHandle) -> DriverResult<()> {
        check(
            unsafe { aclrtDestroyEvent(event.0 as *mut c_void) },
            "aclrtDestroyEvent",
        )
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> DriverResult<()> {
        check(
            unsafe { aclrtRecordEvent(event.0 as *mut c_void, stream.0 as *mut c_void) },
            "aclrtRecordEvent",
        )
    }

    fn query_event(&self, event: EventHandle) -> DriverResult<bool> {
        let mut status: i32 = -1;
        check(
            unsafe { aclrtQueryEvent(event.0 as *mut c_void, &mut status) },
            "aclrtQueryEvent",
        )?;
        Ok(status == ACL_EVENT_STATUS_COMPLETE)
    }

    fn synchronize_event(&self, event: EventHandle) -> DriverResult<()> {
        check(
            unsafe { aclrtSynchronizeEvent(event.0 as *mut c_void) },
            "aclrtSynchronizeEvent",
        )
    }
}
