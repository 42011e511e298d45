//! Multi-device dispatcher
//!
//! [`NpuCachingAllocator`] is the face the rest of a runtime talks to. It
//! owns one [`DeviceCachingAllocator`] per device, routes frees back to the
//! right device through a process-wide pointer map, and hands out
//! [`DeviceAllocation`] guards whose drop returns the memory.
//!
//! The pointer-map mutex is always released before a per-device lock is
//! taken, so the two never nest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use super::block::BlockId;
use super::callbacks::{FreeMemoryCallback, FreeMemoryCallbackRegistry};
use super::config::AllocatorConfig;
use super::device::DeviceCachingAllocator;
use super::events::EventPool;
use super::stats::{DeviceStats, SegmentInfo};
use crate::driver::{DeviceIndex, DevicePtr, NpuDriver, NpuStream};
use crate::error::{AllocResult, NpuAllocError};

#[derive(Debug, Clone, Copy)]
struct BlockRef {
    device: DeviceIndex,
    id: BlockId,
}

struct AllocatorShared {
    driver: Arc<dyn NpuDriver>,
    config: AllocatorConfig,
    events: Arc<EventPool>,
    callbacks: Arc<FreeMemoryCallbackRegistry>,
    devices: RwLock<Vec<Arc<DeviceCachingAllocator>>>,
    blocks_by_ptr: Mutex<HashMap<DevicePtr, BlockRef>>,
}

impl std::fmt::Debug for AllocatorShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorShared")
            .field("devices", &self.devices.read().unwrap().len())
            .finish()
    }
}

/// Caching allocator spanning every visible device.
#[derive(Debug, Clone)]
pub struct NpuCachingAllocator {
    shared: Arc<AllocatorShared>,
}

impl NpuCachingAllocator {
    /// Build an allocator over `driver` configured from the
    /// `PYTORCH_NPU_ALLOC_CONF` environment string.
    pub fn new(driver: Arc<dyn NpuDriver>) -> AllocResult<Self> {
        let config = super::config::process_config()?;
        Ok(Self::with_config(driver, config))
    }

    /// Build an allocator with an explicit configuration.
    pub fn with_config(driver: Arc<dyn NpuDriver>, config: AllocatorConfig) -> Self {
        let events = Arc::new(EventPool::new(Arc::clone(&driver)));
        NpuCachingAllocator {
            shared: Arc::new(AllocatorShared {
                driver,
                config,
                events,
                callbacks: Arc::new(FreeMemoryCallbackRegistry::new()),
                devices: RwLock::new(Vec::new()),
                blocks_by_ptr: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create the per-device allocators. Idempotent; grows the set if the
    /// driver reports more devices than before.
    pub fn init(&self) -> AllocResult<()> {
        let count = self.shared.driver.device_count()? as usize;
        let mut devices = self.shared.devices.write()?;
        if devices.len() >= count {
            return Ok(());
        }
        info!(device_count = count, "initializing caching allocator");
        for device in devices.len()..count {
            devices.push(Arc::new(DeviceCachingAllocator::new(
                device as DeviceIndex,
                Arc::clone(&self.shared.driver),
                self.shared.config.clone(),
                Arc::clone(&self.shared.events),
                Arc::clone(&self.shared.callbacks),
            )));
        }
        Ok(())
    }

    /// Number of initialized per-device allocators.
    pub fn device_count(&self) -> usize {
        self.shared
            .devices
            .read()
            .map(|devices| devices.len())
            .unwrap_or(0)
    }

    fn allocator_for(&self, device: DeviceIndex) -> AllocResult<Arc<DeviceCachingAllocator>> {
        if device < 0 {
            return Err(NpuAllocError::InvalidDevice(device));
        }
        {
            let devices = self.shared.devices.read()?;
            if let Some(allocator) = devices.get(device as usize) {
                return Ok(Arc::clone(allocator));
            }
        }
        // The device set may have grown since the last init.
        self.init()?;
        let devices = self.shared.devices.read()?;
        devices
            .get(device as usize)
            .map(Arc::clone)
            .ok_or(NpuAllocError::InvalidDevice(device))
    }

    fn resolve_device(&self, device: DeviceIndex) -> AllocResult<DeviceIndex> {
        if device == -1 {
            Ok(self.shared.driver.current_device()?)
        } else {
            Ok(device)
        }
    }

    /// Allocate `size` bytes on the current device and stream. A zero-size
    /// request yields a null handle and never reaches the driver.
    pub fn allocate(&self, size: usize) -> AllocResult<DeviceAllocation> {
        let device = self.shared.driver.current_device()?;
        if size == 0 {
            return Ok(DeviceAllocation::null(device));
        }
        let stream = self.shared.driver.current_stream(device)?;
        let ptr = self.malloc_on(device, size, stream)?;
        Ok(DeviceAllocation {
            ptr,
            device,
            shared: Some(Arc::clone(&self.shared)),
        })
    }

    /// Allocate raw memory on the current device and stream. Zero-size
    /// requests return `None`.
    pub fn raw_alloc(&self, size: usize) -> AllocResult<Option<DevicePtr>> {
        if size == 0 {
            return Ok(None);
        }
        let device = self.shared.driver.current_device()?;
        let stream = self.shared.driver.current_stream(device)?;
        Ok(Some(self.malloc_on(device, size, stream)?))
    }

    /// Allocate raw memory usable on `stream`. Zero-size requests return
    /// `None`.
    pub fn raw_alloc_with_stream(
        &self,
        size: usize,
        stream: NpuStream,
    ) -> AllocResult<Option<DevicePtr>> {
        if size == 0 {
            return Ok(None);
        }
        let device = self.resolve_device(stream.device())?;
        Ok(Some(self.malloc_on(device, size, stream)?))
    }

    fn malloc_on(
        &self,
        device: DeviceIndex,
        size: usize,
        stream: NpuStream,
    ) -> AllocResult<DevicePtr> {
        let allocator = self.allocator_for(device)?;
        let block = allocator.malloc(size, stream)?;
        self.shared
            .blocks_by_ptr
            .lock()?
            .insert(block.ptr, BlockRef { device, id: block.id });
        Ok(block.ptr)
    }

    /// Free a pointer previously returned by an allocation call.
    pub fn raw_delete(&self, ptr: DevicePtr) -> AllocResult<()> {
        self.shared.free_ptr(ptr)
    }

    fn lookup(&self, ptr: DevicePtr) -> AllocResult<BlockRef> {
        self.shared
            .blocks_by_ptr
            .lock()?
            .get(&ptr)
            .copied()
            .ok_or(NpuAllocError::InvalidPointer(ptr))
    }

    /// Declare that `stream` consumes the allocation behind `handle`. Null
    /// or externally-owned handles are skipped silently.
    pub fn record_stream(
        &self,
        handle: &DeviceAllocation,
        stream: NpuStream,
    ) -> AllocResult<()> {
        if !self.owns(handle) {
            return Ok(());
        }
        let block = self.lookup(handle.ptr)?;
        self.allocator_for(block.device)?.record_stream(block.id, stream)
    }

    /// Undo a previous [`Self::record_stream`]. Null or externally-owned
    /// handles are skipped silently.
    pub fn erase_stream(&self, handle: &DeviceAllocation, stream: NpuStream) -> AllocResult<()> {
        if !self.owns(handle) {
            return Ok(());
        }
        let block = self.lookup(handle.ptr)?;
        self.allocator_for(block.device)?.erase_stream(block.id, stream)
    }

    fn owns(&self, handle: &DeviceAllocation) -> bool {
        if handle.ptr == 0 {
            return false;
        }
        match &handle.shared {
            Some(shared) => Arc::ptr_eq(shared, &self.shared),
            None => false,
        }
    }

    /// Base address and size of the driver segment backing `ptr`.
    pub fn get_base_allocation(&self, ptr: DevicePtr) -> AllocResult<(DevicePtr, usize)> {
        let block = self.lookup(ptr)?;
        self.allocator_for(block.device)?.base_allocation(block.id)
    }

    /// Cap `device`'s memory footprint at `fraction` of its total physical
    /// memory.
    pub fn set_memory_fraction(&self, fraction: f64, device: DeviceIndex) -> AllocResult<()> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(NpuAllocError::InvalidMemoryFraction(fraction));
        }
        let allocator = self.allocator_for(device)?;
        // The fraction is computed against the target device's memory, so
        // bind to it first.
        let current = self.shared.driver.current_device()?;
        if current != device {
            self.shared.driver.set_device(device)?;
        }
        allocator.set_memory_fraction(fraction)
    }

    /// Return every reusable cached block on every device to the driver.
    pub fn empty_cache(&self, check_error: bool) -> AllocResult<()> {
        for allocator in self.all_devices()? {
            allocator.empty_cache(check_error)?;
        }
        self.shared.events.empty_cache();
        Ok(())
    }

    /// Switch every device allocator into shutdown mode; frees stop
    /// recording events because streams may already be torn down.
    pub fn set_shutdown_stats(&self) -> AllocResult<()> {
        for allocator in self.all_devices()? {
            allocator.set_shutdown()?;
        }
        Ok(())
    }

    pub fn get_device_stats(&self, device: DeviceIndex) -> AllocResult<DeviceStats> {
        self.allocator_for(device)?.stats()
    }

    pub fn reset_accumulated_stats(&self, device: DeviceIndex) -> AllocResult<()> {
        self.allocator_for(device)?.reset_accumulated_stats()
    }

    pub fn reset_peak_stats(&self, device: DeviceIndex) -> AllocResult<()> {
        self.allocator_for(device)?.reset_peak_stats()
    }

    /// Address-sorted descriptors of every segment held across all devices.
    pub fn snapshot(&self) -> AllocResult<Vec<SegmentInfo>> {
        let mut segments = Vec::new();
        for allocator in self.all_devices()? {
            segments.extend(allocator.snapshot()?);
        }
        segments.sort_by_key(|segment| segment.address);
        Ok(segments)
    }

    /// Total cached-free bytes and largest cached block on `device`.
    pub fn cache_info(&self, device: DeviceIndex) -> AllocResult<(usize, usize)> {
        self.allocator_for(device)?.cache_info()
    }

    /// Register a memory-pressure callback under `name`; callbacks run in
    /// name order when an allocation misses every cached block.
    pub fn register_free_memory_callback(
        &self,
        name: impl Into<String>,
        callback: Arc<dyn FreeMemoryCallback>,
    ) {
        self.shared.callbacks.register(name, callback);
    }

    pub fn unregister_free_memory_callback(&self, name: &str) -> bool {
        self.shared.callbacks.unregister(name)
    }

    fn all_devices(&self) -> AllocResult<Vec<Arc<DeviceCachingAllocator>>> {
        Ok(self.shared.devices.read()?.iter().map(Arc::clone).collect())
    }
}

impl AllocatorShared {
    fn free_ptr(&self, ptr: DevicePtr) -> AllocResult<()> {
        if ptr == 0 {
            return Ok(());
        }
        let block = self
            .blocks_by_ptr
            .lock()?
            .remove(&ptr)
            .ok_or(NpuAllocError::InvalidPointer(ptr))?;
        let allocator = {
            let devices = self.devices.read()?;
            devices
                .get(block.device as usize)
                .map(Arc::clone)
                .ok_or(NpuAllocError::InvalidDevice(block.device))?
        };
        allocator.free(block.id)
    }
}

/// Owning handle to one allocation; dropping it frees the memory.
///
/// Handles constructed with [`DeviceAllocation::external`] wrap memory the
/// allocator does not own; stream recording skips them and drop is a no-op.
#[derive(Debug)]
pub struct DeviceAllocation {
    ptr: DevicePtr,
    device: DeviceIndex,
    shared: Option<Arc<AllocatorShared>>,
}

impl DeviceAllocation {
    fn null(device: DeviceIndex) -> Self {
        DeviceAllocation {
            ptr: 0,
            device,
            shared: None,
        }
    }

    /// Wrap a pointer owned by someone else (another process or a foreign
    /// allocator). The handle never frees it.
    pub fn external(ptr: DevicePtr, device: DeviceIndex) -> Self {
        DeviceAllocation {
            ptr,
            device,
            shared: None,
        }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if self.ptr == 0 {
            return;
        }
        if let Some(shared) = self.shared.take() {
            if let Err(err) = shared.free_ptr(self.ptr) {
                warn!(ptr = self.ptr, %err, "failed to free device allocation");
            }
        }
    }
}

/// Process-wide allocator instance.
static PROCESS_ALLOCATOR: OnceCell<NpuCachingAllocator> = OnceCell::new();

/// Install `allocator` as the process-wide instance. Idempotent: the first
/// installation wins and is returned thereafter.
pub fn install_process_allocator(
    allocator: NpuCachingAllocator,
) -> &'static NpuCachingAllocator {
    PROCESS_ALLOCATOR.get_or_init(|| allocator)
}

/// The installed process-wide allocator, if any.
pub fn process_allocator() -> Option<&'static NpuCachingAllocator> {
    PROCESS_ALLOCATOR.get()
}

/// Install a process-wide allocator over the Ascend CL runtime and create
/// its per-device allocators.
#[cfg(feature = "acl")]
pub fn init() -> AllocResult<&'static NpuCachingAllocator> {
    let allocator = match PROCESS_ALLOCATOR.get() {
        Some(existing) => existing,
        None => {
            let driver: Arc<dyn NpuDriver> = Arc::new(crate::driver::acl::AclDriver::new());
            install_process_allocator(NpuCachingAllocator::new(driver)?)
        }
    };
    allocator.init()?;
    Ok(allocator)
}
