//! Host-side driver simulation
//!
//! [`MockDriver`] implements the full [`NpuDriver`] contract in host memory:
//! allocations draw on a per-device byte budget (exhaustion surfaces the
//! same out-of-memory error the real runtime produces), device pointers are
//! monotonically increasing fake addresses, and recorded events stay pending
//! until a test completes them.
//!
//! It is exported unconditionally so integration tests and embedders can
//! exercise the caching allocator without accelerator hardware.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    DeviceIndex, DeviceMemoryInfo, DevicePtr, DriverError, DriverResult, EventHandle, NpuDriver,
    NpuStream, StreamHandle,
};

#[derive(Debug)]
struct MockAllocation {
    device: DeviceIndex,
    size: usize,
}

#[derive(Debug)]
struct MockEvent {
    recorded_on: Option<StreamHandle>,
    completed: bool,
}

#[derive(Debug, Default)]
struct MockState {
    current_device: DeviceIndex,
    next_addr: usize,
    allocations: HashMap<usize, MockAllocation>,
    used: HashMap<DeviceIndex, usize>,
    events: HashMap<u64, MockEvent>,
    next_event: u64,
    alloc_calls: u64,
    free_calls: u64,
    fail_next_alloc: Option<String>,
}

/// In-memory driver double with controllable event completion.
#[derive(Debug)]
pub struct MockDriver {
    device_count: u32,
    total_memory: usize,
    state: Mutex<MockState>,
}

impl MockDriver {
    /// `total_memory` is the per-device byte budget; allocations past it
    /// fail with [`DriverError::OutOfMemory`].
    pub fn new(device_count: u32, total_memory: usize) -> Self {
        MockDriver {
            device_count,
            total_memory,
            state: Mutex::new(MockState {
                // Fake device addresses start away from zero so a null
                // pointer never collides with a real allocation.
                next_addr: 0x1000,
                ..MockState::default()
            }),
        }
    }

    /// Mark every event recorded on `stream` as completed, as if the stream
    /// had drained.
    pub fn complete_stream(&self, stream: StreamHandle) {
        let mut state = self.state.lock().unwrap();
        for event in state.events.values_mut() {
            if event.recorded_on == Some(stream) {
                event.completed = true;
            }
        }
    }

    /// Mark every recorded event as completed.
    pub fn complete_all_events(&self) {
        let mut state = self.state.lock().unwrap();
        for event in state.events.values_mut() {
            if event.recorded_on.is_some() {
                event.completed = true;
            }
        }
    }

    /// Number of successful `alloc` calls so far.
    pub fn alloc_calls(&self) -> u64 {
        self.state.lock().unwrap().alloc_calls
    }

    /// Number of `free` calls so far.
    pub fn free_calls(&self) -> u64 {
        self.state.lock().unwrap().free_calls
    }

    /// Bytes currently held by live allocations on `device`.
    pub fn live_bytes(&self, device: DeviceIndex) -> usize {
        self.state
            .lock()
            .unwrap()
            .used
            .get(&device)
            .copied()
            .unwrap_or(0)
    }

    /// Whether `ptr` is a live allocation.
    pub fn is_live(&self, ptr: DevicePtr) -> bool {
        self.state.lock().unwrap().allocations.contains_key(&ptr)
    }

    /// Make the next `alloc` call fail with a non-OOM runtime error, as a
    /// transient driver fault would.
    pub fn fail_next_alloc(&self, reason: impl Into<String>) {
        self.state.lock().unwrap().fail_next_alloc = Some(reason.into());
    }
}

impl NpuDriver for MockDriver {
    fn device_count(&self) -> DriverResult<u32> {
        Ok(self.device_count)
    }

    fn current_device(&self) -> DriverResult<DeviceIndex> {
        Ok(self.state.lock().unwrap().current_device)
    }

    fn set_device(&self, device: DeviceIndex) -> DriverResult<()> {
        if device < 0 || device as u32 >= self.device_count {
            return Err(DriverError::InvalidDevice(device));
        }
        self.state.lock().unwrap().current_device = device;
        Ok(())
    }

    fn memory_info(&self) -> DriverResult<DeviceMemoryInfo> {
        let state = self.state.lock().unwrap();
        let used = state.used.get(&state.current_device).copied().unwrap_or(0);
        Ok(DeviceMemoryInfo {
            free: self.total_memory - used,
            total: self.total_memory,
        })
    }

    fn current_stream(&self, device: DeviceIndex) -> DriverResult<NpuStream> {
        if device < 0 || device as u32 >= self.device_count {
            return Err(DriverError::InvalidDevice(device));
        }
        // One default stream per device, with a stable fake handle.
        Ok(NpuStream::new(device, StreamHandle(0x100 + device as usize)))
    }

    fn alloc(&self, size: usize) -> DriverResult<DevicePtr> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.fail_next_alloc.take() {
            return Err(DriverError::Failure(reason));
        }
        let device = state.current_device;
        let used = state.used.get(&device).copied().unwrap_or(0);
        if used + size > self.total_memory {
            return Err(DriverError::OutOfMemory { requested: size });
        }

        let addr = state.next_addr;
        state.next_addr += size;
        state.allocations.insert(addr, MockAllocation { device, size });
        *state.used.entry(device).or_insert(0) += size;
        state.alloc_calls += 1;
        Ok(addr)
    }

    fn free(&self, ptr: DevicePtr) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.free_calls += 1;
        let alloc = state
            .allocations
            .remove(&ptr)
            .ok_or_else(|| DriverError::Failure(format!("free of unknown pointer {:#x}", ptr)))?;
        *state.used.entry(alloc.device).or_insert(0) -= alloc.size;
        Ok(())
    }

    fn synchronize_device(&self) -> DriverResult<()> {
        // Device-wide sync drains every stream, so every recorded event is
        // complete afterwards.
        self.complete_all_events();
        Ok(())
    }

    fn create_event(&self, _device: DeviceIndex) -> DriverResult<EventHandle> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_event;
        state.next_event += 1;
        state.events.insert(
            id,
            MockEvent {
                recorded_on: None,
                completed: false,
            },
        );
        Ok(EventHandle(id))
    }

    fn destroy_event(&self, event: EventHandle) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .events
            .remove(&event.0)
            .map(|_| ())
            .ok_or_else(|| DriverError::Failure(format!("destroy of unknown event {}", event.0)))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .events
            .get_mut(&event.0)
            .ok_or_else(|| DriverError::Failure(format!("record on unknown event {}", event.0)))?;
        entry.recorded_on = Some(stream);
        entry.completed = false;
        Ok(())
    }

    fn query_event(&self, event: EventHandle) -> DriverResult<bool> {
        let state = self.state.lock().unwrap();
        let entry = state
            .events
            .get(&event.0)
            .ok_or_else(|| DriverError::Failure(format!("query of unknown event {}", event.0)))?;
        // An event that was never recorded reports complete, matching the
        // runtime contract.
        Ok(entry.recorded_on.is_none() || entry.completed)
    }

    fn synchronize_event(&self, event: EventHandle) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .events
            .get_mut(&event.0)
            .ok_or_else(|| DriverError::Failure(format!("sync of unknown event {}", event.0)))?;
        entry.completed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free_tracks_budget() {
        let driver = MockDriver::new(1, 4096);

        let a = driver.alloc(1024).unwrap();
        let b = driver.alloc(2048).unwrap();
        assert_ne!(a, b);
        assert_eq!(driver.live_bytes(0), 3072);

        driver.free(a).unwrap();
        assert_eq!(driver.live_bytes(0), 1024);
        assert!(!driver.is_live(a));
        assert!(driver.is_live(b));
    }

    #[test]
    fn test_alloc_past_budget_is_oom() {
        let driver = MockDriver::new(1, 1024);
        driver.alloc(1024).unwrap();
        let err = driver.alloc(1).unwrap_err();
        assert!(matches!(err, DriverError::OutOfMemory { requested: 1 }));
    }

    #[test]
    fn test_fail_next_alloc_injects_one_failure() {
        let driver = MockDriver::new(1, 4096);
        driver.fail_next_alloc("transient fault");
        assert!(matches!(driver.alloc(64), Err(DriverError::Failure(_))));
        // only the next call fails
        assert!(driver.alloc(64).is_ok());
    }

    #[test]
    fn test_event_lifecycle() {
        let driver = MockDriver::new(1, 1024);
        let stream = driver.current_stream(0).unwrap();

        let event = driver.create_event(0).unwrap();
        // Unrecorded events report complete.
        assert!(driver.query_event(event).unwrap());

        driver.record_event(event, stream.handle()).unwrap();
        assert!(!driver.query_event(event).unwrap());

        driver.complete_stream(stream.handle());
        assert!(driver.query_event(event).unwrap());

        driver.destroy_event(event).unwrap();
        assert!(driver.query_event(event).is_err());
    }

    #[test]
    fn test_synchronize_device_completes_events() {
        let driver = MockDriver::new(2, 1024);
        let s0 = driver.current_stream(0).unwrap();
        let s1 = driver.current_stream(1).unwrap();

        let e0 = driver.create_event(0).unwrap();
        let e1 = driver.create_event(1).unwrap();
        driver.record_event(e0, s0.handle()).unwrap();
        driver.record_event(e1, s1.handle()).unwrap();

        driver.synchronize_device().unwrap();
        assert!(driver.query_event(e0).unwrap());
        assert!(driver.query_event(e1).unwrap());
    }

    #[test]
    fn test_set_device_validates_index() {
        let driver = MockDriver::new(2, 1024);
        driver.set_device(1).unwrap();
        assert_eq!(driver.current_device().unwrap(), 1);
        assert!(driver.set_device(2).is_err());
        assert!(driver.set_device(-1).is_err());
    }

    #[test]
    fn test_memory_info_reflects_current_device() {
        let driver = MockDriver::new(2, 4096);
        driver.alloc(1000).unwrap();

        let info = driver.memory_info().unwrap();
        assert_eq!(info.total, 4096);
        assert_eq!(info.free, 3096);

        driver.set_device(1).unwrap();
        let info = driver.memory_info().unwrap();
        assert_eq!(info.free, 4096);
    }
}
