//! Completion-event cache
//!
//! Creating and destroying runtime events is not free, and the allocator
//! records one event per used stream on every deferred free. [`EventPool`]
//! keeps finished events around per device for reuse; [`PooledEvent`] is an
//! RAII guard that puts its event back on drop, so events return to the
//! pool on every exit path, including unwinding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::driver::{DeviceIndex, DriverResult, EventHandle, NpuDriver};

/// Per-device cache of reusable completion events.
pub struct EventPool {
    driver: Arc<dyn NpuDriver>,
    pools: Mutex<HashMap<DeviceIndex, Vec<EventHandle>>>,
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pools = self.pools.lock().unwrap();
        f.debug_struct("EventPool")
            .field("devices", &pools.len())
            .field("cached", &pools.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl EventPool {
    pub fn new(driver: Arc<dyn NpuDriver>) -> Self {
        EventPool {
            driver,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Take a cached event for `device`, creating one lazily when the cache
    /// is empty.
    pub fn acquire(self: &Arc<Self>, device: DeviceIndex) -> DriverResult<PooledEvent> {
        let cached = {
            let mut pools = self.pools.lock().unwrap();
            pools.entry(device).or_default().pop()
        };
        let handle = match cached {
            Some(handle) => handle,
            None => self.driver.create_event(device)?,
        };
        Ok(PooledEvent {
            handle,
            device,
            pool: Arc::clone(self),
        })
    }

    /// Destroy every cached event. Events currently checked out return to
    /// the cache (not the driver) when their guards drop.
    pub fn empty_cache(&self) {
        let drained: Vec<EventHandle> = {
            let mut pools = self.pools.lock().unwrap();
            pools.drain().flat_map(|(_, events)| events).collect()
        };
        for handle in drained {
            if let Err(err) = self.driver.destroy_event(handle) {
                tracing::warn!(event = handle.0, %err, "failed to destroy cached event");
            }
        }
    }

    /// Number of events parked in the cache.
    pub fn cached_count(&self) -> usize {
        self.pools.lock().unwrap().values().map(Vec::len).sum()
    }

    fn release(&self, device: DeviceIndex, handle: EventHandle) {
        let mut pools = self.pools.lock().unwrap();
        pools.entry(device).or_default().push(handle);
    }
}

/// A checked-out completion event; returns to its pool on drop.
#[derive(Debug)]
pub struct PooledEvent {
    handle: EventHandle,
    device: DeviceIndex,
    pool: Arc<EventPool>,
}

impl PooledEvent {
    pub fn handle(&self) -> EventHandle {
        self.handle
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }
}

impl Drop for PooledEvent {
    fn drop(&mut self) {
        self.pool.release(self.device, self.handle);
    }
}
