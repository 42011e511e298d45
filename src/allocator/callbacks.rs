//! Memory-pressure callback registry
//!
//! Other subsystems (graph caches, staging buffers, interop layers) can
//! register a callback that releases device memory they hold. When an
//! allocation misses every cached block, the allocator runs the registered
//! callbacks before touching the driver; if any reports that it freed
//! memory, the pool search is retried first.
//!
//! Callbacks execute while the per-device allocator lock is held and must
//! not call back into the allocator for the same device.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::AllocResult;

/// A hook that tries to release device memory under allocation pressure.
pub trait FreeMemoryCallback: Send + Sync {
    /// Attempt to free memory. Returns `true` if any device memory was
    /// released back to the driver.
    fn execute(&self) -> AllocResult<bool>;
}

impl<F> FreeMemoryCallback for F
where
    F: Fn() -> AllocResult<bool> + Send + Sync,
{
    fn execute(&self) -> AllocResult<bool> {
        self()
    }
}

/// Keyed registry of memory-pressure callbacks.
///
/// A `BTreeMap` keeps invocation order lexicographic by name, so failure
/// diagnostics reproduce across runs.
#[derive(Default)]
pub struct FreeMemoryCallbackRegistry {
    callbacks: RwLock<BTreeMap<String, Arc<dyn FreeMemoryCallback>>>,
}

impl std::fmt::Debug for FreeMemoryCallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.callbacks.read().unwrap().keys().cloned().collect();
        f.debug_struct("FreeMemoryCallbackRegistry")
            .field("callbacks", &names)
            .finish()
    }
}

impl FreeMemoryCallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `name`, replacing any previous registration
    /// with the same name.
    pub fn register(&self, name: impl Into<String>, callback: Arc<dyn FreeMemoryCallback>) {
        self.callbacks.write().unwrap().insert(name.into(), callback);
    }

    /// Remove the callback registered under `name`.
    pub fn unregister(&self, name: &str) -> bool {
        self.callbacks.write().unwrap().remove(name).is_some()
    }

    /// Run every callback in name order. Returns `true` if any reported
    /// freed memory; a callback error propagates immediately.
    pub fn run_all(&self) -> AllocResult<bool> {
        let callbacks: Vec<(String, Arc<dyn FreeMemoryCallback>)> = self
            .callbacks
            .read()
            .unwrap()
            .iter()
            .map(|(name, cb)| (name.clone(), Arc::clone(cb)))
            .collect();

        let mut freed = false;
        for (name, callback) in callbacks {
            tracing::debug!(callback = %name, "running free-memory callback");
            freed |= callback.execute()?;
        }
        Ok(freed)
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().unwrap().is_empty()
    }
}
