//! Per-device caching allocator
//!
//! One [`DeviceCachingAllocator`] owns all cached memory of a single device.
//! Freed blocks are kept in per-size-class pools and handed back to later
//! requests on the same stream instead of round-tripping through the
//! driver. Blocks used by additional streams are recycled only after a
//! completion event recorded on each such stream has fired.
//!
//! Allocation ladder on a pool miss: run the registered memory-pressure
//! callbacks and retry, garbage-collect aged blocks when a memory cap with a
//! GC threshold is set, ask the driver, release cached oversize blocks and
//! ask again, purge the whole cache and ask one last time. Only then is an
//! out-of-memory error surfaced.
//!
//! All state lives behind a single mutex; public methods lock it for their
//! whole duration and never call each other.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::block::{
    alloc_size, round_size, Block, BlockArena, BlockId, BlockPool, PoolKey, PoolKind, LARGE_BUFFER,
    MIN_BLOCK_SIZE, SMALL_SIZE,
};
use super::callbacks::FreeMemoryCallbackRegistry;
use super::config::AllocatorConfig;
use super::events::{EventPool, PooledEvent};
use super::stats::{format_size, update_stat_array, BlockInfo, DeviceStats, SegmentInfo, StatType};
use crate::driver::{DeviceIndex, DevicePtr, DriverError, NpuDriver, NpuStream};
use crate::error::{AllocResult, NpuAllocError};

/// A block handed out by [`DeviceCachingAllocator::malloc`].
#[derive(Debug, Clone, Copy)]
pub struct AllocatedBlock {
    pub id: BlockId,
    pub ptr: DevicePtr,
    pub size: usize,
}

#[derive(Debug)]
struct DeviceState {
    arena: BlockArena,
    small: BlockPool,
    large: BlockPool,
    /// Blocks currently handed out; membership is exactly `allocated`.
    active: HashSet<BlockId>,
    /// Blocks whose free is deferred behind completion events, keyed by the
    /// stream each event was recorded on, in record order.
    pending: HashMap<NpuStream, VecDeque<(PooledEvent, BlockId)>>,
    /// Bytes currently held from the driver.
    total_allocated: usize,
    /// Byte cap derived from a user-set memory fraction.
    memory_cap: Option<usize>,
    /// When set, frees release synchronously; streams may be torn down.
    shutdown: bool,
    stats: DeviceStats,
}

/// Caching allocator for one device.
pub struct DeviceCachingAllocator {
    device: DeviceIndex,
    driver: Arc<dyn NpuDriver>,
    config: AllocatorConfig,
    events: Arc<EventPool>,
    callbacks: Arc<FreeMemoryCallbackRegistry>,
    state: Mutex<DeviceState>,
}

impl std::fmt::Debug for DeviceCachingAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCachingAllocator")
            .field("device", &self.device)
            .finish()
    }
}

fn stat_types_for(kind: PoolKind) -> [StatType; 2] {
    let pool_type = match kind {
        PoolKind::Small => StatType::SmallPool,
        PoolKind::Large => StatType::LargePool,
    };
    [StatType::Aggregate, pool_type]
}

impl DeviceCachingAllocator {
    pub fn new(
        device: DeviceIndex,
        driver: Arc<dyn NpuDriver>,
        config: AllocatorConfig,
        events: Arc<EventPool>,
        callbacks: Arc<FreeMemoryCallbackRegistry>,
    ) -> Self {
        let mut stats = DeviceStats::default();
        stats.max_split_size = config.max_split_size() as u64;
        DeviceCachingAllocator {
            device,
            driver,
            config,
            events,
            callbacks,
            state: Mutex::new(DeviceState {
                arena: BlockArena::new(),
                small: BlockPool::new(PoolKind::Small),
                large: BlockPool::new(PoolKind::Large),
                active: HashSet::new(),
                pending: HashMap::new(),
                total_allocated: 0,
                memory_cap: None,
                shutdown: false,
                stats,
            }),
        }
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Allocate a block of at least `size` bytes usable on `stream`.
    pub fn malloc(&self, size: usize, stream: NpuStream) -> AllocResult<AllocatedBlock> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        self.process_events(state)?;

        let rounded = round_size(size);
        let kind = PoolKind::for_size(rounded);
        let alloc_bytes = alloc_size(rounded);
        let types = stat_types_for(kind);

        let mut found = self.get_free_block(state, stream, rounded, kind);
        if found.is_none() && self.callbacks.run_all()? {
            found = self.get_free_block(state, stream, rounded, kind);
        }

        let block_id = match found {
            Some(id) => id,
            None => self.grow(state, stream, rounded, kind, alloc_bytes)?,
        };

        let already_split = state.arena.get(block_id).is_split();
        let chosen = if self.should_split(state.arena.get(block_id), rounded) {
            let (head, tail_size) = self.split_block(state, block_id, rounded, stream, kind);
            if already_split {
                // An already-split inactive block shrinks by the head size.
                update_stat_array(
                    &mut state.stats.inactive_split_bytes,
                    -(rounded as i64),
                    &types,
                );
            } else {
                // A previously whole block now has an inactive split tail.
                update_stat_array(
                    &mut state.stats.inactive_split_bytes,
                    tail_size as i64,
                    &types,
                );
                update_stat_array(&mut state.stats.inactive_split, 1, &types);
            }
            head
        } else {
            if already_split {
                let size = state.arena.get(block_id).size as i64;
                update_stat_array(&mut state.stats.inactive_split_bytes, -size, &types);
                update_stat_array(&mut state.stats.inactive_split, -1, &types);
            }
            block_id
        };

        let (ptr, block_size) = {
            let block = state.arena.get_mut(chosen);
            block.allocated = true;
            (block.addr, block.size)
        };
        state.active.insert(chosen);

        update_stat_array(&mut state.stats.allocation, 1, &types);
        update_stat_array(&mut state.stats.allocated_bytes, block_size as i64, &types);
        update_stat_array(&mut state.stats.active, 1, &types);
        update_stat_array(&mut state.stats.active_bytes, block_size as i64, &types);
        if block_size >= self.config.max_split_size() {
            state.stats.oversize_allocations.update(1);
        }

        debug!(
            size = block_size,
            reserved = state.stats.reserved_bytes[StatType::Aggregate as usize].current,
            allocated = state.stats.allocated_bytes[StatType::Aggregate as usize].current,
            "malloc"
        );

        Ok(AllocatedBlock {
            id: chosen,
            ptr,
            size: block_size,
        })
    }

    /// Return a block. When other streams consumed it, recycling is deferred
    /// behind one completion event per such stream.
    pub fn free(&self, id: BlockId) -> AllocResult<()> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        let (size, kind, has_uses) = {
            let block = state.arena.get_mut(id);
            block.allocated = false;
            (block.size, block.pool, !block.stream_uses.is_empty())
        };
        state.active.remove(&id);

        let types = stat_types_for(kind);
        update_stat_array(&mut state.stats.allocation, -1, &types);
        update_stat_array(&mut state.stats.allocated_bytes, -(size as i64), &types);
        if size >= self.config.max_split_size() {
            state.stats.oversize_allocations.update(-1);
        }

        if has_uses && !state.shutdown {
            self.insert_events(state, id)?;
        } else {
            if has_uses {
                state.arena.get_mut(id).stream_uses.clear();
            }
            self.free_block(state, id);
        }

        debug!(
            size,
            reserved = state.stats.reserved_bytes[StatType::Aggregate as usize].current,
            allocated = state.stats.allocated_bytes[StatType::Aggregate as usize].current,
            "free"
        );
        Ok(())
    }

    /// Note that `stream` has consumed `block`. Idempotent.
    pub fn record_stream(&self, id: BlockId, stream: NpuStream) -> AllocResult<()> {
        let mut state = self.state.lock()?;
        state.arena.get_mut(id).stream_uses.insert(stream);
        Ok(())
    }

    /// Best-effort undo of [`Self::record_stream`]: drops the stream from
    /// the block's use set and discards any events already queued for it on
    /// that stream. A block whose last event is discarded is freed on the
    /// spot.
    pub fn erase_stream(&self, id: BlockId, stream: NpuStream) -> AllocResult<()> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        state.arena.get_mut(id).stream_uses.remove(&stream);

        let mut removed = 0usize;
        if let Some(mut queue) = state.pending.remove(&stream) {
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some((event, block_id)) = queue.pop_front() {
                if block_id == id {
                    removed += 1;
                    drop(event);
                } else {
                    kept.push_back((event, block_id));
                }
            }
            if !kept.is_empty() {
                state.pending.insert(stream, kept);
            }
        }
        if removed > 0 {
            let count = {
                let block = state.arena.get_mut(id);
                block.event_count -= removed;
                block.event_count
            };
            if count == 0 {
                self.free_block(state, id);
            }
        }
        Ok(())
    }

    /// Cap this device's footprint at `fraction` of its total physical
    /// memory. The caller has already bound the driver to this device.
    pub fn set_memory_fraction(&self, fraction: f64) -> AllocResult<()> {
        let info = self.driver.memory_info()?;
        let mut state = self.state.lock()?;
        state.memory_cap = Some((fraction * info.total as f64) as usize);
        Ok(())
    }

    /// Return every reusable cached block to the driver.
    pub fn empty_cache(&self, check_error: bool) -> AllocResult<()> {
        let mut guard = self.state.lock()?;
        self.release_cached_blocks(&mut guard, check_error)
    }

    /// Enter shutdown mode: subsequent frees release synchronously without
    /// recording events, because streams may already be torn down.
    pub fn set_shutdown(&self) -> AllocResult<()> {
        self.state.lock()?.shutdown = true;
        Ok(())
    }

    /// Total cached-free bytes and the largest single cached block.
    pub fn cache_info(&self) -> AllocResult<(usize, usize)> {
        let state = self.state.lock()?;
        let mut total = 0;
        let mut largest = 0;
        for key in state.small.iter().chain(state.large.iter()) {
            total += key.size;
            largest = largest.max(key.size);
        }
        Ok((total, largest))
    }

    pub fn stats(&self) -> AllocResult<DeviceStats> {
        Ok(self.state.lock()?.stats.clone())
    }

    pub fn reset_accumulated_stats(&self) -> AllocResult<()> {
        self.state.lock()?.stats.reset_accumulated();
        Ok(())
    }

    pub fn reset_peak_stats(&self) -> AllocResult<()> {
        self.state.lock()?.stats.reset_peak();
        Ok(())
    }

    /// Address-sorted descriptors of every driver segment this allocator
    /// holds, with their per-block occupancy.
    pub fn snapshot(&self) -> AllocResult<Vec<SegmentInfo>> {
        let guard = self.state.lock()?;
        let state = &*guard;

        let mut ids: HashSet<BlockId> = HashSet::new();
        ids.extend(state.small.iter().map(|key| key.id));
        ids.extend(state.large.iter().map(|key| key.id));
        ids.extend(state.active.iter().copied());
        for queue in state.pending.values() {
            ids.extend(queue.iter().map(|(_, id)| *id));
        }

        let mut segments = Vec::new();
        for id in ids {
            let head = state.arena.get(id);
            if head.prev.is_some() {
                continue;
            }
            let mut info = SegmentInfo {
                device: self.device,
                address: head.addr,
                total_size: 0,
                allocated_size: 0,
                active_size: 0,
                is_large: !head.pool.is_small(),
                blocks: Vec::new(),
            };
            let mut cursor = Some(id);
            while let Some(current) = cursor {
                let block = state.arena.get(current);
                let active = block.allocated || block.event_count > 0;
                info.blocks.push(BlockInfo {
                    size: block.size,
                    allocated: block.allocated,
                    active,
                });
                info.total_size += block.size;
                if block.allocated {
                    info.allocated_size += block.size;
                }
                if active {
                    info.active_size += block.size;
                }
                cursor = block.next;
            }
            segments.push(info);
        }
        segments.sort_by_key(|segment| segment.address);
        Ok(segments)
    }

    /// Base address and total size of the driver segment containing `id`.
    pub fn base_allocation(&self, id: BlockId) -> AllocResult<(DevicePtr, usize)> {
        let state = self.state.lock()?;
        let mut head = id;
        while let Some(prev) = state.arena.get(head).prev {
            head = prev;
        }
        let base = state.arena.get(head).addr;
        let mut total = 0;
        let mut cursor = Some(head);
        while let Some(current) = cursor {
            let block = state.arena.get(current);
            total += block.size;
            cursor = block.next;
        }
        Ok((base, total))
    }

    // ---- internals; the state lock is held by the caller ----

    /// Exhausted every cached option: collect garbage if configured, then
    /// climb the driver ladder.
    fn grow(
        &self,
        state: &mut DeviceState,
        stream: NpuStream,
        rounded: usize,
        kind: PoolKind,
        alloc_bytes: usize,
    ) -> AllocResult<BlockId> {
        if state.memory_cap.is_some() && self.config.garbage_collection_threshold() > 0.0 {
            self.garbage_collect(state)?;
        }

        // Only out-of-memory enters the recovery ladder; any other driver
        // failure surfaces immediately, leaving the cache untouched.
        let mut attempt = self.alloc_block(state, stream, kind, alloc_bytes, false);

        if matches!(attempt, Err(DriverError::OutOfMemory { .. }))
            && self.release_available_cached_blocks(state, stream, rounded, kind)?
        {
            attempt = self.alloc_block(state, stream, kind, alloc_bytes, false);
        }

        if matches!(attempt, Err(DriverError::OutOfMemory { .. })) {
            self.release_cached_blocks(state, true)?;
            attempt = self.alloc_block(state, stream, kind, alloc_bytes, true);
        }

        match attempt {
            Ok(id) => Ok(id),
            Err(DriverError::OutOfMemory { .. }) => {
                state.stats.num_ooms += 1;
                Err(self.oom_diagnostic(state, alloc_bytes))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get_free_block(
        &self,
        state: &mut DeviceState,
        stream: NpuStream,
        size: usize,
        kind: PoolKind,
    ) -> Option<BlockId> {
        let gc_enabled =
            state.memory_cap.is_some() && self.config.garbage_collection_threshold() > 0.0;
        let DeviceState {
            arena,
            small,
            large,
            ..
        } = state;
        let pool = match kind {
            PoolKind::Small => small,
            PoolKind::Large => large,
        };

        if gc_enabled {
            // Track reuse intervals only when garbage collection can act on
            // them.
            let ids: Vec<BlockId> = pool.iter().map(|key| key.id).collect();
            for id in ids {
                arena.get_mut(id).gc_count += 1;
            }
        }

        let key = pool.lower_bound(stream, size)?;
        if key.stream != stream {
            return None;
        }
        let max_split = self.config.max_split_size();
        // Do not burn an oversize block on a regular request.
        if size < max_split && key.size >= max_split {
            return None;
        }
        // Bound the waste when an oversize request reuses an oversize block.
        if size >= max_split && key.size >= size + LARGE_BUFFER {
            return None;
        }

        pool.remove_key(&key);
        arena.get_mut(key.id).gc_count = 0;
        Some(key.id)
    }

    fn should_split(&self, block: &Block, size: usize) -> bool {
        let remaining = block.size - size;
        if block.pool.is_small() {
            remaining >= MIN_BLOCK_SIZE
        } else {
            size < self.config.max_split_size() && remaining > SMALL_SIZE
        }
    }

    /// Split `tail_id` into a head of `rounded` bytes (returned) and the
    /// shrunken tail, which goes back to the pool. Returns the head id and
    /// the tail's new size.
    fn split_block(
        &self,
        state: &mut DeviceState,
        tail_id: BlockId,
        rounded: usize,
        stream: NpuStream,
        kind: PoolKind,
    ) -> (BlockId, usize) {
        let (tail_prev, tail_addr) = {
            let tail = state.arena.get(tail_id);
            (tail.prev, tail.addr)
        };

        let mut head = Block::new(self.device, stream, rounded, kind, tail_addr);
        head.prev = tail_prev;
        head.next = Some(tail_id);
        let head_id = state.arena.insert(head);

        if let Some(prev) = tail_prev {
            state.arena.get_mut(prev).next = Some(head_id);
        }

        let tail_size = {
            let tail = state.arena.get_mut(tail_id);
            tail.prev = Some(head_id);
            tail.addr += rounded;
            tail.size -= rounded;
            tail.size
        };

        let DeviceState {
            arena,
            small,
            large,
            ..
        } = state;
        let pool = match kind {
            PoolKind::Small => small,
            PoolKind::Large => large,
        };
        pool.insert(tail_id, arena.get(tail_id));

        (head_id, tail_size)
    }

    fn alloc_block(
        &self,
        state: &mut DeviceState,
        stream: NpuStream,
        kind: PoolKind,
        alloc_bytes: usize,
        is_retry: bool,
    ) -> Result<BlockId, DriverError> {
        if is_retry {
            state.stats.num_alloc_retries += 1;
        }

        if let Some(cap) = state.memory_cap {
            if state.total_allocated + alloc_bytes > cap {
                return Err(DriverError::OutOfMemory {
                    requested: alloc_bytes,
                });
            }
        }

        let ptr = self.driver.alloc(alloc_bytes)?;
        state.total_allocated += alloc_bytes;
        let id = state
            .arena
            .insert(Block::new(self.device, stream, alloc_bytes, kind, ptr));

        let types = stat_types_for(kind);
        update_stat_array(&mut state.stats.segment, 1, &types);
        update_stat_array(&mut state.stats.reserved_bytes, alloc_bytes as i64, &types);
        if alloc_bytes >= self.config.max_split_size() {
            state.stats.oversize_segments.update(1);
        }
        debug!(size = alloc_bytes, retry = is_retry, "driver allocation");
        Ok(id)
    }

    /// Preemptively return aged, unsplit large blocks to the driver until
    /// the footprint drops back to the GC threshold. Older blocks (higher
    /// `gc_count`) go first; the average age is the bar and is recomputed
    /// every pass.
    fn garbage_collect(&self, state: &mut DeviceState) -> AllocResult<()> {
        let cap = match state.memory_cap {
            Some(cap) => cap,
            None => return Ok(()),
        };
        let gc_threshold = (self.config.garbage_collection_threshold() * cap as f64) as usize;
        if state.total_allocated <= gc_threshold {
            return Ok(());
        }
        let target = state.total_allocated - gc_threshold;

        let mut total_age = 0.0;
        let mut freeable = 0usize;
        for key in state.large.iter() {
            if !state.arena.get(key.id).is_split() {
                total_age += state.arena.get(key.id).gc_count as f64;
                freeable += 1;
            }
        }
        if freeable == 0 {
            return Ok(());
        }

        // Pending work on candidate blocks must be complete before their
        // memory goes back to the driver.
        self.driver.synchronize_device()?;

        let mut reclaimed = 0usize;
        let mut freed_one = true;
        while reclaimed < target && freed_one && freeable > 0 {
            let age_threshold = total_age / freeable as f64;
            freed_one = false;

            let candidates: Vec<PoolKey> = state.large.iter().collect();
            for key in candidates {
                let (is_split, age, size) = {
                    let block = state.arena.get(key.id);
                    (block.is_split(), block.gc_count as f64, block.size)
                };
                if !is_split && age >= age_threshold {
                    freed_one = true;
                    reclaimed += size;
                    total_age -= age;
                    freeable -= 1;
                    self.release_block(state, key.id);
                    debug!(size, "gc released segment");
                }
            }
        }
        Ok(())
    }

    /// Free cached oversize blocks until the search size is covered, one
    /// block if a single fit exists, otherwise largest-first. Only applies
    /// when a split limit is configured.
    fn release_available_cached_blocks(
        &self,
        state: &mut DeviceState,
        stream: NpuStream,
        rounded: usize,
        kind: PoolKind,
    ) -> AllocResult<bool> {
        if !self.config.has_max_split_size() {
            return Ok(false);
        }
        let max_split = self.config.max_split_size();
        let key_size = rounded.max(max_split);

        fn pool_of(state: &DeviceState, kind: PoolKind) -> &BlockPool {
            match kind {
                PoolKind::Small => &state.small,
                PoolKind::Large => &state.large,
            }
        }

        if let Some(key) = pool_of(state, kind)
            .lower_bound(stream, key_size)
            .filter(|key| key.stream == stream)
        {
            self.release_block(state, key.id);
            return Ok(true);
        }

        let candidates: Vec<PoolKey> = pool_of(state, kind)
            .below_rev(stream, key_size)
            .take_while(|key| key.stream == stream && key.size >= max_split)
            .collect();

        let mut released = 0usize;
        for key in candidates {
            released += key.size;
            self.release_block(state, key.id);
            if released >= key_size {
                break;
            }
        }
        Ok(released >= key_size)
    }

    /// Full purge: drain every outstanding event, synchronize the device,
    /// and return every whole free block to the driver.
    fn release_cached_blocks(&self, state: &mut DeviceState, check_error: bool) -> AllocResult<()> {
        self.synchronize_and_free_events(state, check_error)?;

        match self.driver.synchronize_device() {
            Ok(()) => {}
            Err(err) if check_error => return Err(err.into()),
            Err(err) => warn!(%err, "device synchronize failed during cache purge"),
        }

        self.release_whole_pool_blocks(state, PoolKind::Large);
        self.release_whole_pool_blocks(state, PoolKind::Small);
        Ok(())
    }

    fn release_whole_pool_blocks(&self, state: &mut DeviceState, kind: PoolKind) {
        let keys: Vec<PoolKey> = match kind {
            PoolKind::Small => state.small.iter().collect(),
            PoolKind::Large => state.large.iter().collect(),
        };
        for key in keys {
            if !state.arena.get(key.id).is_split() {
                self.release_block(state, key.id);
            }
        }
    }

    fn release_block(&self, state: &mut DeviceState, id: BlockId) {
        let DeviceState {
            arena,
            small,
            large,
            total_allocated,
            stats,
            ..
        } = state;
        let block = arena.get(id);
        debug_assert!(!block.allocated && block.event_count == 0 && !block.is_split());

        // The block is unusable after this point whether or not the driver
        // accepted the free; bookkeeping proceeds either way.
        if let Err(err) = self.driver.free(block.addr) {
            warn!(addr = block.addr, %err, "driver free failed during release");
        }
        *total_allocated -= block.size;

        let types = stat_types_for(block.pool);
        update_stat_array(&mut stats.segment, -1, &types);
        update_stat_array(&mut stats.reserved_bytes, -(block.size as i64), &types);
        if block.size >= self.config.max_split_size() {
            stats.oversize_segments.update(-1);
        }

        let pool = match block.pool {
            PoolKind::Small => small,
            PoolKind::Large => large,
        };
        pool.remove(id, block);
        debug!(size = block.size, "released segment to driver");
        arena.remove(id);
    }

    /// Record one completion event per stream that consumed the block and
    /// park it in the pending queues.
    fn insert_events(&self, state: &mut DeviceState, id: BlockId) -> AllocResult<()> {
        let streams: Vec<NpuStream> = state.arena.get_mut(id).stream_uses.drain().collect();

        let prev_device = self.driver.current_device()?;
        let mut current = prev_device;
        for stream in streams {
            if stream.device() != current {
                self.driver.set_device(stream.device())?;
                current = stream.device();
            }
            let event = self.events.acquire(stream.device())?;
            self.driver.record_event(event.handle(), stream.handle())?;
            state.arena.get_mut(id).event_count += 1;
            state.pending.entry(stream).or_default().push_back((event, id));
        }
        if current != prev_device {
            self.driver.set_device(prev_device)?;
        }
        Ok(())
    }

    /// Pop completed events off every stream queue in FIFO order; a block
    /// whose last event completed goes back to its pool.
    fn process_events(&self, state: &mut DeviceState) -> AllocResult<()> {
        let streams: Vec<NpuStream> = state.pending.keys().copied().collect();
        for stream in streams {
            loop {
                let front_done = {
                    let queue = match state.pending.get(&stream) {
                        Some(queue) => queue,
                        None => break,
                    };
                    match queue.front() {
                        Some((event, _)) => self.driver.query_event(event.handle())?,
                        None => break,
                    }
                };
                if !front_done {
                    break;
                }

                let (event, block_id) = state
                    .pending
                    .get_mut(&stream)
                    .and_then(VecDeque::pop_front)
                    .expect("pending queue changed under the lock");
                drop(event);

                let count = {
                    let block = state.arena.get_mut(block_id);
                    block.event_count -= 1;
                    block.event_count
                };
                if count == 0 {
                    self.free_block(state, block_id);
                }
            }
            if state
                .pending
                .get(&stream)
                .map_or(false, VecDeque::is_empty)
            {
                state.pending.remove(&stream);
            }
        }
        Ok(())
    }

    /// Blocking drain of every queued event. The purge walks every entry
    /// even after a synchronize failure; with `check_error` the first
    /// failure is reported once the drain finishes.
    fn synchronize_and_free_events(
        &self,
        state: &mut DeviceState,
        check_error: bool,
    ) -> AllocResult<()> {
        let mut first_err: Option<NpuAllocError> = None;
        let queues: Vec<(NpuStream, VecDeque<(PooledEvent, BlockId)>)> =
            state.pending.drain().collect();

        for (_, queue) in queues {
            for (event, block_id) in queue {
                if let Err(err) = self.driver.synchronize_event(event.handle()) {
                    if check_error && first_err.is_none() {
                        first_err = Some(err.into());
                    } else {
                        warn!(%err, "event synchronize failed during cache purge");
                    }
                }
                drop(event);

                let count = {
                    let block = state.arena.get_mut(block_id);
                    block.event_count -= 1;
                    block.event_count
                };
                if count == 0 {
                    self.free_block(state, block_id);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Move a quiet block into its pool, coalescing with free, event-quiet
    /// neighbors first.
    fn free_block(&self, state: &mut DeviceState, id: BlockId) {
        debug_assert!({
            let block = state.arena.get(id);
            !block.allocated && block.event_count == 0
        });

        let (original_size, kind, prev, next) = {
            let block = state.arena.get(id);
            (block.size, block.pool, block.prev, block.next)
        };

        let mut net_split_blocks: i64 = 0;
        let mut net_split_bytes: i64 = 0;
        for neighbor in [prev, next] {
            let subsumed = self.try_merge(state, id, neighbor);
            if subsumed > 0 {
                net_split_blocks -= 1;
                net_split_bytes -= subsumed as i64;
            }
        }

        state.active.remove(&id);
        {
            let DeviceState {
                arena,
                small,
                large,
                ..
            } = state;
            let pool = match kind {
                PoolKind::Small => small,
                PoolKind::Large => large,
            };
            pool.insert(id, arena.get(id));
        }

        if state.arena.get(id).is_split() {
            net_split_blocks += 1;
            net_split_bytes += state.arena.get(id).size as i64;
        }

        let types = stat_types_for(kind);
        update_stat_array(&mut state.stats.inactive_split, net_split_blocks, &types);
        update_stat_array(
            &mut state.stats.inactive_split_bytes,
            net_split_bytes,
            &types,
        );
        update_stat_array(&mut state.stats.active, -1, &types);
        update_stat_array(
            &mut state.stats.active_bytes,
            -(original_size as i64),
            &types,
        );
    }

    /// Absorb a free, event-quiet neighbor into `dst_id`. Returns the
    /// subsumed size, 0 when no merge happened.
    fn try_merge(&self, state: &mut DeviceState, dst_id: BlockId, src_id: Option<BlockId>) -> usize {
        let src_id = match src_id {
            Some(src_id) => src_id,
            None => return 0,
        };
        {
            let src = state.arena.get(src_id);
            if src.allocated || src.event_count > 0 {
                return 0;
            }
        }

        let src_is_prev = state.arena.get(dst_id).prev == Some(src_id);
        {
            let DeviceState {
                arena,
                small,
                large,
                ..
            } = state;
            let src = arena.get(src_id);
            let pool = match src.pool {
                PoolKind::Small => small,
                PoolKind::Large => large,
            };
            pool.remove(src_id, src);
        }
        let src = state.arena.remove(src_id);

        {
            let dst = state.arena.get_mut(dst_id);
            if src_is_prev {
                dst.addr = src.addr;
                dst.prev = src.prev;
            } else {
                dst.next = src.next;
            }
            dst.size += src.size;
        }
        if src_is_prev {
            if let Some(prev) = src.prev {
                state.arena.get_mut(prev).next = Some(dst_id);
            }
        } else if let Some(next) = src.next {
            state.arena.get_mut(next).prev = Some(dst_id);
        }

        src.size
    }

    fn oom_diagnostic(&self, state: &DeviceState, requested: usize) -> NpuAllocError {
        let (free, total) = match self.driver.memory_info() {
            Ok(info) => (info.free, info.total),
            Err(_) => (0, 0),
        };
        let aggregate = StatType::Aggregate as usize;
        let cap_info = state
            .memory_cap
            .map(|cap| format!("{} allowed; ", format_size(cap as u64)))
            .unwrap_or_default();
        NpuAllocError::OutOfMemory(format!(
            "NPU out of memory. Tried to allocate {} (NPU {}; {} total capacity; \
             {} already allocated; {} current active; {} free; {}{} reserved in total). \
             If reserved memory is >> allocated memory try setting max_split_size_mb \
             to avoid fragmentation.",
            format_size(requested as u64),
            self.device,
            format_size(total as u64),
            format_size(state.stats.allocated_bytes[aggregate].current as u64),
            format_size(state.stats.active_bytes[aggregate].current as u64),
            format_size(free as u64),
            cap_info,
            format_size(state.stats.reserved_bytes[aggregate].current as u64),
        ))
    }

    #[cfg(test)]
    pub(crate) fn reserved_current(&self) -> i64 {
        self.state.lock().unwrap().stats.reserved_bytes[StatType::Aggregate as usize].current
    }

}
