//! Allocator statistics and snapshot descriptors

use serde::Serialize;

use crate::driver::{DeviceIndex, DevicePtr};

/// One tracked quantity: its current value, high-water mark, and cumulative
/// positive/negative movement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub current: i64,
    pub peak: i64,
    pub allocated: i64,
    pub freed: i64,
}

impl Stat {
    pub fn update(&mut self, amount: i64) {
        self.current += amount;
        self.peak = self.peak.max(self.current);
        if amount > 0 {
            self.allocated += amount;
        }
        if amount < 0 {
            self.freed += -amount;
        }
    }

    pub fn reset_accumulated(&mut self) {
        self.allocated = 0;
        self.freed = 0;
    }

    pub fn reset_peak(&mut self) {
        self.peak = self.current;
    }
}

/// Views a counter is aggregated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatType {
    Aggregate = 0,
    SmallPool = 1,
    LargePool = 2,
}

pub const STAT_TYPE_COUNT: usize = 3;

/// One [`Stat`] per [`StatType`] view.
pub type StatArray = [Stat; STAT_TYPE_COUNT];

/// Update the selected views of a stat array by `amount`.
pub fn update_stat_array(array: &mut StatArray, amount: i64, types: &[StatType]) {
    for ty in types {
        array[*ty as usize].update(amount);
    }
}

/// Full statistics of one device allocator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceStats {
    /// Allocation requests currently served / served over time.
    pub allocation: StatArray,
    /// Driver allocations (segments) currently held.
    pub segment: StatArray,
    /// Blocks that are handed out or still referenced by pending events.
    pub active: StatArray,
    /// Free blocks that are split children of a larger segment.
    pub inactive_split: StatArray,
    /// Bytes of served allocations.
    pub allocated_bytes: StatArray,
    /// Bytes requested from the driver and not yet returned.
    pub reserved_bytes: StatArray,
    /// Bytes in active blocks.
    pub active_bytes: StatArray,
    /// Bytes in free split children.
    pub inactive_split_bytes: StatArray,
    /// Failed driver allocations retried after a full cache purge.
    pub num_alloc_retries: u64,
    /// Out-of-memory failures surfaced to callers.
    pub num_ooms: u64,
    /// Allocations at least `max_split_size` bytes.
    pub oversize_allocations: Stat,
    /// Segments at least `max_split_size` bytes.
    pub oversize_segments: Stat,
    /// The split limit the allocator was configured with.
    pub max_split_size: u64,
}

impl DeviceStats {
    fn for_each_array(&mut self, f: impl Fn(&mut Stat)) {
        for array in [
            &mut self.allocation,
            &mut self.segment,
            &mut self.active,
            &mut self.inactive_split,
            &mut self.allocated_bytes,
            &mut self.reserved_bytes,
            &mut self.active_bytes,
            &mut self.inactive_split_bytes,
        ] {
            for stat in array.iter_mut() {
                f(stat);
            }
        }
    }

    /// Zero the cumulative movement counters and the retry/oom counts.
    pub fn reset_accumulated(&mut self) {
        self.for_each_array(Stat::reset_accumulated);
        self.num_alloc_retries = 0;
        self.num_ooms = 0;
        self.oversize_allocations.reset_accumulated();
        self.oversize_segments.reset_accumulated();
    }

    /// Collapse every peak onto its current value.
    pub fn reset_peak(&mut self) {
        self.for_each_array(Stat::reset_peak);
        self.oversize_allocations.reset_peak();
        self.oversize_segments.reset_peak();
    }
}

/// One block inside a snapshot segment.
#[derive(Debug, Clone, Serialize)]
pub struct BlockInfo {
    pub size: usize,
    pub allocated: bool,
    /// Allocated, or still referenced by an outstanding event.
    pub active: bool,
}

/// One driver segment in a snapshot: the chain of blocks produced by
/// splitting a single driver allocation, in address order.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentInfo {
    pub device: DeviceIndex,
    pub address: DevicePtr,
    pub total_size: usize,
    pub allocated_size: usize,
    pub active_size: usize,
    pub is_large: bool,
    pub blocks: Vec<BlockInfo>,
}

/// Human-readable byte count (two decimals above 1 KiB).
pub fn format_size(size: u64) -> String {
    if size <= 1024 {
        format!("{} bytes", size)
    } else if size <= 1_048_576 {
        format!("{:.2} KiB", size as f64 / 1024.0)
    } else if size <= 1_073_741_824 {
        format!("{:.2} MiB", size as f64 / 1_048_576.0)
    } else {
        format!("{:.2} GiB", size as f64 / 1_073_741_824.0)
    }
}
