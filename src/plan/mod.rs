//! Collection cycles: what kinds exist, why they run, and the algorithms behind them.
//!
//! A per-context [`Heap`](heap::Heap) runs `Young`, `Old` and `Full` cycles on the
//! mutator thread that owns it, borrowing pool workers for the parallel phases. The
//! [`SharedHeap`](shared::SharedHeap) runs `SharedPartial` and `SharedFull` cycles, either
//! concurrently on its daemon thread or stop-the-world on a requesting mutator.

pub(crate) mod barrier;
pub(crate) mod evacuation;
pub mod heap;
pub(crate) mod marking;
pub mod safepoint;
pub mod shared;
pub(crate) mod sweep;
pub(crate) mod trigger;

use crate::policy::region::HeapId;
use std::fmt;
use std::time::Duration;

/// The kind of a collection cycle.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter, enum_map::Enum,
)]
pub enum GCKind {
    /// Evacuate the young generation. Survivors are copied or promoted.
    Young,
    /// Mark the whole local heap, sweep old space, then evacuate the young generation.
    Old,
    /// Mark the whole local heap and compact sparse old regions along with the young
    /// generation.
    Full,
    /// Trace the shared heap and sweep only a selected set of sparse regions.
    SharedPartial,
    /// Trace and sweep the whole shared heap.
    SharedFull,
}

impl GCKind {
    pub fn is_shared(self) -> bool {
        matches!(self, GCKind::SharedPartial | GCKind::SharedFull)
    }

    /// Does this kind of cycle mark the local heap?
    pub fn is_marking(self) -> bool {
        matches!(self, GCKind::Old | GCKind::Full)
    }
}

/// Why a cycle was started.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display, enum_map::Enum)]
pub enum GCReason {
    /// A space grew past its limit.
    AllocationLimit,
    /// An allocation could not be satisfied.
    AllocationFailed,
    /// The embedder asked for it.
    Explicit,
    /// Requested by tests and heap diagnostics.
    Diagnostic,
    /// Memory held outside the heap on behalf of heap objects grew too large.
    NativePressure,
    /// The embedder reported an idle period.
    Idle,
    /// The embedder reported that the process is short of memory.
    MemoryPressure,
}

/// A cycle descriptor. Ids increase monotonically per heap (and for the shared heap).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cycle {
    pub id: u64,
    pub kind: GCKind,
    pub reason: GCReason,
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} ({})", self.id, self.kind, self.reason)
    }
}

/// What a finished cycle did. Handed to GC listeners and kept as the last summary.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleSummary {
    pub cycle: Cycle,
    /// The heap that ran the cycle, `SHARED_HEAP_ID` for shared cycles.
    pub heap: HeapId,
    pub duration: Duration,
    /// Committed bytes of the collected spaces before and after the cycle.
    pub committed_before: usize,
    pub committed_after: usize,
    /// Bytes copied into the young generation.
    pub copied_bytes: usize,
    /// Bytes copied (or moved as whole regions) into old space.
    pub promoted_bytes: usize,
    /// Bytes found live by marking. Zero for young cycles.
    pub marked_bytes: usize,
    /// Regions selected for evacuation (full) or sweeping (partial shared).
    pub collect_set_regions: usize,
    /// Regions returned to the region allocator.
    pub reclaimed_regions: usize,
    /// Weak references cleared because their referent died.
    pub cleared_weak_refs: usize,
}

impl CycleSummary {
    pub(crate) fn new(cycle: Cycle, heap: HeapId) -> Self {
        Self {
            cycle,
            heap,
            duration: Duration::ZERO,
            committed_before: 0,
            committed_after: 0,
            copied_bytes: 0,
            promoted_bytes: 0,
            marked_bytes: 0,
            collect_set_regions: 0,
            reclaimed_regions: 0,
            cleared_weak_refs: 0,
        }
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on heap {}: {}K -> {}K in {:?}, copied {}K, promoted {}K, {} regions reclaimed",
            self.cycle,
            self.heap,
            self.committed_before >> 10,
            self.committed_after >> 10,
            self.duration,
            self.copied_bytes >> 10,
            self.promoted_bytes >> 10,
            self.reclaimed_regions
        )
    }
}

/// Task ids the collector posts its pool work under. Helpers of parallel phases and
/// background region releases of a heap get different ids so they can be withdrawn apart.
pub(crate) fn helper_task_id(heap: HeapId) -> u64 {
    ((heap as u64) << 1) | 1
}

pub(crate) fn release_task_id(heap: HeapId) -> u64 {
    (heap as u64) << 1
}
