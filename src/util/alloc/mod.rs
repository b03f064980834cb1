//! Allocation request kinds and the errors spaces report when they cannot satisfy a request.

use std::fmt;

/// Where a new object should live.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, strum_macros::Display, enum_map::Enum)]
pub enum AllocationKind {
    /// Movable, allocated in the young generation. Objects at or above the huge threshold go
    /// to the huge-object space instead.
    #[default]
    Young,
    /// Pretenured into old space.
    Old,
    /// Never moved by the collector.
    NonMovable,
    /// Allocated in the shared heap, visible to every heap.
    Shared,
}

/// Allocation errors.
///
/// `HeapOutOfMemory` means a space or the process-wide budget is exhausted and a collection
/// may help. `MmapOutOfMemory` means the operating system refused to map more memory; nothing
/// the collector does will fix that.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocationError {
    HeapOutOfMemory,
    MmapOutOfMemory,
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::HeapOutOfMemory => write!(f, "heap out of memory"),
            AllocationError::MmapOutOfMemory => write!(f, "unable to map memory for the heap"),
        }
    }
}

impl std::error::Error for AllocationError {}
