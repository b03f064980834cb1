use crate::policy::space::SpaceKind;
use crate::util::bitmap::SlotBitmap;
use crate::util::constants::*;
use crate::util::object_model::{header_at, HeaderState, ObjectHeader};
use crate::util::{Address, ObjectReference};
use atomic::Atomic;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// Identifies the heap owning a region. Local heaps get ids from 1, the shared heap is 0.
pub type HeapId = u32;
pub const SHARED_HEAP_ID: HeapId = 0;

/// Region state flags. Each flag is one bit of the region's flag word.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum RegionFlag {
    /// The region is being evacuated or swept by the current cycle.
    InCollectSet = 1 << 0,
    /// The region was swept by the current cycle. Cleared when the next cycle starts.
    Swept = 1 << 1,
    /// Some slot of the region is in its remembered set.
    InRememberedSet = 1 << 2,
    /// Some slot of the region is in its cross set.
    HasCrossRefs = 1 << 3,
    /// A young survivor region: its objects survived at least one cycle.
    BelowPromotionAge = 1 << 4,
    /// A young region moved to old space wholesale.
    Promoted = 1 << 5,
}

/// A contiguous, region-aligned span of heap memory of one or more region units.
///
/// The allocation cursor is only advanced by the owning allocator (or a collector holding
/// the owning space's lock). Flags, live bytes and the side bitmaps may be touched by any
/// thread and are atomic.
pub struct Region {
    start: Address,
    end: Address,
    cursor: Atomic<Address>,
    kind: Atomic<SpaceKind>,
    owner: AtomicU32,
    flags: AtomicU8,
    live_bytes: AtomicUsize,
    /// One bit per marked object start.
    pub mark_table: SlotBitmap,
    /// One bit per allocated object start.
    pub alloc_table: SlotBitmap,
    /// Slots of this region holding pointers to young objects.
    pub remset: SlotBitmap,
    /// Slots of this (local) region holding pointers into the shared heap.
    pub cross_set: SlotBitmap,
}

impl Region {
    pub fn new(start: Address, bytes: usize, kind: SpaceKind, owner: HeapId) -> Self {
        debug_assert!(start.is_aligned_to(BYTES_IN_REGION));
        debug_assert!(bytes > 0 && bytes % BYTES_IN_REGION == 0);
        Region {
            start,
            end: start + bytes,
            cursor: Atomic::new(start),
            kind: Atomic::new(kind),
            owner: AtomicU32::new(owner),
            flags: AtomicU8::new(0),
            live_bytes: AtomicUsize::new(0),
            mark_table: SlotBitmap::new(start, bytes),
            alloc_table: SlotBitmap::new(start, bytes),
            remset: SlotBitmap::new(start, bytes),
            cross_set: SlotBitmap::new(start, bytes),
        }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn units(&self) -> usize {
        self.size() >> LOG_BYTES_IN_REGION
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn cursor(&self) -> Address {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn set_cursor(&self, cursor: Address) {
        debug_assert!(cursor >= self.start && cursor <= self.end);
        self.cursor.store(cursor, Ordering::Release);
    }

    pub fn allocated_bytes(&self) -> usize {
        self.cursor() - self.start
    }

    pub fn free_bytes(&self) -> usize {
        self.end - self.cursor()
    }

    /// Bump-allocate `size` bytes with one compare-and-advance of the cursor.
    pub fn bump_allocate(&self, size: usize) -> Option<Address> {
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let new_cursor = current + size;
            if new_cursor > self.end {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                current,
                new_cursor,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind.load(Ordering::Acquire)
    }

    pub fn set_kind(&self, kind: SpaceKind) {
        self.kind.store(kind, Ordering::Release)
    }

    pub fn owner(&self) -> HeapId {
        self.owner.load(Ordering::Acquire)
    }

    pub fn is_shared(&self) -> bool {
        self.owner() == SHARED_HEAP_ID
    }

    pub fn has_flag(&self, flag: RegionFlag) -> bool {
        self.flags.load(Ordering::Acquire) & flag as u8 != 0
    }

    pub fn set_flag(&self, flag: RegionFlag) {
        self.flags.fetch_or(flag as u8, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: RegionFlag) {
        self.flags.fetch_and(!(flag as u8), Ordering::AcqRel);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Relaxed)
    }

    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Fraction of the region found live by the last marking.
    pub fn live_rate(&self) -> f64 {
        self.live_bytes() as f64 / self.size() as f64
    }

    pub fn is_marked(&self, object: ObjectReference) -> bool {
        self.mark_table.is_set(object.to_raw_address())
    }

    /// Mark an object. Returns true if this call marked it, in which case its size is added
    /// to the live bytes.
    pub fn try_mark(&self, object: ObjectReference) -> bool {
        if self.mark_table.set(object.to_raw_address()) {
            self.add_live_bytes(object.size());
            true
        } else {
            false
        }
    }

    pub fn clear_marks(&self) {
        self.mark_table.clear_all();
    }

    pub fn record_object(&self, object: ObjectReference) {
        self.alloc_table.set(object.to_raw_address());
    }

    pub fn is_object_start(&self, addr: Address) -> bool {
        self.contains(addr) && self.alloc_table.is_set(addr)
    }

    /// Remember a slot of this region that holds a young pointer.
    pub fn remember_slot(&self, slot: Address) {
        if self.remset.set(slot) && !self.has_flag(RegionFlag::InRememberedSet) {
            self.set_flag(RegionFlag::InRememberedSet);
        }
    }

    /// Record a slot of this region that holds a shared pointer.
    pub fn record_cross_slot(&self, slot: Address) {
        if self.cross_set.set(slot) && !self.has_flag(RegionFlag::HasCrossRefs) {
            self.set_flag(RegionFlag::HasCrossRefs);
        }
    }

    /// Drop every remembered slot.
    pub fn clear_remset(&self) {
        self.remset.clear_all();
        self.clear_flag(RegionFlag::InRememberedSet);
    }

    pub fn clear_cross_set(&self) {
        self.cross_set.clear_all();
        self.clear_flag(RegionFlag::HasCrossRefs);
    }

    /// Walk the region from its start to its cursor, yielding every object and free cell.
    pub fn cells(&self) -> impl Iterator<Item = (Address, ObjectHeader)> + '_ {
        let limit = self.cursor();
        let mut addr = self.start;
        std::iter::from_fn(move || {
            if addr >= limit {
                return None;
            }
            let header = header_at(addr);
            debug_assert!(
                matches!(header.state(), HeaderState::Object | HeaderState::Free),
                "unparseable cell {:?} at {} in {}",
                header,
                addr,
                self
            );
            let size = header.size();
            if size == 0 {
                debug_assert!(false, "zero-sized cell at {} in {}", addr, self);
                return None;
            }
            let cell = addr;
            addr += size;
            Some((cell, header))
        })
    }

    /// Every allocated object of the region, skipping free cells.
    pub fn objects(&self) -> impl Iterator<Item = ObjectReference> + '_ {
        self.cells()
            .filter(|(_, header)| header.state() == HeaderState::Object)
            .map(|(addr, _)| unsafe { ObjectReference::from_raw_address(addr) })
    }

    /// Marked objects, found through the mark table.
    pub fn marked_objects(&self) -> impl Iterator<Item = ObjectReference> + '_ {
        self.mark_table
            .iter_set()
            .map(|addr| unsafe { ObjectReference::from_raw_address(addr) })
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, {}) owner={}",
            self.kind(),
            self.start,
            self.end,
            self.owner()
        )
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Region({}, cursor={}, flags={:#b}, live={})",
            self,
            self.cursor(),
            self.flags.load(Ordering::Relaxed),
            self.live_bytes()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory;
    use crate::util::object_model::{initialize_object, write_free_cell};

    fn with_region<F: FnOnce(&Region)>(f: F) {
        let start = memory::dzmmap_aligned(BYTES_IN_REGION, BYTES_IN_REGION).unwrap();
        let region = Region::new(start, BYTES_IN_REGION, SpaceKind::Old, 1);
        f(&region);
        memory::try_munmap(start, BYTES_IN_REGION).unwrap();
    }

    #[test]
    fn bump_allocation_stops_at_end() {
        with_region(|region| {
            let a = region.bump_allocate(BYTES_IN_REGION - 64).unwrap();
            assert_eq!(a, region.start());
            assert!(region.bump_allocate(128).is_none());
            assert_eq!(region.bump_allocate(64).unwrap(), region.start() + (BYTES_IN_REGION - 64));
            assert_eq!(region.free_bytes(), 0);
        })
    }

    #[test]
    fn cells_walk_objects_and_free_cells() {
        with_region(|region| {
            let a = region.bump_allocate(32).unwrap();
            initialize_object(a, 32, 0);
            let b = region.bump_allocate(64).unwrap();
            write_free_cell(b, 64);
            let c = region.bump_allocate(16).unwrap();
            initialize_object(c, 16, 0);

            let cells: Vec<_> = region.cells().map(|(addr, h)| (addr, h.state())).collect();
            assert_eq!(
                cells,
                vec![
                    (a, HeaderState::Object),
                    (b, HeaderState::Free),
                    (c, HeaderState::Object)
                ]
            );
            assert_eq!(region.objects().count(), 2);
        })
    }

    #[test]
    fn marking_counts_live_bytes_once() {
        with_region(|region| {
            let a = region.bump_allocate(48).unwrap();
            let object = initialize_object(a, 48, 0);
            assert!(region.try_mark(object));
            assert!(!region.try_mark(object));
            assert!(region.is_marked(object));
            assert_eq!(region.live_bytes(), 48);
            assert_eq!(region.marked_objects().collect::<Vec<_>>(), vec![object]);
            region.clear_marks();
            assert!(!region.is_marked(object));
        })
    }

    #[test]
    fn flags() {
        with_region(|region| {
            region.remember_slot(region.start() + 8);
            assert!(region.has_flag(RegionFlag::InRememberedSet));
            region.set_flag(RegionFlag::Swept);
            region.clear_remset();
            assert!(!region.has_flag(RegionFlag::InRememberedSet));
            assert!(region.has_flag(RegionFlag::Swept));
        })
    }
}
