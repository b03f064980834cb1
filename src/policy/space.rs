use crate::policy::region::{HeapId, Region};
use crate::policy::region_allocator::RegionAllocator;
use crate::util::alloc::AllocationError;
use crate::util::constants::BYTES_IN_REGION;
use crate::util::Address;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The space a region currently belongs to. A region changes kind only when it migrates
/// from young to old, or when a shared allocation region is admitted into shared old space.
#[repr(u8)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, bytemuck::NoUninit, strum_macros::Display, enum_map::Enum,
)]
pub enum SpaceKind {
    Young,
    Old,
    NonMovable,
    Huge,
    SharedOld,
    SharedHuge,
}

impl SpaceKind {
    pub fn is_shared(self) -> bool {
        matches!(self, SpaceKind::SharedOld | SpaceKind::SharedHuge)
    }

    pub fn is_young(self) -> bool {
        self == SpaceKind::Young
    }

    /// Local spaces whose slots may hold old-to-young pointers.
    pub fn is_local_old(self) -> bool {
        matches!(self, SpaceKind::Old | SpaceKind::NonMovable | SpaceKind::Huge)
    }

    /// Can a full cycle compact regions of this kind?
    pub fn is_movable(self) -> bool {
        matches!(self, SpaceKind::Young | SpaceKind::Old)
    }
}

/// A capacity budget shared by one or more spaces, e.g. the old, non-movable and huge
/// spaces of one heap.
#[derive(Debug)]
pub struct SpaceBudget {
    capacity: usize,
    used: AtomicUsize,
}

impl SpaceBudget {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Reserve `bytes`. Fails without side effects if that would exceed the capacity.
    pub fn try_charge(&self, bytes: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + bytes <= self.capacity).then_some(used + bytes)
            })
            .is_ok()
    }

    /// Account for memory adopted from elsewhere. May exceed the capacity.
    pub fn charge(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn credit(&self, bytes: usize) {
        let old = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(old >= bytes, "budget underflow: {} - {}", old, bytes);
    }
}

/// State every space has: what it is, who owns it, where its regions come from and which
/// budget they are charged to.
pub struct CommonSpace {
    pub kind: SpaceKind,
    pub owner: HeapId,
    pub allocator: Arc<RegionAllocator>,
    pub budget: Arc<SpaceBudget>,
}

impl CommonSpace {
    pub fn new(
        kind: SpaceKind,
        owner: HeapId,
        allocator: Arc<RegionAllocator>,
        budget: Arc<SpaceBudget>,
    ) -> Self {
        Self {
            kind,
            owner,
            allocator,
            budget,
        }
    }

    /// Grab a region of `units` region units, charged to the space budget.
    pub fn acquire_region(&self, units: usize) -> Result<Arc<Region>, AllocationError> {
        let bytes = units * BYTES_IN_REGION;
        if !self.budget.try_charge(bytes) {
            return Err(AllocationError::HeapOutOfMemory);
        }
        self.allocator
            .allocate(units, self.kind, self.owner)
            .map_err(|e| {
                self.budget.credit(bytes);
                e
            })
    }

    /// Return a region to the region allocator right away.
    pub fn release_region(&self, region: Arc<Region>) {
        self.budget.credit(region.size());
        self.allocator.release(region);
    }

    /// Credit the budget for a region whose memory is released later by someone else.
    pub fn forget_region(&self, region: &Region) {
        self.budget.credit(region.size());
    }
}

/// Operations shared by all spaces.
pub trait Space {
    fn common(&self) -> &CommonSpace;

    fn regions(&self) -> &[Arc<Region>];

    /// Allocate `size` bytes (header included, word aligned). The memory is zeroed.
    fn allocate(&mut self, size: usize) -> Result<Address, AllocationError>;

    fn kind(&self) -> SpaceKind {
        self.common().kind
    }

    fn enumerate_regions(&self, f: &mut dyn FnMut(&Arc<Region>)) {
        for region in self.regions() {
            f(region)
        }
    }

    /// Bytes of region memory the space holds.
    fn committed_size(&self) -> usize {
        self.regions().iter().map(|r| r.size()).sum()
    }

    /// Bytes between region starts and allocation cursors.
    fn allocated_size(&self) -> usize {
        self.regions().iter().map(|r| r.allocated_bytes()).sum()
    }

    /// Live bytes found by the last marking of each region.
    fn live_size(&self) -> usize {
        self.regions().iter().map(|r| r.live_bytes()).sum()
    }
}
