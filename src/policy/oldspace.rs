use crate::policy::freelist::FreeLists;
use crate::policy::region::Region;
use crate::policy::space::{CommonSpace, Space};
use crate::util::alloc::AllocationError;
use crate::util::constants::*;
use crate::util::Address;
use std::sync::Arc;

/// A space of independently collectible single-unit regions. New objects are bump-allocated
/// into the current region, or carved from the free lists the last sweep built. Used for
/// the old and non-movable spaces of a heap and for the shared old space.
pub struct OldSpace {
    common: CommonSpace,
    regions: Vec<Arc<Region>>,
    /// The region taking bump allocations. Only ever a freshly acquired region.
    current: Option<Arc<Region>>,
    free_lists: FreeLists,
}

impl OldSpace {
    pub fn new(common: CommonSpace) -> Self {
        Self {
            common,
            regions: Vec::new(),
            current: None,
            free_lists: FreeLists::new(),
        }
    }

    fn bump(&self, size: usize) -> Option<Address> {
        let region = self.current.as_ref()?;
        let addr = region.bump_allocate(size)?;
        region.alloc_table.set(addr);
        Some(addr)
    }

    /// Allocate only from free cells, never growing the space.
    pub fn allocate_from_free_lists(&mut self, size: usize) -> Option<Address> {
        let addr = self.free_lists.allocate(size)?;
        crate::policy::region_map::with_region(addr, |r| r.alloc_table.set(addr));
        Some(addr)
    }

    /// Adopt a region from elsewhere (a young region moving to old, or an admitted shared
    /// allocation region). The region is not used for bump allocation.
    pub fn add_region(&mut self, region: Arc<Region>) {
        self.common.budget.charge(region.size());
        self.adopt_region(region);
    }

    /// Like `add_region`, for a region already charged to this space's budget.
    pub fn adopt_region(&mut self, region: Arc<Region>) {
        debug_assert!(!self.regions.iter().any(|r| Arc::ptr_eq(r, &region)));
        region.set_kind(self.common.kind);
        self.regions.push(region);
    }

    /// Remove and return the regions matching `filter`. Their free cells are forgotten.
    pub fn take_regions(&mut self, filter: impl Fn(&Region) -> bool) -> Vec<Arc<Region>> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.regions)
            .into_iter()
            .partition(|r| filter(r));
        self.regions = kept;
        for region in taken.iter() {
            self.free_lists.remove_range(region.start(), region.end());
            if self
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, region))
            {
                self.current = None;
            }
        }
        taken
    }

    /// Release regions a sweep found empty.
    pub fn release_regions(&mut self, regions: Vec<Arc<Region>>) {
        let released = self.take_regions(|r| regions.iter().any(|e| std::ptr::eq(e.as_ref(), r)));
        for region in released {
            self.common.release_region(region);
        }
    }

    /// Start a fresh set of free lists after a sweep. Bump allocation restarts in a new
    /// region since swept regions carry dirty memory above their cursor.
    pub fn reset_allocation(&mut self) {
        self.free_lists.clear();
        self.current = None;
    }

    pub fn free_lists(&self) -> &FreeLists {
        &self.free_lists
    }

    pub fn free_lists_mut(&mut self) -> &mut FreeLists {
        &mut self.free_lists
    }

    /// Bytes in free cells plus unused bump space of the current region.
    pub fn free_bytes(&self) -> usize {
        self.free_lists.free_bytes() + self.current.as_ref().map_or(0, |r| r.free_bytes())
    }

    /// Release every region.
    pub fn release_all(&mut self) {
        self.reset_allocation();
        for region in std::mem::take(&mut self.regions) {
            self.common.release_region(region);
        }
    }
}

impl Space for OldSpace {
    fn common(&self) -> &CommonSpace {
        &self.common
    }

    fn regions(&self) -> &[Arc<Region>] {
        &self.regions
    }

    fn allocate(&mut self, size: usize) -> Result<Address, AllocationError> {
        self.allocate_with(size, false)
    }
}

impl OldSpace {
    /// Allocate even past the space budget. Compaction uses this to place survivors whose
    /// source regions are about to be released.
    pub fn allocate_forced(&mut self, size: usize) -> Result<Address, AllocationError> {
        self.allocate_with(size, true)
    }

    fn allocate_with(&mut self, size: usize, forced: bool) -> Result<Address, AllocationError> {
        debug_assert!(size <= MAX_REGULAR_OBJECT_SIZE);
        if let Some(addr) = self.bump(size) {
            return Ok(addr);
        }
        if let Some(addr) = self.allocate_from_free_lists(size) {
            return Ok(addr);
        }
        // Retire the current region: its tail becomes a free cell.
        if let Some(current) = self.current.take() {
            let tail = current.free_bytes();
            if tail >= MIN_FREE_CELL_SIZE {
                let cell = current.cursor();
                crate::util::object_model::write_free_cell(cell, tail);
                current.set_cursor(current.end());
                self.free_lists.add(cell, tail);
            }
        }
        let region = match self.common.acquire_region(1) {
            Err(AllocationError::HeapOutOfMemory) if forced => {
                let region = self
                    .common
                    .allocator
                    .allocate(1, self.common.kind, self.common.owner)?;
                self.common.budget.charge(region.size());
                region
            }
            result => result?,
        };
        self.regions.push(region.clone());
        self.current = Some(region);
        self.bump(size).ok_or(AllocationError::HeapOutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::region_allocator::RegionAllocator;
    use crate::policy::space::{SpaceBudget, SpaceKind};
    use crate::util::object_model::{header_at, initialize_object, HeaderState};
    use crate::util::options::Options;

    fn old(capacity_regions: usize) -> OldSpace {
        let allocator = Arc::new(RegionAllocator::new(&Options::default()));
        OldSpace::new(CommonSpace::new(
            SpaceKind::Old,
            1,
            allocator,
            Arc::new(SpaceBudget::new(capacity_regions * BYTES_IN_REGION)),
        ))
    }

    #[test]
    fn retiring_a_region_lists_its_tail() {
        let mut space = old(2);
        let first = space.allocate(BYTES_IN_REGION - 1024).unwrap();
        initialize_object(first, BYTES_IN_REGION - 1024, 0);
        // Does not fit in the tail: a second region is acquired, the tail is listed.
        let second = space.allocate(2048).unwrap();
        assert_eq!(space.regions().len(), 2);
        assert!(space.regions()[1].contains(second));
        let tail = first + (BYTES_IN_REGION - 1024);
        assert_eq!(header_at(tail).state(), HeaderState::Free);
        assert_eq!(space.free_lists().free_bytes(), 1024);

        // Bump allocation carries on in the new region.
        let small = space.allocate(512).unwrap();
        assert!(space.regions()[1].contains(small));
        assert_eq!(space.free_bytes(), 1024 + space.regions()[1].free_bytes());
        space.release_all();
    }

    #[test]
    fn capacity_is_enforced() {
        let mut space = old(1);
        assert!(space.allocate(BYTES_IN_REGION).is_ok());
        assert_eq!(
            space.allocate(BYTES_IN_REGION),
            Err(AllocationError::HeapOutOfMemory)
        );
        space.release_all();
        assert_eq!(space.common().budget.used(), 0);
    }

    #[test]
    fn forced_allocation_overdraws_the_budget() {
        let mut space = old(1);
        assert!(space.allocate(BYTES_IN_REGION).is_ok());
        assert!(space.allocate_forced(64).is_ok());
        assert_eq!(space.common().budget.used(), 2 * BYTES_IN_REGION);
        space.release_all();
        assert_eq!(space.common().budget.used(), 0);
    }

    #[test]
    fn take_regions_forgets_free_cells() {
        let mut space = old(4);
        space.allocate(BYTES_IN_REGION - 4096).unwrap();
        space.allocate(8192).unwrap();
        assert_eq!(space.free_lists().free_bytes(), 4096);
        let first = space.regions()[0].clone();
        let taken = space.take_regions(|r| std::ptr::eq(r, first.as_ref()));
        assert_eq!(taken.len(), 1);
        assert_eq!(space.free_lists().free_bytes(), 0);
        for region in taken {
            space.common().release_region(region);
        }
        space.release_all();
    }
}
