use crate::policy::region::{Region, RegionFlag};
use crate::policy::space::{CommonSpace, Space};
use crate::util::alloc::AllocationError;
use crate::util::constants::BYTES_IN_REGION;
use crate::util::Address;
use std::sync::Arc;

/// The young generation: two half-generations of regions that swap roles at every
/// evacuation. Mutators bump-allocate into the active half; survivors of a cycle are copied
/// into the other half, which then becomes active and keeps receiving new objects.
pub struct YoungSpace {
    common: CommonSpace,
    /// Capacity of one half in bytes.
    semispace_size: usize,
    /// The active half.
    regions: Vec<Arc<Region>>,
    /// The half receiving survivors while an evacuation runs.
    survivors: Vec<Arc<Region>>,
}

impl YoungSpace {
    pub fn new(common: CommonSpace, semispace_size: usize) -> Self {
        Self {
            common,
            semispace_size,
            regions: Vec::new(),
            survivors: Vec::new(),
        }
    }

    pub fn semispace_size(&self) -> usize {
        self.semispace_size
    }

    fn bump_into(&self, half: &[Arc<Region>], size: usize) -> Option<Address> {
        let region = half.last()?;
        let addr = region.bump_allocate(size)?;
        region.alloc_table.set(addr);
        Some(addr)
    }

    fn grow(&self, half: &mut Vec<Arc<Region>>, bounded: bool) -> Result<(), AllocationError> {
        if bounded && (half.len() + 1) * BYTES_IN_REGION > self.semispace_size {
            return Err(AllocationError::HeapOutOfMemory);
        }
        let region = self.common.acquire_region(1)?;
        half.push(region);
        Ok(())
    }

    /// Regions of the half being evacuated. They are flagged as collect set and leave the
    /// space; the caller releases them once the evacuation is complete.
    pub fn start_evacuation(&mut self) -> Vec<Arc<Region>> {
        debug_assert!(self.survivors.is_empty());
        for region in self.regions.iter() {
            region.set_flag(RegionFlag::InCollectSet);
        }
        std::mem::take(&mut self.regions)
    }

    /// Copy space for a survivor. `bounded` limits the survivors to one half's capacity;
    /// the unbounded variant is the last resort when old space cannot take a promotion.
    pub fn allocate_survivor(&mut self, size: usize, bounded: bool) -> Option<Address> {
        let mut survivors = std::mem::take(&mut self.survivors);
        let result = self.bump_into(&survivors, size).or_else(|| {
            self.grow(&mut survivors, bounded).ok()?;
            if let Some(region) = survivors.last() {
                region.set_flag(RegionFlag::BelowPromotionAge);
            }
            self.bump_into(&survivors, size)
        });
        self.survivors = survivors;
        result
    }

    /// The survivor half becomes the active half.
    pub fn finish_evacuation(&mut self) {
        debug_assert!(self.regions.is_empty());
        self.regions = std::mem::take(&mut self.survivors);
    }

    /// Remove a region from the active half so it can move to old space.
    pub fn take_region(&mut self, region: &Arc<Region>) -> Option<Arc<Region>> {
        let index = self.regions.iter().position(|r| Arc::ptr_eq(r, region))?;
        Some(self.regions.remove(index))
    }

    /// Bytes the collector copied into the survivor half.
    pub fn survivor_bytes(&self) -> usize {
        self.survivors.iter().map(|r| r.allocated_bytes()).sum()
    }

    /// Release every region of both halves.
    pub fn release_all(&mut self) {
        let regions = std::mem::take(&mut self.regions);
        for region in regions.into_iter().chain(std::mem::take(&mut self.survivors)) {
            self.common.release_region(region);
        }
    }
}

impl Space for YoungSpace {
    fn common(&self) -> &CommonSpace {
        &self.common
    }

    fn regions(&self) -> &[Arc<Region>] {
        &self.regions
    }

    fn allocate(&mut self, size: usize) -> Result<Address, AllocationError> {
        debug_assert!(size <= BYTES_IN_REGION);
        if let Some(addr) = self.bump_into(&self.regions, size) {
            return Ok(addr);
        }
        let mut regions = std::mem::take(&mut self.regions);
        let grown = self.grow(&mut regions, true);
        self.regions = regions;
        grown?;
        self.bump_into(&self.regions, size)
            .ok_or(AllocationError::HeapOutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::region_allocator::RegionAllocator;
    use crate::policy::space::{SpaceBudget, SpaceKind};
    use crate::util::options::Options;

    fn young(semispace_regions: usize) -> YoungSpace {
        let allocator = Arc::new(RegionAllocator::new(&Options::default()));
        let common = CommonSpace::new(
            SpaceKind::Young,
            1,
            allocator,
            Arc::new(SpaceBudget::new(usize::MAX)),
        );
        YoungSpace::new(common, semispace_regions * BYTES_IN_REGION)
    }

    fn release_all(space: &mut YoungSpace, regions: Vec<Arc<Region>>) {
        for region in regions {
            space.common.release_region(region);
        }
        space.release_all();
    }

    #[test]
    fn active_half_is_bounded() {
        let mut space = young(2);
        let big = BYTES_IN_REGION * 3 / 4;
        assert!(space.allocate(big).is_ok());
        assert!(space.allocate(big).is_ok());
        assert_eq!(space.allocate(big), Err(AllocationError::HeapOutOfMemory));
        assert_eq!(space.regions().len(), 2);
        assert_eq!(space.allocated_size(), 2 * big);
        release_all(&mut space, vec![]);
    }

    #[test]
    fn evacuation_swaps_halves() {
        let mut space = young(1);
        let a = space.allocate(64).unwrap();
        let from = space.start_evacuation();
        assert_eq!(from.len(), 1);
        assert!(from[0].has_flag(RegionFlag::InCollectSet));
        assert!(from[0].alloc_table.is_set(a));

        let copy = space.allocate_survivor(64, true).unwrap();
        assert!(space.allocate_survivor(BYTES_IN_REGION, true).is_none());
        assert!(space.allocate_survivor(BYTES_IN_REGION, false).is_some());
        assert_eq!(space.survivor_bytes(), 64 + BYTES_IN_REGION);
        space.finish_evacuation();
        assert_eq!(space.regions().len(), 2);
        assert!(space.regions()[0].contains(copy));
        assert!(space.regions()[0].has_flag(RegionFlag::BelowPromotionAge));
        release_all(&mut space, from);
    }
}
