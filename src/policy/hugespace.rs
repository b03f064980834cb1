use crate::policy::region::Region;
use crate::policy::space::{CommonSpace, Space};
use crate::util::alloc::AllocationError;
use crate::util::conversions::bytes_to_region_units_up;
use crate::util::Address;
use std::sync::Arc;

/// Objects at or above the huge threshold. Each object gets its own (possibly multi-unit)
/// region; objects never move and are reclaimed by releasing their region.
pub struct HugeObjectSpace {
    common: CommonSpace,
    regions: Vec<Arc<Region>>,
}

impl HugeObjectSpace {
    pub fn new(common: CommonSpace) -> Self {
        Self {
            common,
            regions: Vec::new(),
        }
    }

    /// Release the regions whose object died.
    pub fn release_regions(&mut self, dead: &[Arc<Region>]) {
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.regions)
            .into_iter()
            .partition(|r| dead.iter().any(|d| Arc::ptr_eq(d, r)));
        self.regions = kept;
        for region in released {
            trace!("Releasing huge {}", region);
            self.common.release_region(region);
        }
    }

    pub fn release_all(&mut self) {
        for region in std::mem::take(&mut self.regions) {
            self.common.release_region(region);
        }
    }
}

impl Space for HugeObjectSpace {
    fn common(&self) -> &CommonSpace {
        &self.common
    }

    fn regions(&self) -> &[Arc<Region>] {
        &self.regions
    }

    fn allocate(&mut self, size: usize) -> Result<Address, AllocationError> {
        let region = self
            .common
            .acquire_region(bytes_to_region_units_up(size))?;
        self.regions.push(region.clone());
        let addr = region
            .bump_allocate(size)
            .ok_or(AllocationError::HeapOutOfMemory)?;
        region.alloc_table.set(addr);
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::region_allocator::RegionAllocator;
    use crate::policy::region_map;
    use crate::policy::space::{SpaceBudget, SpaceKind};
    use crate::util::constants::BYTES_IN_REGION;
    use crate::util::options::Options;

    #[test]
    fn one_region_per_object() {
        let allocator = Arc::new(RegionAllocator::new(&Options::default()));
        let mut space = HugeObjectSpace::new(CommonSpace::new(
            SpaceKind::Huge,
            3,
            allocator,
            Arc::new(SpaceBudget::new(8 * BYTES_IN_REGION)),
        ));
        let a = space.allocate(BYTES_IN_REGION + 8).unwrap();
        let b = space.allocate(1024).unwrap();
        assert_eq!(space.regions().len(), 2);
        assert_eq!(space.regions()[0].units(), 2);
        assert_eq!(space.committed_size(), 3 * BYTES_IN_REGION);
        assert_eq!(space.allocated_size(), BYTES_IN_REGION + 8 + 1024);

        let dead = vec![region_map::region_of(a).unwrap()];
        space.release_regions(&dead);
        assert_eq!(space.regions().len(), 1);
        assert!(region_map::region_of(a).is_none());
        assert!(region_map::region_of(b).is_some());
        space.release_all();
        assert_eq!(space.common().budget.used(), 0);
    }
}
