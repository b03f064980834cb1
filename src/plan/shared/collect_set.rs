//! Collect set selection for partial shared cycles.

use crate::policy::oldspace::OldSpace;
use crate::policy::region::Region;
use crate::policy::space::Space;
use crate::util::options::Options;
use std::sync::Arc;

/// Admitted regions whose live fraction from the last marking is below
/// `partial_live_rate`, sparsest first, at most `max_partial_regions` of them. Regions
/// admitted since the last marking count as fully live.
pub(super) fn select(old: &OldSpace, options: &Options) -> Vec<Arc<Region>> {
    let mut candidates: Vec<(f64, Arc<Region>)> = old
        .regions()
        .iter()
        .map(|r| (r.live_rate(), r.clone()))
        .filter(|(rate, _)| *rate < options.partial_live_rate)
        .collect();
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
    candidates
        .into_iter()
        .take(options.max_partial_regions)
        .map(|(_, r)| r)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::region::SHARED_HEAP_ID;
    use crate::policy::region_allocator::RegionAllocator;
    use crate::policy::space::{CommonSpace, SpaceBudget, SpaceKind};
    use crate::util::constants::BYTES_IN_REGION;

    #[test]
    fn sparsest_regions_first() {
        let mut options = Options::default();
        options.partial_live_rate = 0.5;
        options.max_partial_regions = 2;
        let allocator = Arc::new(RegionAllocator::new(&options));
        let mut old = OldSpace::new(CommonSpace::new(
            SpaceKind::SharedOld,
            SHARED_HEAP_ID,
            allocator,
            Arc::new(SpaceBudget::new(usize::MAX)),
        ));
        let rates = [0.4, 0.9, 0.1, 0.2];
        let mut regions = vec![];
        for rate in rates {
            let region = old.common().acquire_region(1).unwrap();
            region.set_live_bytes((BYTES_IN_REGION as f64 * rate) as usize);
            old.adopt_region(region.clone());
            regions.push(region);
        }
        let selected = select(&old, &options);
        assert_eq!(selected.len(), 2);
        assert!(Arc::ptr_eq(&selected[0], &regions[2]));
        assert!(Arc::ptr_eq(&selected[1], &regions[3]));
        old.release_all();
    }
}
