//! Process-wide lookup from addresses to the regions containing them.
//!
//! Every region unit of a registered region maps to the same `Arc<Region>`, so interior
//! addresses of multi-unit huge regions resolve as well.

use crate::policy::region::Region;
use crate::util::conversions::region_unit_index;
use crate::util::{Address, ObjectReference};
use spin::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

lazy_static! {
    static ref REGION_MAP: RwLock<HashMap<usize, Arc<Region>>> = RwLock::new(HashMap::new());
}

pub fn register(region: &Arc<Region>) {
    let first = region_unit_index(region.start());
    let mut map = REGION_MAP.write();
    for unit in first..first + region.units() {
        let old = map.insert(unit, region.clone());
        debug_assert!(old.is_none(), "region unit {:#x} registered twice", unit);
    }
}

pub fn unregister(region: &Region) {
    let first = region_unit_index(region.start());
    let mut map = REGION_MAP.write();
    for unit in first..first + region.units() {
        map.remove(&unit);
    }
}

/// The region containing `addr`, if any.
pub fn region_of(addr: Address) -> Option<Arc<Region>> {
    REGION_MAP.read().get(&region_unit_index(addr)).cloned()
}

pub fn region_of_object(object: ObjectReference) -> Option<Arc<Region>> {
    region_of(object.to_raw_address())
}

/// Run `f` on the region containing `addr` without cloning the `Arc`.
pub fn with_region<R>(addr: Address, f: impl FnOnce(&Region) -> R) -> Option<R> {
    REGION_MAP.read().get(&region_unit_index(addr)).map(|r| f(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::space::SpaceKind;
    use crate::util::constants::BYTES_IN_REGION;

    #[test]
    fn multi_unit_lookup() {
        // Not backed by memory: the map only deals with addresses.
        let start = unsafe { Address::from_usize(0x7e00_0000_0000) };
        let region = Arc::new(Region::new(start, 3 * BYTES_IN_REGION, SpaceKind::Huge, 7));
        register(&region);
        let inner = region_of(start + 2 * BYTES_IN_REGION + 100).unwrap();
        assert!(Arc::ptr_eq(&inner, &region));
        assert_eq!(with_region(start + 8, |r| r.owner()), Some(7));
        assert!(region_of(start + 3 * BYTES_IN_REGION).is_none());
        unregister(&region);
        assert!(region_of(start).is_none());
    }
}
