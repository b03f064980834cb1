//! Sweeping marked regions.
//!
//! A sweep walks a region from its start to its cursor. Runs of dead objects and free cells
//! are merged into one free cell each, and the remembered set, cross set and allocation bits
//! of the run are cleared. A dead run at the end of the region lowers the cursor instead,
//! then the unused tail becomes one more free cell. Regions without a live object are
//! reported empty so their space can release them.

use crate::policy::region::{Region, RegionFlag};
use crate::policy::region_map;
use crate::scheduler::work_packets::{run_phase, WorkPackets};
use crate::scheduler::{TaskId, WorkerPool};
use crate::util::constants::MIN_FREE_CELL_SIZE;
use crate::util::object_model::{load_slot, write_free_cell, HeaderState};
use crate::util::{Address, ObjectReference};
use std::sync::{Arc, Mutex};

/// The outcome of sweeping one region.
pub(crate) struct SweptRegion {
    pub region: Arc<Region>,
    /// Free cells large enough to be listed.
    pub free_cells: Vec<(Address, usize)>,
    pub live_bytes: usize,
}

impl SweptRegion {
    pub fn is_empty(&self) -> bool {
        self.live_bytes == 0
    }
}

fn free_run(region: &Region, start: Address, end: Address, free_cells: &mut Vec<(Address, usize)>) {
    let size = end - start;
    write_free_cell(start, size);
    region.alloc_table.clear_range(start, end);
    region.remset.clear_range(start, end);
    region.cross_set.clear_range(start, end);
    if size >= MIN_FREE_CELL_SIZE {
        free_cells.push((start, size));
    }
}

/// Remember the slots of `object` that point into the young generation of its heap.
fn remember_young_slots(region: &Region, object: ObjectReference) {
    for slot in object.slots() {
        if let Some(target) = load_slot(slot).as_object() {
            let young = region_map::with_region(target.to_raw_address(), |r| {
                r.kind().is_young() && r.owner() == region.owner()
            });
            if young == Some(true) {
                region.remember_slot(slot);
            }
        }
    }
}

/// Sweep a regular region. `remember_young` is set for young regions that just moved to old
/// space: their surviving objects may point into the young generation.
pub(crate) fn sweep_region(region: &Arc<Region>, remember_young: bool) -> SweptRegion {
    let mut free_cells = vec![];
    let mut live_bytes = 0;
    let mut dead_start: Option<Address> = None;
    for (addr, header) in region.cells() {
        let live = header.state() == HeaderState::Object && region.mark_table.is_set(addr);
        if live {
            if let Some(start) = dead_start.take() {
                free_run(region, start, addr, &mut free_cells);
            }
            live_bytes += header.size();
            if remember_young {
                remember_young_slots(region, unsafe { ObjectReference::from_raw_address(addr) });
            }
        } else if dead_start.is_none() {
            dead_start = Some(addr);
        }
    }
    if let Some(start) = dead_start {
        region.alloc_table.clear_range(start, region.end());
        region.remset.clear_range(start, region.end());
        region.cross_set.clear_range(start, region.end());
        region.set_cursor(start);
    }
    if live_bytes > 0 {
        let tail = region.cursor();
        let tail_size = region.end() - tail;
        if tail_size >= MIN_FREE_CELL_SIZE {
            write_free_cell(tail, tail_size);
            region.set_cursor(region.end());
            free_cells.push((tail, tail_size));
        }
    }
    region.set_live_bytes(live_bytes);
    region.set_flag(RegionFlag::Swept);
    SweptRegion {
        region: region.clone(),
        free_cells,
        live_bytes,
    }
}

/// Sweep a huge region: it is either live as a whole or empty.
pub(crate) fn sweep_huge_region(region: &Arc<Region>) -> SweptRegion {
    let live = region.mark_table.is_set(region.start());
    let live_bytes = if live {
        unsafe { ObjectReference::from_raw_address(region.start()) }.size()
    } else {
        0
    };
    region.set_live_bytes(live_bytes);
    region.set_flag(RegionFlag::Swept);
    SweptRegion {
        region: region.clone(),
        free_cells: vec![],
        live_bytes,
    }
}

/// A region to sweep and how.
pub(crate) struct SweepItem {
    pub region: Arc<Region>,
    pub huge: bool,
    pub remember_young: bool,
}

#[derive(Default)]
pub(crate) struct SweepResults {
    results: Mutex<Vec<SweptRegion>>,
}

fn sweep_work(results: &SweepResults, item: SweepItem, _: &mut Vec<SweepItem>) {
    let swept = if item.huge {
        sweep_huge_region(&item.region)
    } else {
        sweep_region(&item.region, item.remember_young)
    };
    results.results.lock().unwrap().push(swept);
}

/// Sweep `items` in parallel, one region per packet.
pub(crate) fn sweep_all(pool: Option<&WorkerPool>, id: TaskId, items: Vec<SweepItem>) -> Vec<SweptRegion> {
    if items.is_empty() {
        return vec![];
    }
    let packets = Arc::new(WorkPackets::from_items(items, 1));
    let results = Arc::new(SweepResults::default());
    run_phase(pool, id, packets, results.clone(), sweep_work);
    let mut swept = std::mem::take(&mut *results.results.lock().unwrap());
    // Deterministic free list order regardless of which worker swept what.
    swept.sort_by_key(|s| s.region.start());
    swept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::*;
    use crate::util::object_model::header_at;
    use crate::util::tagged::TaggedValue;
    use crate::util::test_util::fixtures::RegionFixture;

    #[test]
    fn dead_runs_become_free_cells() {
        let fixture = RegionFixture::new(1);
        let region = fixture.region();
        let a = fixture.object(3);
        let b = fixture.object(3);
        let c = fixture.object(3);
        let d = fixture.object(1);
        let e = fixture.object(5);
        region.remember_slot(b.slot(0));
        region.record_cross_slot(c.slot(1));
        for live in [a, d] {
            region.try_mark(live);
        }

        let swept = sweep_region(region, false);
        assert_eq!(swept.live_bytes, a.size() + d.size());
        // b and c merge, e is trailing and lowers the cursor before the tail is freed.
        assert_eq!(header_at(b.to_raw_address()).state(), HeaderState::Free);
        assert_eq!(header_at(b.to_raw_address()).size(), 64);
        assert_eq!(
            swept.free_cells,
            vec![
                (b.to_raw_address(), 64),
                (e.to_raw_address(), region.end() - e.to_raw_address())
            ]
        );
        assert!(region.remset.is_empty());
        assert!(region.cross_set.is_empty());
        assert!(!region.is_object_start(c.to_raw_address()));
        assert!(region.is_object_start(d.to_raw_address()));
        assert_eq!(region.cursor(), region.end());
        assert!(region.has_flag(RegionFlag::Swept));
        assert_eq!(region.objects().collect::<Vec<_>>(), vec![a, d]);
    }

    #[test]
    fn unmarked_region_is_empty() {
        let fixture = RegionFixture::new(1);
        fixture.object(10);
        let swept = sweep_region(fixture.region(), false);
        assert!(swept.is_empty());
        assert!(swept.free_cells.is_empty());
    }

    #[test]
    fn moved_young_regions_remember_young_slots() {
        let young = RegionFixture::with_kind(crate::policy::space::SpaceKind::Young, 2);
        let promoted = RegionFixture::new(2);
        let target = young.object(0);
        let holder = promoted.object(2);
        holder.set_field_unbarriered(1, TaggedValue::from_object(target));
        promoted.region().try_mark(holder);
        sweep_region(promoted.region(), true);
        assert_eq!(
            promoted.region().remset.iter_set().collect::<Vec<_>>(),
            vec![holder.slot(1)]
        );
    }

    #[test]
    fn parallel_sweep_collects_every_region() {
        let pool = WorkerPool::new(2);
        let fixtures: Vec<_> = (0..4).map(|_| RegionFixture::new(1)).collect();
        let mut items = vec![];
        for (i, f) in fixtures.iter().enumerate() {
            let o = f.object(1);
            if i % 2 == 0 {
                f.region().try_mark(o);
            }
            items.push(SweepItem {
                region: f.region().clone(),
                huge: false,
                remember_young: false,
            });
        }
        let swept = sweep_all(Some(&pool), 11, items);
        assert_eq!(swept.len(), 4);
        assert_eq!(swept.iter().filter(|s| s.is_empty()).count(), 2);
        assert!(swept.windows(2).all(|w| w[0].region.start() < w[1].region.start()));
        let _ = BYTES_IN_WORD;
    }
}
