//! Huge arrays get their own regions, never move, and are released when they die.

use isoheap::plan::heap::Heap;
use isoheap::plan::shared::SharedHeap;
use isoheap::policy::space::SpaceKind;
use isoheap::util::constants::BYTES_IN_REGION;
use isoheap::util::handles::HandleScope;
use isoheap::vm::DefaultBinding;
use isoheap::{AllocationKind, GCKind, GCReason, Options, TaggedValue, WorkerPool};
use std::sync::Arc;

const ROUNDS: usize = 3;
const ARRAYS_PER_ROUND: usize = 15;

#[test]
fn repeated_huge_allocations_verify() {
    let mut options = Options::default();
    options.threads = 2;
    options.old_space_size = 64 * BYTES_IN_REGION;
    options.min_old_space_limit = 8 * BYTES_IN_REGION;
    options.concurrent_marking = false;
    let pool = Arc::new(WorkerPool::new(options.threads));
    let shared = SharedHeap::new(options.clone(), Some(pool.clone()));
    let heap = Heap::new(options, shared, Some(pool), Arc::new(DefaultBinding));

    let survivor = heap.global(TaggedValue::EMPTY);
    let mut survivor_address = None;
    for round in 0..ROUNDS {
        let scope = HandleScope::new(&heap);
        let holder = scope.object(heap.allocate(ARRAYS_PER_ROUND * 8, AllocationKind::Young));
        for i in 0..ARRAYS_PER_ROUND {
            let array = heap.allocate(BYTES_IN_REGION, AllocationKind::Young);
            assert_eq!(heap.space_of(array), Some(SpaceKind::Huge));
            heap.write_field(array, 0, TaggedValue::from_int((round * 100 + i) as i64));
            heap.write_field(holder.object().unwrap(), i, TaggedValue::from_object(array));
            if round == 0 && i == 0 {
                survivor.set(TaggedValue::from_object(array));
                survivor_address = Some(array);
            }
        }
        let report = heap.verify();
        assert!(report.is_ok(), "{}", report);
        for i in 0..ARRAYS_PER_ROUND {
            let array = holder.object().unwrap().get_field(i).as_object().unwrap();
            assert_eq!(array.get_field(0), TaggedValue::from_int((round * 100 + i) as i64));
        }
    }

    assert!(heap.collect(GCKind::Full, GCReason::Explicit));
    let report = heap.verify();
    assert!(report.is_ok(), "{}", report);
    assert_eq!(report.checked_objects, 1);
    assert_eq!(survivor.object(), survivor_address);
    assert_eq!(survivor.object().unwrap().get_field(0), TaggedValue::from_int(0));
    // Dead arrays of the last round were released.
    assert!(heap.committed_size() < ARRAYS_PER_ROUND * BYTES_IN_REGION);
}
