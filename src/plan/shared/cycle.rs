//! The phases of a shared cycle.
//!
//! A concurrent cycle runs on the daemon thread:
//!
//! 1. Initial pause. Every heap's shared allocation region is admitted, live bytes are
//!    reset and the roots (each heap's strong roots and cross sets, shared global handles)
//!    are greyed.
//! 2. Concurrent marking. Mutators run; new shared objects are allocated marked and the
//!    insertion barrier greys shared targets of their stores into a buffer the daemon
//!    drains.
//! 3. Final pause. Roots are rescanned and the buffer drained once more, then weak
//!    references are cleared and the collect set (partial) or every shared region (full)
//!    is swept.
//!
//! A stop-the-world cycle runs all of this in one pause on the requesting thread.

use super::heap::{BarrierBuffer, SharedSpaces};
use super::{SharedHeap, SharedPhase};
use crate::plan::heap::Heap;
use crate::plan::marking::{mark_closure, MarkScope, Marker};
use crate::plan::sweep::{sweep_all, SweepItem};
use crate::plan::{helper_task_id, Cycle, CycleSummary, GCKind};
use crate::policy::region::{HeapId, RegionFlag, SHARED_HEAP_ID};
use crate::policy::space::SpaceKind;
use crate::util::handles::GlobalsPin;
use crate::util::reference_processor::ReferenceProcessor;
use crate::util::Address;
use crate::vm::VMBinding;
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

impl SharedHeap {
    fn set_phase(&self, phase: SharedPhase) {
        let mut state = self.state.lock().unwrap();
        debug!("Shared heap: {} -> {}", state.phase, phase);
        state.phase = phase;
    }

    fn lock_spaces(&self) -> MutexGuard<'_, SharedSpaces> {
        self.spaces.lock().unwrap()
    }

    fn stop_the_world(&self, requester: Option<HeapId>) {
        self.safepoint().request_suspend(requester);
        self.safepoint().wait_for_all_parked();
    }

    /// Pin the global handles of the shared heap and of every heap in `heaps`.
    fn pin_all_handles(&self, heaps: &[Arc<Heap>]) -> Vec<GlobalsPin> {
        let mut pins = vec![self.pin_handles()];
        pins.extend(heaps.iter().map(|heap| heap.pin_handles()));
        pins
    }

    fn roots(&self, heaps: &[Arc<Heap>]) -> Vec<Address> {
        let mut roots = self.handles.strong_root_slots();
        for heap in heaps {
            roots.extend(heap.shared_roots());
        }
        roots
    }

    /// The binding that classifies shared values. Heaps sharing a shared heap classify
    /// alike, so any live one will do.
    fn binding_of(&self, heaps: &[Arc<Heap>]) -> Option<Arc<dyn VMBinding>> {
        heaps.first().map(|heap| heap.binding().clone())
    }

    fn mark_from_roots(&self, marker: &Arc<Marker>, heaps: &[Arc<Heap>]) {
        let grey = marker.mark_roots(&self.roots(heaps));
        mark_closure(self.pool(), helper_task_id(SHARED_HEAP_ID), marker, grey);
    }

    fn drain_barrier_buffer(&self, marker: &Arc<Marker>) {
        loop {
            let grey = std::mem::take(&mut self.barrier_buffer.lock().unwrap().grey);
            if grey.is_empty() {
                return;
            }
            trace!("Draining {} barrier-greyed objects", grey.len());
            mark_closure(self.pool(), helper_task_id(SHARED_HEAP_ID), marker, grey);
        }
    }

    /// Forget the previous marking: admit the allocation regions, then reset marks and
    /// live bytes of every shared region.
    fn reset_marking(&self, heaps: &[Arc<Heap>]) {
        let admitted = self.admit_allocation_regions(heaps);
        trace!("Admitted {} shared allocation regions", admitted);
        for region in self.lock_spaces().regions() {
            region.clear_marks();
            region.set_live_bytes(0);
            region.clear_flag(RegionFlag::Swept);
        }
    }

    pub(super) fn run_stop_the_world_cycle(&self, cycle: Cycle, requester: Option<HeapId>) {
        debug!("Shared cycle {} started stop-the-world", cycle);
        let start = Instant::now();
        let mut summary = CycleSummary::new(cycle, SHARED_HEAP_ID);
        self.stop_the_world(requester);
        self.set_phase(SharedPhase::FinalMarkAndSweep);
        let heaps = self.live_heaps();
        let pins = self.pin_all_handles(&heaps);
        summary.committed_before = self.committed_size();
        self.reset_marking(&heaps);
        let marker = Arc::new(Marker::new(MarkScope::Shared, self.binding_of(&heaps)));
        self.mark_from_roots(&marker, &heaps);
        self.sweep(&heaps, &marker, &mut summary);
        self.safepoint().resume_all();
        drop(pins);
        drop(heaps);
        self.end_cycle(summary, start);
    }

    pub(crate) fn run_concurrent_cycle(&self, cycle: Cycle) {
        debug!("Shared cycle {} started", cycle);
        let start = Instant::now();
        let mut summary = CycleSummary::new(cycle, SHARED_HEAP_ID);

        self.stop_the_world(None);
        let heaps = self.live_heaps();
        let pins = self.pin_all_handles(&heaps);
        summary.committed_before = self.committed_size();
        self.reset_marking(&heaps);
        *self.barrier_buffer.lock().unwrap() = BarrierBuffer::default();
        let marker = Arc::new(Marker::new(MarkScope::Shared, self.binding_of(&heaps)));
        let grey = marker.mark_roots(&self.roots(&heaps));
        self.set_marking_active(true);
        self.set_phase(SharedPhase::ConcurrentMarking);
        self.safepoint().resume_all();
        drop(pins);
        drop(heaps);

        mark_closure(self.pool(), helper_task_id(SHARED_HEAP_ID), &marker, grey);
        self.drain_barrier_buffer(&marker);

        self.stop_the_world(None);
        self.set_phase(SharedPhase::FinalMarkAndSweep);
        let heaps = self.live_heaps();
        let pins = self.pin_all_handles(&heaps);
        self.admit_allocation_regions(&heaps);
        let overflowed = std::mem::take(&mut self.barrier_buffer.lock().unwrap().overflowed);
        let marker = if overflowed {
            warn!(
                "Barrier buffer of {} overflowed its limit of {} objects, restarting marking",
                cycle, self.options.marking_buffer_limit
            );
            self.set_marking_active(false);
            for region in self.lock_spaces().regions() {
                region.clear_marks();
                region.set_live_bytes(0);
            }
            Arc::new(Marker::new(MarkScope::Shared, self.binding_of(&heaps)))
        } else {
            marker
        };
        self.mark_from_roots(&marker, &heaps);
        self.drain_barrier_buffer(&marker);
        self.set_marking_active(false);
        self.sweep(&heaps, &marker, &mut summary);
        self.safepoint().resume_all();
        drop(pins);
        drop(heaps);
        self.end_cycle(summary, start);
    }

    /// Clear dead weak references and sweep. Runs with every mutator stopped.
    fn sweep(&self, heaps: &[Arc<Heap>], marker: &Marker, summary: &mut CycleSummary) {
        summary.marked_bytes = self.lock_spaces().regions().iter().map(|r| r.live_bytes()).sum();

        let mut weak_slots = marker.take_weak_slots();
        weak_slots.extend(std::mem::take(&mut self.barrier_buffer.lock().unwrap().weak_slots));
        weak_slots.extend(self.handles.weak_global_slots());
        for heap in heaps {
            weak_slots.extend(heap.shared_weak_slots());
        }
        let processor = ReferenceProcessor::new();
        processor.clear_unmarked(&weak_slots, |r| r.is_shared());
        summary.cleared_weak_refs = processor.cleared();

        let (partial, collect_set) = {
            let state = self.state.lock().unwrap();
            let partial = state.cycle.is_some_and(|c| c.kind == GCKind::SharedPartial);
            (partial, state.collect_set.clone())
        };
        let regions = if partial {
            collect_set
        } else {
            self.lock_spaces().regions()
        };
        summary.collect_set_regions = if partial { regions.len() } else { 0 };
        let items = regions
            .into_iter()
            .map(|region| SweepItem {
                huge: region.kind() == SpaceKind::SharedHuge,
                region,
                remember_young: false,
            })
            .collect();
        let swept = sweep_all(self.pool(), helper_task_id(SHARED_HEAP_ID), items);

        let mut spaces = self.lock_spaces();
        if !partial {
            spaces.old.reset_allocation();
        }
        let mut empty = vec![];
        let mut dead_huge = vec![];
        for s in swept {
            if s.region.kind() == SpaceKind::SharedHuge {
                if s.is_empty() {
                    dead_huge.push(s.region);
                }
                continue;
            }
            if partial {
                // Cells of the last sweep are superseded.
                spaces.old.free_lists_mut().remove_range(s.region.start(), s.region.end());
            }
            if s.is_empty() {
                empty.push(s.region);
                continue;
            }
            for (cell, size) in s.free_cells {
                spaces.old.free_lists_mut().add(cell, size);
            }
        }
        summary.reclaimed_regions = empty.len() + dead_huge.len();
        debug_assert!(!partial || summary.reclaimed_regions <= summary.collect_set_regions);
        spaces.old.release_regions(empty);
        spaces.huge.release_regions(&dead_huge);

        let mut live = 0;
        for region in spaces.regions() {
            region.clear_marks();
            live += region.live_bytes();
        }
        drop(spaces);
        self.trigger.lock().unwrap().cycle_done(live);
    }

    fn end_cycle(&self, mut summary: CycleSummary, start: Instant) {
        summary.committed_after = self.committed_size();
        summary.duration = start.elapsed();
        self.stats.end_cycle(&summary);
        debug!("{}", summary);
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::GCReason;
    use crate::util::alloc::AllocationKind;
    use crate::util::constants::BYTES_IN_REGION;
    use crate::util::handles::HandleScope;
    use crate::util::tagged::{TaggedValue, ValueKind};
    use crate::util::test_util::fixtures::{small_options, HeapFixture};
    use crate::util::ObjectReference;
    use std::sync::Mutex;

    /// Classifies references to chosen objects as weak.
    #[derive(Default)]
    struct WeakTargets(Mutex<Vec<ObjectReference>>);

    impl VMBinding for WeakTargets {
        fn classify(&self, value: TaggedValue) -> ValueKind {
            match (value.kind(), value.as_object()) {
                (ValueKind::Pointer, Some(object)) if self.0.lock().unwrap().contains(&object) => {
                    ValueKind::Weak
                }
                (kind, _) => kind,
            }
        }
    }

    fn weak_targets_fixture() -> (Arc<WeakTargets>, HeapFixture) {
        let binding = Arc::new(WeakTargets::default());
        let f = HeapFixture::with_binding(small_options(), binding.clone());
        (binding, f)
    }

    #[test]
    fn shared_tracing_classifies_through_the_binding() {
        let (binding, f) = weak_targets_fixture();
        let heap = &f.heap;
        let holder = heap.global(TaggedValue::from_object(heap.allocate(16, AllocationKind::Shared)));
        let weak = heap.allocate(16, AllocationKind::Shared);
        let strong = heap.allocate(16, AllocationKind::Shared);
        binding.0.lock().unwrap().push(weak);
        let holder_object = holder.object().unwrap();
        heap.write_field(holder_object, 0, TaggedValue::from_object(weak));
        heap.write_field(holder_object, 1, TaggedValue::from_object(strong));

        assert!(heap.collect(GCKind::SharedFull, GCReason::Explicit));
        assert_eq!(holder_object.get_field(0), TaggedValue::EMPTY);
        assert_eq!(holder_object.get_field(1), TaggedValue::from_object(strong));
        assert!(f.shared.stats().last.unwrap().cleared_weak_refs >= 1);
    }

    #[test]
    fn insertion_barrier_classifies_through_the_binding() {
        let (binding, f) = weak_targets_fixture();
        let heap = &f.heap;
        let holder = heap.allocate(16, AllocationKind::Shared);
        let weak = heap.allocate(16, AllocationKind::Shared);
        let strong = heap.allocate(16, AllocationKind::Shared);
        binding.0.lock().unwrap().push(weak);

        f.shared.set_marking_active(true);
        heap.write_field(holder, 0, TaggedValue::from_object(weak));
        heap.write_field(holder, 1, TaggedValue::from_object(strong));
        f.shared.set_marking_active(false);
        let buffer = f.shared.barrier_buffer.lock().unwrap();
        assert_eq!(buffer.weak_slots, vec![holder.slot(0)]);
        assert_eq!(buffer.grey, vec![strong]);
    }

    #[test]
    fn concurrent_cycle_keeps_objects_stored_during_marking() {
        let f = HeapFixture::new();
        let heap = &f.heap;
        let scope = HandleScope::new(heap);
        let holder = scope.object(heap.allocate(16, AllocationKind::Old));
        for _ in 0..6 {
            heap.allocate(BYTES_IN_REGION / 4, AllocationKind::Shared);
        }
        assert!(f.shared.start_concurrent_mark(GCKind::SharedFull, GCReason::Explicit));
        // Coalesced with the cycle in flight.
        assert!(!f.shared.start_concurrent_mark(GCKind::SharedFull, GCReason::Explicit));
        let late = heap.allocate(16, AllocationKind::Shared);
        heap.write_field(holder.object().unwrap(), 0, TaggedValue::from_object(late));
        f.shared.wait_until_finished(heap.id());

        assert_eq!(f.shared.phase(), SharedPhase::Idle);
        let stats = f.shared.stats();
        assert_eq!(stats.cycles[GCKind::SharedFull], 1);
        assert_eq!(stats.collections_coalesced, 1);
        assert_eq!(holder.object().unwrap().get_field(0), TaggedValue::from_object(late));
        assert!(heap.verify().is_ok());
    }

    #[test]
    fn partial_cycle_only_sweeps_the_collect_set() {
        let f = HeapFixture::new();
        let heap = &f.heap;
        let scope = HandleScope::new(heap);
        let holder = scope.object(heap.allocate(24, AllocationKind::Old));
        // Three regions, each a quarter live.
        for i in 0..9 {
            let object = heap.allocate(BYTES_IN_REGION / 4, AllocationKind::Shared);
            if i % 3 == 0 {
                heap.write_field(holder.object().unwrap(), i / 3, TaggedValue::from_object(object));
            }
        }
        assert!(heap.collect(GCKind::SharedFull, GCReason::Explicit));
        assert_eq!(f.shared.partial_candidate_count(), 3);

        heap.write_field(holder.object().unwrap(), 0, TaggedValue::EMPTY);
        assert!(f.shared.collect(GCKind::SharedPartial, GCReason::Explicit, Some(heap.id())));
        let summary = f.shared.stats().last.unwrap();
        assert_eq!(summary.cycle.kind, GCKind::SharedPartial);
        assert_eq!(summary.collect_set_regions, 3);
        assert_eq!(summary.reclaimed_regions, 1);
        let spaces = f.shared.spaces.lock().unwrap();
        assert_eq!(spaces.regions().len(), 2);
        assert!(spaces.regions().iter().all(|r| r.has_flag(RegionFlag::Swept)));
    }
}
