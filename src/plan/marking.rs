//! Parallel marking with an explicit work list.
//!
//! Marking sets a region's mark bit for every reachable object in scope and accumulates
//! the region's live bytes. Weak slots met on the way are recorded and never traversed.
//! The grey set is a [`WorkPackets`] of objects whose slots still need scanning, so the
//! traversal depth never depends on the object graph and pool workers can share it.

use crate::policy::region::{HeapId, Region};
use crate::policy::region_map;
use crate::scheduler::work_packets::{run_phase, WorkPackets, DEFAULT_PACKET_SIZE};
use crate::scheduler::{TaskId, WorkerPool};
use crate::util::object_model::load_slot;
use crate::util::tagged::{TaggedValue, ValueKind};
use crate::util::{Address, ObjectReference};
use crate::vm::VMBinding;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Which objects a marking traverses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum MarkScope {
    /// Objects of one local heap. Shared targets are left alone.
    Local(HeapId),
    /// Objects of the shared heap. Shared objects never point into local heaps.
    Shared,
}

pub(crate) struct Marker {
    scope: MarkScope,
    binding: Option<Arc<dyn VMBinding>>,
    weak_slots: Mutex<Vec<Address>>,
    scanned: AtomicUsize,
}

impl Marker {
    pub fn new(scope: MarkScope, binding: Option<Arc<dyn VMBinding>>) -> Self {
        Self {
            scope,
            binding,
            weak_slots: Mutex::new(vec![]),
            scanned: AtomicUsize::new(0),
        }
    }

    fn classify(&self, value: TaggedValue) -> ValueKind {
        match &self.binding {
            Some(binding) => binding.classify(value),
            None => value.kind(),
        }
    }

    fn in_scope(&self, region: &Region) -> bool {
        match self.scope {
            MarkScope::Local(heap) => region.owner() == heap,
            MarkScope::Shared => region.is_shared(),
        }
    }

    /// Mark `object` if it is in scope. Newly marked objects are pushed to `grey`.
    pub fn mark_object(&self, object: ObjectReference, grey: &mut Vec<ObjectReference>) {
        let Some(newly_marked) = region_map::with_region(object.to_raw_address(), |region| {
            self.in_scope(region) && region.try_mark(object)
        }) else {
            debug_assert!(false, "{} is not in any region", object);
            return;
        };
        if newly_marked {
            grey.push(object);
        }
    }

    /// Trace the value in a root slot. Roots are never weak.
    pub fn mark_root(&self, slot: Address, grey: &mut Vec<ObjectReference>) {
        let value = load_slot(slot);
        if self.classify(value) == ValueKind::Pointer {
            if let Some(object) = value.as_object() {
                self.mark_object(object, grey);
            }
        }
    }

    /// Mark the referents of `roots` and return the initial grey set.
    pub fn mark_roots(&self, roots: &[Address]) -> Vec<ObjectReference> {
        let mut grey = vec![];
        for slot in roots {
            self.mark_root(*slot, &mut grey);
        }
        grey
    }

    /// Record a weak slot so it can be cleared or updated once marking is over.
    pub fn record_weak_slots(&self, slots: &[Address]) {
        if !slots.is_empty() {
            self.weak_slots.lock().unwrap().extend_from_slice(slots);
        }
    }

    pub fn take_weak_slots(&self) -> Vec<Address> {
        std::mem::take(&mut *self.weak_slots.lock().unwrap())
    }

    /// Objects whose slots were scanned so far.
    pub fn scanned_objects(&self) -> usize {
        self.scanned.load(Ordering::Relaxed)
    }
}

/// Scan the slots of a grey object.
pub(crate) fn scan_object(
    marker: &Marker,
    object: ObjectReference,
    grey: &mut Vec<ObjectReference>,
) {
    marker.scanned.fetch_add(1, Ordering::Relaxed);
    let mut weak = vec![];
    for slot in object.slots() {
        let value = load_slot(slot);
        match marker.classify(value) {
            ValueKind::Pointer => {
                if let Some(target) = value.as_object() {
                    debug_assert!(
                        marker.scope != MarkScope::Shared
                            || region_map::with_region(target.to_raw_address(), |r| r.is_shared())
                                .unwrap_or(false),
                        "shared object {} points to local object {}",
                        object,
                        target
                    );
                    marker.mark_object(target, grey);
                }
            }
            ValueKind::Weak => weak.push(slot),
            _ => {}
        }
    }
    marker.record_weak_slots(&weak);
}

/// Mark everything reachable from `grey`, sharing the work with the pool.
pub(crate) fn mark_closure(
    pool: Option<&WorkerPool>,
    id: TaskId,
    marker: &Arc<Marker>,
    grey: Vec<ObjectReference>,
) {
    if grey.is_empty() {
        return;
    }
    let packets = Arc::new(WorkPackets::from_items(grey, DEFAULT_PACKET_SIZE));
    run_phase(pool, id, packets, marker.clone(), scan_object);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::fixtures::RegionFixture;

    #[test]
    fn marks_reachable_and_records_weak() {
        let fixture = RegionFixture::new(3);
        let a = fixture.object(2);
        let b = fixture.object(1);
        let c = fixture.object(0);
        let unreachable = fixture.object(1);
        a.set_field_unbarriered(0, TaggedValue::from_object(b));
        a.set_field_unbarriered(1, TaggedValue::weak_from_object(c));
        b.set_field_unbarriered(0, TaggedValue::from_object(a));
        unreachable.set_field_unbarriered(0, TaggedValue::from_object(c));

        let marker = Arc::new(Marker::new(MarkScope::Local(3), None));
        let mut grey = vec![];
        marker.mark_object(a, &mut grey);
        mark_closure(None, 0, &marker, grey);

        let region = fixture.region();
        assert!(region.is_marked(a));
        assert!(region.is_marked(b));
        assert!(!region.is_marked(c));
        assert!(!region.is_marked(unreachable));
        assert_eq!(region.live_bytes(), a.size() + b.size());
        assert_eq!(marker.take_weak_slots(), vec![a.slot(1)]);
        assert_eq!(marker.scanned_objects(), 2);
    }

    #[test]
    fn other_heaps_are_out_of_scope() {
        let fixture = RegionFixture::new(4);
        let a = fixture.object(0);
        let marker = Marker::new(MarkScope::Local(5), None);
        let mut grey = vec![];
        marker.mark_object(a, &mut grey);
        assert!(grey.is_empty());
        assert!(!fixture.region().is_marked(a));
    }
}
