//! Weak reference processing.
//!
//! Tracing records weak slots and never follows them. Once the referents' fate is known,
//! the slots are visited here: a slot whose referent died reads `EMPTY` afterwards, and a
//! slot whose referent moved is updated to the new location.
//!
//! A weak slot may hold a weak-tagged value (an object field) or a plain pointer (the slot
//! of a [`WeakHandle`](crate::util::handles::WeakHandle)). Both are handled alike.

use crate::plan::barrier;
use crate::policy::region::{HeapId, Region, RegionFlag};
use crate::policy::region_map;
use crate::util::object_forwarding::get_forwarded_object;
use crate::util::object_model::{load_slot, store_slot};
use crate::util::tagged::TaggedValue;
use crate::util::Address;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct ReferenceProcessor {
    cleared: AtomicUsize,
    forwarded: AtomicUsize,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weak references cleared so far.
    pub fn cleared(&self) -> usize {
        self.cleared.load(Ordering::Relaxed)
    }

    /// Weak references retargeted at a moved referent so far.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    fn clear(&self, slot: Address) {
        store_slot(slot, TaggedValue::EMPTY);
        self.cleared.fetch_add(1, Ordering::Relaxed);
    }

    /// After marking: clear every slot whose referent lives in a region matching `in_scope`
    /// and is not marked.
    pub fn clear_unmarked(&self, slots: &[Address], in_scope: impl Fn(&Region) -> bool) {
        for slot in slots {
            let Some(referent) = load_slot(*slot).as_object() else {
                continue;
            };
            let dead = region_map::with_region(referent.to_raw_address(), |r| {
                in_scope(r) && !r.is_marked(referent)
            });
            match dead {
                Some(true) => self.clear(*slot),
                Some(false) => {}
                // The referent's region is gone already.
                None => self.clear(*slot),
            }
        }
    }

    /// After an evacuation of heap `heap`: retarget slots whose referent was copied and
    /// clear slots whose referent was left behind in the collect set.
    pub fn forward_or_clear(&self, slots: &[Address], heap: HeapId) {
        for slot in slots {
            let value = load_slot(*slot);
            let Some(referent) = value.as_object() else {
                continue;
            };
            let evacuated = region_map::with_region(referent.to_raw_address(), |r| {
                r.has_flag(RegionFlag::InCollectSet) && r.owner() == heap
            });
            if evacuated != Some(true) {
                continue;
            }
            match get_forwarded_object(referent) {
                Some(new) => {
                    store_slot(*slot, value.with_object(new));
                    barrier::record_slot(*slot, new);
                    self.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                None => self.clear(*slot),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::space::SpaceKind;
    use crate::util::object_forwarding::{attempt_to_forward, forward_object};
    use crate::util::test_util::fixtures::RegionFixture;

    #[test]
    fn unmarked_referents_are_cleared() {
        let fixture = RegionFixture::new(2);
        let holder = fixture.object(2);
        let live = fixture.object(0);
        let dead = fixture.object(0);
        holder.set_field_unbarriered(0, TaggedValue::weak_from_object(live));
        holder.set_field_unbarriered(1, TaggedValue::weak_from_object(dead));
        fixture.region().try_mark(live);

        let processor = ReferenceProcessor::new();
        processor.clear_unmarked(&holder.slots().collect::<Vec<_>>(), |r| r.owner() == 2);
        assert_eq!(holder.get_field(0), TaggedValue::weak_from_object(live));
        assert!(holder.get_field(1).is_empty());
        assert_eq!(processor.cleared(), 1);
    }

    #[test]
    fn out_of_scope_referents_are_kept() {
        let fixture = RegionFixture::new(2);
        let holder = fixture.object(1);
        let referent = fixture.object(0);
        holder.set_field_unbarriered(0, TaggedValue::weak_from_object(referent));
        let processor = ReferenceProcessor::new();
        processor.clear_unmarked(&[holder.slot(0)], |r| r.is_shared());
        assert_eq!(processor.cleared(), 0);
        assert!(!holder.get_field(0).is_empty());
    }

    #[test]
    fn evacuated_referents_are_forwarded_or_cleared() {
        let from = RegionFixture::with_kind(SpaceKind::Young, 2);
        let to = RegionFixture::with_kind(SpaceKind::Young, 2);
        let old = RegionFixture::new(2);
        from.region().set_flag(RegionFlag::InCollectSet);
        let moved = from.object(0);
        let left = from.object(0);
        let copy = to.object(0);
        assert!(matches!(
            attempt_to_forward(moved),
            crate::util::object_forwarding::ForwardingAttempt::Won(_)
        ));
        forward_object(moved, copy);

        let holder = old.object(2);
        holder.set_field_unbarriered(0, TaggedValue::weak_from_object(moved));
        holder.set_field_unbarriered(1, TaggedValue::weak_from_object(left));
        let processor = ReferenceProcessor::new();
        processor.forward_or_clear(&[holder.slot(0), holder.slot(1)], 2);

        assert_eq!(holder.get_field(0), TaggedValue::weak_from_object(copy));
        assert!(holder.get_field(1).is_empty());
        assert_eq!(processor.forwarded(), 1);
        assert_eq!(processor.cleared(), 1);
        // The old slot now refers to a young object.
        assert!(old.region().remset.is_set(holder.slot(0)));
    }
}
