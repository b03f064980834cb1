//! The write barrier and slot recording.
//!
//! Every pointer store by mutator code runs [`post_write`] after the store. The collector
//! calls [`record_slot`] when it rewrites a slot to point at a moved object, so that the
//! remembered and cross sets stay complete without a barrier.

use crate::plan::shared::SharedHeap;
use crate::policy::region_map;
use crate::util::tagged::{TaggedValue, ValueKind};
use crate::util::{Address, ObjectReference};

/// What recording a slot did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Recorded {
    Nothing,
    /// The slot went into its region's remembered set.
    Remembered,
    /// The slot went into its region's cross set.
    Cross,
}

/// Record `slot`, which now refers to `target`. Slots outside the heap (handles, binding
/// roots) are never recorded.
pub(crate) fn record_slot(slot: Address, target: ObjectReference) -> Recorded {
    let Some((target_shared, target_young, target_owner)) =
        region_map::with_region(target.to_raw_address(), |r| {
            (r.is_shared(), r.kind().is_young(), r.owner())
        })
    else {
        debug_assert!(false, "{} stored into {} is not in any region", target, slot);
        return Recorded::Nothing;
    };
    region_map::with_region(slot, |region| {
        if region.is_shared() {
            assert!(
                target_shared,
                "shared slot {} refers to local object {}",
                slot, target
            );
            Recorded::Nothing
        } else if target_shared {
            region.record_cross_slot(slot);
            Recorded::Cross
        } else if target_young && target_owner == region.owner() && region.kind().is_local_old() {
            region.remember_slot(slot);
            Recorded::Remembered
        } else {
            Recorded::Nothing
        }
    })
    .unwrap_or(Recorded::Nothing)
}

/// The post-write barrier of a mutator store of `value` into `slot`.
pub(crate) fn post_write(shared: &SharedHeap, slot: Address, value: TaggedValue, kind: ValueKind) {
    if !kind.is_reference() {
        return;
    }
    let Some(target) = value.as_object() else {
        return;
    };
    let recorded = record_slot(slot, target);
    // Insertion barrier: a shared object that becomes reachable from a local slot while
    // the shared heap is marking must not be missed.
    if recorded == Recorded::Cross && kind == ValueKind::Pointer && shared.is_marking_active() {
        shared.grey(target);
    }
}
