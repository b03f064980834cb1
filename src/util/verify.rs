//! Heap verification.
//!
//! Walks everything reachable from a heap's roots and checks every reference on the way:
//! the target must be a plain object recorded in its region's allocation bitmap, and the
//! slot must be in the remembered or cross set its region needs. Weak references are
//! checked but not followed.

use crate::plan::heap::Heap;
use crate::policy::region::{HeapId, Region};
use crate::policy::region_map;
use crate::util::object_model::{load_slot, HeaderState};
use crate::util::tagged::TaggedValue;
use crate::util::{Address, ObjectReference};
use std::collections::{HashSet, VecDeque};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum FailureKind {
    /// The target is not in any region.
    NoRegion,
    /// The target is not the start of an allocated object.
    NotObjectStart,
    /// The target header is a free cell or a forwarding pointer.
    InvalidHeader,
    /// An old-to-young slot missing from the remembered set.
    MissingRemembered,
    /// A local-to-shared slot missing from the cross set.
    MissingCrossRef,
    /// A shared object refers to a local object.
    SharedToLocal,
    /// A reference into another heap's local objects.
    ForeignHeap,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VerifyFailure {
    pub slot: Address,
    pub value: TaggedValue,
    pub reason: FailureKind,
}

#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    pub checked_objects: usize,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} objects checked, {} failures",
            self.checked_objects,
            self.failures.len()
        )?;
        for failure in self.failures.iter().take(16) {
            write!(
                f,
                "\n  {} in slot {}: {:?}",
                failure.reason, failure.slot, failure.value
            )?;
        }
        Ok(())
    }
}

/// What the verifier knows about the region holding a slot.
#[derive(Copy, Clone)]
struct SlotRegion {
    shared: bool,
    local_old: bool,
    owner: HeapId,
}

impl SlotRegion {
    fn of(region: &Region) -> Self {
        Self {
            shared: region.is_shared(),
            local_old: region.kind().is_local_old(),
            owner: region.owner(),
        }
    }
}

struct Verifier {
    heap: HeapId,
    visited: HashSet<ObjectReference>,
    queue: VecDeque<ObjectReference>,
    report: VerifyReport,
}

impl Verifier {
    fn fail(&mut self, slot: Address, value: TaggedValue, reason: FailureKind) {
        self.report.failures.push(VerifyFailure {
            slot,
            value,
            reason,
        });
    }

    /// Check the reference in `slot`. `holder` is the region of the object holding the slot,
    /// `None` for roots. Returns the target if it is a valid object.
    fn check_slot(&mut self, slot: Address, holder: Option<SlotRegion>) -> Option<ObjectReference> {
        let value = load_slot(slot);
        let target = value.as_object().filter(|_| value.kind().is_reference())?;
        // Remembered and cross set bits of the slot.
        let recorded = holder.and_then(|_| {
            region_map::with_region(slot, |r| (r.remset.is_set(slot), r.cross_set.is_set(slot)))
        });
        let heap = self.heap;
        let checked = region_map::with_region(target.to_raw_address(), |r| {
            if !r.is_object_start(target.to_raw_address()) {
                return Err(FailureKind::NotObjectStart);
            }
            if target.header().state() != HeaderState::Object {
                return Err(FailureKind::InvalidHeader);
            }
            if !r.is_shared() && r.owner() != heap {
                return Err(FailureKind::ForeignHeap);
            }
            let (Some(holder), Some((remembered, cross))) = (holder, recorded) else {
                return Ok(());
            };
            if holder.shared && !r.is_shared() {
                Err(FailureKind::SharedToLocal)
            } else if !holder.shared && r.is_shared() && !cross {
                Err(FailureKind::MissingCrossRef)
            } else if holder.local_old && r.kind().is_young() && r.owner() == holder.owner && !remembered {
                Err(FailureKind::MissingRemembered)
            } else {
                Ok(())
            }
        });
        match checked {
            None => {
                self.fail(slot, value, FailureKind::NoRegion);
                None
            }
            Some(Err(reason)) => {
                self.fail(slot, value, reason);
                None
            }
            Some(Ok(())) => Some(target),
        }
    }

    fn visit(&mut self, slot: Address, holder: Option<SlotRegion>, follow: bool) {
        let Some(target) = self.check_slot(slot, holder) else {
            return;
        };
        if follow && self.visited.insert(target) {
            self.queue.push_back(target);
        }
    }

    fn run(&mut self) {
        while let Some(object) = self.queue.pop_front() {
            self.report.checked_objects += 1;
            let Some(holder) = region_map::with_region(object.to_raw_address(), SlotRegion::of) else {
                continue;
            };
            for slot in object.slots() {
                let weak = load_slot(slot).is_weak();
                self.visit(slot, Some(holder), !weak);
            }
        }
    }
}

/// Verify everything reachable from the roots of `heap`, including the shared objects it
/// refers to.
pub fn verify_heap(heap: &Heap) -> VerifyReport {
    let mut verifier = Verifier {
        heap: heap.id(),
        visited: HashSet::new(),
        queue: VecDeque::new(),
        report: VerifyReport::default(),
    };
    let _pins = (heap.pin_handles(), heap.shared().pin_handles());
    for slot in heap.strong_roots() {
        verifier.visit(slot, None, true);
    }
    for slot in heap.shared().handle_storage().strong_global_slots() {
        verifier.visit(slot, None, true);
    }
    for slot in heap.handle_storage().weak_global_slots() {
        verifier.visit(slot, None, false);
    }
    verifier.run();
    if !verifier.report.is_ok() {
        warn!("Heap {} verification: {}", heap.id(), verifier.report);
    }
    verifier.report
}
