//! Copying live objects out of a collect set.
//!
//! Young evacuation is a parallel Cheney-style copy driven by slots: every work item is the
//! address of a slot that may refer into the collect set. Copying an object publishes its
//! slots as new work, so the traversal needs no separate scan pointer. Parallel evacuators
//! race for each object with a compare-and-swap on its header (see
//! [`attempt_to_forward`]) and agree on one copy.
//!
//! Compaction, used by full cycles, copies the marked objects of whole regions instead and
//! leaves the pointers to a separate fixup pass over every remaining region and root.

use crate::plan::barrier;
use crate::plan::heap::LocalSpaces;
use crate::policy::region::{HeapId, Region, RegionFlag};
use crate::policy::region_map;
use crate::policy::space::Space;
use crate::scheduler::work_packets::{run_phase, WorkPackets, DEFAULT_PACKET_SIZE};
use crate::scheduler::{TaskId, WorkerPool};
use crate::util::alloc::AllocationError;
use crate::util::object_forwarding::{attempt_to_forward, forward_object, get_forwarded_object, ForwardingAttempt};
use crate::util::object_model::{copy_object, load_slot, store_slot, HeaderState};
use crate::util::tagged::ValueKind;
use crate::util::{Address, ObjectReference};
use crate::vm::VMBinding;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared state of one evacuation.
pub(crate) struct Evacuator {
    heap: HeapId,
    spaces: Arc<LocalSpaces>,
    binding: Arc<dyn VMBinding>,
    promotion_age: u8,
    /// Weak slots referring into the collect set, processed once copying is over.
    weak_slots: Mutex<Vec<Address>>,
    copied_bytes: AtomicUsize,
    promoted_bytes: AtomicUsize,
    failure: Mutex<Option<AllocationError>>,
}

impl Evacuator {
    pub fn new(
        heap: HeapId,
        spaces: Arc<LocalSpaces>,
        binding: Arc<dyn VMBinding>,
        promotion_age: u8,
    ) -> Self {
        Self {
            heap,
            spaces,
            binding,
            promotion_age,
            weak_slots: Mutex::new(vec![]),
            copied_bytes: AtomicUsize::new(0),
            promoted_bytes: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    pub fn take_weak_slots(&self) -> Vec<Address> {
        std::mem::take(&mut *self.weak_slots.lock().unwrap())
    }

    /// Bytes copied into the young generation.
    pub fn copied_bytes(&self) -> usize {
        self.copied_bytes.load(Ordering::Relaxed)
    }

    /// Bytes copied into old space.
    pub fn promoted_bytes(&self) -> usize {
        self.promoted_bytes.load(Ordering::Relaxed)
    }

    /// The error of the first copy that found no space, if any.
    pub fn failure(&self) -> Option<AllocationError> {
        *self.failure.lock().unwrap()
    }

    /// Space for a survivor of age `age`. Returns the address and whether it is in old
    /// space.
    fn allocate_survivor(&self, size: usize, age: u8) -> Result<(Address, bool), AllocationError> {
        if age < self.promotion_age {
            if let Some(addr) = self.spaces.young.lock().unwrap().allocate_survivor(size, true) {
                return Ok((addr, false));
            }
        }
        match self.spaces.old.lock().unwrap().allocate(size) {
            Ok(addr) => return Ok((addr, true)),
            Err(e) => debug!("Promotion of {} bytes failed ({}), keeping it young", size, e),
        }
        self.spaces
            .young
            .lock()
            .unwrap()
            .allocate_survivor(size, false)
            .map(|addr| (addr, false))
            .ok_or(AllocationError::MmapOutOfMemory)
    }

    fn fail(&self, object: ObjectReference, err: AllocationError) -> ObjectReference {
        error!("No space to evacuate {}: {}", object, err);
        self.failure.lock().unwrap().get_or_insert(err);
        // Let racing evacuators proceed. The heap is abandoned once the phase is over.
        forward_object(object, object);
        object
    }

    /// Copy a young object, or return its copy if another evacuator won.
    fn evacuate(&self, object: ObjectReference, out: &mut Vec<Address>) -> ObjectReference {
        let header = match attempt_to_forward(object) {
            ForwardingAttempt::Forwarded(new) => return new,
            ForwardingAttempt::Won(header) => header,
        };
        let size = header.size();
        let age = header.age().saturating_add(1);
        let (addr, promoted) = match self.allocate_survivor(size, age) {
            Ok(result) => result,
            Err(e) => return self.fail(object, e),
        };
        let new = unsafe { copy_object(object, addr, header.with_age(age)) };
        forward_object(object, new);
        if promoted {
            self.promoted_bytes.fetch_add(size, Ordering::Relaxed);
        } else {
            self.copied_bytes.fetch_add(size, Ordering::Relaxed);
        }
        out.extend(new.slots());
        new
    }

    /// Copy a marked object of a compacted region into old space.
    fn compact(&self, object: ObjectReference) {
        let header = match attempt_to_forward(object) {
            ForwardingAttempt::Forwarded(_) => return,
            ForwardingAttempt::Won(header) => header,
        };
        let addr = match self.spaces.old.lock().unwrap().allocate_forced(header.size()) {
            Ok(addr) => addr,
            Err(e) => {
                self.fail(object, e);
                return;
            }
        };
        let new = unsafe { copy_object(object, addr, header) };
        forward_object(object, new);
        self.promoted_bytes.fetch_add(header.size(), Ordering::Relaxed);
    }
}

/// Is `object` in the collect set of `heap`? `None` if it is shared, `Some(false)` if it is
/// a local object outside the collect set.
fn collect_set_status(object: ObjectReference, heap: HeapId) -> Option<bool> {
    let status = region_map::with_region(object.to_raw_address(), |r| {
        if r.is_shared() {
            None
        } else {
            Some(r.has_flag(RegionFlag::InCollectSet) && r.owner() == heap)
        }
    });
    debug_assert!(status.is_some(), "{} is not in any region", object);
    status.flatten()
}

fn evacuate_slot(ev: &Evacuator, slot: Address, out: &mut Vec<Address>) {
    let value = load_slot(slot);
    let kind = ev.binding.classify(value);
    if !kind.is_reference() {
        return;
    }
    let Some(object) = value.as_object() else {
        return;
    };
    match collect_set_status(object, ev.heap) {
        None => {
            barrier::record_slot(slot, object);
        }
        Some(false) => {}
        Some(true) if kind == ValueKind::Weak => ev.weak_slots.lock().unwrap().push(slot),
        Some(true) => {
            let new = ev.evacuate(object, out);
            store_slot(slot, value.with_object(new));
            barrier::record_slot(slot, new);
        }
    }
}

/// Evacuate everything in the collect set reachable from `roots`.
pub(crate) fn evacuate_young(
    pool: Option<&WorkerPool>,
    id: TaskId,
    ev: &Arc<Evacuator>,
    roots: Vec<Address>,
) {
    if roots.is_empty() {
        return;
    }
    let packets = Arc::new(WorkPackets::from_items(roots, DEFAULT_PACKET_SIZE));
    run_phase(pool, id, packets, ev.clone(), evacuate_slot);
}

fn compact_region(ev: &Evacuator, region: Arc<Region>, _: &mut Vec<Arc<Region>>) {
    for object in region.marked_objects() {
        if object.header().state() == HeaderState::Object {
            ev.compact(object);
        }
    }
}

/// Copy the marked objects of `regions` into old space. Pointers are left stale until
/// [`fixup`] runs.
pub(crate) fn compact(pool: Option<&WorkerPool>, id: TaskId, ev: &Arc<Evacuator>, regions: Vec<Arc<Region>>) {
    if regions.is_empty() {
        return;
    }
    let packets = Arc::new(WorkPackets::from_items(regions, 1));
    run_phase(pool, id, packets, ev.clone(), compact_region);
}

/// Update the slot if its referent was compacted. Returns the (new) referent.
fn fixup_slot(heap: HeapId, binding: &dyn VMBinding, slot: Address) -> Option<ObjectReference> {
    let value = load_slot(slot);
    if !binding.classify(value).is_reference() {
        return None;
    }
    let object = value.as_object()?;
    if collect_set_status(object, heap) == Some(true) {
        let new = get_forwarded_object(object)?;
        store_slot(slot, value.with_object(new));
        return Some(new);
    }
    Some(object)
}

struct Fixup {
    heap: HeapId,
    binding: Arc<dyn VMBinding>,
}

fn fixup_region(fixup: &Fixup, region: Arc<Region>, _: &mut Vec<Arc<Region>>) {
    // The young generation is empty after compaction, so no old slot can refer into it.
    region.clear_remset();
    region.clear_cross_set();
    for object in region.objects() {
        for slot in object.slots() {
            if let Some(target) = fixup_slot(fixup.heap, fixup.binding.as_ref(), slot) {
                let shared = region_map::with_region(target.to_raw_address(), |r| r.is_shared());
                if shared == Some(true) {
                    region.record_cross_slot(slot);
                }
            }
        }
    }
}

/// Point every slot of `regions` and every root at the compacted copies, and rebuild the
/// regions' cross sets.
pub(crate) fn fixup(
    pool: Option<&WorkerPool>,
    id: TaskId,
    heap: HeapId,
    binding: &Arc<dyn VMBinding>,
    regions: Vec<Arc<Region>>,
    roots: &[Address],
) {
    for slot in roots {
        fixup_slot(heap, binding.as_ref(), *slot);
    }
    if regions.is_empty() {
        return;
    }
    let packets = Arc::new(WorkPackets::from_items(regions, 1));
    let ctx = Arc::new(Fixup {
        heap,
        binding: binding.clone(),
    });
    run_phase(pool, id, packets, ctx, fixup_region);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::heap::LocalSpaces;
    use crate::policy::region::SHARED_HEAP_ID;
    use crate::policy::region_allocator::RegionAllocator;
    use crate::policy::space::SpaceKind;
    use crate::util::object_model::initialize_object;
    use crate::util::options::Options;
    use crate::util::tagged::TaggedValue;
    use crate::util::test_util::fixtures::RegionFixture;
    use crate::vm::DefaultBinding;

    const HEAP: HeapId = 9;

    fn spaces() -> Arc<LocalSpaces> {
        let mut options = Options::default();
        options.young_semispace_size = crate::util::constants::BYTES_IN_REGION;
        let allocator = Arc::new(RegionAllocator::new(&options));
        Arc::new(LocalSpaces::new(HEAP, &options, allocator))
    }

    fn young_object(spaces: &LocalSpaces, slots: usize, age: u8) -> ObjectReference {
        let size = crate::util::constants::OBJECT_HEADER_BYTES + slots * 8;
        let addr = spaces.young.lock().unwrap().allocate(size).unwrap();
        initialize_object(addr, size, age)
    }

    #[test]
    fn survivors_are_copied_or_promoted_by_age() {
        let spaces = spaces();
        let shared = RegionFixture::with_kind(SpaceKind::SharedOld, SHARED_HEAP_ID);
        let shared_object = shared.object(0);
        let root = young_object(&spaces, 3, 0);
        let old_enough = young_object(&spaces, 0, 1);
        let weakly_held = young_object(&spaces, 0, 0);
        root.set_field_unbarriered(0, TaggedValue::from_object(old_enough));
        root.set_field_unbarriered(1, TaggedValue::weak_from_object(weakly_held));
        root.set_field_unbarriered(2, TaggedValue::from_object(shared_object));

        let root_cell = std::sync::atomic::AtomicU64::new(0);
        let root_slot = Address::from_ref(&root_cell);
        store_slot(root_slot, TaggedValue::from_object(root));

        let from = spaces.young.lock().unwrap().start_evacuation();
        let ev = Arc::new(Evacuator::new(HEAP, spaces.clone(), Arc::new(DefaultBinding), 2));
        evacuate_young(None, 0, &ev, vec![root_slot]);
        spaces.young.lock().unwrap().finish_evacuation();

        let new_root = load_slot(root_slot).as_object().unwrap();
        assert_ne!(new_root, root);
        assert_eq!(new_root.age(), 1);
        let promoted = new_root.get_field(0).as_object().unwrap();
        let promoted_region = region_map::region_of_object(promoted).unwrap();
        assert_eq!(promoted_region.kind(), SpaceKind::Old);
        // The promoted object is not young, the weak slot is left for weak processing.
        assert!(region_map::region_of_object(new_root).unwrap().kind().is_young());
        assert_eq!(ev.take_weak_slots(), vec![new_root.slot(1)]);
        assert!(region_map::region_of_object(new_root)
            .unwrap()
            .cross_set
            .is_set(new_root.slot(2)));
        assert_eq!(ev.promoted_bytes(), promoted.size());
        assert_eq!(ev.copied_bytes(), new_root.size());
        assert!(ev.failure().is_none());

        let young = spaces.young.lock().unwrap();
        for region in from {
            young.common().release_region(region);
        }
        drop(young);
        spaces.release_all();
    }

    #[test]
    fn compaction_and_fixup_move_marked_objects() {
        let spaces = spaces();
        let holder_region = RegionFixture::new(HEAP);
        let holder = holder_region.object(2);
        let live = young_object(&spaces, 0, 0);
        let dead = young_object(&spaces, 0, 0);
        holder.set_field_unbarriered(0, TaggedValue::from_object(live));
        let live_region = region_map::region_of_object(live).unwrap();
        live_region.try_mark(live);
        holder_region.region().remember_slot(holder.slot(0));

        let cset = spaces.young.lock().unwrap().start_evacuation();
        let ev = Arc::new(Evacuator::new(HEAP, spaces.clone(), Arc::new(DefaultBinding), 2));
        compact(None, 0, &ev, cset.clone());
        assert!(get_forwarded_object(dead).is_none());
        let binding: Arc<dyn VMBinding> = Arc::new(DefaultBinding);
        fixup(None, 0, HEAP, &binding, vec![holder_region.region().clone()], &[]);

        let moved = holder.get_field(0).as_object().unwrap();
        assert_ne!(moved, live);
        assert_eq!(region_map::region_of_object(moved).unwrap().kind(), SpaceKind::Old);
        assert!(holder_region.region().remset.is_empty());

        let young = spaces.young.lock().unwrap();
        for region in cset {
            young.common().release_region(region);
        }
        drop(young);
        spaces.release_all();
    }
}
