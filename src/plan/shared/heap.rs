use super::collect_set;
use super::daemon::Daemon;
use super::SharedPhase;
use crate::plan::heap::Heap;
use crate::plan::safepoint::SafepointController;
use crate::plan::trigger::SharedTrigger;
use crate::plan::{Cycle, GCKind, GCReason};
use crate::policy::hugespace::HugeObjectSpace;
use crate::policy::oldspace::OldSpace;
use crate::policy::region::{HeapId, Region, SHARED_HEAP_ID};
use crate::policy::region_allocator::RegionAllocator;
use crate::policy::region_map;
use crate::policy::space::{CommonSpace, Space, SpaceBudget, SpaceKind};
use crate::scheduler::WorkerPool;
use crate::util::alloc::AllocationError;
use crate::util::handles::{GlobalHandle, GlobalsPin, HandleStorage};
use crate::util::object_model::{initialize_object, store_slot};
use crate::util::options::Options;
use crate::util::statistics::{Stats, StatsSnapshot};
use crate::util::tagged::{TaggedValue, ValueKind};
use crate::util::{Address, ObjectReference};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

pub(super) struct SharedSpaces {
    pub old: OldSpace,
    pub huge: HugeObjectSpace,
}

impl SharedSpaces {
    pub fn regions(&self) -> Vec<Arc<Region>> {
        let mut regions = self.old.regions().to_vec();
        regions.extend_from_slice(self.huge.regions());
        regions
    }
}

pub(super) struct CycleState {
    pub phase: SharedPhase,
    pub cycle: Option<Cycle>,
    /// Regions a partial cycle sweeps. Empty for full cycles.
    pub collect_set: Vec<Arc<Region>>,
}

/// Objects greyed by the insertion barrier while the daemon marks.
#[derive(Default)]
pub(super) struct BarrierBuffer {
    pub grey: Vec<ObjectReference>,
    /// Slots of shared objects that received a weak value during marking.
    pub weak_slots: Vec<Address>,
    /// Set when `grey` outgrew `marking_buffer_limit`. Marking is then redone in the final
    /// pause.
    pub overflowed: bool,
}

pub struct SharedHeap {
    pub(super) options: Options,
    pub(super) pool: Option<Arc<WorkerPool>>,
    allocator: Arc<RegionAllocator>,
    safepoint: SafepointController,
    next_heap_id: AtomicU32,
    heaps: Mutex<HashMap<HeapId, Weak<Heap>>>,
    pub(super) spaces: Mutex<SharedSpaces>,
    pub(super) state: Mutex<CycleState>,
    pub(super) finished: Condvar,
    next_cycle: AtomicU64,
    marking_active: AtomicBool,
    pub(super) barrier_buffer: Mutex<BarrierBuffer>,
    pub(super) handles: Arc<HandleStorage>,
    pub(super) trigger: Mutex<SharedTrigger>,
    trigger_pending: AtomicBool,
    pub(super) stats: Stats,
    daemon: Daemon,
}

impl SharedHeap {
    /// Create a shared heap with its daemon thread. Every heap sharing objects with each
    /// other must be created with the same shared heap.
    pub fn new(options: Options, pool: Option<Arc<WorkerPool>>) -> Arc<SharedHeap> {
        let allocator = Arc::new(RegionAllocator::new(&options));
        let budget = Arc::new(SpaceBudget::new(options.shared_heap_size));
        let common = |kind| CommonSpace::new(kind, SHARED_HEAP_ID, allocator.clone(), budget.clone());
        let spaces = SharedSpaces {
            old: OldSpace::new(common(SpaceKind::SharedOld)),
            huge: HugeObjectSpace::new(common(SpaceKind::SharedHuge)),
        };
        let pool = pool.filter(|_| options.parallel_gc);
        let shared = Arc::new_cyclic(|weak: &Weak<SharedHeap>| SharedHeap {
            trigger: Mutex::new(SharedTrigger::new(&options)),
            daemon: Daemon::spawn(weak.clone()),
            options,
            pool,
            allocator: allocator.clone(),
            safepoint: SafepointController::new(),
            next_heap_id: AtomicU32::new(SHARED_HEAP_ID + 1),
            heaps: Mutex::new(HashMap::new()),
            spaces: Mutex::new(spaces),
            state: Mutex::new(CycleState {
                phase: SharedPhase::Idle,
                cycle: None,
                collect_set: vec![],
            }),
            finished: Condvar::new(),
            next_cycle: AtomicU64::new(1),
            marking_active: AtomicBool::new(false),
            barrier_buffer: Mutex::new(BarrierBuffer::default()),
            handles: Arc::new(HandleStorage::new()),
            trigger_pending: AtomicBool::new(false),
            stats: Stats::default(),
        });
        info!("Shared heap created");
        shared
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn region_allocator(&self) -> &Arc<RegionAllocator> {
        &self.allocator
    }

    pub fn safepoint(&self) -> &SafepointController {
        &self.safepoint
    }

    pub(super) fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_deref()
    }

    // Heap registry

    pub(crate) fn next_heap_id(&self) -> HeapId {
        self.next_heap_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make `heap` a mutator of this shared heap. Called on the heap's mutator thread.
    pub(crate) fn register_heap(&self, heap: &Arc<Heap>) {
        self.heaps.lock().unwrap().insert(heap.id(), Arc::downgrade(heap));
        self.safepoint.register(heap.id());
    }

    pub(crate) fn deregister_heap(&self, id: HeapId) {
        self.heaps.lock().unwrap().remove(&id);
        self.safepoint.deregister(id);
    }

    /// Heaps that are still alive. Only used while every mutator is stopped.
    pub(super) fn live_heaps(&self) -> Vec<Arc<Heap>> {
        self.heaps
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.lock().unwrap().len()
    }

    // Regions and allocation

    /// A fresh shared allocation region, charged to the shared budget but not yet part of
    /// shared old space.
    pub fn new_region(&self) -> Result<Arc<Region>, AllocationError> {
        self.spaces.lock().unwrap().old.common().acquire_region(1)
    }

    /// Admit a region into shared old space. Its objects count as live until the next
    /// marking says otherwise.
    pub fn add_region(&self, region: Arc<Region>) {
        debug_assert!(region.is_shared(), "{} is not a shared region", region);
        if !self.is_marking_active() {
            region.set_live_bytes(region.allocated_bytes());
        }
        trace!("Admitting {} into shared old space", region);
        self.spaces.lock().unwrap().old.adopt_region(region);
    }

    /// Admit the shared allocation regions of every heap. Only called while every mutator
    /// is stopped.
    pub(super) fn admit_allocation_regions(&self, heaps: &[Arc<Heap>]) -> usize {
        let mut admitted = 0;
        for heap in heaps {
            if let Some(region) = heap.take_shared_buffer() {
                self.add_region(region);
                admitted += 1;
            }
        }
        admitted
    }

    fn allocate_regular(
        &self,
        buffer: &Mutex<Option<Arc<Region>>>,
        size: usize,
    ) -> Result<Address, AllocationError> {
        let mut buffer = buffer.lock().unwrap();
        let bump = |region: &Arc<Region>| {
            let addr = region.bump_allocate(size)?;
            region.alloc_table.set(addr);
            Some(addr)
        };
        if let Some(addr) = buffer.as_ref().and_then(bump) {
            return Ok(addr);
        }
        if let Some(addr) = self.spaces.lock().unwrap().old.allocate_from_free_lists(size) {
            return Ok(addr);
        }
        let region = self.new_region()?;
        let addr = bump(&region).ok_or(AllocationError::HeapOutOfMemory)?;
        if let Some(full) = buffer.replace(region) {
            self.add_region(full);
        }
        Ok(addr)
    }

    /// Allocate a shared object of `size` bytes. Small objects go to `buffer`, the calling
    /// heap's shared allocation region. While the shared heap is marking, new objects are
    /// allocated marked.
    pub(crate) fn allocate_object(
        &self,
        buffer: &Mutex<Option<Arc<Region>>>,
        size: usize,
    ) -> Result<ObjectReference, AllocationError> {
        let addr = if size >= self.options.huge_object_threshold {
            self.spaces.lock().unwrap().huge.allocate(size)?
        } else {
            self.allocate_regular(buffer, size)?
        };
        let object = initialize_object(addr, size, 0);
        if self.is_marking_active() {
            region_map::with_region(addr, |r| r.try_mark(object));
        }
        if self.trigger.lock().unwrap().allocated(size) {
            self.trigger_pending.store(true, Ordering::Release);
        }
        Ok(object)
    }

    /// Start a shared cycle if allocations crossed the concurrent limit since the last one.
    /// Called by `requester` before a shared allocation.
    pub(crate) fn poll_trigger(&self, requester: HeapId) {
        if !self.trigger_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.phase() != SharedPhase::Idle {
            // The cycle in progress resets the trigger when it is done.
            return;
        }
        let kind = if self.partial_candidate_count() >= self.options.min_partial_regions {
            GCKind::SharedPartial
        } else {
            GCKind::SharedFull
        };
        debug!(
            "Shared heap over its concurrent limit of {} bytes, requesting {}",
            self.trigger.lock().unwrap().concurrent_limit(),
            kind
        );
        if self.options.concurrent_marking {
            self.start_concurrent_mark(kind, GCReason::AllocationLimit);
        } else {
            self.collect(kind, GCReason::AllocationLimit, Some(requester));
        }
    }

    // Barrier

    pub fn is_marking_active(&self) -> bool {
        self.marking_active.load(Ordering::Acquire)
    }

    pub(super) fn set_marking_active(&self, active: bool) {
        self.marking_active.store(active, Ordering::Release);
    }

    /// Mark a shared object found by the insertion barrier. Newly marked objects are queued
    /// for the daemon to scan.
    pub(crate) fn grey(&self, object: ObjectReference) {
        let newly_marked = region_map::with_region(object.to_raw_address(), |r| {
            r.is_shared() && r.try_mark(object)
        });
        if newly_marked != Some(true) {
            return;
        }
        let mut buffer = self.barrier_buffer.lock().unwrap();
        if buffer.overflowed {
            return;
        }
        buffer.grey.push(object);
        if buffer.grey.len() > self.options.marking_buffer_limit {
            buffer.overflowed = true;
            buffer.grey.clear();
        }
    }

    /// Store `value` into field `index` of shared object `object`.
    pub fn write_field(&self, object: ObjectReference, index: usize, value: TaggedValue) {
        self.write_field_classified(object, index, value, value.kind())
    }

    /// Store `value`, which the storing heap's binding classified as `kind`.
    pub(crate) fn write_field_classified(
        &self,
        object: ObjectReference,
        index: usize,
        value: TaggedValue,
        kind: ValueKind,
    ) {
        let target = value.as_object().filter(|_| kind.is_reference());
        if let Some(target) = target {
            let shared = region_map::with_region(target.to_raw_address(), |r| r.is_shared());
            assert!(
                shared == Some(true),
                "shared object {} field {} refers to local object {}",
                object,
                index,
                target
            );
        }
        let slot = object.slot(index);
        store_slot(slot, value);
        if let (Some(target), true) = (target, self.is_marking_active()) {
            match kind {
                ValueKind::Weak => self.barrier_buffer.lock().unwrap().weak_slots.push(slot),
                _ => self.grey(target),
            }
        }
    }

    // Handles

    pub fn handle_storage(&self) -> &HandleStorage {
        &self.handles
    }

    pub(crate) fn pin_handles(&self) -> GlobalsPin {
        self.handles.pin_globals()
    }

    /// A persistent strong root to a shared object, not tied to any heap.
    pub fn global(&self, value: TaggedValue) -> GlobalHandle {
        GlobalHandle::new(self.handles.clone(), value)
    }

    // Cycles

    pub fn phase(&self) -> SharedPhase {
        self.state.lock().unwrap().phase
    }

    pub(super) fn new_cycle(&self, kind: GCKind, reason: GCReason) -> Cycle {
        Cycle {
            id: self.next_cycle.fetch_add(1, Ordering::Relaxed),
            kind,
            reason,
        }
    }

    /// Number of admitted regions a partial cycle would pick right now.
    pub fn partial_candidate_count(&self) -> usize {
        collect_set::select(&self.spaces.lock().unwrap().old, &self.options).len()
    }

    /// Regions in the collect set of the cycle in progress.
    pub fn collect_set_len(&self) -> usize {
        self.state.lock().unwrap().collect_set.len()
    }

    /// Whether `object` lives in a region of the collect set of the cycle in progress.
    pub fn in_collect_set(&self, object: ObjectReference) -> bool {
        let Some(region) = region_map::region_of_object(object) else {
            return false;
        };
        self.state
            .lock()
            .unwrap()
            .collect_set
            .iter()
            .any(|r| Arc::ptr_eq(r, &region))
    }

    pub fn can_start_concurrent_mark(&self) -> bool {
        self.options.concurrent_marking
            && self.phase() == SharedPhase::Idle
            && self.partial_candidate_count() >= self.options.min_partial_regions
    }

    /// Claim the cycle for `cycle`, picking the collect set of a partial cycle. A partial
    /// cycle without candidates becomes a full one.
    pub(super) fn claim(&self, state: &mut MutexGuard<'_, CycleState>, mut cycle: Cycle) -> Cycle {
        debug_assert_eq!(state.phase, SharedPhase::Idle);
        state.phase = SharedPhase::SelectingCollectSet;
        if cycle.kind == GCKind::SharedPartial {
            let selected = collect_set::select(&self.spaces.lock().unwrap().old, &self.options);
            if selected.is_empty() {
                debug!("No partial collection candidates, upgrading {} to a full cycle", cycle);
                cycle.kind = GCKind::SharedFull;
            }
            state.collect_set = selected;
        }
        state.cycle = Some(cycle);
        debug!(
            "Shared cycle {} claimed with {} collect set regions",
            cycle,
            state.collect_set.len()
        );
        cycle
    }

    /// Hand a cycle to the daemon thread. Returns false if a cycle is already running.
    pub fn start_concurrent_mark(&self, kind: GCKind, reason: GCReason) -> bool {
        debug_assert!(kind.is_shared());
        let mut state = self.state.lock().unwrap();
        if state.phase != SharedPhase::Idle {
            debug!("Shared {} ({}) coalesced with the cycle in progress", kind, reason);
            self.stats.coalesced();
            return false;
        }
        let cycle = self.new_cycle(kind, reason);
        let cycle = self.claim(&mut state, cycle);
        drop(state);
        debug!("Shared cycle {} handed to the daemon", cycle);
        self.daemon.request(cycle);
        true
    }

    /// Block until no shared cycle is in progress. `heap` is parked while it waits so the
    /// cycle can stop it.
    pub fn wait_until_finished(&self, heap: HeapId) {
        let _parked = self.safepoint.parked_scope(heap);
        let mut state = self.state.lock().unwrap();
        while state.phase != SharedPhase::Idle {
            state = self.finished.wait(state).unwrap();
        }
    }

    /// Run a stop-the-world shared cycle on the calling thread, after any cycle in
    /// progress. `requester` is the calling mutator, if the caller is one.
    pub fn collect(&self, kind: GCKind, reason: GCReason, requester: Option<HeapId>) -> bool {
        debug_assert!(kind.is_shared());
        let cycle = {
            let _parked = requester.map(|id| self.safepoint.parked_scope(id));
            let mut state = self.state.lock().unwrap();
            while state.phase != SharedPhase::Idle {
                state = self.finished.wait(state).unwrap();
            }
            let cycle = self.new_cycle(kind, reason);
            self.claim(&mut state, cycle)
        };
        self.run_stop_the_world_cycle(cycle, requester);
        true
    }

    /// The cycle is over: go back to idle and wake the waiters.
    pub(super) fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.phase = SharedPhase::Idle;
        state.cycle = None;
        state.collect_set.clear();
        self.finished.notify_all();
    }

    // Sizes and statistics

    pub fn committed_size(&self) -> usize {
        let spaces = self.spaces.lock().unwrap();
        spaces.old.common().budget.used()
    }

    /// Bytes allocated in admitted shared regions.
    pub fn object_size(&self) -> usize {
        let spaces = self.spaces.lock().unwrap();
        spaces.old.allocated_size() + spaces.huge.allocated_size()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for SharedHeap {
    fn drop(&mut self) {
        self.daemon.shutdown();
        let spaces = self.spaces.get_mut().unwrap();
        spaces.old.release_all();
        spaces.huge.release_all();
        info!("Shared heap destroyed");
    }
}
