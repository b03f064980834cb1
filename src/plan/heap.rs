//! The per-context heap.
//!
//! A [`Heap`] belongs to one execution context and is used by the thread running it (the
//! mutator). It owns a young space, an old space, a non-movable space and a huge-object
//! space, and runs young, old and full cycles on the mutator thread. Shared allocations and
//! shared cycles are handed to the [`SharedHeap`] the heap was created with.

use crate::plan::barrier;
use crate::plan::evacuation::{self, Evacuator};
use crate::plan::marking::{mark_closure, MarkScope, Marker};
use crate::plan::safepoint::ParkedScope;
use crate::plan::shared::SharedHeap;
use crate::plan::sweep::{sweep_all, SweepItem, SweptRegion};
use crate::plan::trigger::HeapTrigger;
use crate::plan::{helper_task_id, release_task_id, Cycle, CycleSummary, GCKind, GCReason};
use crate::policy::hugespace::HugeObjectSpace;
use crate::policy::oldspace::OldSpace;
use crate::policy::region::{HeapId, Region, RegionFlag};
use crate::policy::region_allocator::RegionAllocator;
use crate::policy::region_map;
use crate::policy::semispace::YoungSpace;
use crate::policy::space::{CommonSpace, Space, SpaceBudget, SpaceKind};
use crate::scheduler::{task, WorkerPool};
use crate::util::alloc::{AllocationError, AllocationKind};
use crate::util::conversions::object_size_for_payload;
use crate::util::handles::{GlobalHandle, GlobalsPin, HandleStorage, WeakHandle};
use crate::util::object_model::{initialize_object, load_slot, store_slot};
use crate::util::options::Options;
use crate::util::reference_processor::ReferenceProcessor;
use crate::util::statistics::{Stats, StatsSnapshot};
use crate::util::tagged::{TaggedValue, ValueKind};
use crate::util::verify::{self, VerifyReport};
use crate::util::{Address, ObjectReference};
use crate::vm::VMBinding;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The spaces of one heap. Parallel phases get them through an `Arc`.
pub(crate) struct LocalSpaces {
    pub young: Mutex<YoungSpace>,
    pub old: Mutex<OldSpace>,
    pub non_movable: Mutex<OldSpace>,
    pub huge: Mutex<HugeObjectSpace>,
}

impl LocalSpaces {
    pub fn new(id: HeapId, options: &Options, allocator: Arc<RegionAllocator>) -> Self {
        let common = |kind, budget: &Arc<SpaceBudget>| {
            CommonSpace::new(kind, id, allocator.clone(), budget.clone())
        };
        // The young generation is bounded by its half size, not by a budget.
        let young_budget = Arc::new(SpaceBudget::new(usize::MAX));
        let old_budget = Arc::new(SpaceBudget::new(options.old_space_size));
        Self {
            young: Mutex::new(YoungSpace::new(
                common(SpaceKind::Young, &young_budget),
                options.young_semispace_size,
            )),
            old: Mutex::new(OldSpace::new(common(SpaceKind::Old, &old_budget))),
            non_movable: Mutex::new(OldSpace::new(common(SpaceKind::NonMovable, &old_budget))),
            huge: Mutex::new(HugeObjectSpace::new(common(SpaceKind::Huge, &old_budget))),
        }
    }

    pub fn young_regions(&self) -> Vec<Arc<Region>> {
        self.young.lock().unwrap().regions().to_vec()
    }

    /// Regions of the old, non-movable and huge spaces.
    pub fn old_regions(&self) -> Vec<Arc<Region>> {
        let mut regions = self.old.lock().unwrap().regions().to_vec();
        regions.extend_from_slice(self.non_movable.lock().unwrap().regions());
        regions.extend_from_slice(self.huge.lock().unwrap().regions());
        regions
    }

    pub fn all_regions(&self) -> Vec<Arc<Region>> {
        let mut regions = self.young_regions();
        regions.extend(self.old_regions());
        regions
    }

    /// Bytes charged to the old space budget, which the non-movable and huge spaces share.
    pub fn old_bytes(&self) -> usize {
        self.old.lock().unwrap().common().budget.used()
    }

    pub fn committed(&self) -> usize {
        self.young.lock().unwrap().committed_size()
            + self.old.lock().unwrap().committed_size()
            + self.non_movable.lock().unwrap().committed_size()
            + self.huge.lock().unwrap().committed_size()
    }

    pub fn allocated(&self) -> usize {
        self.young.lock().unwrap().allocated_size()
            + self.old.lock().unwrap().allocated_size()
            + self.non_movable.lock().unwrap().allocated_size()
            + self.huge.lock().unwrap().allocated_size()
    }

    pub fn release_all(&self) {
        self.young.lock().unwrap().release_all();
        self.old.lock().unwrap().release_all();
        self.non_movable.lock().unwrap().release_all();
        self.huge.lock().unwrap().release_all();
    }
}

/// Regions waiting to be returned to the region allocator. The regions are released when
/// this is dropped, whether the release task ran or was discarded by the pool.
struct PendingRelease {
    allocator: Arc<RegionAllocator>,
    regions: Vec<Arc<Region>>,
    done: Sender<usize>,
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        let count = self.regions.len();
        for region in self.regions.drain(..) {
            self.allocator.release(region);
        }
        // The heap may be gone already.
        let _ = self.done.send(count);
    }
}

/// Where an allocation request is served from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum AllocationTarget {
    Young,
    Old,
    NonMovable,
    Huge,
    Shared,
}

type GCListener = Arc<dyn Fn(&CycleSummary) + Send + Sync>;

const ESCALATION: [GCKind; 4] = [GCKind::Young, GCKind::Old, GCKind::Full, GCKind::SharedFull];

pub struct Heap {
    id: HeapId,
    options: Options,
    shared: Arc<SharedHeap>,
    pool: Option<Arc<WorkerPool>>,
    binding: Arc<dyn VMBinding>,
    allocator: Arc<RegionAllocator>,
    spaces: Arc<LocalSpaces>,
    handles: Arc<HandleStorage>,
    trigger: Mutex<HeapTrigger>,
    gc_in_progress: AtomicBool,
    next_cycle: AtomicU64,
    pending_release: Mutex<Vec<Receiver<usize>>>,
    has_pending_release: AtomicBool,
    stats: Stats,
    listeners: Mutex<Vec<(usize, GCListener)>>,
    next_listener: AtomicUsize,
    /// The region receiving this heap's shared allocations until the shared heap admits it.
    shared_buffer: Mutex<Option<Arc<Region>>>,
    native_bytes: AtomicUsize,
}

impl Heap {
    /// Create a heap for the calling thread's execution context. The thread becomes a
    /// registered mutator of `shared` and must poll safepoints (allocation and collection
    /// poll implicitly) or stay in a [`Heap::parked_scope`] while it is not using the heap.
    /// `pool` runs parallel phases; without one every phase runs on the mutator thread.
    pub fn new(
        options: Options,
        shared: Arc<SharedHeap>,
        pool: Option<Arc<WorkerPool>>,
        binding: Arc<dyn VMBinding>,
    ) -> Arc<Heap> {
        let id = shared.next_heap_id();
        let allocator = shared.region_allocator().clone();
        let pool = pool.filter(|_| options.parallel_gc);
        let heap = Arc::new(Heap {
            id,
            trigger: Mutex::new(HeapTrigger::new(&options)),
            spaces: Arc::new(LocalSpaces::new(id, &options, allocator.clone())),
            options,
            shared: shared.clone(),
            pool,
            binding,
            allocator,
            handles: Arc::new(HandleStorage::new()),
            gc_in_progress: AtomicBool::new(false),
            next_cycle: AtomicU64::new(1),
            pending_release: Mutex::new(vec![]),
            has_pending_release: AtomicBool::new(false),
            stats: Stats::default(),
            listeners: Mutex::new(vec![]),
            next_listener: AtomicUsize::new(0),
            shared_buffer: Mutex::new(None),
            native_bytes: AtomicUsize::new(0),
        });
        shared.register_heap(&heap);
        debug!("Heap {} created", id);
        heap
    }

    pub fn id(&self) -> HeapId {
        self.id
    }

    pub fn shared(&self) -> &Arc<SharedHeap> {
        &self.shared
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn handle_storage(&self) -> &HandleStorage {
        &self.handles
    }

    /// Keep global handle slots allocated while a cycle uses their addresses.
    pub(crate) fn pin_handles(&self) -> GlobalsPin {
        self.handles.pin_globals()
    }

    /// A persistent strong root.
    pub fn global(&self, value: TaggedValue) -> GlobalHandle {
        GlobalHandle::new(self.handles.clone(), value)
    }

    /// A persistent weak reference to `object`.
    pub fn weak(&self, object: ObjectReference) -> WeakHandle {
        WeakHandle::new(self.handles.clone(), object)
    }

    fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_deref()
    }

    /// Park at a safepoint if a suspension is pending. Returns true if the mutator parked.
    pub fn safepoint_poll(&self) -> bool {
        self.shared.safepoint().poll(self.id)
    }

    /// Count as parked until the scope is dropped: for native code, blocking calls and any
    /// time the mutator does not touch the heap.
    pub fn parked_scope(&self) -> ParkedScope<'_> {
        self.shared.safepoint().parked_scope(self.id)
    }

    // Allocation

    fn target(&self, size: usize, kind: AllocationKind) -> AllocationTarget {
        match kind {
            AllocationKind::Shared => AllocationTarget::Shared,
            _ if size >= self.options.huge_object_threshold => AllocationTarget::Huge,
            AllocationKind::Young => AllocationTarget::Young,
            AllocationKind::Old => AllocationTarget::Old,
            AllocationKind::NonMovable => AllocationTarget::NonMovable,
        }
    }

    fn try_allocate(&self, target: AllocationTarget, size: usize) -> Result<ObjectReference, AllocationError> {
        let addr = match target {
            AllocationTarget::Young => self.spaces.young.lock().unwrap().allocate(size)?,
            AllocationTarget::Old => self.spaces.old.lock().unwrap().allocate(size)?,
            AllocationTarget::NonMovable => self.spaces.non_movable.lock().unwrap().allocate(size)?,
            AllocationTarget::Huge => self.spaces.huge.lock().unwrap().allocate(size)?,
            AllocationTarget::Shared => return self.shared.allocate_object(&self.shared_buffer, size),
        };
        Ok(initialize_object(addr, size, 0))
    }

    /// Allocate an object with `payload` bytes of zeroed slots. Collects (and escalates) as
    /// needed. Running out of memory is fatal.
    pub fn allocate(&self, payload: usize, kind: AllocationKind) -> ObjectReference {
        self.safepoint_poll();
        if self.has_pending_release.load(Ordering::Acquire) {
            self.prepare();
        }
        let size = object_size_for_payload(payload);
        let target = self.target(size, kind);
        match target {
            AllocationTarget::Shared => self.shared.poll_trigger(self.id),
            AllocationTarget::Young => {}
            _ => {
                let over_limit = {
                    let old_bytes = self.spaces.old_bytes() + size;
                    self.trigger.lock().unwrap().is_old_limit_exceeded(old_bytes)
                };
                if over_limit && !self.should_postpone_collection() {
                    self.collect(GCKind::Old, GCReason::AllocationLimit);
                }
            }
        }
        let mut result = self.try_allocate(target, size);
        if let Ok(object) = result {
            return object;
        }
        let first = match target {
            AllocationTarget::Young => self.select_gc_type(),
            AllocationTarget::Shared => GCKind::SharedFull,
            _ => GCKind::Old,
        };
        for (step, kind) in ESCALATION.iter().skip_while(|k| **k != first).enumerate() {
            if step > 0 {
                self.stats.escalated();
                info!("Heap {}: allocation of {} bytes still failing, escalating to {}", self.id, size, kind);
            }
            let reason = if step > 0 || target != AllocationTarget::Young {
                GCReason::AllocationFailed
            } else if *kind != GCKind::Young && self.native_size() > self.options.native_size_limit {
                GCReason::NativePressure
            } else {
                GCReason::AllocationLimit
            };
            self.collect(*kind, reason);
            result = self.try_allocate(target, size);
            if let Ok(object) = result {
                return object;
            }
        }
        let err = result.err().unwrap_or(AllocationError::HeapOutOfMemory);
        error!("Heap {}: allocation of {} bytes failed after every collection: {}", self.id, size, err);
        self.binding.out_of_memory(&err);
        panic!("Out of memory: {}", err);
    }

    /// The kind of cycle the policy picks next.
    pub fn select_gc_type(&self) -> GCKind {
        let postponed = self.should_postpone_collection();
        let old_bytes = self.spaces.old_bytes();
        self.trigger
            .lock()
            .unwrap()
            .select_gc_type(old_bytes, self.native_size(), postponed)
    }

    /// Whether collections other than forced ones wait, because the context is starting up
    /// or in a latency-sensitive window.
    pub fn should_postpone_collection(&self) -> bool {
        let heap_object_bytes = self.heap_object_size();
        self.trigger
            .lock()
            .unwrap()
            .should_postpone(heap_object_bytes, Instant::now())
    }

    /// Old space bytes that make the next cycle an old cycle.
    pub fn old_space_limit(&self) -> usize {
        self.trigger.lock().unwrap().old_limit()
    }

    // Embedder notifications

    /// The context is idle for about `idle`. Runs a cycle if one is due soon and is expected
    /// to fit the idle period. Returns true if a cycle ran.
    pub fn notify_idle(&self, idle: Duration) -> bool {
        if self.should_postpone_collection() {
            return false;
        }
        let young_free = {
            let young = self.spaces.young.lock().unwrap();
            young.semispace_size().saturating_sub(young.allocated_size())
        };
        let old_bytes = self.spaces.old_bytes();
        let kind = {
            let mut trigger = self.trigger.lock().unwrap();
            trigger.schedule_idle_task(young_free, old_bytes);
            trigger.take_idle_task(idle)
        };
        match kind {
            Some(kind) => {
                debug!("Heap {}: running {} in an idle period of {:?}", self.id, kind, idle);
                self.collect(kind, GCReason::Idle)
            }
            None => false,
        }
    }

    /// The process is (or is no longer) short of memory. Under pressure the heap collects
    /// fully right away and then keeps its old limit at the live bytes.
    pub fn notify_memory_pressure(&self, pressure: bool) {
        info!("Heap {}: memory pressure {}", self.id, if pressure { "on" } else { "off" });
        self.trigger.lock().unwrap().set_memory_pressure(pressure);
        if pressure {
            self.collect(GCKind::Full, GCReason::MemoryPressure);
        }
    }

    /// The context starts (`true`) or finished (`false`) starting up. Collections are
    /// postponed during startup and restrained for a while after it.
    pub fn notify_startup(&self, starting: bool) {
        let mut trigger = self.trigger.lock().unwrap();
        if starting {
            trigger.start_startup();
        } else {
            trigger.finish_startup(Instant::now());
        }
        debug!("Heap {}: startup status {:?}", self.id, trigger.startup_status());
    }

    /// The context enters (`true`) or leaves (`false`) a latency-sensitive window. The
    /// heap may grow by `sensitive_growth_limit` before collections resume. Leaving the
    /// window runs an old cycle if the old limit was crossed meanwhile.
    pub fn notify_high_sensitive(&self, sensitive: bool) {
        let heap_object_bytes = self.heap_object_size();
        self.trigger
            .lock()
            .unwrap()
            .set_high_sensitive(sensitive, heap_object_bytes);
        debug!("Heap {}: high sensitive {}", self.id, sensitive);
        if !sensitive && self.select_gc_type() != GCKind::Young {
            self.collect(GCKind::Old, GCReason::AllocationLimit);
        }
    }

    // Barrier

    /// Store `value` into field `index` of `object`, through the write barrier.
    pub fn write_field(&self, object: ObjectReference, index: usize, value: TaggedValue) {
        let shared = region_map::with_region(object.to_raw_address(), |r| {
            debug_assert!(r.is_shared() || r.owner() == self.id, "{} belongs to heap {}", object, r.owner());
            r.is_shared()
        });
        match shared {
            Some(true) => {
                self.shared
                    .write_field_classified(object, index, value, self.binding.classify(value))
            }
            Some(false) => {
                let slot = object.slot(index);
                store_slot(slot, value);
                barrier::post_write(&self.shared, slot, value, self.binding.classify(value));
            }
            None => panic!("{} is not a heap object", object),
        }
    }

    // Sizes

    /// Bytes of region memory held by this heap's spaces.
    pub fn committed_size(&self) -> usize {
        self.spaces.committed()
    }

    /// Bytes allocated in this heap's spaces, free cells included.
    pub fn heap_object_size(&self) -> usize {
        self.spaces.allocated()
    }

    pub fn native_size(&self) -> usize {
        self.native_bytes.load(Ordering::Relaxed)
    }

    /// Account for memory held outside the heap on behalf of heap objects.
    pub fn increase_native_size(&self, bytes: usize) {
        self.native_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn decrease_native_size(&self, bytes: usize) {
        let _ = self
            .native_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(bytes)));
    }

    /// The space `object` lives in, if it is a heap object.
    pub fn space_of(&self, object: ObjectReference) -> Option<SpaceKind> {
        region_map::with_region(object.to_raw_address(), |r| r.kind())
    }

    // Statistics and listeners

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Call `listener` with the summary of every local cycle. Returns an id for
    /// [`Heap::remove_gc_listener`].
    pub fn add_gc_listener(&self, listener: impl Fn(&CycleSummary) + Send + Sync + 'static) -> usize {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_gc_listener(&self, id: usize) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    pub fn verify(&self) -> VerifyReport {
        verify::verify_heap(self)
    }

    // Collection

    /// Wait for regions released in the background by the last cycle.
    pub fn prepare(&self) {
        let pending = std::mem::take(&mut *self.pending_release.lock().unwrap());
        self.has_pending_release.store(false, Ordering::Release);
        for done in pending {
            if let Ok(count) = done.recv() {
                trace!("Heap {}: {} regions released", self.id, count);
            }
        }
    }

    fn release_later(&self, regions: Vec<Arc<Region>>) {
        if regions.is_empty() {
            return;
        }
        let (done, receiver) = channel::bounded(1);
        let pending = PendingRelease {
            allocator: self.allocator.clone(),
            regions,
            done,
        };
        self.pending_release.lock().unwrap().push(receiver);
        self.has_pending_release.store(true, Ordering::Release);
        match self.pool() {
            Some(pool) => pool.post(task(release_task_id(self.id), move |_| drop(pending))),
            None => drop(pending),
        }
    }

    /// Run a cycle of `kind` on the calling thread. Shared kinds run a stop-the-world
    /// shared cycle. Returns false if the request was coalesced with a cycle in progress.
    pub fn collect(&self, kind: GCKind, reason: GCReason) -> bool {
        self.safepoint_poll();
        if kind.is_shared() {
            return self.shared.collect(kind, reason, Some(self.id));
        }
        if self.gc_in_progress.swap(true, Ordering::AcqRel) {
            debug!("Heap {}: {} ({}) coalesced with the cycle in progress", self.id, kind, reason);
            self.stats.coalesced();
            return false;
        }
        self.prepare();
        let _pin = self.pin_handles();
        let cycle = Cycle {
            id: self.next_cycle.fetch_add(1, Ordering::Relaxed),
            kind,
            reason,
        };
        debug!("Heap {}: cycle {} started", self.id, cycle);
        let start = Instant::now();
        let verify = self.options.verify_heap || cfg!(feature = "extreme_assertions");
        if verify {
            self.verify_or_panic("before", &cycle);
        }
        let mut summary = CycleSummary::new(cycle, self.id);
        summary.committed_before = self.committed_size();
        for region in self.spaces.all_regions() {
            region.clear_flag(RegionFlag::Swept);
        }
        match kind {
            GCKind::Young => self.young_cycle(&mut summary),
            GCKind::Old => self.old_cycle(&mut summary),
            GCKind::Full => self.full_cycle(&mut summary),
            GCKind::SharedPartial | GCKind::SharedFull => unreachable!(),
        }
        if verify {
            self.verify_or_panic("after", &cycle);
        }
        summary.committed_after = self.committed_size();
        summary.duration = start.elapsed();
        self.trigger.lock().unwrap().record_pause(kind, summary.duration);
        self.stats.end_cycle(&summary);
        debug!("{}", summary);
        self.gc_in_progress.store(false, Ordering::Release);
        let listeners: Vec<GCListener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&summary);
        }
        true
    }

    fn verify_or_panic(&self, when: &str, cycle: &Cycle) {
        let report = self.verify();
        assert!(report.is_ok(), "Heap {} failed verification {} {}: {}", self.id, when, cycle, report);
    }

    fn binding_roots(&self) -> Vec<Address> {
        let mut roots = vec![];
        self.binding.scan_roots(&mut |slot: Address| roots.push(slot));
        roots
    }

    /// Handle slots and binding roots.
    pub(crate) fn strong_roots(&self) -> Vec<Address> {
        let mut roots = self.handles.strong_root_slots();
        roots.extend(self.binding_roots());
        roots
    }

    fn young_cycle(&self, summary: &mut CycleSummary) {
        let young_bytes = self.spaces.young.lock().unwrap().allocated_size();
        self.evacuate_young_generation(self.strong_roots(), summary);
        self.trigger
            .lock()
            .unwrap()
            .young_cycle_done(summary.copied_bytes + summary.promoted_bytes, young_bytes);
    }

    /// Copy the live young objects out of the active half. `roots` are extended with every
    /// remembered slot.
    fn evacuate_young_generation(&self, mut roots: Vec<Address>, summary: &mut CycleSummary) {
        for region in self.spaces.old_regions() {
            if region.has_flag(RegionFlag::InRememberedSet) {
                region.clear_flag(RegionFlag::InRememberedSet);
                roots.extend(region.remset.take_all());
            }
        }
        let from = self.spaces.young.lock().unwrap().start_evacuation();
        let ev = Arc::new(Evacuator::new(
            self.id,
            self.spaces.clone(),
            self.binding.clone(),
            self.options.promotion_age,
        ));
        evacuation::evacuate_young(self.pool(), helper_task_id(self.id), &ev, roots);
        if let Some(err) = ev.failure() {
            self.binding.out_of_memory(&err);
            panic!("Out of memory during evacuation: {}", err);
        }
        self.spaces.young.lock().unwrap().finish_evacuation();

        let processor = ReferenceProcessor::new();
        processor.forward_or_clear(&ev.take_weak_slots(), self.id);
        processor.forward_or_clear(&self.handles.weak_global_slots(), self.id);

        summary.copied_bytes += ev.copied_bytes();
        summary.promoted_bytes += ev.promoted_bytes();
        summary.cleared_weak_refs += processor.cleared();
        summary.reclaimed_regions += from.len();
        self.forget_and_release(&self.spaces.young, from);
    }

    fn forget_and_release<S: Space>(&self, space: &Mutex<S>, regions: Vec<Arc<Region>>) {
        {
            let space = space.lock().unwrap();
            for region in regions.iter() {
                space.common().forget_region(region);
            }
        }
        self.release_later(regions);
    }

    /// Mark everything reachable from `roots` and clear weak references to unmarked objects.
    fn mark(&self, roots: &[Address], summary: &mut CycleSummary) {
        let regions = self.spaces.all_regions();
        for region in regions.iter() {
            region.set_live_bytes(0);
        }
        let marker = Arc::new(Marker::new(MarkScope::Local(self.id), Some(self.binding.clone())));
        let grey = marker.mark_roots(roots);
        mark_closure(self.pool(), helper_task_id(self.id), &marker, grey);
        summary.marked_bytes = regions.iter().map(|r| r.live_bytes()).sum();
        debug!(
            "Heap {}: marked {} bytes in {} objects",
            self.id,
            summary.marked_bytes,
            marker.scanned_objects()
        );

        let processor = ReferenceProcessor::new();
        let mut weak_slots = marker.take_weak_slots();
        weak_slots.extend(self.handles.weak_global_slots());
        processor.clear_unmarked(&weak_slots, |r| r.owner() == self.id);
        summary.cleared_weak_refs += processor.cleared();
    }

    /// Move young regions that are mostly live to old space. They are swept with the old
    /// regions instead of being evacuated.
    fn promote_dense_regions(&self, summary: &mut CycleSummary) -> Vec<Arc<Region>> {
        let rate = self.options.region_promotion_live_rate;
        let moved: Vec<Arc<Region>> = {
            let mut young = self.spaces.young.lock().unwrap();
            let dense: Vec<Arc<Region>> = young
                .regions()
                .iter()
                .filter(|r| r.live_rate() >= rate)
                .cloned()
                .collect();
            let mut moved = vec![];
            for region in dense.iter() {
                if let Some(region) = young.take_region(region) {
                    young.common().forget_region(&region);
                    moved.push(region);
                }
            }
            moved
        };
        let mut old = self.spaces.old.lock().unwrap();
        for region in moved.iter() {
            region.clear_flag(RegionFlag::BelowPromotionAge);
            region.set_flag(RegionFlag::Promoted);
            summary.promoted_bytes += region.live_bytes();
            old.add_region(region.clone());
        }
        if !moved.is_empty() {
            debug!("Heap {}: moved {} dense young regions to old space", self.id, moved.len());
        }
        moved
    }

    fn sweep_items(&self, moved: &[Arc<Region>]) -> Vec<SweepItem> {
        let item = |region: &Arc<Region>, huge: bool| SweepItem {
            region: region.clone(),
            huge,
            remember_young: moved.iter().any(|m| Arc::ptr_eq(m, region)),
        };
        let mut items: Vec<SweepItem> = vec![];
        items.extend(self.spaces.old.lock().unwrap().regions().iter().map(|r| item(r, false)));
        items.extend(self.spaces.non_movable.lock().unwrap().regions().iter().map(|r| item(r, false)));
        items.extend(self.spaces.huge.lock().unwrap().regions().iter().map(|r| item(r, true)));
        items
    }

    /// Rebuild the free lists of the old and non-movable spaces and release empty regions.
    fn apply_sweep(&self, swept: Vec<SweptRegion>, summary: &mut CycleSummary) {
        let mut old = self.spaces.old.lock().unwrap();
        let mut non_movable = self.spaces.non_movable.lock().unwrap();
        old.reset_allocation();
        non_movable.reset_allocation();
        let mut empty_old = vec![];
        let mut empty_non_movable = vec![];
        let mut dead_huge = vec![];
        for s in swept {
            match (s.region.kind(), s.is_empty()) {
                (SpaceKind::Huge, true) => dead_huge.push(s.region),
                (SpaceKind::Huge, false) => {}
                (SpaceKind::Old, true) => empty_old.push(s.region),
                (SpaceKind::NonMovable, true) => empty_non_movable.push(s.region),
                (SpaceKind::Old, false) => {
                    for (cell, size) in s.free_cells {
                        old.free_lists_mut().add(cell, size);
                    }
                }
                (SpaceKind::NonMovable, false) => {
                    for (cell, size) in s.free_cells {
                        non_movable.free_lists_mut().add(cell, size);
                    }
                }
                (kind, _) => unreachable!("{} region swept by a local cycle", kind),
            }
        }
        summary.reclaimed_regions += empty_old.len() + empty_non_movable.len() + dead_huge.len();
        old.release_regions(empty_old);
        non_movable.release_regions(empty_non_movable);
        drop(old);
        drop(non_movable);
        self.spaces.huge.lock().unwrap().release_regions(&dead_huge);
    }

    fn old_space_after_marking(&self, kind: GCKind, live: usize) {
        let free = self.spaces.old.lock().unwrap().free_bytes()
            + self.spaces.non_movable.lock().unwrap().free_bytes();
        let committed = self.spaces.old_bytes();
        self.trigger
            .lock()
            .unwrap()
            .marking_cycle_done(kind, live, free, committed);
    }

    fn clear_marks(&self) {
        for region in self.spaces.all_regions() {
            region.clear_marks();
        }
    }

    fn old_cycle(&self, summary: &mut CycleSummary) {
        let roots = self.strong_roots();
        self.mark(&roots, summary);
        let moved = self.promote_dense_regions(summary);
        let swept = sweep_all(self.pool(), helper_task_id(self.id), self.sweep_items(&moved));
        let live_old: usize = swept.iter().map(|s| s.live_bytes).sum();
        self.apply_sweep(swept, summary);
        let promoted_before = summary.promoted_bytes;
        self.evacuate_young_generation(roots, summary);
        self.clear_marks();
        self.old_space_after_marking(
            GCKind::Old,
            live_old + summary.promoted_bytes - promoted_before,
        );
    }

    fn full_cycle(&self, summary: &mut CycleSummary) {
        let roots = self.strong_roots();
        self.mark(&roots, summary);

        let compact_rate = self.options.compact_live_rate;
        let sparse = self
            .spaces
            .old
            .lock()
            .unwrap()
            .take_regions(|r| r.live_rate() < compact_rate);
        for region in sparse.iter() {
            region.set_flag(RegionFlag::InCollectSet);
        }
        let young = self.spaces.young.lock().unwrap().start_evacuation();
        summary.collect_set_regions = sparse.len() + young.len();

        let swept = sweep_all(self.pool(), helper_task_id(self.id), self.sweep_items(&[]));
        let live_old: usize = swept.iter().map(|s| s.live_bytes).sum();
        self.apply_sweep(swept, summary);

        let ev = Arc::new(Evacuator::new(
            self.id,
            self.spaces.clone(),
            self.binding.clone(),
            self.options.promotion_age,
        ));
        let mut cset = sparse.clone();
        cset.extend(young.iter().cloned());
        evacuation::compact(self.pool(), helper_task_id(self.id), &ev, cset);
        if let Some(err) = ev.failure() {
            self.binding.out_of_memory(&err);
            panic!("Out of memory during compaction: {}", err);
        }
        self.spaces.young.lock().unwrap().finish_evacuation();
        summary.promoted_bytes += ev.promoted_bytes();

        let mut fixup_roots = roots;
        fixup_roots.extend(self.handles.weak_global_slots());
        evacuation::fixup(
            self.pool(),
            helper_task_id(self.id),
            self.id,
            &self.binding,
            self.spaces.old_regions(),
            &fixup_roots,
        );

        summary.reclaimed_regions += sparse.len() + young.len();
        self.forget_and_release(&self.spaces.old, sparse);
        self.forget_and_release(&self.spaces.young, young);
        self.clear_marks();
        self.old_space_after_marking(GCKind::Full, live_old + ev.promoted_bytes());
    }

    // Shared heap cooperation. Only called while this heap's mutator is parked.

    /// Slots of this heap the shared heap traces from: strong handles, binding roots and
    /// every cross-set slot.
    pub(crate) fn shared_roots(&self) -> Vec<Address> {
        let mut roots = self.strong_roots();
        for region in self.spaces.all_regions() {
            if region.has_flag(RegionFlag::HasCrossRefs) {
                roots.extend(region.cross_set.iter_set());
            }
        }
        roots
    }

    /// Slots of this heap that may hold weak references into the shared heap.
    pub(crate) fn shared_weak_slots(&self) -> Vec<Address> {
        let mut slots = self.handles.weak_global_slots();
        for region in self.spaces.all_regions() {
            if region.has_flag(RegionFlag::HasCrossRefs) {
                slots.extend(
                    region
                        .cross_set
                        .iter_set()
                        .filter(|slot| self.binding.classify(load_slot(*slot)) == ValueKind::Weak),
                );
            }
        }
        slots
    }

    pub(crate) fn take_shared_buffer(&self) -> Option<Arc<Region>> {
        self.shared_buffer.lock().unwrap().take()
    }

    pub(crate) fn binding(&self) -> &Arc<dyn VMBinding> {
        &self.binding
    }

    #[cfg(test)]
    pub(crate) fn spaces(&self) -> &LocalSpaces {
        &self.spaces
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.prepare();
        self.shared.deregister_heap(self.id);
        if let Some(buffer) = self.take_shared_buffer() {
            self.shared.add_region(buffer);
        }
        self.spaces.release_all();
        debug!("Heap {} destroyed", self.id);
    }
}
