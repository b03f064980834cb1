//! Runtime-to-collector interface: safe Rust APIs.
//!
//! This module wraps the process-wide worker pool and shared heap, and the per-context
//! [`Heap`], in free functions. We expect a runtime to call these from its own embedding
//! layer and, if it needs to, expose them to native code. Everything here can also be done
//! through the types directly, which is what a runtime that wants more than one shared heap
//! (or a private worker pool) should do.
//!
//! A typical embedding:
//!
//! 1. Call [`init`] once, before any execution context starts.
//! 2. Call [`create_heap`] on each thread that starts an execution context. Keep the
//!    returned `Arc<Heap>` for the lifetime of the context and drop it when the context ends.
//! 3. Allocate with [`alloc`], store references with [`write_field`] and call
//!    [`safepoint_poll`] at loop back-edges and method entries. Wrap blocking native calls in
//!    [`Heap::parked_scope`].
//! 4. Call [`shutdown`] after the last heap is dropped.

use crate::plan::heap::Heap;
use crate::plan::shared::{self, SharedHeap};
use crate::plan::{CycleSummary, GCKind, GCReason};
use crate::scheduler::{self, Task, WorkerPool};
use crate::util::alloc::AllocationKind;
use crate::util::handles::{GlobalHandle, WeakHandle};
use crate::util::options::Options;
use crate::util::statistics::StatsSnapshot;
use crate::util::tagged::TaggedValue;
use crate::util::verify::VerifyReport;
use crate::util::ObjectReference;
use crate::vm::VMBinding;
use std::sync::Arc;
use std::time::Duration;

/// Initialize the collector: start the process-wide worker pool with `options.threads`
/// workers and create the shared heap. Calling this again returns the existing shared heap
/// and ignores `options`. Every call must be paired with a [`shutdown`].
///
/// Note that this function attempts to initialize a logger. If the runtime would like to
/// use its own logger, it should initialize it before calling this function.
pub fn init(options: Options) -> Arc<SharedHeap> {
    match crate::util::logger::try_init() {
        Ok(_) => debug!("isoheap initialized the logger."),
        Err(_) => debug!(
            "isoheap failed to initialize the logger. Possibly a logger has been initialized by user."
        ),
    }
    let pool = scheduler::initialize(options.threads);
    shared::initialize(options, Some(pool))
}

fn shared_heap() -> Arc<SharedHeap> {
    match shared::instance() {
        Some(shared) => shared,
        None => panic!("The collector is not initialized. Call memory_manager::init first."),
    }
}

/// Create a heap for the calling thread's execution context, configured with the options
/// the shared heap was created with. The calling thread becomes a registered mutator.
pub fn create_heap(binding: Arc<dyn VMBinding>) -> Arc<Heap> {
    let shared = shared_heap();
    let options = shared.options().clone();
    create_heap_with_options(options, binding)
}

/// Create a heap with its own options. Shared heap options in `options` are ignored.
pub fn create_heap_with_options(options: Options, binding: Arc<dyn VMBinding>) -> Arc<Heap> {
    Heap::new(options, shared_heap(), scheduler::current(), binding)
}

/// Allocate an object with room for `payload` bytes of fields. Fields start out
/// [`TaggedValue::EMPTY`]. May run a collection first. This never fails: if memory is
/// exhausted after every collection was tried, the binding's `out_of_memory` is called and
/// the collector panics.
///
/// Arguments:
/// * `heap`: The heap of the calling thread.
/// * `payload`: Number of bytes of fields. Rounded up to whole words.
/// * `kind`: Where the object goes. `Young` unless the runtime knows better.
pub fn alloc(heap: &Heap, payload: usize, kind: AllocationKind) -> ObjectReference {
    heap.allocate(payload, kind)
}

/// Store `value` in field `index` of `object`, running the write barrier. Every store of a
/// reference into a heap object must go through here (or [`Heap::write_field`]).
pub fn write_field(heap: &Heap, object: ObjectReference, index: usize, value: TaggedValue) {
    heap.write_field(object, index, value)
}

/// Load field `index` of `object`. Reads need no barrier.
pub fn read_field(object: ObjectReference, index: usize) -> TaggedValue {
    object.get_field(index)
}

/// Stop here if a collection asked the mutators to. Returns true if the thread was parked.
pub fn safepoint_poll(heap: &Heap) -> bool {
    heap.safepoint_poll()
}

/// Create a strong global handle of `heap`. It is a root until dropped.
pub fn new_global(heap: &Heap, value: TaggedValue) -> GlobalHandle {
    heap.global(value)
}

/// Create a weak handle. It reads `EMPTY` once `object` died.
pub fn new_weak(heap: &Heap, object: ObjectReference) -> WeakHandle {
    heap.weak(object)
}

/// Trigger a collection as requested by the user (e.g. a `gc()` builtin). Local kinds run on
/// the calling thread; shared kinds run a stop-the-world shared cycle. Returns false if the
/// request was coalesced with a cycle already in progress.
pub fn handle_user_collection_request(heap: &Heap, kind: GCKind) -> bool {
    heap.collect(kind, GCReason::Explicit)
}

/// Ask the shared heap daemon to start a concurrent cycle of `kind`. Returns false if a
/// shared cycle is already running.
pub fn start_concurrent_shared_cycle(kind: GCKind) -> bool {
    shared_heap().start_concurrent_mark(kind, GCReason::Explicit)
}

/// Block until the running shared cycle, if any, has finished. The calling thread is parked
/// while it waits.
pub fn wait_for_shared_cycle(heap: &Heap) {
    heap.shared().wait_until_finished(heap.id())
}

/// Wait for memory released in the background by the last cycle of `heap`.
pub fn prepare(heap: &Heap) {
    heap.prepare()
}

/// Bytes of regions `heap` holds, not counting the shared heap.
pub fn committed_size(heap: &Heap) -> usize {
    heap.committed_size()
}

/// Bytes of objects allocated in `heap`.
pub fn heap_object_size(heap: &Heap) -> usize {
    heap.heap_object_size()
}

/// Tell the collector that `bytes` of native memory are now kept alive by objects of `heap`.
/// Large amounts of native memory make the next collection come sooner.
pub fn increase_native_size(heap: &Heap, bytes: usize) {
    heap.increase_native_size(bytes)
}

/// Tell the collector that `bytes` of native memory reported with
/// [`increase_native_size`] were freed.
pub fn decrease_native_size(heap: &Heap, bytes: usize) {
    heap.decrease_native_size(bytes)
}

/// Tell the collector that the context of `heap` expects to be idle for `idle`. A cycle
/// that is due soon runs now if it is expected to fit. Returns true if a cycle ran.
pub fn notify_idle(heap: &Heap, idle: Duration) -> bool {
    heap.notify_idle(idle)
}

/// Tell the collector that the process is short of memory, or no longer is.
pub fn notify_memory_pressure(heap: &Heap, pressure: bool) {
    heap.notify_memory_pressure(pressure)
}

/// Tell the collector that the context of `heap` starts or finished starting up.
pub fn notify_startup(heap: &Heap, starting: bool) {
    heap.notify_startup(starting)
}

/// Tell the collector that the context of `heap` enters or leaves a latency-sensitive
/// window, such as an animation.
pub fn notify_high_sensitive(heap: &Heap, sensitive: bool) {
    heap.notify_high_sensitive(sensitive)
}

/// Call `listener` at the end of every cycle of `heap`, on the thread that ran the cycle.
/// Returns an id for [`remove_gc_listener`].
pub fn add_gc_listener(
    heap: &Heap,
    listener: impl Fn(&CycleSummary) + Send + Sync + 'static,
) -> usize {
    heap.add_gc_listener(listener)
}

pub fn remove_gc_listener(heap: &Heap, id: usize) -> bool {
    heap.remove_gc_listener(id)
}

pub fn heap_stats(heap: &Heap) -> StatsSnapshot {
    heap.stats()
}

pub fn shared_heap_stats() -> StatsSnapshot {
    shared_heap().stats()
}

/// Check every reference reachable from the roots of `heap`. Meant for debugging the
/// runtime's use of the write barrier and handles.
pub fn verify_heap(heap: &Heap) -> VerifyReport {
    heap.verify()
}

/// The process-wide worker pool, if the collector is initialized.
pub fn worker_pool() -> Option<Arc<WorkerPool>> {
    scheduler::current()
}

/// Run `task` on the process-wide worker pool. The task is dropped if the pool is not
/// running.
pub fn post_task(task: Box<dyn Task>) {
    match scheduler::current() {
        Some(pool) => pool.post(task),
        None => warn!("No worker pool. Dropping task {}", task.id()),
    }
}

/// Run `task` on the process-wide worker pool no earlier than `delay` from now.
pub fn post_delayed_task(task: Box<dyn Task>, delay: Duration) {
    match scheduler::current() {
        Some(pool) => pool.post_delayed(task, delay),
        None => warn!("No worker pool. Dropping delayed task {}", task.id()),
    }
}

/// Release what [`init`] acquired. The shared heap's memory is returned once the last heap
/// referring to it is dropped.
pub fn shutdown() {
    if let Some(shared) = shared::instance() {
        info!("Shared heap statistics: {}", shared.stats());
    }
    shared::destroy();
    scheduler::destroy();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{fixtures::small_options, serial_test, with_cleanup};
    use crate::vm::DefaultBinding;

    #[test]
    fn facade_round_trip() {
        serial_test(|| {
            with_cleanup(
                || {
                    init(small_options());
                    let heap = create_heap(Arc::new(DefaultBinding));
                    let global = new_global(&heap, TaggedValue::EMPTY);
                    let object = alloc(&heap, 16, AllocationKind::Young);
                    global.set(TaggedValue::from_object(object));
                    write_field(&heap, object, 1, TaggedValue::from_int(7));
                    assert!(handle_user_collection_request(&heap, GCKind::Young));
                    let moved = global.object().unwrap();
                    assert_eq!(read_field(moved, 1), TaggedValue::from_int(7));
                    assert_eq!(heap_stats(&heap).cycles[GCKind::Young], 1);
                    assert!(verify_heap(&heap).is_ok());
                    notify_memory_pressure(&heap, true);
                    notify_memory_pressure(&heap, false);
                    assert_eq!(heap_stats(&heap).cycles[GCKind::Full], 1);
                    assert_eq!(global.object().unwrap().get_field(1), TaggedValue::from_int(7));
                },
                shutdown,
            )
        })
    }

    #[test]
    #[should_panic(expected = "not initialized")]
    fn heaps_need_init() {
        serial_test(|| {
            create_heap(Arc::new(DefaultBinding));
        })
    }
}
