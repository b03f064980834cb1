//! Mutators on several threads stop for shared cycles.

use isoheap::plan::heap::Heap;
use isoheap::plan::safepoint::SafepointController;
use isoheap::plan::shared::SharedHeap;
use isoheap::util::handles::HandleScope;
use isoheap::vm::DefaultBinding;
use isoheap::{AllocationKind, GCKind, GCReason, Options, TaggedValue, WorkerPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const CYCLES: usize = 5;

#[test]
fn exclusive_phase_waits_for_every_mutator() {
    let controller = Arc::new(SafepointController::new());
    let touching = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    controller.register(1);
    controller.register(2);
    let mutator = {
        let (controller, touching, stop) = (controller.clone(), touching.clone(), stop.clone());
        thread::spawn(move || {
            let mut polls = 0;
            while !stop.load(Ordering::SeqCst) {
                touching.store(true, Ordering::SeqCst);
                std::hint::spin_loop();
                touching.store(false, Ordering::SeqCst);
                if controller.poll(2) {
                    polls += 1;
                }
            }
            controller.deregister(2);
            polls
        })
    };
    for _ in 0..CYCLES {
        controller.request_suspend(Some(1));
        controller.wait_for_all_parked();
        assert!(!touching.load(Ordering::SeqCst));
        controller.resume_all();
    }
    stop.store(true, Ordering::SeqCst);
    assert_eq!(mutator.join().unwrap(), CYCLES);
    assert_eq!(controller.suspensions(), CYCLES);
}

#[test]
fn shared_cycles_stop_mutators_on_other_threads() {
    let mut options = Options::default();
    options.threads = 2;
    options.concurrent_marking = false;
    let pool = Arc::new(WorkerPool::new(options.threads));
    let shared = SharedHeap::new(options.clone(), Some(pool.clone()));
    let heap = Heap::new(options.clone(), shared.clone(), Some(pool.clone()), Arc::new(DefaultBinding));
    let kept = heap.global(TaggedValue::EMPTY);
    kept.set(TaggedValue::from_object(heap.allocate(8, AllocationKind::Shared)));

    let stop = Arc::new(AtomicBool::new(false));
    let allocated = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Barrier::new(2));
    let mutator = {
        let (shared, pool, stop, allocated, started) =
            (shared.clone(), pool.clone(), stop.clone(), allocated.clone(), started.clone());
        thread::spawn(move || {
            let heap = Heap::new(options, shared, Some(pool), Arc::new(DefaultBinding));
            let scope = HandleScope::new(&heap);
            let list = scope.handle(TaggedValue::EMPTY);
            started.wait();
            while !stop.load(Ordering::SeqCst) {
                let node = heap.allocate(16, AllocationKind::Young);
                heap.write_field(node, 0, list.get());
                list.set(TaggedValue::from_object(node));
                allocated.fetch_add(1, Ordering::SeqCst);
                heap.safepoint_poll();
            }
            let report = heap.verify();
            assert!(report.is_ok(), "{}", report);
        })
    };
    {
        // Parked while the other heap is being created.
        let _parked = heap.parked_scope();
        started.wait();
    }
    for _ in 0..CYCLES {
        assert!(heap.collect(GCKind::SharedFull, GCReason::Explicit));
    }
    stop.store(true, Ordering::SeqCst);
    {
        let _parked = heap.parked_scope();
        mutator.join().unwrap();
    }
    assert!(shared.safepoint().suspensions() >= CYCLES);
    assert_eq!(shared.stats().cycles[GCKind::SharedFull], CYCLES);
    assert!(allocated.load(Ordering::SeqCst) > 0);
    assert!(kept.object().is_some());
    assert_eq!(shared.heap_count(), 1);
}
