//! Log levels of routine collections. Runs in its own binary so it can own the logger.

use isoheap::plan::heap::Heap;
use isoheap::plan::shared::SharedHeap;
use isoheap::vm::DefaultBinding;
use isoheap::{AllocationKind, GCKind, GCReason, Options, TaggedValue, WorkerPool};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::{Arc, Mutex};

struct CaptureLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with("isoheap")
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let line = format!("{}", record.args());
            self.records.lock().unwrap().push((record.level(), line));
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger {
    records: Mutex::new(Vec::new()),
};

#[test]
fn routine_cycles_log_below_info() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Trace);

    let mut options = Options::default();
    options.threads = 2;
    options.concurrent_marking = false;
    let pool = Arc::new(WorkerPool::new(options.threads));
    let shared = SharedHeap::new(options.clone(), Some(pool.clone()));
    let heap = Heap::new(options, shared, Some(pool), Arc::new(DefaultBinding));
    let kept = heap.global(TaggedValue::from_object(heap.allocate(16, AllocationKind::Shared)));
    LOGGER.records.lock().unwrap().clear();

    for kind in [GCKind::Young, GCKind::Old, GCKind::Full, GCKind::SharedFull] {
        assert!(heap.collect(kind, GCReason::Explicit));
    }
    assert!(kept.object().is_some());

    let records = std::mem::take(&mut *LOGGER.records.lock().unwrap());
    let loud: Vec<_> = records.iter().filter(|(level, _)| *level <= Level::Info).collect();
    assert!(loud.is_empty(), "{:?}", loud);
    // Each cycle is still announced at debug level.
    let started = records
        .iter()
        .filter(|(level, line)| *level == Level::Debug && line.contains("cycle") && line.contains("started"))
        .count();
    assert_eq!(started, 4);
}
