use super::worker_monitor::WorkerMonitor;
use atomic_refcell::{AtomicRef, AtomicRefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Counters a worker keeps about the tasks it ran.
#[derive(Default, Debug, Clone)]
pub struct WorkerStat {
    pub tasks_run: usize,
    pub tasks_panicked: usize,
    pub busy_time: Duration,
}

/// The part shared between a worker thread and the pool.
pub struct WorkerShared {
    pub parked: AtomicBool,
    stat: AtomicRefCell<WorkerStat>,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            parked: AtomicBool::new(true),
            stat: Default::default(),
        }
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn try_borrow_stat(&self) -> Option<AtomicRef<WorkerStat>> {
        self.stat.try_borrow().ok()
    }
}

/// A pool worker. This part is privately owned by the worker thread.
pub struct Worker {
    pub ordinal: usize,
    monitor: Arc<WorkerMonitor>,
    pub shared: Arc<WorkerShared>,
}

impl Worker {
    pub(crate) fn new(ordinal: usize, monitor: Arc<WorkerMonitor>) -> Self {
        Self {
            ordinal,
            monitor,
            shared: Arc::new(WorkerShared::new()),
        }
    }

    /// Start the thread of this worker.
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("isoheap-worker-{}", self.ordinal))
            .spawn(move || self.run())
    }

    /// Entry point of the worker thread. Runs tasks until the pool shuts down.
    fn run(self) {
        debug!("Worker {} started", self.ordinal);
        loop {
            self.shared.parked.store(true, Ordering::SeqCst);
            let Some(task) = self.monitor.next_task(self.ordinal) else {
                break;
            };
            self.shared.parked.store(false, Ordering::SeqCst);
            let id = task.id();
            let start = Instant::now();
            let ordinal = self.ordinal;
            let result = panic::catch_unwind(AssertUnwindSafe(move || task.run(ordinal)));
            self.monitor.task_done();
            let mut stat = self.shared.stat.borrow_mut();
            stat.tasks_run += 1;
            stat.busy_time += start.elapsed();
            if let Err(payload) = result {
                stat.tasks_panicked += 1;
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic>".to_string());
                error!(
                    "Task {} panicked on worker {}: {}",
                    id, self.ordinal, message
                );
            }
        }
        debug!("Worker {} exited", self.ordinal);
    }
}
