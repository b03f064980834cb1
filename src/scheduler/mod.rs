//! A fixed-size worker pool running immediate and deadline-scheduled tasks.
//!
//! The collector borrows the pool for its parallel phases (see [`work_packets`]) and for
//! releasing regions in the background, but any client may post tasks. The pool can be
//! created directly and injected, or used through the process-wide instance managed by
//! [`initialize`], [`current`] and [`destroy`].

mod work;
pub use work::{task, ClosureTask, Task, TaskId};

pub(crate) mod work_packets;
pub(crate) mod worker;
mod worker_monitor;

pub use worker::WorkerStat;

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use worker::{Worker, WorkerShared};
use worker_monitor::WorkerMonitor;

pub struct WorkerPool {
    monitor: Arc<WorkerMonitor>,
    workers: Vec<Arc<WorkerShared>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start a pool of `threads` workers. The worker count never changes.
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "a worker pool needs at least one thread");
        let monitor = Arc::new(WorkerMonitor::new());
        let mut workers = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for ordinal in 0..threads {
            let worker = Worker::new(ordinal, monitor.clone());
            workers.push(worker.shared.clone());
            handles.push(worker.spawn().expect("Failed to spawn a worker thread"));
        }
        info!("Worker pool started with {} threads", threads);
        Self {
            monitor,
            workers,
            handles: Mutex::new(handles),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task for immediate execution by any idle worker. Tasks posted after
    /// `shutdown` are dropped without running.
    pub fn post(&self, task: Box<dyn Task>) {
        if let Err(task) = self.monitor.post(task) {
            warn!("Worker pool is shut down. Dropping task {}", task.id());
        }
    }

    /// Queue a task that starts no earlier than `delay` from now.
    pub fn post_delayed(&self, task: Box<dyn Task>, delay: Duration) {
        let deadline = Instant::now() + delay;
        if let Err(task) = self.monitor.post_delayed(task, deadline) {
            warn!("Worker pool is shut down. Dropping delayed task {}", task.id());
        }
    }

    /// Withdraw every queued task posted under `id`. Returns how many were withdrawn.
    pub fn terminate_tasks(&self, id: TaskId) -> usize {
        let removed = self.monitor.terminate_tasks(id);
        if removed > 0 {
            trace!("Terminated {} queued tasks of {}", removed, id);
        }
        removed
    }

    pub fn queued_tasks(&self) -> usize {
        self.monitor.queued_tasks()
    }

    pub fn running_tasks(&self) -> usize {
        self.monitor.running_tasks()
    }

    /// Number of workers waiting for a task.
    pub fn idle_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_parked()).count()
    }

    /// Per-worker counters. A worker updating its counters right now reports defaults.
    pub fn worker_stats(&self) -> Vec<WorkerStat> {
        self.workers
            .iter()
            .map(|w| w.try_borrow_stat().map(|s| s.clone()).unwrap_or_default())
            .collect()
    }

    /// Drop queued tasks, wait for running tasks and join the workers. Idempotent.
    pub fn shutdown(&self) {
        let dropped = self.monitor.shutdown();
        if !dropped.is_empty() {
            debug!("Dropping {} queued tasks at shutdown", dropped.len());
        }
        // Dropping a task may run arbitrary code, so this happens outside the monitor lock.
        drop(dropped);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        if handles.is_empty() {
            return;
        }
        let current = std::thread::current().id();
        for handle in handles {
            // A task may drop the last reference to the pool on a worker thread.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("A worker thread panicked outside of a task");
            }
        }
        info!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

lazy_static! {
    /// The process-wide pool and the number of clients holding it.
    static ref GLOBAL_POOL: Mutex<Option<(Arc<WorkerPool>, usize)>> = Mutex::new(None);
}

/// Get the process-wide pool, starting it with `threads` workers if no client holds it yet.
/// Every call must be paired with a [`destroy`].
pub fn initialize(threads: usize) -> Arc<WorkerPool> {
    let mut global = GLOBAL_POOL.lock().unwrap();
    match global.as_mut() {
        Some((pool, clients)) => {
            *clients += 1;
            if pool.thread_count() != threads {
                debug!(
                    "Worker pool already running with {} threads, ignoring request for {}",
                    pool.thread_count(),
                    threads
                );
            }
            pool.clone()
        }
        None => {
            let pool = Arc::new(WorkerPool::new(threads));
            *global = Some((pool.clone(), 1));
            pool
        }
    }
}

/// The process-wide pool, if initialized.
pub fn current() -> Option<Arc<WorkerPool>> {
    GLOBAL_POOL
        .lock()
        .unwrap()
        .as_ref()
        .map(|(pool, _)| pool.clone())
}

/// Release one client's hold on the process-wide pool. The last release shuts it down.
pub fn destroy() {
    let last = {
        let mut global = GLOBAL_POOL.lock().unwrap();
        match global.as_mut() {
            Some((_, clients)) if *clients > 1 => {
                *clients -= 1;
                None
            }
            Some(_) => global.take().map(|(pool, _)| pool),
            None => {
                warn!("Worker pool destroyed without being initialized");
                None
            }
        }
    };
    if let Some(pool) = last {
        pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::serial_test;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn tasks_run_once() {
        let pool = WorkerPool::new(3);
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let count = count.clone();
            let tx = tx.clone();
            pool.post(task(i, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                tx.send(i).unwrap();
            }));
        }
        let mut seen: Vec<_> = (0..20).map(|_| rx.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 20);
        let runs: usize = pool.worker_stats().iter().map(|s| s.tasks_run).sum();
        assert_eq!(runs, 20);
    }

    #[test]
    fn panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::new(1);
        pool.post(task(1, |_| panic!("task failure")));
        let (tx, rx) = mpsc::channel();
        pool.post(task(2, move |worker| tx.send(worker).unwrap()));
        assert_eq!(rx.recv().unwrap(), 0);
        pool.shutdown();
        assert_eq!(pool.worker_stats()[0].tasks_panicked, 1);
    }

    #[test]
    fn shutdown_drops_queued_tasks() {
        let pool = WorkerPool::new(1);
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        pool.post(task(1, move |_| {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv();
        }));
        started_rx.recv().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        pool.post_delayed(
            task(2, move |_| {
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_secs(60),
        );
        assert_eq!(pool.queued_tasks(), 1);
        drop(block_tx);
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        pool.post(task(3, |_| {}));
        assert_eq!(pool.queued_tasks(), 0);
    }

    #[test]
    fn global_pool_is_reference_counted() {
        serial_test(|| {
            let a = initialize(2);
            let b = initialize(4);
            assert!(Arc::ptr_eq(&a, &b));
            assert_eq!(b.thread_count(), 2);
            destroy();
            assert!(current().is_some());
            destroy();
            assert!(current().is_none());
        })
    }
}
