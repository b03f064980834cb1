//! This module contains `WorkerMonitor`, the synchronized task queues of the worker pool.
//! Its purposes include:
//!
//! -   holding immediate tasks in FIFO order and delayed tasks ordered by deadline,
//! -   letting idle workers park until a task is posted or a deadline passes, and
//! -   telling workers to exit when the pool shuts down.

use super::work::{Task, TaskId};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// A task that must not start before its deadline. Same-deadline tasks keep submission
/// order through the sequence number.
struct DelayedTask {
    deadline: Instant,
    seq: u64,
    task: Box<dyn Task>,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    // `BinaryHeap` is a max-heap. Reverse so the earliest deadline is on top.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// The synchronized part of `WorkerMonitor`.
struct WorkerMonitorSync {
    immediate: VecDeque<Box<dyn Task>>,
    delayed: BinaryHeap<DelayedTask>,
    next_seq: u64,
    /// Number of workers running a task.
    running: usize,
    /// Number of workers waiting for a task.
    parked: usize,
    shutting_down: bool,
}

pub(crate) struct WorkerMonitor {
    sync: Mutex<WorkerMonitorSync>,
    /// Workers wait on this when idle. Notified when a task is posted and on shutdown.
    workers_have_anything_to_do: Condvar,
}

impl WorkerMonitor {
    pub fn new() -> Self {
        Self {
            sync: Mutex::new(WorkerMonitorSync {
                immediate: VecDeque::new(),
                delayed: BinaryHeap::new(),
                next_seq: 0,
                running: 0,
                parked: 0,
                shutting_down: false,
            }),
            workers_have_anything_to_do: Condvar::new(),
        }
    }

    /// Queue a task. Returns the task back if the pool is shutting down.
    pub fn post(&self, task: Box<dyn Task>) -> Result<(), Box<dyn Task>> {
        let mut sync = self.sync.lock().unwrap();
        if sync.shutting_down {
            return Err(task);
        }
        sync.immediate.push_back(task);
        self.workers_have_anything_to_do.notify_one();
        Ok(())
    }

    pub fn post_delayed(&self, task: Box<dyn Task>, deadline: Instant) -> Result<(), Box<dyn Task>> {
        let mut sync = self.sync.lock().unwrap();
        if sync.shutting_down {
            return Err(task);
        }
        let seq = sync.next_seq;
        sync.next_seq += 1;
        sync.delayed.push(DelayedTask {
            deadline,
            seq,
            task,
        });
        // A parked worker may be sleeping until a later deadline.
        self.workers_have_anything_to_do.notify_all();
        Ok(())
    }

    /// Block until a task is ready for this worker. Returns `None` if the worker should exit.
    pub fn next_task(&self, ordinal: usize) -> Option<Box<dyn Task>> {
        let mut sync = self.sync.lock().unwrap();
        loop {
            if sync.shutting_down {
                return None;
            }
            let now = Instant::now();
            if sync.delayed.peek().is_some_and(|t| t.deadline <= now) {
                let delayed = sync.delayed.pop().map(|t| t.task);
                sync.running += 1;
                return delayed;
            }
            if let Some(task) = sync.immediate.pop_front() {
                sync.running += 1;
                return Some(task);
            }
            let next_deadline = sync.delayed.peek().map(|t| t.deadline);
            sync.parked += 1;
            trace!("Worker {} parked", ordinal);
            sync = match next_deadline {
                Some(deadline) => {
                    self.workers_have_anything_to_do
                        .wait_timeout(sync, deadline.saturating_duration_since(now))
                        .unwrap()
                        .0
                }
                None => self.workers_have_anything_to_do.wait(sync).unwrap(),
            };
            sync.parked -= 1;
        }
    }

    pub fn task_done(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.running -= 1;
    }

    /// Remove queued tasks posted under `id`. Running tasks are not affected.
    pub fn terminate_tasks(&self, id: TaskId) -> usize {
        let removed: Vec<Box<dyn Task>>;
        {
            let mut sync = self.sync.lock().unwrap();
            let (matching, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut sync.immediate)
                .into_iter()
                .partition(|t| t.id() == id);
            sync.immediate = kept;
            let (delayed_matching, delayed_kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut sync.delayed)
                    .into_vec()
                    .into_iter()
                    .partition(|t| t.task.id() == id);
            sync.delayed = delayed_kept.into();
            removed = matching
                .into_iter()
                .chain(delayed_matching.into_iter().map(|t| t.task))
                .collect();
        }
        // Dropped outside the lock: dropping a task may post another one.
        removed.len()
    }

    /// Stop handing out tasks and wake every worker so it can exit. Returns the tasks that
    /// were still queued.
    pub fn shutdown(&self) -> Vec<Box<dyn Task>> {
        let mut sync = self.sync.lock().unwrap();
        sync.shutting_down = true;
        self.workers_have_anything_to_do.notify_all();
        let delayed = std::mem::take(&mut sync.delayed);
        std::mem::take(&mut sync.immediate)
            .into_iter()
            .chain(delayed.into_vec().into_iter().map(|t| t.task))
            .collect()
    }

    pub fn queued_tasks(&self) -> usize {
        let sync = self.sync.lock().unwrap();
        sync.immediate.len() + sync.delayed.len()
    }

    pub fn running_tasks(&self) -> usize {
        self.sync.lock().unwrap().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::work::task;
    use std::time::Duration;

    #[test]
    fn delayed_tasks_order_by_deadline_then_submission() {
        let monitor = WorkerMonitor::new();
        let now = Instant::now();
        let later = now + Duration::from_millis(5);
        assert!(monitor.post_delayed(task(3, |_| {}), later).is_ok());
        assert!(monitor.post_delayed(task(1, |_| {}), now).is_ok());
        assert!(monitor.post_delayed(task(2, |_| {}), now).is_ok());
        let order: Vec<_> = (0..3)
            .map(|_| {
                let t = monitor.next_task(0).unwrap();
                monitor.task_done();
                t.id()
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(Instant::now() >= later);
    }

    #[test]
    fn terminate_removes_only_matching_tasks() {
        let monitor = WorkerMonitor::new();
        for id in [1, 2, 1] {
            assert!(monitor.post(task(id, |_| {})).is_ok());
        }
        assert!(monitor
            .post_delayed(task(1, |_| {}), Instant::now() + Duration::from_secs(60))
            .is_ok());
        assert_eq!(monitor.terminate_tasks(1), 3);
        assert_eq!(monitor.queued_tasks(), 1);
        assert_eq!(monitor.next_task(0).unwrap().id(), 2);
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let monitor = WorkerMonitor::new();
        assert!(monitor.post(task(1, |_| {})).is_ok());
        assert_eq!(monitor.shutdown().len(), 1);
        assert!(monitor.post(task(1, |_| {})).is_err());
        assert!(monitor.next_task(0).is_none());
    }
}
