//! Immediate and delayed tasks on the worker pool.

use isoheap::scheduler::{task, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const TASKS: usize = 10;
const TASK_TIME: Duration = Duration::from_millis(100);
const DELAY: Duration = Duration::from_millis(300);

#[derive(Debug)]
enum Finished {
    Immediate,
    Delayed { deadline_passed: bool },
}

#[test]
fn delayed_tasks_start_after_their_deadline() {
    let pool = WorkerPool::new(4);
    let (sender, receiver) = mpsc::channel();
    for _ in 0..TASKS {
        let sender = sender.clone();
        pool.post(task(1, move |_| {
            thread::sleep(TASK_TIME);
            sender.send(Finished::Immediate).unwrap();
        }));
    }
    for _ in 0..TASKS {
        let sender = sender.clone();
        // The pool's deadline is computed after this one, so it is never earlier.
        let deadline = Instant::now() + DELAY;
        pool.post_delayed(
            task(2, move |_| {
                let deadline_passed = Instant::now() >= deadline;
                thread::sleep(TASK_TIME);
                sender.send(Finished::Delayed { deadline_passed }).unwrap();
            }),
            DELAY,
        );
    }
    drop(sender);

    let mut immediate = 0;
    let mut delayed = 0;
    for _ in 0..2 * TASKS {
        match receiver.recv_timeout(Duration::from_secs(10)).unwrap() {
            Finished::Immediate => immediate += 1,
            Finished::Delayed { deadline_passed } => {
                assert!(deadline_passed);
                delayed += 1;
            }
        }
    }
    assert_eq!(immediate, TASKS);
    assert_eq!(delayed, TASKS);
    pool.shutdown();
}

#[test]
fn terminated_tasks_never_run() {
    let pool = WorkerPool::new(2);
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let ran = ran.clone();
        pool.post_delayed(
            task(7, move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(200),
        );
    }
    assert_eq!(pool.terminate_tasks(7), 5);
    assert_eq!(pool.terminate_tasks(7), 0);
    thread::sleep(Duration::from_millis(400));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
