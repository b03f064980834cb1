//! The thread running concurrent shared cycles.

use super::SharedHeap;
use crate::plan::Cycle;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::{Mutex, Weak};
use std::thread::JoinHandle;

enum DaemonRequest {
    Collect(Cycle),
    Shutdown,
}

pub(super) struct Daemon {
    requests: Sender<DaemonRequest>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Start the daemon of `shared`. It only holds the shared heap while a cycle runs.
    pub fn spawn(shared: Weak<SharedHeap>) -> Self {
        let (requests, receiver) = channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("isoheap-shared-gc".to_string())
            .spawn(move || run(shared, receiver))
            .expect("Failed to spawn the shared heap daemon");
        Self {
            requests,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn request(&self, cycle: Cycle) {
        if self.requests.send(DaemonRequest::Collect(cycle)).is_err() {
            error!("Shared heap daemon is gone, dropping cycle {}", cycle);
        }
    }

    /// Stop the daemon and wait for it, unless the daemon itself is dropping the shared
    /// heap.
    pub fn shutdown(&self) {
        let _ = self.requests.send(DaemonRequest::Shutdown);
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Shared heap daemon panicked");
        }
    }
}

fn run(shared: Weak<SharedHeap>, requests: Receiver<DaemonRequest>) {
    debug!("Shared heap daemon started");
    while let Ok(DaemonRequest::Collect(cycle)) = requests.recv() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.run_concurrent_cycle(cycle);
    }
    debug!("Shared heap daemon exited");
}
