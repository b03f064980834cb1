//! Work packets for the parallel phases of a collection.
//!
//! A phase starts with a set of packets (root slots, objects to scan, regions to sweep).
//! Participants repeatedly take a packet, process its items and publish the new items they
//! produce as further packets. The phase is over when no packet is left and no participant
//! is processing one. The collecting thread always participates, so the phase completes even
//! if no pool worker ever gets to help.

use super::work::{task, TaskId};
use super::WorkerPool;
use std::sync::{Arc, Condvar, Mutex};

/// Default number of items per published packet.
pub const DEFAULT_PACKET_SIZE: usize = 512;

struct PacketsSync<T> {
    packets: Vec<Vec<T>>,
    /// Participants holding a packet.
    active: usize,
    /// Participants inside `participate`.
    joined: usize,
    done: bool,
    /// A participant panicked. The phase ends early and its result is incomplete.
    poisoned: bool,
}

pub struct WorkPackets<T> {
    sync: Mutex<PacketsSync<T>>,
    changed: Condvar,
    packet_size: usize,
}

impl<T: Send> WorkPackets<T> {
    pub fn new(packet_size: usize) -> Self {
        debug_assert!(packet_size > 0);
        Self {
            sync: Mutex::new(PacketsSync {
                packets: vec![],
                active: 0,
                joined: 0,
                done: false,
                poisoned: false,
            }),
            changed: Condvar::new(),
            packet_size,
        }
    }

    /// Packets of at most `packet_size` items holding `items`.
    pub fn from_items(items: Vec<T>, packet_size: usize) -> Self {
        let packets = Self::new(packet_size);
        let mut items = items;
        while !items.is_empty() {
            let rest = items.split_off(items.len().min(packet_size));
            packets.publish(std::mem::replace(&mut items, rest));
        }
        packets
    }

    /// Add a packet. Only valid before the phase is over.
    pub fn publish(&self, packet: Vec<T>) {
        if packet.is_empty() {
            return;
        }
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(!sync.done, "publishing into a finished phase");
        sync.packets.push(packet);
        self.changed.notify_one();
    }

    #[cfg(test)]
    pub fn is_done(&self) -> bool {
        self.sync.lock().unwrap().done
    }

    pub fn is_poisoned(&self) -> bool {
        self.sync.lock().unwrap().poisoned
    }

    /// Process packets until the phase is over. `work` gets one item and the output buffer
    /// for the items it produces.
    pub fn participate(&self, mut work: impl FnMut(T, &mut Vec<T>)) {
        {
            let mut sync = self.sync.lock().unwrap();
            if sync.done {
                return;
            }
            sync.joined += 1;
            sync.active += 1;
        }
        let guard = LeaveOnUnwind { packets: self };
        let mut current: Vec<T> = vec![];
        let mut out: Vec<T> = vec![];
        loop {
            while let Some(item) = current.pop() {
                work(item, &mut out);
                if out.len() >= self.packet_size {
                    self.publish(std::mem::take(&mut out));
                }
            }
            if !out.is_empty() {
                // Keep our own leftovers instead of round-tripping through the lock.
                current = std::mem::take(&mut out);
                continue;
            }
            match self.take_packet() {
                Some(packet) => current = packet,
                None => break,
            }
        }
        std::mem::forget(guard);
        let mut sync = self.sync.lock().unwrap();
        sync.joined -= 1;
        self.changed.notify_all();
    }

    fn take_packet(&self) -> Option<Vec<T>> {
        let mut sync = self.sync.lock().unwrap();
        sync.active -= 1;
        loop {
            if let Some(packet) = sync.packets.pop() {
                sync.active += 1;
                return Some(packet);
            }
            if sync.active == 0 || sync.done {
                sync.done = true;
                self.changed.notify_all();
                return None;
            }
            sync = self.changed.wait(sync).unwrap();
        }
    }

    /// Block until every participant has left.
    pub fn wait_for_helpers(&self) {
        let mut sync = self.sync.lock().unwrap();
        while sync.joined > 0 {
            sync = self.changed.wait(sync).unwrap();
        }
    }
}

/// Takes a participant whose work panicked out of the phase, so that the others stop
/// waiting for it.
struct LeaveOnUnwind<'a, T> {
    packets: &'a WorkPackets<T>,
}

impl<T> Drop for LeaveOnUnwind<'_, T> {
    fn drop(&mut self) {
        let mut sync = self
            .packets
            .sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Work only runs while the participant holds a packet.
        sync.active -= 1;
        sync.joined -= 1;
        sync.poisoned = true;
        sync.done = true;
        self.packets.changed.notify_all();
    }
}

/// Run one parallel phase. Up to `pool.thread_count()` helpers are posted under `id`, the
/// calling thread participates until the phase is over, then queued helpers are withdrawn
/// and running ones are awaited. Panics if a participant panicked.
pub fn run_phase<T, C>(
    pool: Option<&WorkerPool>,
    id: TaskId,
    packets: Arc<WorkPackets<T>>,
    ctx: Arc<C>,
    work: fn(&C, T, &mut Vec<T>),
) where
    T: Send + 'static,
    C: Send + Sync + 'static,
{
    if let Some(pool) = pool {
        for _ in 0..pool.thread_count() {
            let packets = packets.clone();
            let ctx = ctx.clone();
            pool.post(task(id, move |_| {
                packets.participate(|item, out| work(&ctx, item, out))
            }));
        }
    }
    packets.participate(|item, out| work(&ctx, item, out));
    if let Some(pool) = pool {
        pool.terminate_tasks(id);
    }
    packets.wait_for_helpers();
    if packets.is_poisoned() {
        panic!("A helper of parallel phase {} panicked", id);
    }
}
