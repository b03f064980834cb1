//! Cooperative suspension of mutators.
//!
//! A collector that needs every mutator stopped calls [`SafepointController::request_suspend`]
//! and then [`SafepointController::wait_for_all_parked`]. Mutators notice the request when
//! they poll ([`SafepointController::poll`], done at allocation sites, collect entry and
//! explicit safepoint polls) and park until [`SafepointController::resume_all`]. A mutator
//! inside a [`ParkedScope`] (native code, or blocked waiting for the collector) counts as
//! parked without polling.
//!
//! Only one suspension is active at a time. A mutator requesting a suspension while another
//! one is active parks until it is over.

use crate::policy::region::HeapId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum MutatorState {
    Running,
    /// Stopped at a safepoint poll.
    Parked,
    /// In a parked scope. May keep running code that does not touch the heap.
    Native,
}

impl MutatorState {
    fn is_stopped(self) -> bool {
        self != MutatorState::Running
    }
}

struct SafepointSync {
    mutators: HashMap<HeapId, MutatorState>,
    suspended: bool,
    /// The mutator that requested the active suspension. `None` for the shared heap daemon.
    requester: Option<HeapId>,
}

impl SafepointSync {
    fn all_parked(&self) -> bool {
        self.mutators
            .iter()
            .all(|(id, state)| Some(*id) == self.requester || state.is_stopped())
    }
}

pub struct SafepointController {
    sync: Mutex<SafepointSync>,
    /// Fast path for polls. Only set while a suspension is active.
    pending: AtomicBool,
    /// Notified when a mutator parks, enters a parked scope, or deregisters.
    parked_changed: Condvar,
    /// Notified when a suspension ends.
    resumed: Condvar,
    suspensions: AtomicUsize,
}

impl Default for SafepointController {
    fn default() -> Self {
        Self::new()
    }
}

impl SafepointController {
    pub fn new() -> Self {
        Self {
            sync: Mutex::new(SafepointSync {
                mutators: HashMap::new(),
                suspended: false,
                requester: None,
            }),
            pending: AtomicBool::new(false),
            parked_changed: Condvar::new(),
            resumed: Condvar::new(),
            suspensions: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, id: HeapId) {
        let mut sync = self.sync.lock().unwrap();
        // A mutator created during a suspension starts parked.
        let state = if sync.suspended {
            MutatorState::Native
        } else {
            MutatorState::Running
        };
        let old = sync.mutators.insert(id, state);
        debug_assert!(old.is_none(), "mutator {} registered twice", id);
        if state == MutatorState::Native {
            self.leave_native_locked(sync, id);
        }
    }

    pub fn deregister(&self, id: HeapId) {
        let mut sync = self.sync.lock().unwrap();
        sync.mutators.remove(&id);
        self.parked_changed.notify_all();
    }

    pub fn has_pending_request(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.sync.lock().unwrap().suspended
    }

    pub fn state_of(&self, id: HeapId) -> Option<MutatorState> {
        self.sync.lock().unwrap().mutators.get(&id).copied()
    }

    pub fn mutator_count(&self) -> usize {
        self.sync.lock().unwrap().mutators.len()
    }

    /// Number of suspensions so far.
    pub fn suspensions(&self) -> usize {
        self.suspensions.load(Ordering::Relaxed)
    }

    /// Ask every mutator to park. `requester` is the mutator asking, if any; it counts as
    /// parked for the duration of the suspension. Returns once this caller owns the
    /// suspension; call [`Self::wait_for_all_parked`] next.
    pub fn request_suspend(&self, requester: Option<HeapId>) {
        let mut sync = self.sync.lock().unwrap();
        while sync.suspended {
            // Someone else is stopping the world. Get out of their way.
            sync = match requester {
                Some(id) => self.park_locked(sync, id, MutatorState::Parked),
                None => self.resumed.wait(sync).unwrap(),
            };
        }
        sync.suspended = true;
        sync.requester = requester;
        self.pending.store(true, Ordering::Release);
        self.suspensions.fetch_add(1, Ordering::Relaxed);
        debug!("Suspension requested by {:?}", requester);
    }

    /// Block until every registered mutator except the requester is parked.
    pub fn wait_for_all_parked(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.suspended);
        while !sync.all_parked() {
            sync = self.parked_changed.wait(sync).unwrap();
        }
        trace!("All {} mutators parked", sync.mutators.len());
    }

    pub fn resume_all(&self) {
        let mut sync = self.sync.lock().unwrap();
        debug_assert!(sync.suspended);
        sync.suspended = false;
        sync.requester = None;
        self.pending.store(false, Ordering::Release);
        self.resumed.notify_all();
        debug!("Mutators resumed");
    }

    /// Safepoint poll of mutator `id`. Parks while a suspension is active. Returns true if
    /// the mutator parked.
    pub fn poll(&self, id: HeapId) -> bool {
        if !self.has_pending_request() {
            return false;
        }
        let sync = self.sync.lock().unwrap();
        if !sync.suspended || sync.requester == Some(id) {
            return false;
        }
        drop(self.park_locked(sync, id, MutatorState::Parked));
        true
    }

    /// Mark `id` as stopped with `state`, wait until the suspension ends, and mark it
    /// running again.
    fn park_locked<'a>(
        &'a self,
        mut sync: MutexGuard<'a, SafepointSync>,
        id: HeapId,
        state: MutatorState,
    ) -> MutexGuard<'a, SafepointSync> {
        let previous = sync.mutators.insert(id, state);
        self.parked_changed.notify_all();
        while sync.suspended {
            sync = self.resumed.wait(sync).unwrap();
        }
        if let Some(previous) = previous {
            sync.mutators.insert(id, previous);
        } else {
            sync.mutators.remove(&id);
        }
        sync
    }

    pub fn enter_native(&self, id: HeapId) {
        let mut sync = self.sync.lock().unwrap();
        if let Some(state) = sync.mutators.get_mut(&id) {
            debug_assert_eq!(*state, MutatorState::Running);
            *state = MutatorState::Native;
        }
        self.parked_changed.notify_all();
    }

    /// Leave a parked scope. Waits while a suspension is active.
    pub fn leave_native(&self, id: HeapId) {
        let sync = self.sync.lock().unwrap();
        self.leave_native_locked(sync, id);
    }

    fn leave_native_locked(&self, mut sync: MutexGuard<'_, SafepointSync>, id: HeapId) {
        while sync.suspended && sync.requester != Some(id) {
            sync = self.resumed.wait(sync).unwrap();
        }
        if let Some(state) = sync.mutators.get_mut(&id) {
            *state = MutatorState::Running;
        }
    }

    /// Treat `id` as parked until the scope is dropped.
    pub fn parked_scope(&self, id: HeapId) -> ParkedScope<'_> {
        self.enter_native(id);
        ParkedScope {
            controller: self,
            id,
        }
    }
}

/// While alive, the mutator counts as parked. Dropping it waits for any active suspension
/// to end.
pub struct ParkedScope<'a> {
    controller: &'a SafepointController,
    id: HeapId,
}

impl Drop for ParkedScope<'_> {
    fn drop(&mut self) {
        self.controller.leave_native(self.id);
    }
}
