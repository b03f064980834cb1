//! Handles: root slots owned by the embedder.
//!
//! A [`HandleScope`] hands out [`Local`] handles that stay valid (and keep their referents
//! alive) until the scope is dropped, including during unwinding. Scopes nest, and only the
//! innermost open scope may create handles. [`GlobalHandle`] and [`WeakHandle`] are
//! persistent strong and weak roots released when dropped.
//!
//! Every handle is one word holding a [`TaggedValue`]. The collector updates handle slots
//! when it moves a referent and clears weak handles whose referent died.

use crate::plan::heap::Heap;
use crate::util::tagged::TaggedValue;
use crate::util::{Address, ObjectReference};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CHUNK_SIZE: usize = 256;

type Chunk = Box<[AtomicU64; CHUNK_SIZE]>;

fn new_chunk() -> Chunk {
    Box::new(std::array::from_fn(|_| AtomicU64::new(0)))
}

struct LocalHandles {
    /// Chunks are never freed while the storage lives, so slot addresses are stable.
    chunks: Vec<Chunk>,
    top: usize,
    depth: usize,
}

impl LocalHandles {
    fn slot(&self, index: usize) -> &AtomicU64 {
        &self.chunks[index / CHUNK_SIZE][index % CHUNK_SIZE]
    }
}

struct GlobalEntry {
    slot: Arc<AtomicU64>,
    weak: bool,
}

#[derive(Default)]
struct GlobalTable {
    entries: Vec<Option<GlobalEntry>>,
    free: Vec<usize>,
    /// Cycles currently holding addresses of global slots.
    pins: usize,
    /// Slots released while pinned. Freed when the last pin is dropped.
    retired: Vec<Arc<AtomicU64>>,
}

/// Handle slots of one heap (or of the shared heap, which only has global handles).
pub struct HandleStorage {
    local: spin::Mutex<LocalHandles>,
    globals: spin::Mutex<GlobalTable>,
}

impl Default for HandleStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleStorage {
    pub fn new() -> Self {
        Self {
            local: spin::Mutex::new(LocalHandles {
                chunks: vec![],
                top: 0,
                depth: 0,
            }),
            globals: spin::Mutex::new(GlobalTable::default()),
        }
    }

    fn open_scope(&self) -> (usize, usize) {
        let mut local = self.local.lock();
        local.depth += 1;
        (local.top, local.depth)
    }

    fn close_scope(&self, base: usize, depth: usize) {
        let mut local = self.local.lock();
        debug_assert_eq!(local.depth, depth, "handle scopes closed out of order");
        for index in base..local.top {
            local.slot(index).store(0, Ordering::Relaxed);
        }
        local.top = base;
        local.depth -= 1;
    }

    fn new_local(&self, depth: usize, value: TaggedValue) -> *const AtomicU64 {
        let mut local = self.local.lock();
        assert_eq!(
            local.depth, depth,
            "only the innermost handle scope may create handles"
        );
        let index = local.top;
        if index / CHUNK_SIZE == local.chunks.len() {
            local.chunks.push(new_chunk());
        }
        local.top += 1;
        let slot = local.slot(index);
        slot.store(value.raw(), Ordering::Relaxed);
        slot as *const AtomicU64
    }

    fn new_global(&self, value: TaggedValue, weak: bool) -> (usize, Arc<AtomicU64>) {
        let slot = Arc::new(AtomicU64::new(value.raw()));
        let mut globals = self.globals.lock();
        let entry = Some(GlobalEntry {
            slot: slot.clone(),
            weak,
        });
        let index = match globals.free.pop() {
            Some(index) => {
                globals.entries[index] = entry;
                index
            }
            None => {
                globals.entries.push(entry);
                globals.entries.len() - 1
            }
        };
        (index, slot)
    }

    fn remove_global(&self, index: usize) {
        let mut globals = self.globals.lock();
        let entry = globals.entries[index].take();
        debug_assert!(entry.is_some());
        globals.free.push(index);
        if let Some(entry) = entry {
            if globals.pins > 0 {
                globals.retired.push(entry.slot);
            }
        }
    }

    /// Keep every global slot allocated, including slots of handles dropped meanwhile,
    /// until the returned pin is dropped. A cycle holds a pin while it uses slot addresses.
    pub(crate) fn pin_globals(self: &Arc<Self>) -> GlobalsPin {
        self.globals.lock().pins += 1;
        GlobalsPin {
            storage: self.clone(),
        }
    }

    fn unpin_globals(&self) {
        let retired = {
            let mut globals = self.globals.lock();
            globals.pins -= 1;
            if globals.pins == 0 {
                std::mem::take(&mut globals.retired)
            } else {
                vec![]
            }
        };
        if !retired.is_empty() {
            trace!("Freeing {} global slots released during a cycle", retired.len());
        }
    }

    /// Global slots released while pinned and not yet freed.
    pub fn retired_global_count(&self) -> usize {
        self.globals.lock().retired.len()
    }

    /// Slots of every live local handle.
    pub fn local_slots(&self) -> Vec<Address> {
        let local = self.local.lock();
        (0..local.top)
            .map(|index| Address::from_ref(local.slot(index)))
            .collect()
    }

    fn global_slots(&self, weak: bool) -> Vec<Address> {
        self.globals
            .lock()
            .entries
            .iter()
            .flatten()
            .filter(|e| e.weak == weak)
            .map(|e| Address::from_ref(e.slot.as_ref()))
            .collect()
    }

    pub fn strong_global_slots(&self) -> Vec<Address> {
        self.global_slots(false)
    }

    pub fn weak_global_slots(&self) -> Vec<Address> {
        self.global_slots(true)
    }

    /// Every strong root slot: local handles and strong globals.
    pub fn strong_root_slots(&self) -> Vec<Address> {
        let mut slots = self.local_slots();
        slots.extend(self.strong_global_slots());
        slots
    }

    pub fn local_handle_count(&self) -> usize {
        self.local.lock().top
    }

    pub fn global_handle_count(&self) -> usize {
        let globals = self.globals.lock();
        globals.entries.len() - globals.free.len()
    }
}

/// Holds the global slots of a [`HandleStorage`] allocated. See
/// [`HandleStorage::pin_globals`].
pub(crate) struct GlobalsPin {
    storage: Arc<HandleStorage>,
}

impl Drop for GlobalsPin {
    fn drop(&mut self) {
        self.storage.unpin_globals();
    }
}

/// A scope for local handles. Dropping it releases every handle created in it.
pub struct HandleScope<'h> {
    storage: &'h HandleStorage,
    base: usize,
    depth: usize,
    // Scopes are bound to the thread running the heap's mutator.
    _not_send: PhantomData<*const ()>,
}

impl<'h> HandleScope<'h> {
    pub fn new(heap: &'h Heap) -> Self {
        Self::with_storage(heap.handle_storage())
    }

    pub(crate) fn with_storage(storage: &'h HandleStorage) -> Self {
        let (base, depth) = storage.open_scope();
        Self {
            storage,
            base,
            depth,
            _not_send: PhantomData,
        }
    }

    /// Root `value` for the lifetime of this scope.
    pub fn handle(&self, value: TaggedValue) -> Local<'_> {
        let slot = self.storage.new_local(self.depth, value);
        // Safety: chunks live as long as the storage, which outlives the scope, and the slot
        // is only reused after this scope (and the borrow of it) ends.
        Local {
            slot: unsafe { &*slot },
        }
    }

    pub fn object(&self, object: ObjectReference) -> Local<'_> {
        self.handle(TaggedValue::from_object(object))
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        self.storage.close_scope(self.base, self.depth);
    }
}

/// A local handle. The collector keeps its value current.
#[derive(Copy, Clone)]
pub struct Local<'s> {
    slot: &'s AtomicU64,
}

impl Local<'_> {
    pub fn get(&self) -> TaggedValue {
        TaggedValue::from_raw(self.slot.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: TaggedValue) {
        self.slot.store(value.raw(), Ordering::Relaxed)
    }

    /// The referenced object. Only valid until the next allocation or cycle.
    pub fn object(&self) -> Option<ObjectReference> {
        self.get().as_object()
    }

    pub fn slot(&self) -> Address {
        Address::from_ref(self.slot)
    }
}

/// A persistent strong root.
pub struct GlobalHandle {
    storage: Arc<HandleStorage>,
    index: usize,
    slot: Arc<AtomicU64>,
}

impl GlobalHandle {
    pub(crate) fn new(storage: Arc<HandleStorage>, value: TaggedValue) -> Self {
        let (index, slot) = storage.new_global(value, false);
        Self {
            storage,
            index,
            slot,
        }
    }

    pub fn get(&self) -> TaggedValue {
        TaggedValue::from_raw(self.slot.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: TaggedValue) {
        self.slot.store(value.raw(), Ordering::Relaxed)
    }

    pub fn object(&self) -> Option<ObjectReference> {
        self.get().as_object()
    }
}

impl Drop for GlobalHandle {
    fn drop(&mut self) {
        self.storage.remove_global(self.index);
    }
}

/// A persistent weak reference. Reads `EMPTY` once its referent has been collected.
pub struct WeakHandle {
    storage: Arc<HandleStorage>,
    index: usize,
    slot: Arc<AtomicU64>,
}

impl WeakHandle {
    pub(crate) fn new(storage: Arc<HandleStorage>, object: ObjectReference) -> Self {
        let (index, slot) = storage.new_global(TaggedValue::from_object(object), true);
        Self {
            storage,
            index,
            slot,
        }
    }

    pub fn get(&self) -> TaggedValue {
        TaggedValue::from_raw(self.slot.load(Ordering::Relaxed))
    }

    pub fn object(&self) -> Option<ObjectReference> {
        self.get().as_object()
    }

    pub fn is_cleared(&self) -> bool {
        self.get().is_empty()
    }
}

impl Drop for WeakHandle {
    fn drop(&mut self) {
        self.storage.remove_global(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_release_on_drop() {
        let storage = HandleStorage::new();
        {
            let outer = HandleScope::with_storage(&storage);
            let a = outer.handle(TaggedValue::from_int(1));
            {
                let inner = HandleScope::with_storage(&storage);
                for i in 0..300 {
                    inner.handle(TaggedValue::from_int(i));
                }
                assert_eq!(storage.local_handle_count(), 301);
            }
            assert_eq!(storage.local_handle_count(), 1);
            assert_eq!(a.get().as_int(), Some(1));
            assert_eq!(storage.local_slots(), vec![a.slot()]);
        }
        assert_eq!(storage.local_handle_count(), 0);
    }

    #[test]
    #[should_panic(expected = "innermost")]
    fn outer_scope_cannot_create_handles() {
        let storage = HandleStorage::new();
        let outer = HandleScope::with_storage(&storage);
        let _inner = HandleScope::with_storage(&storage);
        outer.handle(TaggedValue::NULL);
    }

    #[test]
    fn scope_released_during_unwinding() {
        let storage = HandleStorage::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let scope = HandleScope::with_storage(&storage);
            scope.handle(TaggedValue::TRUE);
            panic!("unwind");
        }));
        assert!(result.is_err());
        assert_eq!(storage.local_handle_count(), 0);
        // The storage is usable again.
        let scope = HandleScope::with_storage(&storage);
        assert_eq!(scope.handle(TaggedValue::FALSE).get(), TaggedValue::FALSE);
    }

    #[test]
    fn globals_reuse_released_entries() {
        let storage = Arc::new(HandleStorage::new());
        let a = GlobalHandle::new(storage.clone(), TaggedValue::from_int(1));
        let b = GlobalHandle::new(storage.clone(), TaggedValue::from_int(2));
        assert_eq!(storage.strong_global_slots().len(), 2);
        drop(a);
        let c = GlobalHandle::new(storage.clone(), TaggedValue::from_int(3));
        assert_eq!(storage.global_handle_count(), 2);
        assert_eq!(b.get().as_int(), Some(2));
        assert_eq!(c.get().as_int(), Some(3));
        assert!(storage.weak_global_slots().is_empty());
    }

    #[test]
    fn pinned_slots_outlive_their_handles() {
        let storage = Arc::new(HandleStorage::new());
        let a = GlobalHandle::new(storage.clone(), TaggedValue::from_int(1));
        let outer = storage.pin_globals();
        let slots = storage.strong_global_slots();
        let inner = storage.pin_globals();
        drop(a);
        drop(inner);
        // Still pinned by the outer pin: the slot is retired, not freed.
        assert_eq!(storage.retired_global_count(), 1);
        assert_eq!(storage.global_handle_count(), 0);
        assert_eq!(crate::util::object_model::load_slot(slots[0]).as_int(), Some(1));
        drop(outer);
        assert_eq!(storage.retired_global_count(), 0);

        let b = GlobalHandle::new(storage.clone(), TaggedValue::from_int(2));
        drop(b);
        assert_eq!(storage.retired_global_count(), 0);
    }
}
