//! Fixtures for unit tests: standalone regions with hand-built object graphs, and heaps
//! wired to their own shared heap and pool.

use crate::plan::heap::Heap;
use crate::plan::shared::SharedHeap;
use crate::policy::region::{HeapId, Region};
use crate::policy::region_allocator::RegionAllocator;
use crate::policy::space::SpaceKind;
use crate::scheduler::WorkerPool;
use crate::util::constants::*;
use crate::util::object_model::initialize_object;
use crate::util::options::Options;
use crate::util::ObjectReference;
use crate::vm::{DefaultBinding, VMBinding};
use std::sync::Arc;

/// A single registered region outside of any space.
pub struct RegionFixture {
    allocator: RegionAllocator,
    region: Option<Arc<Region>>,
}

impl RegionFixture {
    pub fn new(owner: HeapId) -> Self {
        Self::with_kind(SpaceKind::Old, owner)
    }

    pub fn with_kind(kind: SpaceKind, owner: HeapId) -> Self {
        let allocator = RegionAllocator::new(&Options::default());
        let region = allocator
            .allocate(1, kind, owner)
            .expect("fixture region allocation failed");
        Self {
            allocator,
            region: Some(region),
        }
    }

    pub fn region(&self) -> &Arc<Region> {
        self.region.as_ref().unwrap()
    }

    /// Bump-allocate an object with `slots` empty slots.
    pub fn object(&self, slots: usize) -> ObjectReference {
        let size = OBJECT_HEADER_BYTES + slots * BYTES_IN_WORD;
        let addr = self
            .region()
            .bump_allocate(size)
            .expect("fixture region is full");
        let object = initialize_object(addr, size, 0);
        self.region().record_object(object);
        object
    }
}

impl Drop for RegionFixture {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.allocator.release(region);
        }
    }
}

/// Small spaces so tests can fill them quickly.
pub fn small_options() -> Options {
    let mut options = Options::default();
    options.threads = 2;
    options.young_semispace_size = 2 * BYTES_IN_REGION;
    options.old_space_size = 64 * BYTES_IN_REGION;
    options.shared_heap_size = 64 * BYTES_IN_REGION;
    options.min_old_space_limit = 16 * BYTES_IN_REGION;
    options.min_shared_space_limit = 16 * BYTES_IN_REGION;
    options.concurrent_marking = false;
    options
}

/// A heap with its own pool and shared heap.
pub struct HeapFixture {
    pub pool: Arc<WorkerPool>,
    pub shared: Arc<SharedHeap>,
    pub heap: Arc<Heap>,
}

impl HeapFixture {
    pub fn new() -> Self {
        Self::with_options(small_options())
    }

    pub fn with_options(options: Options) -> Self {
        Self::with_binding(options, Arc::new(DefaultBinding))
    }

    pub fn with_binding(options: Options, binding: Arc<dyn VMBinding>) -> Self {
        let pool = Arc::new(WorkerPool::new(options.threads));
        let shared = SharedHeap::new(options.clone(), Some(pool.clone()));
        let heap = Heap::new(options, shared.clone(), Some(pool.clone()), binding);
        Self { pool, shared, heap }
    }
}

impl Default for HeapFixture {
    fn default() -> Self {
        Self::new()
    }
}
