use crate::policy::region::{HeapId, Region};
use crate::policy::region_map;
use crate::policy::space::SpaceKind;
use crate::util::alloc::AllocationError;
use crate::util::constants::*;
use crate::util::conversions::bytes_to_kb;
use crate::util::memory;
use crate::util::options::Options;
use crate::util::Address;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// The process-wide source of region memory. Maps region-aligned spans from the operating
/// system, registers them in the region map and keeps a few released single-unit mappings
/// around for reuse.
pub struct RegionAllocator {
    max_committed: usize,
    committed: AtomicUsize,
    cache_limit: usize,
    cache: Mutex<Vec<Address>>,
}

impl RegionAllocator {
    pub fn new(options: &Options) -> Self {
        Self {
            max_committed: options.max_committed_memory,
            committed: AtomicUsize::new(0),
            cache_limit: options.region_cache_size,
            cache: Mutex::new(Vec::new()),
        }
    }

    /// Bytes of mapped region memory, cached regions included.
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn cached_regions(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Get a zeroed region of `units` region units for a space.
    pub fn allocate(
        &self,
        units: usize,
        kind: SpaceKind,
        owner: HeapId,
    ) -> Result<Arc<Region>, AllocationError> {
        debug_assert!(units > 0);
        let bytes = units * BYTES_IN_REGION;
        let start = match self.take_cached(units) {
            Some(start) => start,
            None => self.map(bytes)?,
        };
        let region = Arc::new(Region::new(start, bytes, kind, owner));
        region_map::register(&region);
        trace!("Allocated {}", region);
        Ok(region)
    }

    fn take_cached(&self, units: usize) -> Option<Address> {
        if units != 1 {
            return None;
        }
        let start = self.cache.lock().unwrap().pop()?;
        memory::zero(start, BYTES_IN_REGION);
        Some(start)
    }

    fn map(&self, bytes: usize) -> Result<Address, AllocationError> {
        let charged = self
            .committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c + bytes <= self.max_committed).then_some(c + bytes)
            })
            .is_ok();
        if !charged {
            // Cached mappings count against the budget. Give them back and try once more.
            if self.drain_cache() == 0 {
                warn!(
                    "Region allocation of {} KB exceeds the committed memory budget of {} KB",
                    bytes_to_kb(bytes),
                    bytes_to_kb(self.max_committed)
                );
                return Err(AllocationError::HeapOutOfMemory);
            }
            return self.map(bytes);
        }
        memory::dzmmap_aligned(bytes, BYTES_IN_REGION).map_err(|e| {
            error!("Failed to map {} KB: {}", bytes_to_kb(bytes), e);
            self.committed.fetch_sub(bytes, Ordering::AcqRel);
            AllocationError::MmapOutOfMemory
        })
    }

    /// Unregister a region and give its memory back (or keep it cached for reuse).
    pub fn release(&self, region: Arc<Region>) {
        region_map::unregister(&region);
        trace!("Released {}", region);
        let start = region.start();
        let bytes = region.size();
        if region.units() == 1 {
            let mut cache = self.cache.lock().unwrap();
            if cache.len() < self.cache_limit {
                cache.push(start);
                return;
            }
        }
        self.unmap(start, bytes);
    }

    fn unmap(&self, start: Address, bytes: usize) {
        if let Err(e) = memory::try_munmap(start, bytes) {
            error!("Failed to unmap {} KB at {}: {}", bytes_to_kb(bytes), start, e);
        }
        self.committed.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Unmap every cached region. Returns how many there were.
    fn drain_cache(&self) -> usize {
        let drained: Vec<Address> = std::mem::take(&mut *self.cache.lock().unwrap());
        for start in drained.iter() {
            self.unmap(*start, BYTES_IN_REGION);
        }
        drained.len()
    }
}

impl Drop for RegionAllocator {
    fn drop(&mut self) {
        self.drain_cache();
    }
}
