//! The boundary to the language runtime embedding the collector.
//!
//! The collector knows nothing about the interpreter or compiler. It asks the binding for
//! extra root slots (stack frames, interpreter registers), lets it override how a value is
//! classified, and tells it when memory is exhausted.

use crate::util::alloc::AllocationError;
use crate::util::tagged::{TaggedValue, ValueKind};
use crate::util::Address;

/// Callback trait of root scanning. Each call reports the address of one slot holding a
/// tagged value. The collector may update the slot when it moves the referent.
pub trait SlotVisitor {
    /// Call this function for each slot.
    fn visit_slot(&mut self, slot: Address);
}

/// This lets us use closures as SlotVisitor.
impl<F: FnMut(Address)> SlotVisitor for F {
    fn visit_slot(&mut self, slot: Address) {
        self(slot)
    }
}

/// Hooks a runtime implements to embed the collector. One binding instance is given to each
/// heap. It may be called from the heap's mutator thread, from worker pool threads and from
/// the shared heap daemon while the mutator is parked.
pub trait VMBinding: Send + Sync + 'static {
    /// Report every root slot the runtime owns. Called once per cycle before tracing starts,
    /// while the owning mutator is stopped. Slots must stay valid until the cycle ends.
    fn scan_roots(&self, _visitor: &mut dyn SlotVisitor) {}

    /// Classify a value. The default reads the tag bits.
    ///
    /// Shared objects are traced with the binding of one of the live heaps, so every heap
    /// of a shared heap must classify shared values alike.
    fn classify(&self, value: TaggedValue) -> ValueKind {
        value.kind()
    }

    /// Inform the runtime that an allocation cannot be satisfied even after every collection
    /// was tried. The collector panics if this returns.
    ///
    /// Note that there are two categories of errors:
    ///  * `MmapOutOfMemory`: the operating system cannot provide more memory.
    ///  * `HeapOutOfMemory`: the configured heap sizes are too small for the program.
    fn out_of_memory(&self, err: &AllocationError) {
        panic!("Out of memory with {:?}!", err);
    }
}

/// A binding without runtime-owned roots. Every root comes from handles.
#[derive(Default, Debug)]
pub struct DefaultBinding;

impl VMBinding for DefaultBinding {}
