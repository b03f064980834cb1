//! Object layout: one header word followed by tagged slots.
//!
//! | header bits | field                                                          |
//! |-------------|----------------------------------------------------------------|
//! | `[1:0]`     | state: `00` object, `01` forwarded, `10` being forwarded, `11` free cell |
//! | `[15:8]`    | age: young cycles survived                                     |
//! | `[63:32]`   | size in words, header included                                 |
//!
//! A forwarded header holds the new address in bits `[63:2]` (objects are word aligned).
//! Free cells are dead or unused spans with a header, so every region is linearly
//! parseable from its start to its cursor.

use crate::util::constants::*;
use crate::util::conversions;
use crate::util::tagged::TaggedValue;
use crate::util::{Address, ObjectReference};
use std::sync::atomic::{AtomicU64, Ordering};

const STATE_MASK: u64 = 0b11;
const STATE_OBJECT: u64 = 0b00;
const STATE_FORWARDED: u64 = 0b01;
const STATE_BEING_FORWARDED: u64 = 0b10;
const STATE_FREE: u64 = 0b11;

const AGE_SHIFT: u32 = 8;
const AGE_MASK: u64 = 0xff << AGE_SHIFT;
const SIZE_SHIFT: u32 = 32;

/// The largest age stored in a header. Ages saturate.
pub const MAX_AGE: u8 = u8::MAX;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeaderState {
    Object,
    Forwarded,
    BeingForwarded,
    Free,
}

#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ObjectHeader(u64);

impl ObjectHeader {
    pub const BEING_FORWARDED: ObjectHeader = ObjectHeader(STATE_BEING_FORWARDED);

    pub fn new(size: usize, age: u8) -> ObjectHeader {
        debug_assert!(size >= MIN_OBJECT_SIZE && size % BYTES_IN_WORD == 0);
        let words = (size >> LOG_BYTES_IN_WORD) as u64;
        debug_assert!(words <= u32::MAX as u64);
        ObjectHeader((words << SIZE_SHIFT) | ((age as u64) << AGE_SHIFT) | STATE_OBJECT)
    }

    pub fn free_cell(size: usize) -> ObjectHeader {
        let words = (size >> LOG_BYTES_IN_WORD) as u64;
        ObjectHeader((words << SIZE_SHIFT) | STATE_FREE)
    }

    pub fn forwarded(to: ObjectReference) -> ObjectHeader {
        ObjectHeader(to.value() as u64 | STATE_FORWARDED)
    }

    pub const fn from_raw(raw: u64) -> ObjectHeader {
        ObjectHeader(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn state(self) -> HeaderState {
        match self.0 & STATE_MASK {
            STATE_OBJECT => HeaderState::Object,
            STATE_FORWARDED => HeaderState::Forwarded,
            STATE_BEING_FORWARDED => HeaderState::BeingForwarded,
            _ => HeaderState::Free,
        }
    }

    /// Size in bytes. Only meaningful for objects and free cells.
    pub fn size(self) -> usize {
        debug_assert!(matches!(self.state(), HeaderState::Object | HeaderState::Free));
        conversions::words_to_bytes((self.0 >> SIZE_SHIFT) as usize)
    }

    pub fn age(self) -> u8 {
        ((self.0 & AGE_MASK) >> AGE_SHIFT) as u8
    }

    pub fn with_age(self, age: u8) -> ObjectHeader {
        ObjectHeader((self.0 & !AGE_MASK) | ((age as u64) << AGE_SHIFT))
    }

    pub fn forwarding_target(self) -> Option<ObjectReference> {
        (self.state() == HeaderState::Forwarded).then(|| unsafe {
            ObjectReference::from_raw_address(Address::from_usize(
                (self.0 & !STATE_MASK) as usize,
            ))
        })
    }
}

impl std::fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.state() {
            HeaderState::Object => write!(f, "object(size={}, age={})", self.size(), self.age()),
            HeaderState::Free => write!(f, "free({})", self.size()),
            HeaderState::Forwarded => write!(f, "forwarded({:#x})", self.0 & !STATE_MASK),
            HeaderState::BeingForwarded => write!(f, "being-forwarded"),
        }
    }
}

/// Load a slot. Slots are only ever accessed atomically so that concurrent marking can
/// read them while mutators store.
pub fn load_slot(slot: Address) -> TaggedValue {
    TaggedValue::from_raw(unsafe { slot.atomic_load::<AtomicU64>(Ordering::Relaxed) })
}

pub fn store_slot(slot: Address, value: TaggedValue) {
    unsafe { slot.atomic_store::<AtomicU64>(value.raw(), Ordering::Relaxed) }
}

/// Read the header word at `addr`, which may be an object or a free cell.
pub fn header_at(addr: Address) -> ObjectHeader {
    ObjectHeader(unsafe { addr.atomic_load::<AtomicU64>(Ordering::Acquire) })
}

/// Write a header word at `addr`.
pub fn write_header_at(addr: Address, header: ObjectHeader) {
    unsafe { addr.atomic_store::<AtomicU64>(header.raw(), Ordering::Release) }
}

/// Turn `[addr, addr + size)` into a free cell. The body is left as it is.
pub fn write_free_cell(addr: Address, size: usize) {
    debug_assert!(size >= MIN_OBJECT_SIZE);
    write_header_at(addr, ObjectHeader::free_cell(size));
}

/// Install a fresh object header at `addr`. The body must already be zero.
pub fn initialize_object(addr: Address, size: usize, age: u8) -> ObjectReference {
    write_header_at(addr, ObjectHeader::new(size, age));
    unsafe { ObjectReference::from_raw_address(addr) }
}

/// Copy the body of `from` to `to` and give the copy `header`.
///
/// # Safety
/// `to` must be a reserved span of `header.size()` bytes that no one else accesses.
pub unsafe fn copy_object(from: ObjectReference, to: Address, header: ObjectHeader) -> ObjectReference {
    let size = header.size();
    let body = size - OBJECT_HEADER_BYTES;
    if body > 0 {
        std::ptr::copy_nonoverlapping(
            (from.to_raw_address() + OBJECT_HEADER_BYTES).to_ptr::<u8>(),
            (to + OBJECT_HEADER_BYTES).to_mut_ptr::<u8>(),
            body,
        );
    }
    write_header_at(to, header);
    ObjectReference::from_raw_address(to)
}

impl ObjectReference {
    pub fn header(self) -> ObjectHeader {
        header_at(self.to_raw_address())
    }

    pub(crate) fn set_header(self, header: ObjectHeader) {
        write_header_at(self.to_raw_address(), header)
    }

    pub(crate) fn compare_exchange_header(
        self,
        old: ObjectHeader,
        new: ObjectHeader,
    ) -> Result<ObjectHeader, ObjectHeader> {
        unsafe {
            self.to_raw_address()
                .compare_exchange::<AtomicU64>(old.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
        }
        .map(ObjectHeader)
        .map_err(ObjectHeader)
    }

    /// Size in bytes, header included.
    pub fn size(self) -> usize {
        self.header().size()
    }

    pub fn slot_count(self) -> usize {
        (self.size() - OBJECT_HEADER_BYTES) >> LOG_BYTES_IN_WORD
    }

    /// The address of slot `index`.
    pub fn slot(self, index: usize) -> Address {
        debug_assert!(index < self.slot_count(), "slot {} out of bounds for {}", index, self);
        self.to_raw_address() + OBJECT_HEADER_BYTES + (index << LOG_BYTES_IN_WORD)
    }

    /// Iterate the slot addresses of the object.
    pub fn slots(self) -> impl Iterator<Item = Address> {
        let first = self.to_raw_address() + OBJECT_HEADER_BYTES;
        (0..self.slot_count()).map(move |i| first + (i << LOG_BYTES_IN_WORD))
    }

    pub fn get_field(self, index: usize) -> TaggedValue {
        load_slot(self.slot(index))
    }

    /// Store without the write barrier, for building object graphs in tests.
    #[cfg(test)]
    pub(crate) fn set_field_unbarriered(self, index: usize, value: TaggedValue) {
        store_slot(self.slot(index), value)
    }

    pub fn age(self) -> u8 {
        self.header().age()
    }
}
