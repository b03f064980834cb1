use crate::util::constants::*;
use crate::util::Address;

/* Alignment */

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

pub const fn region_align_down(addr: Address) -> Address {
    addr.align_down(BYTES_IN_REGION)
}

pub const fn region_align_up(addr: Address) -> Address {
    addr.align_up(BYTES_IN_REGION)
}

/// The index of the region unit containing `addr`. Region map keys are unit indices.
pub const fn region_unit_index(addr: Address) -> usize {
    addr.as_usize() >> LOG_BYTES_IN_REGION
}

/* Conversion */

/// Round a byte size up to whole words.
pub const fn bytes_to_words_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_WORD - 1) >> LOG_BYTES_IN_WORD
}

pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_BYTES_IN_WORD
}

/// The number of region units needed to hold `bytes`.
pub const fn bytes_to_region_units_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_REGION - 1) >> LOG_BYTES_IN_REGION
}

/// The size in bytes of an allocation request once the header is added and the total is
/// rounded up to words.
pub const fn object_size_for_payload(payload: usize) -> usize {
    words_to_bytes(bytes_to_words_up(payload)) + OBJECT_HEADER_BYTES
}

pub fn bytes_to_kb(bytes: usize) -> usize {
    bytes >> LOG_BYTES_IN_KBYTE
}
