use crate::util::constants::*;
use crate::util::Address;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A side bitmap with one bit per word of a region. Regions use it as mark table,
/// object-start (allocation) table, remembered set and cross set.
///
/// Every bit operation is atomic so that tracing threads and the write barrier can set
/// bits of the same word concurrently.
pub struct SlotBitmap {
    base: Address,
    limit: Address,
    data: Box<[AtomicUsize]>,
}

impl SlotBitmap {
    /// A bitmap covering `[base, base + bytes)`.
    pub fn new(base: Address, bytes: usize) -> Self {
        let bits = bytes >> LOG_BYTES_IN_WORD;
        let entries = (bits + BITS_IN_WORD - 1) >> LOG_BITS_IN_WORD;
        Self {
            base,
            limit: base + bytes,
            data: (0..entries).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    fn get_entry_for_address(&self, addr: Address) -> (usize, usize) {
        debug_assert!(
            addr >= self.base && addr < self.limit,
            "{} is out of [{}, {})",
            addr,
            self.base,
            self.limit
        );
        let bit_index = (addr - self.base) >> LOG_BYTES_IN_WORD;
        (bit_index >> LOG_BITS_IN_WORD, bit_index & (BITS_IN_WORD - 1))
    }

    fn address_of(&self, index: usize, offset: usize) -> Address {
        self.base + (((index << LOG_BITS_IN_WORD) + offset) << LOG_BYTES_IN_WORD)
    }

    /// Set the bit for `addr`. Returns true if this call changed it.
    pub fn set(&self, addr: Address) -> bool {
        let (index, offset) = self.get_entry_for_address(addr);
        let mask = 1usize << offset;
        self.data[index].fetch_or(mask, Ordering::Relaxed) & mask == 0
    }

    /// Clear the bit for `addr`. Returns true if this call changed it.
    pub fn clear(&self, addr: Address) -> bool {
        let (index, offset) = self.get_entry_for_address(addr);
        let mask = 1usize << offset;
        self.data[index].fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    pub fn is_set(&self, addr: Address) -> bool {
        let (index, offset) = self.get_entry_for_address(addr);
        self.data[index].load(Ordering::Relaxed) & (1usize << offset) != 0
    }

    /// Clear every bit for words in `[start, end)`.
    pub fn clear_range(&self, start: Address, end: Address) {
        if start >= end {
            return;
        }
        let (first, first_offset) = self.get_entry_for_address(start);
        let (last, last_offset) = if end >= self.limit {
            (self.data.len() - 1, BITS_IN_WORD)
        } else {
            self.get_entry_for_address(end)
        };
        // `mask(a, b)` covers bits [a, b) of one word.
        let mask = |a: usize, b: usize| -> usize {
            let high = if b >= BITS_IN_WORD { usize::MAX } else { (1usize << b) - 1 };
            high & !((1usize << a) - 1)
        };
        if first == last {
            self.data[first].fetch_and(!mask(first_offset, last_offset), Ordering::Relaxed);
            return;
        }
        self.data[first].fetch_and(!mask(first_offset, BITS_IN_WORD), Ordering::Relaxed);
        for entry in &self.data[first + 1..last] {
            entry.store(0, Ordering::Relaxed);
        }
        if last_offset > 0 {
            self.data[last].fetch_and(!mask(0, last_offset), Ordering::Relaxed);
        }
    }

    pub fn clear_all(&self) {
        for entry in self.data.iter() {
            entry.store(0, Ordering::Relaxed);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|e| e.load(Ordering::Relaxed) == 0)
    }

    pub fn count(&self) -> usize {
        self.data
            .iter()
            .map(|e| e.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Addresses whose bit is set, in address order.
    pub fn iter_set(&self) -> impl Iterator<Item = Address> + '_ {
        self.data.iter().enumerate().flat_map(move |(index, entry)| {
            let mut bits = entry.load(Ordering::Relaxed);
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let offset = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(self.address_of(index, offset))
            })
        })
    }

    /// Clear the bitmap and return the addresses that were set.
    pub fn take_all(&self) -> Vec<Address> {
        let mut result = vec![];
        for (index, entry) in self.data.iter().enumerate() {
            let mut bits = entry.swap(0, Ordering::Relaxed);
            while bits != 0 {
                let offset = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                result.push(self.address_of(index, offset));
            }
        }
        result
    }
}
