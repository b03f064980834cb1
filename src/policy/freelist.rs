use crate::util::constants::*;
use crate::util::memory;
use crate::util::object_model::write_free_cell;
use crate::util::Address;

const NUM_SIZE_CLASSES: usize = LOG_BYTES_IN_REGION as usize + 1;

/// Segregated free lists of free cells, rebuilt by sweeping. Class `i` holds cells of
/// `[2^i, 2^(i+1))` bytes.
pub struct FreeLists {
    classes: Vec<Vec<(Address, usize)>>,
    free_bytes: usize,
}

fn size_class(size: usize) -> usize {
    debug_assert!(size > 0);
    ((usize::BITS - 1 - size.leading_zeros()) as usize).min(NUM_SIZE_CLASSES - 1)
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeLists {
    pub fn new() -> Self {
        Self {
            classes: (0..NUM_SIZE_CLASSES).map(|_| Vec::new()).collect(),
            free_bytes: 0,
        }
    }

    /// Bytes in listed cells.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn len(&self) -> usize {
        self.classes.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List a free cell. Its free-cell header must already be written.
    pub fn add(&mut self, cell: Address, size: usize) {
        debug_assert!(size >= MIN_FREE_CELL_SIZE);
        self.classes[size_class(size)].push((cell, size));
        self.free_bytes += size;
    }

    /// Take `size` bytes from the lists: first fit in the request's own class, otherwise any
    /// cell of a larger class. The cell is split and the remainder re-listed. The returned
    /// memory is zeroed.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        let first = size_class(size);
        let (cell, cell_size) = match self.classes[first].iter().position(|(_, s)| *s >= size) {
            Some(index) => self.classes[first].swap_remove(index),
            None => self.classes[first + 1..]
                .iter_mut()
                .find_map(|class| class.pop())?,
        };
        self.free_bytes -= cell_size;
        let remainder = cell_size - size;
        if remainder > 0 {
            write_free_cell(cell + size, remainder);
            if remainder >= MIN_FREE_CELL_SIZE {
                self.add(cell + size, remainder);
            }
        }
        memory::zero(cell, size);
        Some(cell)
    }

    /// Forget every cell inside `[start, end)`.
    pub fn remove_range(&mut self, start: Address, end: Address) {
        let mut removed = 0;
        for class in self.classes.iter_mut() {
            class.retain(|(cell, size)| {
                let inside = *cell >= start && *cell < end;
                if inside {
                    removed += *size;
                }
                !inside
            });
        }
        self.free_bytes -= removed;
    }

    pub fn clear(&mut self) {
        for class in self.classes.iter_mut() {
            class.clear();
        }
        self.free_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::object_model::{header_at, HeaderState};

    fn buffer(words: usize) -> (Vec<u64>, Address) {
        let buffer = vec![0xffu64; words];
        let addr = Address::from_ptr(buffer.as_ptr());
        (buffer, addr)
    }

    #[test]
    fn split_relists_remainder() {
        let (_buffer, base) = buffer(64);
        let mut lists = FreeLists::new();
        write_free_cell(base, 512);
        lists.add(base, 512);

        let a = lists.allocate(64).unwrap();
        assert_eq!(a, base);
        assert_eq!(unsafe { (a + 8).load::<u64>() }, 0);
        assert_eq!(lists.free_bytes(), 448);
        assert_eq!(header_at(base + 64).state(), HeaderState::Free);
        assert_eq!(header_at(base + 64).size(), 448);
    }

    #[test]
    fn small_remainder_is_left_as_filler() {
        let (_buffer, base) = buffer(8);
        let mut lists = FreeLists::new();
        write_free_cell(base, 64);
        lists.add(base, 64);
        assert_eq!(lists.allocate(48), Some(base));
        // The 16 byte tail stays parseable but is not listed.
        assert_eq!(header_at(base + 48).size(), 16);
        assert!(lists.is_empty());
        assert_eq!(lists.allocate(8), None);
    }

    #[test]
    fn first_fit_within_class_then_larger_classes() {
        let (_buffer, base) = buffer(256);
        let mut lists = FreeLists::new();
        // Both in class 6: [64, 128).
        write_free_cell(base, 64);
        lists.add(base, 64);
        write_free_cell(base + 64, 96);
        lists.add(base + 64, 96);
        write_free_cell(base + 160, 1024);
        lists.add(base + 160, 1024);

        assert_eq!(lists.allocate(96), Some(base + 64));
        assert_eq!(lists.allocate(120), Some(base + 160));
        lists.remove_range(base, base + 128);
        assert_eq!(lists.free_bytes(), 1024 - 120);
    }
}
