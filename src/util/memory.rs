use crate::util::Address;
use std::io::{Error, Result};

/// Zero `[start, start + len)`.
pub fn zero(start: Address, len: usize) {
    unsafe {
        libc::memset(start.to_mut_ptr(), 0, len);
    }
}

/// Demand-zero anonymous mmap at an address chosen by the OS.
/// The mapping is reserved without swap so untouched pages stay free.
pub fn dzmmap_anywhere(size: usize) -> Result<Address> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        Err(Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(ptr))
    }
}

/// Demand-zero mmap of `size` bytes starting at an address aligned to `align`.
/// Over-maps by `align` and returns the unaligned head and tail to the OS.
pub fn dzmmap_aligned(size: usize, align: usize) -> Result<Address> {
    debug_assert!(align.is_power_of_two());
    let raw = dzmmap_anywhere(size + align)?;
    let start = raw.align_up(align);
    let head = start - raw;
    if head > 0 {
        try_munmap(raw, head)?;
    }
    let tail = align - head;
    if tail > 0 {
        try_munmap(start + size, tail)?;
    }
    Ok(start)
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn try_munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_REGION;

    #[test]
    fn test_aligned_mapping() {
        let start = dzmmap_aligned(BYTES_IN_REGION * 2, BYTES_IN_REGION).unwrap();
        assert!(start.is_aligned_to(BYTES_IN_REGION));
        unsafe {
            assert_eq!(start.load::<usize>(), 0);
            (start + BYTES_IN_REGION * 2 - 8).store(42usize);
            assert_eq!((start + BYTES_IN_REGION * 2 - 8).load::<usize>(), 42);
        }
        zero(start + BYTES_IN_REGION, BYTES_IN_REGION);
        unsafe {
            assert_eq!((start + BYTES_IN_REGION * 2 - 8).load::<usize>(), 0);
        }
        assert!(try_munmap(start, BYTES_IN_REGION * 2).is_ok());
    }
}
