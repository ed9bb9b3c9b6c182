// SPDX-License-Identifier: MPL-2.0

//! Page-granular anonymous memory.
//!
//! DMA-visible buffers and queue rings must be page-aligned and backed by
//! process-private memory. [`Pages`] wraps an anonymous private `mmap`
//! region whose length is rounded up to the system page size and which is
//! unmapped when dropped. The regions are locked into RAM on a best-effort
//! basis; the IOMMU driver pins the backing pages for real once a region is
//! mapped for DMA.

use std::{ptr::NonNull, sync::OnceLock};

use log::debug;

use crate::{Error, Result};

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The system page size.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            fatal("cannot determine the system page size");
        }
        debug!("pagesize is {} (shift {})", sz, (sz as usize).trailing_zeros());
        sz as usize
    })
}

/// log2 of the system page size.
pub fn page_shift() -> u32 {
    page_size().trailing_zeros()
}

/// Rounds `len` up to the next multiple of the page size.
///
/// Aborts on overflow: a length that wraps is a programmer error and is
/// safer crashed than quietly truncated.
pub(crate) fn page_align_up(len: usize) -> usize {
    let mask = page_size() - 1;
    match len.checked_add(mask) {
        Some(v) => v & !mask,
        None => fatal("page alignment would overflow"),
    }
}

/// Prints a diagnostic and aborts the process.
///
/// Reserved for programmer errors (allocation-size overflow, failing
/// `munmap`) where unwinding could tear shared device-visible state.
pub(crate) fn fatal(msg: &str) -> ! {
    eprintln!("fatal error: {}", msg);
    std::process::abort();
}

/// A page-aligned, process-private anonymous memory region.
///
/// The region is writable, zero-initialized and unmapped on drop.
#[derive(Debug)]
pub struct Pages {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is exclusively owned and valid for the lifetime of the
// value on any thread.
unsafe impl Send for Pages {}
unsafe impl Sync for Pages {}

impl Pages {
    /// Maps a new region of at least `size` bytes, rounded up to the page
    /// size.
    pub fn alloc(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgs);
        }
        let len = page_align_up(size);

        // SAFETY: a fresh private anonymous mapping does not alias any
        // existing Rust object.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        // SAFETY: the region was just mapped.
        if unsafe { libc::mlock(ptr, len) } != 0 {
            debug!("mlock of {} bytes failed: {}", len, std::io::Error::last_os_error());
        }

        Ok(Self {
            ptr: NonNull::new(ptr.cast()).unwrap(),
            len,
        })
    }

    /// Maps a region of at least `n * size` bytes.
    ///
    /// Aborts with a diagnostic if `n * size` overflows.
    pub fn alloc_n(n: usize, size: usize) -> Result<Self> {
        let Some(total) = n.checked_mul(size) else {
            fatal("allocation size multiplication overflows");
        };
        Self::alloc(total)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The base address of the region as an integer.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The mapped length, a multiple of the page size.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole region as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is mapped, readable and exclusively owned.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The whole region as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the region is mapped, writable and exclusively owned.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        // SAFETY: ptr/len denote a live mapping created in `alloc`.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } != 0 {
            fatal("munmap of an owned region failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_page_size() {
        let pages = Pages::alloc(1).unwrap();
        assert_eq!(pages.len(), page_size());
        assert_eq!(pages.addr() % page_size(), 0);
    }

    #[test]
    fn multiple_of_page_size_is_kept() {
        let pages = Pages::alloc(2 * page_size()).unwrap();
        assert_eq!(pages.len(), 2 * page_size());
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(matches!(Pages::alloc(0), Err(Error::InvalidArgs)));
    }

    #[test]
    fn region_is_zeroed_and_writable() {
        let mut pages = Pages::alloc_n(3, page_size()).unwrap();
        assert!(pages.as_slice().iter().all(|&b| b == 0));
        pages.as_mut_slice()[42] = 0xa5;
        assert_eq!(pages.as_slice()[42], 0xa5);
    }
}
