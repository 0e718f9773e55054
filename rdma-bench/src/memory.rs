use crate::{BenchError, Result};
use std::alloc::{self, Layout};
use std::fmt::{Debug, Formatter};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{instrument, trace};

pub const PAGE_SIZE: usize = 4096;

/// A zeroed, page-aligned allocation that the transport registers and the
/// remote peer addresses directly.
///
/// The buffer never hands out references into its memory: the transport
/// writes it on behalf of the peer at any time, so all access goes through
/// raw pointers or atomics.
pub struct PageBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: the allocation is owned by the buffer and only accessed through raw
// pointers handed to the transport, which performs its own synchronization.
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    #[instrument(name = "PageBuffer::zeroed", err, level = "debug")]
    pub fn zeroed(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), PAGE_SIZE).map_err(|e| {
            BenchError::transport(
                "posix_memalign",
                io::Error::new(io::ErrorKind::InvalidInput, e),
            )
        })?;
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or_else(|| {
            BenchError::transport("posix_memalign", io::ErrorKind::OutOfMemory.into())
        })?;
        trace!(addr = ?ptr, len, "allocated");
        Ok(Self { ptr, layout, len })
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `[addr, addr + len)` lies inside the buffer.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let base = self.addr();
        addr >= base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= base + self.len as u64)
    }

    /// Atomically reads the 8-byte word at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the word is out of bounds or not 8-byte aligned.
    pub fn load_u64(&self, offset: usize) -> u64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.len, "bad word offset {offset}");
        // SAFETY: in bounds and aligned (the base is page aligned); peers only
        // touch this word through atomics or whole-buffer copies.
        unsafe { AtomicU64::from_ptr(self.as_ptr().add(offset).cast()) }.load(Ordering::Acquire)
    }

    /// Atomically writes the 8-byte word at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the word is out of bounds or not 8-byte aligned.
    pub fn store_u64(&self, offset: usize, value: u64) {
        assert!(offset % 8 == 0 && offset + 8 <= self.len, "bad word offset {offset}");
        // SAFETY: see `load_u64`.
        unsafe { AtomicU64::from_ptr(self.as_ptr().add(offset).cast()) }.store(value, Ordering::Release)
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl Debug for PageBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("addr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_page_aligned_and_zeroed() {
        let buffer = PageBuffer::zeroed(3 * PAGE_SIZE + 17).unwrap();
        assert_eq!(buffer.addr() % PAGE_SIZE as u64, 0);
        assert_eq!(buffer.len(), 3 * PAGE_SIZE + 17);
        for offset in (0..buffer.len() - 8).step_by(8) {
            assert_eq!(buffer.load_u64(offset), 0);
        }
    }

    #[test]
    fn bounds_check() {
        let buffer = PageBuffer::zeroed(64).unwrap();
        let base = buffer.addr();
        assert!(buffer.contains(base, 64));
        assert!(buffer.contains(base + 56, 8));
        assert!(!buffer.contains(base + 57, 8));
        assert!(!buffer.contains(base - 1, 1));
        assert!(!buffer.contains(u64::MAX, 2));
    }

    #[test]
    fn empty_buffer_is_still_addressable() {
        let buffer = PageBuffer::zeroed(0).unwrap();
        assert!(buffer.is_empty());
        assert!(buffer.contains(buffer.addr(), 0));
        assert!(!buffer.contains(buffer.addr(), 1));
    }
}
