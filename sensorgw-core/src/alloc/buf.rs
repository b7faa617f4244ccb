//! ## sensorgw-core::alloc::buf
//! **Growable byte buffer backed by a `RawAlloc`**
//!
//! Growth allocates a larger region, copies the live bytes and releases the
//! old region, so short buffers stay inside pool blocks and only long ones
//! spill over to the global allocator.

use std::io;
use std::ops::Deref;
use std::ptr::{self, NonNull};

use super::pool::RawAlloc;
use crate::error::PoolError;

const MIN_CAPACITY: usize = 16;

pub struct PoolBuf<'a, A: RawAlloc + ?Sized> {
    alloc: &'a A,
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
}

impl<'a, A: RawAlloc + ?Sized> PoolBuf<'a, A> {
    /// Empty buffer; nothing is allocated until the first write.
    pub fn new(alloc: &'a A) -> Self {
        Self {
            alloc,
            ptr: NonNull::dangling(),
            len: 0,
            cap: 0,
        }
    }

    pub fn with_capacity(alloc: &'a A, capacity: usize) -> Result<Self, PoolError> {
        let mut buf = Self::new(alloc);
        buf.reserve(capacity)?;
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.cap == 0 {
            return &[];
        }
        // SAFETY: the first `len` bytes of the region were written by us.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Ensures room for `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) -> Result<(), PoolError> {
        let needed = self
            .len
            .checked_add(additional)
            .ok_or(PoolError::Exhausted(usize::MAX))?;
        if needed <= self.cap {
            return Ok(());
        }

        let new_cap = needed.max(self.cap.saturating_mul(2)).max(MIN_CAPACITY);
        let new_ptr = self
            .alloc
            .allocate(new_cap)
            .ok_or(PoolError::Exhausted(new_cap))?;

        if self.cap > 0 {
            // SAFETY: both regions are at least `len` bytes and distinct; the
            // old region came from `alloc` with size `cap`.
            unsafe {
                ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
                self.alloc.deallocate(self.ptr, self.cap);
            }
        }

        self.ptr = new_ptr;
        self.cap = new_cap;
        Ok(())
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), PoolError> {
        self.reserve(bytes.len())?;
        // SAFETY: reserve guaranteed `cap - len >= bytes.len()`.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<A: RawAlloc + ?Sized> Deref for PoolBuf<'_, A> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<A: RawAlloc + ?Sized> io::Write for PoolBuf<'_, A> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<A: RawAlloc + ?Sized> Drop for PoolBuf<'_, A> {
    fn drop(&mut self) {
        if self.cap > 0 {
            // SAFETY: the region came from `alloc` with size `cap`.
            unsafe { self.alloc.deallocate(self.ptr, self.cap) };
        }
    }
}

impl<A: RawAlloc + ?Sized> std::fmt::Debug for PoolBuf<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuf")
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BlockPool;
    use std::io::Write;

    /// Refuses every request.
    struct Exhausted;

    impl RawAlloc for Exhausted {
        fn allocate(&self, _size: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn deallocate(&self, _ptr: NonNull<u8>, _size: usize) {}
    }

    #[test]
    fn test_empty_buffer_allocates_nothing() {
        let pool = BlockPool::new(4096, 128, 16).unwrap();
        let buf = PoolBuf::new(&pool);
        assert!(buf.is_empty());
        assert_eq!(buf.as_slice(), b"");
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn test_short_content_stays_in_pool() {
        let pool = BlockPool::new(4096, 128, 16).unwrap();
        {
            let mut buf = PoolBuf::with_capacity(&pool, 64).unwrap();
            write!(buf, "{{\"dev_id\":{}}}", 7).unwrap();
            assert_eq!(&buf[..], br#"{"dev_id":7}"#);
        }

        let stats = pool.stats();
        assert_eq!(stats.pool_allocations, 1);
        assert_eq!(stats.pool_frees, 1);
        assert_eq!(stats.fallback_allocations, 0);
    }

    #[test]
    fn test_growth_spills_to_fallback_and_keeps_bytes() {
        let pool = BlockPool::new(4096, 128, 16).unwrap();
        {
            let mut buf = PoolBuf::with_capacity(&pool, 32).unwrap();
            let chunk = [b'x'; 50];
            for _ in 0..10 {
                buf.extend_from_slice(&chunk).unwrap();
            }
            assert_eq!(buf.len(), 500);
            assert!(buf.iter().all(|&b| b == b'x'));
        }

        let stats = pool.stats();
        assert_eq!(stats.blocks_in_use(), 0);
        assert_eq!(stats.fallback_in_use(), 0);
        assert!(stats.fallback_allocations > 0);
    }

    #[test]
    fn test_exhausted_allocator_surfaces_error() {
        let mut buf = PoolBuf::new(&Exhausted);
        assert!(matches!(
            buf.extend_from_slice(b"abc"),
            Err(PoolError::Exhausted(_))
        ));
        let err = buf.write(b"abc").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }
}
