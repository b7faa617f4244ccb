//! ## sensorgw-core::alloc::pool
//! **Fixed-block page pool**
//!
//! Pages are obtained from the global allocator on demand and carved into
//! equally sized blocks threaded onto an intrusive LIFO free list. The first
//! pointer-sized bytes of a free block hold the address of the next free
//! block. Requests at or above the block size bypass the pool entirely.
//!
//! Pages are never returned before the pool itself is dropped.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::stats::{PoolCounters, PoolStats};
use crate::error::PoolError;

const LINK_SIZE: usize = std::mem::size_of::<*mut u8>();

/// Byte-level allocation hooks.
///
/// This is the seam through which document serialization obtains and
/// releases storage.
pub trait RawAlloc {
    /// Returns `None` when storage cannot be obtained.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator with the
    /// same `size`, and must not be used after this call.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

struct PoolInner {
    pages: Vec<NonNull<u8>>,
    free_head: Option<NonNull<u8>>,
    /// Lowest page base seen so far.
    start_addr: usize,
    /// One past the usable end of the highest page seen so far.
    end_addr: usize,
}

pub struct BlockPool {
    inner: Mutex<PoolInner>,
    page_layout: Layout,
    block_size: usize,
    align: usize,
    /// Bytes of each page covered by whole blocks.
    usable_page_size: usize,
    counters: PoolCounters,
}

// SAFETY: the raw page and block pointers are only read or written while the
// inner mutex is held, and the pages are owned exclusively by the pool.
unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    /// Builds a pool without allocating any page.
    ///
    /// `block_size` is rounded up to `align` and to at least one pointer;
    /// `page_size` is raised to hold at least one block.
    pub fn new(page_size: usize, block_size: usize, align: usize) -> Result<Self, PoolError> {
        if !align.is_power_of_two() {
            return Err(PoolError::InvalidAlignment(align));
        }

        let rounded = block_size
            .checked_add(align - 1)
            .map(|size| size & !(align - 1))
            .ok_or(PoolError::InvalidBlockSize { block_size, align })?;
        let block_size = rounded.max(LINK_SIZE);
        let page_size = page_size.max(block_size);
        let page_layout = Layout::from_size_align(page_size, align)
            .map_err(|_| PoolError::InvalidBlockSize { block_size, align })?;

        debug!(page_size, block_size, align, "Block pool configured");

        Ok(Self {
            inner: Mutex::new(PoolInner {
                pages: Vec::new(),
                free_head: None,
                start_addr: usize::MAX,
                end_addr: 0,
            }),
            page_layout,
            block_size,
            align,
            usable_page_size: page_size - page_size % block_size,
            counters: PoolCounters::new(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn page_size(&self) -> usize {
        self.page_layout.size()
    }

    pub fn alignment(&self) -> usize {
        self.align
    }

    pub fn blocks_per_page(&self) -> usize {
        self.usable_page_size / self.block_size
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Number of blocks currently on the free list. Walks the list.
    pub fn free_blocks(&self) -> usize {
        let inner = self.inner.lock();
        let mut count = 0;
        let mut cursor = inner.free_head;
        while let Some(block) = cursor {
            count += 1;
            // SAFETY: every block on the list lives inside an owned page and
            // stores the next link in its first bytes.
            cursor = NonNull::new(unsafe { read_link(block) });
        }
        count
    }

    /// Returns `ptr` to the pool or to the global allocator.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawAlloc::deallocate`].
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let addr = ptr.as_ptr() as usize;
        {
            let mut inner = self.inner.lock();
            if addr >= inner.start_addr && addr < inner.end_addr && self.owns(&inner, addr) {
                push_block(&mut inner, ptr);
                self.counters.record_pool_free();
                return;
            }
        }

        match Layout::from_size_align(size, self.align) {
            Ok(layout) => {
                alloc::dealloc(ptr.as_ptr(), layout);
                self.counters.record_fallback_free();
            }
            Err(_) => warn!(size, "Leaking block with unrepresentable layout"),
        }
    }

    fn owns(&self, inner: &PoolInner, addr: usize) -> bool {
        inner.pages.iter().any(|page| {
            let base = page.as_ptr() as usize;
            addr >= base
                && addr < base + self.usable_page_size
                && (addr - base) % self.block_size == 0
        })
    }

    fn alloc_block(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        if inner.free_head.is_none() {
            if let Err(e) = self.grow(&mut inner) {
                warn!(error = %e, "Block pool could not grow");
                return None;
            }
        }

        let block = inner.free_head?;
        // SAFETY: the head block belongs to an owned page and holds a link.
        inner.free_head = NonNull::new(unsafe { read_link(block) });
        self.counters.record_pool_allocation();
        Some(block)
    }

    fn alloc_fallback(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, self.align).ok()?;
        // SAFETY: size >= block_size > 0, so the layout is non-zero sized.
        let block = NonNull::new(unsafe { alloc::alloc(layout) })?;
        self.counters.record_fallback_allocation();
        Some(block)
    }

    /// Obtains one page and pushes each of its blocks onto the free list.
    fn grow(&self, inner: &mut PoolInner) -> Result<(), PoolError> {
        // SAFETY: page_layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc::alloc(self.page_layout) })
            .ok_or(PoolError::PageExhausted(self.page_layout.size()))?;

        let start = base.as_ptr() as usize;
        inner.pages.push(base);
        inner.start_addr = inner.start_addr.min(start);
        inner.end_addr = inner.end_addr.max(start + self.usable_page_size);

        for offset in (0..self.usable_page_size).step_by(self.block_size) {
            // SAFETY: offset stays inside the page just allocated.
            let block = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
            push_block(inner, block);
        }

        self.counters.record_page();
        debug!(
            pages = inner.pages.len(),
            blocks = self.blocks_per_page(),
            "Block pool grew by one page"
        );
        Ok(())
    }
}

impl RawAlloc for BlockPool {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size < self.block_size {
            self.alloc_block()
        } else {
            self.alloc_fallback(size)
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.free(ptr, size)
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for page in inner.pages.drain(..) {
            // SAFETY: each page was allocated with page_layout in `grow`.
            unsafe { alloc::dealloc(page.as_ptr(), self.page_layout) };
        }
        inner.free_head = None;
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("page_size", &self.page_size())
            .field("block_size", &self.block_size)
            .field("align", &self.align)
            .field("stats", &self.stats())
            .finish()
    }
}

/// # Safety
///
/// `block` must point to at least `LINK_SIZE` readable bytes.
#[inline]
unsafe fn read_link(block: NonNull<u8>) -> *mut u8 {
    ptr::read_unaligned(block.as_ptr() as *const *mut u8)
}

#[inline]
fn push_block(inner: &mut PoolInner, block: NonNull<u8>) {
    let next = inner.free_head.map_or(ptr::null_mut(), NonNull::as_ptr);
    // SAFETY: callers only push blocks of at least LINK_SIZE bytes that the
    // pool owns and nobody else references.
    unsafe { ptr::write_unaligned(block.as_ptr() as *mut *mut u8, next) };
    inner.free_head = Some(block);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_rejects_non_power_of_two_alignment() {
        assert_eq!(
            BlockPool::new(4096, 128, 12).unwrap_err(),
            PoolError::InvalidAlignment(12)
        );
        assert_eq!(
            BlockPool::new(4096, 128, 0).unwrap_err(),
            PoolError::InvalidAlignment(0)
        );
    }

    #[test]
    fn test_block_size_rounding() {
        let pool = BlockPool::new(4096, 100, 16).unwrap();
        assert_eq!(pool.block_size(), 112);
        assert_eq!(pool.blocks_per_page(), 4096 / 112);

        let tiny = BlockPool::new(4096, 1, 1).unwrap();
        assert_eq!(tiny.block_size(), LINK_SIZE);

        let small_page = BlockPool::new(64, 128, 16).unwrap();
        assert_eq!(small_page.page_size(), 128);
        assert_eq!(small_page.blocks_per_page(), 1);
    }

    #[test]
    fn test_no_page_until_first_allocation() {
        let pool = BlockPool::new(4096, 128, 16).unwrap();
        assert_eq!(pool.page_count(), 0);

        let block = pool.allocate(10).unwrap();
        assert_eq!(pool.page_count(), 1);
        assert_eq!(pool.free_blocks(), pool.blocks_per_page() - 1);

        unsafe { pool.deallocate(block, 10) };
        assert_eq!(pool.free_blocks(), pool.blocks_per_page());
    }

    #[test]
    fn test_blocks_are_distinct_and_aligned() {
        let pool = BlockPool::new(4096, 128, 16).unwrap();
        let blocks: Vec<_> = (0..pool.blocks_per_page() * 3)
            .map(|_| pool.allocate(64).unwrap())
            .collect();

        let unique: HashSet<usize> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
        assert_eq!(unique.len(), blocks.len());
        assert!(unique.iter().all(|addr| addr % 16 == 0));
        assert_eq!(pool.page_count(), 3);

        for block in blocks {
            unsafe { pool.deallocate(block, 64) };
        }
        assert_eq!(pool.stats().blocks_in_use(), 0);
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = BlockPool::new(4096, 128, 16).unwrap();
        let first = pool.allocate(8).unwrap();
        unsafe { pool.deallocate(first, 8) };
        let second = pool.allocate(8).unwrap();
        assert_eq!(first, second);
        unsafe { pool.deallocate(second, 8) };
    }

    #[test]
    fn test_repeated_cycles_stay_on_first_page() {
        let pool = BlockPool::new(4096, 128, 16).unwrap();
        for _ in 0..10_000 {
            let block = pool.allocate(100).unwrap();
            assert!(pool.owns(&pool.inner.lock(), block.as_ptr() as usize));
            unsafe { pool.deallocate(block, 100) };
        }

        let stats = pool.stats();
        assert_eq!(pool.page_count(), 1);
        assert_eq!(stats.fallback_allocations, 0);
        assert_eq!(stats.pool_allocations, 10_000);
        assert_eq!(stats.pool_allocations, stats.pool_frees);
    }

    #[test]
    fn test_size_at_block_boundary_uses_fallback() {
        let pool = BlockPool::new(4096, 128, 16).unwrap();

        let pooled = pool.allocate(127).unwrap();
        let fallback = pool.allocate(128).unwrap();
        let big = pool.allocate(10_000).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.pool_allocations, 1);
        assert_eq!(stats.fallback_allocations, 2);
        assert_eq!(fallback.as_ptr() as usize % 16, 0);

        unsafe {
            ptr::write_bytes(big.as_ptr(), 0xAB, 10_000);
            pool.deallocate(pooled, 127);
            pool.deallocate(fallback, 128);
            pool.deallocate(big, 10_000);
        }

        let stats = pool.stats();
        assert_eq!(stats.pool_frees, 1);
        assert_eq!(stats.fallback_frees, 2);
    }

    #[test]
    fn test_block_contents_survive_until_free() {
        let pool = BlockPool::new(256, 32, 8).unwrap();
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(16).unwrap();
        unsafe {
            ptr::write_bytes(a.as_ptr(), 0x11, 16);
            ptr::write_bytes(b.as_ptr(), 0x22, 16);
            assert_eq!(*a.as_ptr().add(15), 0x11);
            assert_eq!(*b.as_ptr(), 0x22);
            pool.deallocate(a, 16);
            pool.deallocate(b, 16);
        }
    }

    #[test]
    fn test_concurrent_allocate_and_free() {
        let pool = Arc::new(BlockPool::new(4096, 64, 16).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        let block = pool.allocate(32).unwrap();
                        unsafe {
                            ptr::write_bytes(block.as_ptr(), 0x5A, 32);
                            pool.deallocate(block, 32);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.pool_allocations, 4_000);
        assert_eq!(stats.pool_frees, 4_000);
        assert_eq!(pool.free_blocks(), pool.page_count() * pool.blocks_per_page());
    }
}
