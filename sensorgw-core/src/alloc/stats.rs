//! ## sensorgw-core::alloc::stats
//! **Block pool allocation counters**
//!
//! Counters are updated with relaxed atomics from inside the pool and read
//! back as a [`PoolStats`] snapshot by the periodic stats report.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Live counters owned by a `BlockPool`.
#[derive(Debug, Default)]
pub struct PoolCounters {
    pool_allocations: AtomicUsize,
    pool_frees: AtomicUsize,
    fallback_allocations: AtomicUsize,
    fallback_frees: AtomicUsize,
    pages: AtomicUsize,
}

impl PoolCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_pool_allocation(&self) {
        self.pool_allocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pool_free(&self) {
        self.pool_frees.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fallback_allocation(&self) {
        self.fallback_allocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fallback_free(&self) {
        self.fallback_frees.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_page(&self) {
        self.pages.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            pool_allocations: self.pool_allocations.load(Ordering::Relaxed),
            pool_frees: self.pool_frees.load(Ordering::Relaxed),
            fallback_allocations: self.fallback_allocations.load(Ordering::Relaxed),
            fallback_frees: self.fallback_frees.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_allocations: usize,
    pub pool_frees: usize,
    pub fallback_allocations: usize,
    pub fallback_frees: usize,
    pub pages: usize,
}

impl PoolStats {
    /// Blocks currently handed out from the free list.
    pub fn blocks_in_use(&self) -> usize {
        self.pool_allocations.saturating_sub(self.pool_frees)
    }

    /// Oversized allocations not yet returned.
    pub fn fallback_in_use(&self) -> usize {
        self.fallback_allocations.saturating_sub(self.fallback_frees)
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pages={} blocks_in_use={} pool_alloc={} pool_free={} fallback_alloc={} fallback_free={}",
            self.pages,
            self.blocks_in_use(),
            self.pool_allocations,
            self.pool_frees,
            self.fallback_allocations,
            self.fallback_frees
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let counters = PoolCounters::new();
        counters.record_pool_allocation();
        counters.record_pool_allocation();
        counters.record_pool_free();
        counters.record_fallback_allocation();
        counters.record_page();

        let stats = counters.snapshot();
        assert_eq!(stats.pool_allocations, 2);
        assert_eq!(stats.pool_frees, 1);
        assert_eq!(stats.blocks_in_use(), 1);
        assert_eq!(stats.fallback_in_use(), 1);
        assert_eq!(stats.pages, 1);
    }

    #[test]
    fn display_is_single_line() {
        let stats = PoolStats {
            pages: 2,
            pool_allocations: 5,
            pool_frees: 3,
            ..Default::default()
        };
        let line = stats.to_string();
        assert!(line.contains("pages=2"));
        assert!(line.contains("blocks_in_use=2"));
        assert!(!line.contains('\n'));
    }
}
