//! ## sensorgw-core::alloc
//! **Fixed-block memory pool backing the outgoing-document path**
//!
//! ### Expectations (Production):
//! - Small requests served from an intrusive free list without touching the
//!   global allocator
//! - Oversized requests transparently delegated to the global allocator
//! - Safe to call from any thread (single mutex around the free list)
//!
//! ### Key Submodules:
//! - `pool/`: Page pool with address-range ownership tests on free
//! - `stats/`: Allocation counters and snapshots
//! - `buf/`: Growable byte buffer whose storage comes from a `RawAlloc`

pub mod buf;
pub mod pool;
pub mod stats;

pub use buf::PoolBuf;
pub use pool::{BlockPool, RawAlloc};
pub use stats::PoolStats;
