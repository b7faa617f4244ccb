//! # sensorgw-core
//!
//! Allocation and timekeeping primitives used by the gateway reactor.
//!
//! ### Expectations (Production):
//! - No general-purpose allocator traffic for small outgoing documents
//! - O(1) amortized timer insert and expiry
//! - Single reactor thread; only the block pool is shared across threads
//!
//! ### Key Submodules:
//! - `alloc`: Fixed-block page pool, its counters and a pool-backed byte buffer
//! - `time`: Monotonic/manual clocks and the five-level timing wheel

pub mod alloc;
pub mod error;
pub mod time;

pub mod prelude {
    pub use crate::alloc::*;
    pub use crate::error::*;
    pub use crate::time::*;
}

pub use error::{PoolError, TimerError};
