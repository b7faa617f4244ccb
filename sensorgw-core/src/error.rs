use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Block alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("Block size {block_size} cannot be aligned to {align}")]
    InvalidBlockSize { block_size: usize, align: usize },

    #[error("Page of {0} bytes could not be allocated")]
    PageExhausted(usize),

    #[error("Allocation of {0} bytes failed")]
    Exhausted(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("Timer delay {delay_ms}ms exceeds the supported maximum of {max_ms}ms")]
    DelayTooLong { delay_ms: u64, max_ms: u64 },
}
