//! ## sensorgw-engine::document
//! **Compact JSON documents built in pool memory**
//!
//! Published readings are small flat objects of numbers, so the builder
//! writes straight into a [`PoolBuf`] and never touches the global heap
//! unless a document outgrows a pool block.

use std::io::Write;

use thiserror::Error;

use sensorgw_core::alloc::{PoolBuf, RawAlloc};
use sensorgw_core::PoolError;
use sensorgw_protocols::SensorReading;

const INITIAL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Document allocation failed: {0}")]
    Alloc(#[from] PoolError),

    #[error("Document encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Document write failed: {0}")]
    Write(#[from] std::io::Error),
}

/// Flat JSON object of numeric members.
///
/// Punctuation is written here rather than through a derived `Serialize`:
/// subscribers of the data topic expect whole numbers as `60`, which
/// serde_json would print as `60.0` for an `f64` field. See the document
/// number format entry in DESIGN.md.
pub struct Document<'a, A: RawAlloc + ?Sized> {
    buf: PoolBuf<'a, A>,
    members: usize,
}

impl<'a, A: RawAlloc + ?Sized> Document<'a, A> {
    pub fn new(alloc: &'a A) -> Result<Self, DocumentError> {
        let mut buf = PoolBuf::with_capacity(alloc, INITIAL_CAPACITY)?;
        buf.extend_from_slice(b"{")?;
        Ok(Self { buf, members: 0 })
    }

    /// Reading document published for every valid sensor frame.
    pub fn reading(
        alloc: &'a A,
        reading: &SensorReading,
        gateway_id: u32,
    ) -> Result<PoolBuf<'a, A>, DocumentError> {
        let mut doc = Self::new(alloc)?;
        doc.add_number("dev_id", f64::from(reading.device_id))?;
        doc.add_number("temp", reading.temperature)?;
        doc.add_number("humi", reading.humidity)?;
        doc.add_number("gw_id", f64::from(gateway_id))?;
        doc.serialize()
    }

    /// Integral values print without a fraction; non-finite values as `null`.
    pub fn add_number(&mut self, key: &str, value: f64) -> Result<(), DocumentError> {
        if self.members > 0 {
            self.buf.extend_from_slice(b",")?;
        }
        serde_json::to_writer(&mut self.buf, key)?;
        self.buf.extend_from_slice(b":")?;

        if !value.is_finite() {
            self.buf.extend_from_slice(b"null")?;
        } else if value.fract() == 0.0 && value.abs() < 1e15 {
            write!(self.buf, "{}", value as i64)?;
        } else {
            serde_json::to_writer(&mut self.buf, &value)?;
        }

        self.members += 1;
        Ok(())
    }

    pub fn serialize(mut self) -> Result<PoolBuf<'a, A>, DocumentError> {
        self.buf.extend_from_slice(b"}")?;
        Ok(self.buf)
    }
}
