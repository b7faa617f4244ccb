//! ## sensorgw-protocols::sensor
//! Fixed-size binary sensor frame.
//!
//! ```text
//! [u16 BE length = 8][u8 device][u16 BE raw temp][u16 BE raw humi][u8 status][u16 BE checksum]
//! ```
//!
//! The checksum is the 16-bit wrapping sum of the four host-order fields.
//! A bad length means the stream lost alignment and is recovered by sliding a
//! single byte; a bad checksum discards the whole frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Payload bytes following the length field.
pub const FRAME_PAYLOAD_LEN: usize = 8;
/// Length field plus payload.
pub const FRAME_LEN: usize = 2 + FRAME_PAYLOAD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorFrame {
    pub device_id: u8,
    pub raw_temp: u16,
    pub raw_humi: u16,
    pub status: u8,
    pub checksum: u16,
}

/// Decoded reading in engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub device_id: u8,
    pub temperature: f64,
    pub humidity: f64,
    pub status: u8,
}

/// Result of one extraction attempt on an inbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStep {
    /// A valid frame; `FRAME_LEN` bytes were consumed.
    Frame(SensorFrame),
    /// Length field was not 8; one byte was consumed.
    Resync { declared: u16 },
    /// Checksum mismatch; `FRAME_LEN` bytes were consumed.
    Corrupt { computed: u16, received: u16 },
    /// Fewer than `FRAME_LEN` bytes buffered; nothing consumed.
    NeedMore,
}

impl SensorFrame {
    /// Builds a frame carrying the correct checksum.
    pub fn new(device_id: u8, raw_temp: u16, raw_humi: u16, status: u8) -> Self {
        let mut frame = Self {
            device_id,
            raw_temp,
            raw_humi,
            status,
            checksum: 0,
        };
        frame.checksum = frame.compute_checksum();
        frame
    }

    pub fn compute_checksum(&self) -> u16 {
        u16::from(self.device_id)
            .wrapping_add(self.raw_temp)
            .wrapping_add(self.raw_humi)
            .wrapping_add(u16::from(self.status))
    }

    pub fn is_valid(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    pub fn reading(&self) -> SensorReading {
        SensorReading {
            device_id: self.device_id,
            temperature: f64::from(self.raw_temp) / 100.0,
            humidity: f64::from(self.raw_humi) / 100.0,
            status: self.status,
        }
    }

    /// Appends the framed wire representation, length field included.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(FRAME_LEN);
        dst.put_u16(FRAME_PAYLOAD_LEN as u16);
        dst.put_u8(self.device_id);
        dst.put_u16(self.raw_temp);
        dst.put_u16(self.raw_humi);
        dst.put_u8(self.status);
        dst.put_u16(self.checksum);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(FRAME_LEN);
        self.encode(&mut dst);
        dst.freeze()
    }

    /// Reads the 8 payload bytes. The caller guarantees the length.
    fn decode_payload(mut payload: &[u8]) -> Self {
        Self {
            device_id: payload.get_u8(),
            raw_temp: payload.get_u16(),
            raw_humi: payload.get_u16(),
            status: payload.get_u8(),
            checksum: payload.get_u16(),
        }
    }
}

/// Attempts to take one frame off the front of `buf`.
pub fn next_step(buf: &mut BytesMut) -> SensorStep {
    if buf.len() < FRAME_LEN {
        return SensorStep::NeedMore;
    }

    let declared = u16::from_be_bytes([buf[0], buf[1]]);
    if usize::from(declared) != FRAME_PAYLOAD_LEN {
        buf.advance(1);
        return SensorStep::Resync { declared };
    }

    let frame = SensorFrame::decode_payload(&buf[2..FRAME_LEN]);
    buf.advance(FRAME_LEN);

    let computed = frame.compute_checksum();
    if computed != frame.checksum {
        return SensorStep::Corrupt {
            computed,
            received: frame.checksum,
        };
    }
    SensorStep::Frame(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn buffer(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    #[test]
    fn test_reference_frame() {
        let frame = SensorFrame::new(3, 2550, 6000, 0);
        assert_eq!(frame.checksum, 8553);
        assert_eq!(hex::encode(frame.to_bytes()), "00080309f61770002169");

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf.extend_from_slice(b"tail");

        assert_eq!(next_step(&mut buf), SensorStep::Frame(frame));
        assert_eq!(&buf[..], b"tail");

        let reading = frame.reading();
        assert_eq!(reading.device_id, 3);
        assert_eq!(reading.temperature, 25.5);
        assert_eq!(reading.humidity, 60.0);
    }

    #[test]
    fn test_checksum_wraps() {
        let frame = SensorFrame::new(0xFF, 0xFFFF, 0xFFFF, 0xFF);
        let expected = (0xFFu32 + 0xFFFF + 0xFFFF + 0xFF) as u16;
        assert_eq!(frame.checksum, expected);
        assert!(frame.is_valid());
    }

    #[test]
    fn test_waits_for_ten_bytes() {
        let bytes = SensorFrame::new(1, 2, 3, 4).to_bytes();
        let mut buf = buffer(&bytes[..9]);
        assert_eq!(next_step(&mut buf), SensorStep::NeedMore);
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn test_wrong_length_slides_one_byte() {
        let mut raw = vec![0x00, 0x05];
        raw.extend_from_slice(&[0xAA; 10]);
        let mut buf = buffer(&raw);

        assert_eq!(next_step(&mut buf), SensorStep::Resync { declared: 5 });
        assert_eq!(&buf[..], &raw[1..]);
    }

    #[test]
    fn test_bad_checksum_discards_whole_frame() {
        let mut frame = SensorFrame::new(3, 2550, 6000, 0);
        frame.checksum = 1234;
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf.extend_from_slice(&[1, 2, 3]);

        assert_eq!(
            next_step(&mut buf),
            SensorStep::Corrupt {
                computed: 8553,
                received: 1234
            }
        );
        assert_eq!(&buf[..], &[1, 2, 3]);
    }

    #[test]
    fn test_misaligned_byte_then_frame() {
        let frame = SensorFrame::new(7, 100, 200, 1);
        let mut buf = buffer(&[0x42]);
        frame.encode(&mut buf);

        assert_eq!(next_step(&mut buf), SensorStep::Resync { declared: 0x4200 });
        assert_eq!(next_step(&mut buf), SensorStep::Frame(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_several_frames_in_one_buffer() {
        let frames: Vec<_> = (0..5).map(|i| SensorFrame::new(i, 1000 + i as u16, 0, 0)).collect();
        let mut buf = BytesMut::new();
        for frame in &frames {
            frame.encode(&mut buf);
        }

        let mut decoded = Vec::new();
        while let SensorStep::Frame(frame) = next_step(&mut buf) {
            decoded.push(frame);
        }
        assert_eq!(decoded, frames);
    }

    proptest! {
        #[test]
        fn prop_garbage_prefix_is_skipped(
            garbage in prop::collection::vec(0x10u8..=0xFF, 0..64),
            device in any::<u8>(),
            temp in any::<u16>(),
            humi in any::<u16>(),
        ) {
            let frame = SensorFrame::new(device, temp, humi, 0);
            let mut buf = BytesMut::from(&garbage[..]);
            frame.encode(&mut buf);

            let mut slides = 0;
            loop {
                match next_step(&mut buf) {
                    SensorStep::Resync { .. } => slides += 1,
                    SensorStep::Frame(decoded) => {
                        prop_assert_eq!(decoded, frame);
                        break;
                    }
                    other => prop_assert!(false, "unexpected step {:?}", other),
                }
            }
            prop_assert_eq!(slides, garbage.len());
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_arbitrary_input_consumes_in_fixed_steps(
            input in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut buf = BytesMut::from(&input[..]);
            loop {
                let before = buf.len();
                let consumed = match next_step(&mut buf) {
                    SensorStep::NeedMore => {
                        prop_assert!(before < FRAME_LEN);
                        break;
                    }
                    SensorStep::Resync { .. } => 1,
                    SensorStep::Frame(_) | SensorStep::Corrupt { .. } => FRAME_LEN,
                };
                prop_assert_eq!(before - buf.len(), consumed);
            }
        }
    }
}
