//! ## sensorgw-protocols::mqtt
//! MQTT 3.1.1 packet codec for the gateway's broker link.
//!
//! Covers the subset a QoS 0/1 publisher-subscriber needs: CONNECT,
//! CONNACK, PUBLISH, PUBACK, SUBSCRIBE, SUBACK, PINGREQ, PINGRESP and
//! DISCONNECT. Decoded packets borrow from the input buffer.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub const CONNECT: u8 = 0x10;
pub const CONNACK: u8 = 0x20;
pub const PUBLISH: u8 = 0x30;
pub const PUBACK: u8 = 0x40;
pub const SUBSCRIBE: u8 = 0x82;
pub const SUBACK: u8 = 0x90;
pub const PINGREQ: u8 = 0xC0;
pub const PINGRESP: u8 = 0xD0;
pub const DISCONNECT: u8 = 0xE0;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;
/// Largest value the four-byte remaining length can carry.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Errors that can occur while parsing an MQTT packet.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MqttParseError {
    #[error("Malformed remaining length field")]
    RemainingLengthMalformed,
    #[error("Malformed {0} packet")]
    Malformed(&'static str),
    #[error("Topic is not valid UTF-8")]
    InvalidTopic,
    #[error("Unsupported QoS level {0}")]
    UnsupportedQos(u8),
}

/// A decoded packet borrowing from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttPacket<'a> {
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish {
        topic: &'a str,
        packet_id: Option<u16>,
        qos: u8,
        retain: bool,
        dup: bool,
        payload: &'a [u8],
    },
    PubAck {
        packet_id: u16,
    },
    SubAck {
        packet_id: u16,
        granted: &'a [u8],
    },
    PingResp,
    /// Any other control packet; the broker should never send one.
    Other {
        header: u8,
        body: &'a [u8],
    },
}

/// Decodes MQTT's variable-length "remaining length" field.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise
/// `(decoded_value, number_of_bytes_used)`.
pub fn decode_remaining_length(input: &[u8]) -> Result<Option<(usize, usize)>, MqttParseError> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    for (i, byte) in input.iter().enumerate() {
        if i == 4 {
            return Err(MqttParseError::RemainingLengthMalformed);
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if input.len() >= 4 {
        return Err(MqttParseError::RemainingLengthMalformed);
    }
    Ok(None)
}

pub fn encode_remaining_length(mut len: usize, dst: &mut BytesMut) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_str(s: &[u8], dst: &mut BytesMut) {
    dst.put_u16(s.len() as u16);
    dst.put_slice(s);
}

fn put_header(header: u8, remaining: usize, dst: &mut BytesMut) {
    dst.reserve(5 + remaining);
    dst.put_u8(header);
    encode_remaining_length(remaining.min(MAX_REMAINING_LENGTH), dst);
}

/// CONNECT with a clean session and no will, username or password.
pub fn encode_connect(client_id: &str, keepalive_secs: u16, dst: &mut BytesMut) {
    let remaining = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2 + 2 + client_id.len();
    put_header(CONNECT, remaining, dst);
    put_str(PROTOCOL_NAME, dst);
    dst.put_u8(PROTOCOL_LEVEL);
    dst.put_u8(CLEAN_SESSION);
    dst.put_u16(keepalive_secs);
    put_str(client_id.as_bytes(), dst);
}

/// PUBLISH. `packet_id` is required for QoS 1 and ignored for QoS 0.
pub fn encode_publish(
    topic: &str,
    payload: &[u8],
    qos: u8,
    retain: bool,
    packet_id: u16,
    dst: &mut BytesMut,
) -> Result<(), MqttParseError> {
    if qos > 1 {
        return Err(MqttParseError::UnsupportedQos(qos));
    }
    let id_len = if qos > 0 { 2 } else { 0 };
    let remaining = 2 + topic.len() + id_len + payload.len();
    if remaining > MAX_REMAINING_LENGTH {
        return Err(MqttParseError::Malformed("PUBLISH"));
    }

    put_header(PUBLISH | (qos << 1) | u8::from(retain), remaining, dst);
    put_str(topic.as_bytes(), dst);
    if qos > 0 {
        dst.put_u16(packet_id);
    }
    dst.put_slice(payload);
    Ok(())
}

/// SUBSCRIBE to a single topic filter.
pub fn encode_subscribe(
    packet_id: u16,
    topic: &str,
    qos: u8,
    dst: &mut BytesMut,
) -> Result<(), MqttParseError> {
    if qos > 1 {
        return Err(MqttParseError::UnsupportedQos(qos));
    }
    let remaining = 2 + 2 + topic.len() + 1;
    put_header(SUBSCRIBE, remaining, dst);
    dst.put_u16(packet_id);
    put_str(topic.as_bytes(), dst);
    dst.put_u8(qos);
    Ok(())
}

pub fn encode_puback(packet_id: u16, dst: &mut BytesMut) {
    put_header(PUBACK, 2, dst);
    dst.put_u16(packet_id);
}

pub fn encode_pingreq(dst: &mut BytesMut) {
    put_header(PINGREQ, 0, dst);
}

pub fn encode_disconnect(dst: &mut BytesMut) {
    put_header(DISCONNECT, 0, dst);
}

fn read_u16(body: &[u8], at: usize, packet: &'static str) -> Result<u16, MqttParseError> {
    body.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(MqttParseError::Malformed(packet))
}

/// Decodes one packet from the front of `data`.
///
/// Returns the packet and the total bytes it occupies, or `Ok(None)` when the
/// packet is not fully buffered yet.
pub fn decode(data: &[u8]) -> Result<Option<(MqttPacket<'_>, usize)>, MqttParseError> {
    let Some(&header) = data.first() else {
        return Ok(None);
    };
    let Some((remaining, len_bytes)) = decode_remaining_length(&data[1..])? else {
        return Ok(None);
    };
    let total = 1 + len_bytes + remaining;
    if data.len() < total {
        return Ok(None);
    }
    let body = &data[1 + len_bytes..total];

    let packet = match header & 0xF0 {
        CONNACK => {
            if body.len() != 2 {
                return Err(MqttParseError::Malformed("CONNACK"));
            }
            MqttPacket::ConnAck {
                session_present: body[0] & 0x01 != 0,
                return_code: body[1],
            }
        }
        PUBLISH => decode_publish(header, body)?,
        PUBACK => MqttPacket::PubAck {
            packet_id: read_u16(body, 0, "PUBACK")?,
        },
        SUBACK => MqttPacket::SubAck {
            packet_id: read_u16(body, 0, "SUBACK")?,
            granted: &body[2..],
        },
        PINGRESP => MqttPacket::PingResp,
        _ => MqttPacket::Other { header, body },
    };
    Ok(Some((packet, total)))
}

fn decode_publish(header: u8, body: &[u8]) -> Result<MqttPacket<'_>, MqttParseError> {
    let qos = (header >> 1) & 0x03;
    if qos > 2 {
        return Err(MqttParseError::UnsupportedQos(qos));
    }

    let topic_len = usize::from(read_u16(body, 0, "PUBLISH")?);
    let topic_bytes = body
        .get(2..2 + topic_len)
        .ok_or(MqttParseError::Malformed("PUBLISH"))?;
    let topic = std::str::from_utf8(topic_bytes).map_err(|_| MqttParseError::InvalidTopic)?;

    let mut offset = 2 + topic_len;
    let packet_id = if qos > 0 {
        let id = read_u16(body, offset, "PUBLISH")?;
        offset += 2;
        Some(id)
    } else {
        None
    };

    Ok(MqttPacket::Publish {
        topic,
        packet_id,
        qos,
        retain: header & 0x01 != 0,
        dup: header & 0x08 != 0,
        payload: &body[offset..],
    })
}
