//! MQTT 3.1.1 packet decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, FilterRequest, Packet, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe, Will,
};

/// Streaming packet decoder.
///
/// `decode` is called with the unconsumed front of the read buffer and
/// returns `None` until a full packet is available.
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer.
    /// Returns (packet, bytes_consumed), or `None` if the buffer does not yet
    /// hold a complete packet.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => decode_connect(body)?,
            2 => decode_connack(flags, body)?,
            3 => decode_publish(flags, body)?,
            4 => Packet::PubAck(PubAck {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            5 => Packet::PubRec(PubRec {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            6 => Packet::PubRel(PubRel {
                packet_id: decode_ack(flags, 0x02, body)?,
            }),
            7 => Packet::PubComp(PubComp {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            8 => decode_subscribe(flags, body)?,
            9 => decode_suback(flags, body)?,
            10 => decode_unsubscribe(flags, body)?,
            11 => Packet::UnsubAck(UnsubAck {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            12 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingReq
            }
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingResp
            }
            14 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_connect(body: &[u8]) -> Result<Packet, DecodeError> {
    let mut pos = 0;

    let (protocol_name, len) = read_string(&body[pos..])?;
    pos += len;

    // "MQIsdp" is the 3.1 name; the level check below lets the accept path
    // answer with CONNACK 0x01 instead of dropping the connection cold.
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(DecodeError::InvalidProtocolName);
    }

    if pos >= body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let protocol_level = body[pos];
    pos += 1;

    if pos >= body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = body[pos];
    pos += 1;

    // Reserved bit must be zero
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // Password without username is forbidden in 3.1.1
    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    if will_qos > 2 {
        return Err(DecodeError::InvalidQoS(will_qos));
    }
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    if pos + 2 > body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let keep_alive = u16::from_be_bytes([body[pos], body[pos + 1]]);
    pos += 2;

    let (client_id, len) = read_string(&body[pos..])?;
    pos += len;

    let will = if will_flag {
        let (will_topic, len) = read_string(&body[pos..])?;
        pos += len;

        let (will_payload, len) = read_binary(&body[pos..])?;
        pos += len;

        Some(Will {
            topic: will_topic.to_string(),
            payload: Bytes::copy_from_slice(will_payload),
            qos: QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&body[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, _len) = read_binary(&body[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        protocol_level,
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let ack_flags = body[0];
    if (ack_flags & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code = ConnectReturnCode::from_u8(body[1])
        .ok_or(DecodeError::MalformedPacket("unknown connack return code"))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (ack_flags & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut pos = 0;

    let (topic, len) = read_string(&body[pos..])?;
    pos += len;

    // Publish topics carry no wildcards
    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }
    if topic.is_empty() {
        return Err(DecodeError::MalformedPacket("topic cannot be empty"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        if pos + 2 > body.len() {
            return Err(DecodeError::InsufficientData);
        }
        let id = u16::from_be_bytes([body[pos], body[pos + 1]]);
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(&body[pos..]),
    }))
}

/// Decode a two byte packet identifier body shared by the ack packets.
fn decode_ack(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    Ok(u16::from_be_bytes([body[0], body[1]]))
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // SUBSCRIBE fixed header flags must be 0010
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([body[0], body[1]]);
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;

        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }
        if pos >= body.len() {
            return Err(DecodeError::InsufficientData);
        }

        let qos_byte = body[pos];
        pos += 1;

        // Upper six bits are reserved
        if (qos_byte & 0xFC) != 0 {
            return Err(DecodeError::MalformedPacket("reserved bits in requested QoS"));
        }
        let qos = QoS::from_u8(qos_byte & 0x03).ok_or(DecodeError::InvalidQoS(qos_byte & 0x03))?;

        filters.push(FilterRequest {
            filter: filter.to_string(),
            qos,
        });
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must carry at least one filter",
        ));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() < 3 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([body[0], body[1]]);
    let return_codes = body[2..].to_vec();

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // UNSUBSCRIBE fixed header flags must be 0010
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([body[0], body[1]]);
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;
        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }
        filters.push(filter.to_string());
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must carry at least one filter",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
