//! MQTT 3.1.1 packet encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// Encode a packet into the buffer.
pub fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect(p) => encode_connect(p, buf),
        Packet::ConnAck(p) => encode_connack(p, buf),
        Packet::Publish(p) => encode_publish(p, buf),
        Packet::PubAck(p) => encode_ack(0x40, p.packet_id, buf),
        Packet::PubRec(p) => encode_ack(0x50, p.packet_id, buf),
        Packet::PubRel(p) => encode_ack(0x62, p.packet_id, buf),
        Packet::PubComp(p) => encode_ack(0x70, p.packet_id, buf),
        Packet::Subscribe(p) => encode_subscribe(p, buf),
        Packet::SubAck(p) => encode_suback(p, buf),
        Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
        Packet::UnsubAck(p) => encode_unsuback(p, buf),
        Packet::PingReq => {
            buf.put_u8(0xC0);
            buf.put_u8(0x00);
            Ok(())
        }
        Packet::PingResp => {
            buf.put_u8(0xD0);
            buf.put_u8(0x00);
            Ok(())
        }
        Packet::Disconnect => {
            buf.put_u8(0xE0);
            buf.put_u8(0x00);
            Ok(())
        }
    }
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // protocol name + level + flags + keep alive
    let mut remaining = 6 + 1 + 1 + 2;
    remaining += 2 + packet.client_id.len();

    if let Some(ref will) = packet.will {
        remaining += 2 + will.topic.len();
        remaining += 2 + will.payload.len();
    }
    if let Some(ref username) = packet.username {
        remaining += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        remaining += 2 + password.len();
    }

    buf.put_u8(0x10);
    write_variable_int(buf, remaining as u32)?;

    write_string(buf, "MQTT")?;
    buf.put_u8(packet.protocol_level);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);
    write_string(buf, &packet.client_id)?;

    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x20);
    buf.put_u8(0x02);
    buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
    buf.put_u8(packet.return_code as u8);
    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining = 2 + packet.topic.len();
    if packet.qos != QoS::AtMostOnce {
        remaining += 2;
    }
    remaining += packet.payload.len();

    let mut first_byte: u8 = 0x30;
    if packet.dup {
        first_byte |= 0x08;
    }
    first_byte |= (packet.qos as u8) << 1;
    if packet.retain {
        first_byte |= 0x01;
    }
    buf.put_u8(first_byte);
    write_variable_int(buf, remaining as u32)?;

    write_string(buf, &packet.topic)?;
    if let Some(packet_id) = packet.packet_id {
        buf.put_u16(packet_id);
    }
    buf.put_slice(&packet.payload);

    Ok(())
}

/// Encode the fixed two byte acknowledgment body shared by the ack packets.
fn encode_ack(first_byte: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining = 2;
    for req in &packet.filters {
        remaining += 2 + req.filter.len() + 1;
    }

    buf.put_u8(0x82);
    write_variable_int(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);

    for req in &packet.filters {
        write_string(buf, &req.filter)?;
        buf.put_u8(req.qos as u8);
    }

    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining = 2 + packet.return_codes.len();

    buf.put_u8(0x90);
    write_variable_int(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);
    buf.put_slice(&packet.return_codes);

    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining = 2;
    for filter in &packet.filters {
        remaining += 2 + filter.len();
    }

    buf.put_u8(0xA2);
    write_variable_int(buf, remaining as u32)?;
    buf.put_u16(packet.packet_id);

    for filter in &packet.filters {
        write_string(buf, filter)?;
    }

    Ok(())
}

fn encode_unsuback(packet: &UnsubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0xB0);
    buf.put_u8(0x02);
    buf.put_u16(packet.packet_id);
    Ok(())
}
