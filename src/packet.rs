// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! MQTT 3.1 / 3.1.1 packet types and codec.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
///
/// QoS 2 is parsed so a downgrade decision can be made at the session layer,
/// but the broker never delivers at QoS 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid QoS: {value}"
            ))),
        }
    }
}

/// CONNACK return codes (MQTT 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

/// MQTT Packets.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
#[derive(Debug, Clone)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message configuration.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Decoder cursor over a packet body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.3-2: UTF-8 string MUST NOT contain null character U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            )
            .into());
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }
}

/// Decode the remaining length field (variable length encoding).
/// Returns (length, bytes_consumed) or None if incomplete.
fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        value += ((byte & 0x7F) as usize) * multiplier;

        if multiplier > 128 * 128 * 128 {
            return Err(ProtocolError::InvalidRemainingLength.into());
        }

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    // Need more bytes
    Ok(None)
}

/// Encode remaining length into the buffer.
fn encode_remaining_length(mut len: usize, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Try to decode a complete packet from the buffer.
///
/// Returns Ok(Some((packet, bytes_consumed))) on success, Ok(None) if more
/// data is needed, or Err on protocol errors.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type_raw = fixed_header >> 4;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type_raw)?;
    let body = &buf[header_len..total_len];

    // MQTT-3.8.1-1 / MQTT-3.10.1-1: SUBSCRIBE and UNSUBSCRIBE fixed header
    // flags MUST be 0010
    match packet_type {
        PacketType::Subscribe | PacketType::Unsubscribe => {
            if flags != 0x02 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{packet_type:?} fixed header flags must be 0x02, got {flags:#04x}"
                ))
                .into());
            }
        }
        _ => {}
    }

    let packet = match packet_type {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => {
            let mut dec = Decoder::new(body);
            Packet::Puback {
                packet_id: dec.read_u16()?,
            }
        }
        PacketType::Subscribe => decode_subscribe(body)?,
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsubscribe => decode_unsubscribe(body)?,
        PacketType::Unsuback => {
            let mut dec = Decoder::new(body);
            Packet::Unsuback {
                packet_id: dec.read_u16()?,
            }
        }
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect,
        PacketType::Pubrec | PacketType::Pubrel | PacketType::Pubcomp => {
            // QoS 2 flow is not supported by this broker
            return Err(ProtocolError::UnexpectedPacket("QoS 2 acknowledgement").into());
        }
    };

    Ok(Some((packet, total_len)))
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    if protocol_name != "MQIsdp" && protocol_name != "MQTT" {
        return Err(ProtocolError::InvalidProtocolName(protocol_name).into());
    }

    // 3 = MQTT 3.1, 4 = MQTT 3.1.1
    let protocol_version = dec.read_u8()?;
    if protocol_version != 3 && protocol_version != 4 {
        return Err(ProtocolError::UnsupportedProtocolVersion(protocol_version).into());
    }

    let flags = dec.read_u8()?;
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // Reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    // MQTT-3.1.2-11/13: If Will Flag is 0, Will QoS MUST be 0
    if !will_flag && will_qos != QoS::AtMostOnce {
        return Err(
            ProtocolError::MalformedPacket("Will QoS must be 0 when Will Flag is 0".into()).into(),
        );
    }

    // MQTT-3.1.2-15: If Will Flag is 0, Will Retain MUST be 0
    if !will_flag && will_retain {
        return Err(ProtocolError::MalformedPacket(
            "Will Retain must be 0 when Will Flag is 0".into(),
        )
        .into());
    }

    // MQTT-3.1.2-22: If Username Flag is 0, Password Flag MUST be 0
    if !username_flag && password_flag {
        return Err(ProtocolError::MalformedPacket(
            "Password Flag must be 0 when Username Flag is 0".into(),
        )
        .into());
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let payload = dec.read_binary()?;
        Some(Will {
            topic,
            payload: Bytes::from(payload),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        protocol_name,
        protocol_version,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    let code = match dec.read_u8()? {
        0 => ConnackCode::Accepted,
        1 => ConnackCode::UnacceptableProtocolVersion,
        2 => ConnackCode::IdentifierRejected,
        3 => ConnackCode::ServerUnavailable,
        4 => ConnackCode::BadUsernamePassword,
        5 => ConnackCode::NotAuthorized,
        other => {
            return Err(
                ProtocolError::MalformedPacket(format!("Invalid CONNACK code: {other}")).into(),
            )
        }
    };
    Ok(Packet::Connack(Connack {
        session_present: (ack_flags & 0x01) != 0,
        code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(body);
    let topic = dec.read_string()?;

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_u16()?)
    } else {
        None
    };

    let payload = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(payload),
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }
        let qos = QoS::try_from(dec.read_u8()? & 0x03)?;
        topics.push((topic, qos));
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    let return_codes = dec.read_bytes(dec.remaining())?.to_vec();
    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }
        topics.push(topic);
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("UNSUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}

/// Encode a packet into the provided buffer.
///
/// Covers both broker- and client-emitted packets so test harnesses can
/// speak the protocol with the same codec.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => {
            buf.push((PacketType::Connack as u8) << 4);
            buf.push(2);
            buf.push(if connack.session_present { 1 } else { 0 });
            buf.push(connack.code as u8);
        }
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback { packet_id } => encode_simple_ack(PacketType::Puback, *packet_id, buf),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::Suback(suback) => {
            buf.push((PacketType::Suback as u8) << 4);
            encode_remaining_length(2 + suback.return_codes.len(), buf);
            buf.extend_from_slice(&suback.packet_id.to_be_bytes());
            buf.extend_from_slice(&suback.return_codes);
        }
        Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, buf),
        Packet::Unsuback { packet_id } => encode_simple_ack(PacketType::Unsuback, *packet_id, buf),
        Packet::Pingreq => {
            buf.push((PacketType::Pingreq as u8) << 4);
            buf.push(0);
        }
        Packet::Pingresp => {
            buf.push((PacketType::Pingresp as u8) << 4);
            buf.push(0);
        }
        Packet::Disconnect => {
            buf.push((PacketType::Disconnect as u8) << 4);
            buf.push(0);
        }
    }
}

fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    buf.push(fixed_header);

    let topic_len = 2 + publish.topic.len();
    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    encode_remaining_length(topic_len + packet_id_len + publish.payload.len(), buf);

    buf.extend_from_slice(&(publish.topic.len() as u16).to_be_bytes());
    buf.extend_from_slice(publish.topic.as_bytes());

    if let Some(id) = publish.packet_id {
        buf.extend_from_slice(&id.to_be_bytes());
    }

    buf.extend_from_slice(&publish.payload);
}

fn encode_simple_ack(packet_type: PacketType, packet_id: u16, buf: &mut Vec<u8>) {
    buf.push((packet_type as u8) << 4);
    buf.push(2);
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();

    let protocol_name = connect.protocol_name.as_bytes();
    payload.extend_from_slice(&(protocol_name.len() as u16).to_be_bytes());
    payload.extend_from_slice(protocol_name);
    payload.push(connect.protocol_version);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    payload.push(flags);

    payload.extend_from_slice(&connect.keep_alive.to_be_bytes());

    let client_id = connect.client_id.as_bytes();
    payload.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
    payload.extend_from_slice(client_id);

    if let Some(ref will) = connect.will {
        let topic = will.topic.as_bytes();
        payload.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        payload.extend_from_slice(topic);
        payload.extend_from_slice(&(will.payload.len() as u16).to_be_bytes());
        payload.extend_from_slice(&will.payload);
    }

    if let Some(ref username) = connect.username {
        let username = username.as_bytes();
        payload.extend_from_slice(&(username.len() as u16).to_be_bytes());
        payload.extend_from_slice(username);
    }

    if let Some(ref password) = connect.password {
        payload.extend_from_slice(&(password.len() as u16).to_be_bytes());
        payload.extend_from_slice(password);
    }

    buf.push((PacketType::Connect as u8) << 4);
    encode_remaining_length(payload.len(), buf);
    buf.extend_from_slice(&payload);
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    for (topic, qos) in &subscribe.topics {
        let topic_bytes = topic.as_bytes();
        payload.extend_from_slice(&(topic_bytes.len() as u16).to_be_bytes());
        payload.extend_from_slice(topic_bytes);
        payload.push(*qos as u8);
    }

    // Fixed header flags must be 0x02
    buf.push(((PacketType::Subscribe as u8) << 4) | 0x02);
    encode_remaining_length(payload.len(), buf);
    buf.extend_from_slice(&payload);
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) {
    let mut payload = Vec::new();
    payload.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
    for topic in &unsubscribe.topics {
        let topic_bytes = topic.as_bytes();
        payload.extend_from_slice(&(topic_bytes.len() as u16).to_be_bytes());
        payload.extend_from_slice(topic_bytes);
    }

    buf.push(((PacketType::Unsubscribe as u8) << 4) | 0x02);
    encode_remaining_length(payload.len(), buf);
    buf.extend_from_slice(&payload);
}
