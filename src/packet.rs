//! # MQTT Packet Structures and Serialization
//!
//! This module defines the MQTT 3.1.1 control packets a device session needs
//! and the traits for encoding and decoding them to and from a byte buffer.
//! Decoding borrows from the receive buffer, so an inbound [`Publish`] costs no
//! copies.

use crate::error::{CodecError, ProtocolError};
use crate::util::{self, read_u16, read_utf8_string, write_binary, write_bytes, write_utf8_string};
use heapless::Vec;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket.into()),
        }
    }
}

/// A trait for packets that can be encoded into a byte buffer.
pub trait EncodePacket {
    /// Encodes the packet at the start of `buf`, returning the encoded length.
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError>;
}

/// A trait for packets that can be decoded from a complete frame.
pub trait DecodePacket<'a>: Sized {
    /// Decodes `frame`, which must hold exactly one packet.
    fn decode(frame: &'a [u8]) -> Result<Self, CodecError>;
}

/// The packets a broker sends to a client.
#[derive(Debug)]
pub enum MqttPacket<'a> {
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    SubAck(SubAck),
    PingResp,
}

/// Decodes a complete frame into an [`MqttPacket`].
pub fn decode(frame: &[u8]) -> Result<MqttPacket<'_>, CodecError> {
    let first = *frame.first().ok_or(ProtocolError::MalformedPacket)?;
    let packet_type = first >> 4;
    let packet = match packet_type {
        2 => MqttPacket::ConnAck(ConnAck::decode(frame)?),
        3 => MqttPacket::Publish(Publish::decode(frame)?),
        4 => MqttPacket::PubAck(PubAck::decode(frame)?),
        9 => MqttPacket::SubAck(SubAck::decode(frame)?),
        13 => MqttPacket::PingResp,
        _ => return Err(ProtocolError::InvalidPacketType(packet_type).into()),
    };
    Ok(packet)
}

/// Returns the total length of the frame starting at `buf[0]`, once its fixed
/// header is complete.
///
/// `Ok(None)` means more bytes are needed to know the length. The returned
/// length may exceed `buf.len()` while the body is still arriving.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    let mut remaining = 0usize;
    let mut multiplier = 1usize;
    for i in 0..4 {
        let Some(&byte) = buf.get(1 + i) else {
            return Ok(None);
        };
        remaining += (byte & 127) as usize * multiplier;
        if byte & 128 == 0 {
            return Ok(Some(1 + (i + 1) + remaining));
        }
        multiplier *= 128;
    }
    Err(ProtocolError::MalformedPacket.into())
}

/// Splits a frame into its first header byte and its body.
fn split_frame(frame: &[u8]) -> Result<(u8, &[u8]), CodecError> {
    let first = *frame.first().ok_or(ProtocolError::MalformedPacket)?;
    let mut cursor = 1;
    let remaining_len = util::read_variable_byte_integer(&mut cursor, frame)?;
    let body = frame
        .get(cursor..cursor + remaining_len)
        .ok_or(ProtocolError::MalformedPacket)?;
    Ok((first, body))
}

/// Writes a fixed header plus the body produced by `body`.
///
/// The body is written after a 4-byte gap reserved for the remaining length,
/// then moved down once the real length is known.
fn encode_frame<F>(buf: &mut [u8], header: u8, body: F) -> Result<usize, CodecError>
where
    F: FnOnce(&mut usize, &mut [u8]) -> Result<(), CodecError>,
{
    const CONTENT_START: usize = 5;
    if buf.len() < CONTENT_START {
        return Err(CodecError::BufferTooSmall);
    }
    buf[0] = header;
    let mut cursor = CONTENT_START;
    body(&mut cursor, buf)?;

    let remaining_len = cursor - CONTENT_START;
    let len_bytes = util::write_variable_byte_integer_len(&mut buf[1..CONTENT_START], remaining_len)?;
    let header_len = 1 + len_bytes;
    buf.copy_within(CONTENT_START..cursor, header_len);
    Ok(header_len + remaining_len)
}

// --- CONNECT Packet ---
#[derive(Debug)]
pub struct Connect<'a> {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

impl<'a> Connect<'a> {
    pub fn new(client_id: &'a str, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
            username: None,
            password: None,
        }
    }

    /// Attaches credentials. ThingsBoard-style brokers take the device access
    /// token as the username and no password.
    pub fn with_credentials(mut self, username: Option<&'a str>, password: Option<&'a [u8]>) -> Self {
        self.username = username;
        self.password = password;
        self
    }
}

impl EncodePacket for Connect<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        encode_frame(buf, 0x10, |cursor, buf| {
            write_utf8_string(cursor, buf, "MQTT")?;
            // Protocol level 4 is MQTT 3.1.1
            write_bytes(cursor, buf, &[4])?;
            let mut flags = 0;
            if self.clean_session {
                flags |= 0x02;
            }
            if self.username.is_some() {
                flags |= 0x80;
            }
            if self.password.is_some() {
                flags |= 0x40;
            }
            write_bytes(cursor, buf, &[flags])?;
            write_bytes(cursor, buf, &self.keep_alive.to_be_bytes())?;
            write_utf8_string(cursor, buf, self.client_id)?;
            if let Some(username) = self.username {
                write_utf8_string(cursor, buf, username)?;
            }
            if let Some(password) = self.password {
                write_binary(cursor, buf, password)?;
            }
            Ok(())
        })
    }
}

// --- CONNACK Packet ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: u8,
}

impl DecodePacket<'_> for ConnAck {
    fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (_, body) = split_frame(frame)?;
        match body {
            [flags, reason_code, ..] => Ok(Self {
                session_present: (flags & 0x01) != 0,
                reason_code: *reason_code,
            }),
            _ => Err(ProtocolError::MalformedPacket.into()),
        }
    }
}

// --- PUBLISH Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub retain: bool,
    pub payload: &'a [u8],
    pub packet_id: Option<u16>,
}

impl<'a> Publish<'a> {
    /// A QoS 0, non-retained message.
    pub fn new(topic: &'a str, payload: &'a [u8]) -> Self {
        Self {
            topic,
            qos: QoS::AtMostOnce,
            retain: false,
            payload,
            packet_id: None,
        }
    }
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode(frame: &'a [u8]) -> Result<Self, CodecError> {
        let (first, body) = split_frame(frame)?;
        let qos = QoS::from_bits((first >> 1) & 0x03)?;
        let retain = first & 0x01 != 0;

        let mut cursor = 0;
        let topic = read_utf8_string(&mut cursor, body)?;
        let packet_id = if qos != QoS::AtMostOnce {
            Some(read_u16(&mut cursor, body)?)
        } else {
            None
        };
        let payload = body.get(cursor..).ok_or(ProtocolError::MalformedPacket)?;

        Ok(Publish {
            topic,
            qos,
            retain,
            payload,
            packet_id,
        })
    }
}

impl EncodePacket for Publish<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let header = 0x30 | ((self.qos as u8) << 1) | u8::from(self.retain);
        encode_frame(buf, header, |cursor, buf| {
            write_utf8_string(cursor, buf, self.topic)?;
            if self.qos != QoS::AtMostOnce {
                let id = self.packet_id.ok_or(ProtocolError::MalformedPacket)?;
                write_bytes(cursor, buf, &id.to_be_bytes())?;
            }
            write_bytes(cursor, buf, self.payload)
        })
    }
}

// --- PUBACK Packet ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
}

impl DecodePacket<'_> for PubAck {
    fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (_, body) = split_frame(frame)?;
        let mut cursor = 0;
        Ok(PubAck {
            packet_id: read_u16(&mut cursor, body)?,
        })
    }
}

impl EncodePacket for PubAck {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        encode_frame(buf, 0x40, |cursor, buf| {
            write_bytes(cursor, buf, &self.packet_id.to_be_bytes())
        })
    }
}

// --- SUBSCRIBE Packet ---
#[derive(Debug)]
pub struct Subscribe<'a> {
    pub packet_id: u16,
    pub topic: &'a str,
    pub qos: QoS,
}

impl<'a> Subscribe<'a> {
    /// Creates a new Subscribe packet with a single topic filter.
    pub fn new(packet_id: u16, topic: &'a str, qos: QoS) -> Self {
        Self {
            packet_id,
            topic,
            qos,
        }
    }
}

impl EncodePacket for Subscribe<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        // SUBSCRIBE carries the reserved flag bits 0b0010
        encode_frame(buf, 0x82, |cursor, buf| {
            write_bytes(cursor, buf, &self.packet_id.to_be_bytes())?;
            write_utf8_string(cursor, buf, self.topic)?;
            write_bytes(cursor, buf, &[self.qos as u8])
        })
    }
}

// --- SUBACK Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub reason_codes: Vec<u8, 8>,
}

impl SubAck {
    /// Whether the broker rejected any of the requested filters.
    pub fn has_failure(&self) -> bool {
        self.reason_codes.iter().any(|code| *code >= 0x80)
    }
}

impl DecodePacket<'_> for SubAck {
    fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (_, body) = split_frame(frame)?;
        let mut cursor = 0;
        let packet_id = read_u16(&mut cursor, body)?;
        let mut reason_codes = Vec::new();
        for code in &body[cursor..] {
            reason_codes
                .push(*code)
                .map_err(|_| ProtocolError::MalformedPacket)?;
        }
        Ok(SubAck {
            packet_id,
            reason_codes,
        })
    }
}

// --- PINGREQ Packet ---
#[derive(Debug)]
pub struct PingReq;

impl EncodePacket for PingReq {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut cursor = 0;
        write_bytes(&mut cursor, buf, &[0xC0, 0x00])?;
        Ok(cursor)
    }
}

// --- DISCONNECT Packet ---
#[derive(Debug)]
pub struct Disconnect;

impl EncodePacket for Disconnect {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut cursor = 0;
        write_bytes(&mut cursor, buf, &[0xE0, 0x00])?;
        Ok(cursor)
    }
}
