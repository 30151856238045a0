//! # Error Types
//!
//! This module defines the error types used throughout the crate, from MQTT
//! transport and protocol failures up to the request-level outcomes reported
//! by the RPC and attribute clients.

use core::fmt;

/// The primary error enum for the MQTT session.
///
/// It is generic over the transport error type `T`, allowing it to wrap
/// specific errors from the underlying network transport (e.g., TCP, UART).
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError<T> {
    /// An error occurred in the underlying transport layer.
    Transport(T),
    /// A protocol-level error occurred, indicating a violation of the MQTT specification.
    Protocol(ProtocolError),
    /// The connection was refused by the broker. The enclosed code provides the reason.
    ConnectionRefused(ConnectReasonCode),
    /// The client is not currently connected to the broker.
    NotConnected,
    /// The buffer provided for an operation was too small.
    BufferTooSmall,
    /// An operation timed out.
    Timeout,
}

impl<T> MqttError<T> {
    /// Whether the error means the link to the broker can no longer be used.
    pub fn is_link_lost(&self) -> bool {
        matches!(
            self,
            MqttError::Transport(_)
                | MqttError::Timeout
                | MqttError::NotConnected
                | MqttError::Protocol(ProtocolError::ConnectionClosed)
        )
    }
}

impl<T> From<CodecError> for MqttError<T> {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::BufferTooSmall => MqttError::BufferTooSmall,
            CodecError::Protocol(p) => MqttError::Protocol(p),
        }
    }
}

/// Errors raised while encoding or decoding MQTT packets.
///
/// Packet code never touches the transport, so it reports this narrower type
/// and the client lifts it into [`MqttError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodecError {
    /// The output buffer cannot hold the encoded packet.
    BufferTooSmall,
    /// The input bytes are not a valid packet.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for CodecError {
    fn from(err: ProtocolError) -> Self {
        CodecError::Protocol(err)
    }
}

/// Represents the reason codes for a connection refusal (`CONNACK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReasonCode {
    /// The connection was accepted.
    Success,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// An unknown or unspecified error occurred.
    Other(u8),
}

impl From<u8> for ConnectReasonCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Success,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

/// Enumerates specific MQTT protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An invalid packet type was received.
    InvalidPacketType(u8),
    /// The server sent an invalid or unexpected response.
    InvalidResponse,
    /// The connection was closed by the broker.
    ConnectionClosed,
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// The payload of a message exceeds the maximum allowable size.
    PayloadTooLarge,
    /// A string was not valid UTF-8.
    InvalidUtf8String,
}

/// Why a request could not be issued.
///
/// None of these are fatal: the request was simply not sent and no callback
/// will ever fire for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestError {
    /// Every slot of the request table is occupied.
    CapacityExceeded,
    /// The session is not connected.
    NotConnected,
    /// An attribute query or upload named no keys.
    EmptyKeys,
    /// An attribute query named more keys than a request can carry.
    TooManyKeys,
    /// An attribute key was empty, too long or contained a separator.
    InvalidKey,
    /// The topic or payload did not fit the outgoing buffers.
    Encode,
    /// The outbox refused the publish.
    OutboxFull,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RequestError::CapacityExceeded => "too many requests in flight",
            RequestError::NotConnected => "not connected",
            RequestError::EmptyKeys => "no attribute keys given",
            RequestError::TooManyKeys => "too many attribute keys",
            RequestError::InvalidKey => "invalid attribute key",
            RequestError::Encode => "request does not fit the outgoing buffers",
            RequestError::OutboxFull => "outbox is full",
        };
        f.write_str(msg)
    }
}

/// A runtime was handed modules it cannot serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The modules registered more topic filters than the registry holds.
    TooManyTopics,
    /// A topic filter is longer than the registry stores.
    TopicTooLong,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConfigError::TooManyTopics => "too many topic filters",
            ConfigError::TopicTooLong => "topic filter too long",
        };
        f.write_str(msg)
    }
}

/// Errors raised while reading or writing JSON documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PayloadError {
    /// The bytes are not UTF-8.
    InvalidUtf8,
    /// The text is not a JSON object, or is truncated.
    Malformed,
    /// Objects or arrays are nested deeper than the reader accepts.
    TooDeep,
    /// The output buffer is full.
    BufferTooSmall,
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PayloadError::InvalidUtf8 => "payload is not valid UTF-8",
            PayloadError::Malformed => "payload is not a JSON object",
            PayloadError::TooDeep => "payload is nested too deeply",
            PayloadError::BufferTooSmall => "payload buffer is too small",
        };
        f.write_str(msg)
    }
}

impl From<fmt::Error> for PayloadError {
    fn from(_: fmt::Error) -> Self {
        PayloadError::BufferTooSmall
    }
}
