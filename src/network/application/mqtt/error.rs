//! Error kinds raised by the MQTT stack.
//!
//! Retry policy in the session client is keyed off the kind: transport,
//! protocol and timeout failures mean "this connection is unusable" and are
//! absorbed by reconnecting, while configuration and acknowledgement errors
//! are handed straight back to the caller because a new connection cannot
//! fix them.

use crate::network::error::Error as NetError;
use core::fmt;

/// Top-level error for every MQTT operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The byte stream failed or was closed.
    Transport(NetError),
    /// The broker sent something this client cannot make sense of.
    Protocol(ProtocolError),
    /// Invalid configuration or call arguments.
    Config(ConfigError),
    /// The broker answered, but not with what was asked for.
    Ack(AckError),
    /// A bounded wait exceeded the configured response time.
    Timeout,
    /// The client was disconnected by the application.
    Disconnected,
}

/// Malformed or unexpected traffic from the broker.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// CONNACK fixed header was not `0x20 0x02`.
    BadConnack,
    /// CONNACK carried a non-zero return code.
    ConnectionRefused(u8),
    /// A packet type this client never expects from a broker.
    UnexpectedPacket(u8),
    /// The declared remaining length does not fit the packet type.
    LengthMismatch,
    /// A remaining-length field longer than four bytes.
    MalformedLength,
    /// An inbound PUBLISH used QoS 2 (or the reserved value 3).
    UnsupportedQos(u8),
}

/// Rejected configuration or arguments.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// No broker host was given.
    MissingHost,
    /// The client identifier is empty.
    MissingClientId,
    /// The response time must be at least one second.
    InvalidResponseTime,
    /// Keepalive must be 0 or at least 1.5 times the response time.
    KeepaliveTooShort,
    /// Only QoS 0 and 1 are supported.
    InvalidQos,
    /// Topics must not be empty.
    EmptyTopic,
    /// Encoded packet would reach 2 MiB or more.
    MessageTooLong,
    /// A packet identifier was supplied without QoS 1, or missing with it.
    PacketIdMismatch,
}

/// Negative acknowledgements.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AckError {
    /// The broker refused the subscription (SUBACK 0x80).
    Refused,
    /// The broker granted a different QoS than requested.
    QosMismatch,
}

impl Error {
    /// Whether the error means the current connection must be replaced.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_) | Error::Timeout)
    }
}

impl From<NetError> for Error {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Timeout => Error::Timeout,
            other => Error::Transport(other),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<AckError> for Error {
    fn from(e: AckError) -> Self {
        Error::Ack(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport: {}", e),
            Error::Protocol(e) => write!(f, "protocol: {}", e),
            Error::Config(e) => write!(f, "config: {}", e),
            Error::Ack(e) => write!(f, "ack: {}", e),
            Error::Timeout => f.write_str("connection timed out"),
            Error::Disconnected => f.write_str("client disconnected"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadConnack => f.write_str("bad CONNACK"),
            ProtocolError::ConnectionRefused(code) => {
                write!(f, "connection refused, return code {}", code)
            }
            ProtocolError::UnexpectedPacket(op) => write!(f, "unexpected packet 0x{:02x}", op),
            ProtocolError::LengthMismatch => f.write_str("remaining length mismatch"),
            ProtocolError::MalformedLength => f.write_str("malformed remaining length"),
            ProtocolError::UnsupportedQos(qos) => write!(f, "QoS {} not supported", qos),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigError::MissingHost => "no server specified",
            ConfigError::MissingClientId => "empty client id",
            ConfigError::InvalidResponseTime => "response time must be positive",
            ConfigError::KeepaliveTooShort => "keepalive not >= 1.5x response time",
            ConfigError::InvalidQos => "only QoS 0 and 1 are supported",
            ConfigError::EmptyTopic => "empty topic",
            ConfigError::MessageTooLong => "message too long",
            ConfigError::PacketIdMismatch => "packet id must be present iff QoS is 1",
        })
    }
}

impl fmt::Display for AckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AckError::Refused => "subscription refused",
            AckError::QosMismatch => "subscription QoS mismatch",
        })
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
