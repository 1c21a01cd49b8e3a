//! Message types shared by the protocol engine and the session client.

use super::error::{ConfigError, Error};
use alloc::vec::Vec;

/// Quality of Service levels supported by this client.
///
/// QoS 2 is deliberately absent: a broker that delivers at QoS 2 is treated
/// as a protocol error.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    /// **QoS 0**: fire and forget.
    #[default]
    AtMostOnce = 0,
    /// **QoS 1**: acknowledged, possibly delivered more than once.
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            _ => Err(ConfigError::InvalidQos.into()),
        }
    }
}

/// Message body: either one buffer or an ordered list of chunks written
/// back to back, so large bodies never need to be joined into one buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Payload {
    /// A single contiguous buffer.
    Bytes(Vec<u8>),
    /// Chunks sent in order; the receiver sees their concatenation.
    Chunks(Vec<Vec<u8>>),
}

impl Payload {
    /// Total length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(b) => b.len(),
            Payload::Chunks(chunks) => chunks.iter().map(Vec::len).sum(),
        }
    }

    /// Whether the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The pieces to write, in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        let (single, many) = match self {
            Payload::Bytes(b) => (Some(b.as_slice()), &[][..]),
            Payload::Chunks(chunks) => (None, chunks.as_slice()),
        };
        single.into_iter().chain(many.iter().map(Vec::as_slice))
    }

    /// Concatenated copy of the payload.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Bytes(Vec::new())
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Payload::Bytes(b.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Payload {
    fn from(b: &[u8; N]) -> Self {
        Payload::Bytes(b.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Vec<Vec<u8>>> for Payload {
    fn from(chunks: Vec<Vec<u8>>) -> Self {
        Payload::Chunks(chunks)
    }
}

/// An MQTT application message.
///
/// A packet id is present exactly when the QoS is 1; the constructors
/// enforce this, so every `Message` in circulation satisfies it.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Message {
    topic: Vec<u8>,
    payload: Payload,
    retain: bool,
    qos: QoS,
    pid: Option<u16>,
}

impl Message {
    /// Build a message, checking the topic and the pid/QoS pairing.
    pub fn new(
        topic: impl AsRef<[u8]>,
        payload: impl Into<Payload>,
        retain: bool,
        qos: QoS,
        pid: Option<u16>,
    ) -> Result<Self, Error> {
        let topic = topic.as_ref();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic.into());
        }
        match (qos, pid) {
            (QoS::AtMostOnce, None) | (QoS::AtLeastOnce, Some(_)) => {}
            _ => return Err(ConfigError::PacketIdMismatch.into()),
        }
        Ok(Self {
            topic: topic.to_vec(),
            payload: payload.into(),
            retain,
            qos,
            pid,
        })
    }

    // Decoded PUBLISH; the caller derives `pid` from `qos`.
    pub(crate) fn from_wire(
        topic: Vec<u8>,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
        pid: Option<u16>,
    ) -> Self {
        Self {
            topic,
            payload: Payload::Bytes(payload),
            retain,
            qos,
            pid,
        }
    }

    /// A QoS 0 message.
    pub fn at_most_once(
        topic: impl AsRef<[u8]>,
        payload: impl Into<Payload>,
        retain: bool,
    ) -> Result<Self, Error> {
        Self::new(topic, payload, retain, QoS::AtMostOnce, None)
    }

    /// A QoS 1 message carrying `pid`.
    pub fn at_least_once(
        topic: impl AsRef<[u8]>,
        payload: impl Into<Payload>,
        retain: bool,
        pid: u16,
    ) -> Result<Self, Error> {
        Self::new(topic, payload, retain, QoS::AtLeastOnce, Some(pid))
    }

    /// Topic bytes.
    pub fn topic(&self) -> &[u8] {
        &self.topic
    }

    /// Message body.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Retain flag.
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Delivery QoS.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Packet id, present iff QoS is 1.
    pub fn pid(&self) -> Option<u16> {
        self.pid
    }

    /// PUBLISH remaining length: topic, optional pid and payload.
    pub fn remaining_length(&self) -> usize {
        let pid_len = if self.qos == QoS::AtLeastOnce { 2 } else { 0 };
        2 + self.topic.len() + pid_len + self.payload.len()
    }

    /// Split the message back into its parts.
    pub fn into_parts(self) -> (Vec<u8>, Payload, bool, QoS, Option<u16>) {
        (self.topic, self.payload, self.retain, self.qos, self.pid)
    }
}

/// The message the broker publishes on the client's behalf when the
/// connection drops without a DISCONNECT.
///
/// Unlike [`Message`] it carries a QoS without a packet id: the broker picks
/// the id when it eventually publishes the will.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LastWill {
    topic: Vec<u8>,
    payload: Payload,
    retain: bool,
    qos: QoS,
}

impl LastWill {
    /// Build a last will; the topic must not be empty.
    pub fn new(
        topic: impl AsRef<[u8]>,
        payload: impl Into<Payload>,
        retain: bool,
        qos: QoS,
    ) -> Result<Self, Error> {
        let topic = topic.as_ref();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic.into());
        }
        Ok(Self {
            topic: topic.to_vec(),
            payload: payload.into(),
            retain,
            qos,
        })
    }

    /// Topic bytes.
    pub fn topic(&self) -> &[u8] {
        &self.topic
    }

    /// Will body.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Retain flag for the will publish.
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// QoS for the will publish.
    pub fn qos(&self) -> QoS {
        self.qos
    }
}
