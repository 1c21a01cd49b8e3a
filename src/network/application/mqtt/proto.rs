//! The MQTT wire protocol over one connection.
//!
//! An [`Engine`] owns a single non-blocking stream from the CONNECT handshake
//! until it is closed. It encodes outgoing packets, decodes incoming ones and
//! hands them to a [`Dispatch`] implementation, and remembers when it last
//! sent a request that expects an answer and when it last received one. It
//! never retries anything: every failure is returned to the caller, which
//! decides whether the connection is worth keeping.
//!
//! Writes from concurrent callers (publish, subscribe, ping and the PUBACKs
//! sent by [`Engine::poll`]) are serialised by a send lock that spans the
//! whole packet, so bytes of different packets never interleave. Reading is
//! expected to be driven by a single task.

use super::config::Config;
use super::error::{ConfigError, Error, ProtocolError};
use super::message::{Message, QoS};
use super::varint;
use crate::fmt::{debug, info, trace, warn};
use crate::network::error::{Error as NetError, NetworkError};
use crate::network::Connection;
use crate::system::Scheduler;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;

// MQTT control packet first bytes
const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PUBACK: u8 = 0x40;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 0x90;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1

/// Delay between attempts on a stream that reported a transient error.
pub const POLL_DELAY_MS: u64 = 5;

/// PUBLISH packets whose remaining length reaches this are refused.
pub const MAX_PUBLISH_LEN: usize = 2_097_152;

/// Default cap on the remaining length of an inbound PUBLISH.
pub const DEFAULT_MAX_INBOUND_LEN: usize = MAX_PUBLISH_LEN - 1;

/// Kind of packet consumed by one successful [`Engine::poll`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    /// PINGRESP
    PingResp,
    /// PUBACK
    PubAck,
    /// SUBACK
    SubAck,
    /// PUBLISH
    Publish,
}

/// Receives the packets decoded by [`Engine::poll`].
///
/// Called synchronously from the reading task; implementations must not
/// block.
pub trait Dispatch {
    /// An application message arrived.
    fn on_publish(&self, message: &Message);
    /// A QoS 1 publish was acknowledged.
    fn on_puback(&self, pid: u16);
    /// A subscription was answered with `granted` (0x80 means refused).
    fn on_suback(&self, pid: u16, granted: u8);
    /// The broker answered a ping.
    fn on_pingresp(&self) {}
}

/// One broker connection speaking MQTT 3.1.1.
///
/// Once a handshake or I/O call has failed the engine must be discarded;
/// it is never reconnected in place.
pub struct Engine<C: Connection, S: Scheduler> {
    stream: RefCell<Option<C>>,
    send_lock: Mutex<NoopRawMutex, ()>,
    scheduler: S,
    response_ms: u64,
    max_inbound: usize,
    last_req: Cell<u64>,
    last_ack: Cell<u64>,
    awaiting: Cell<bool>,
    epoch: u32,
}

impl<C: Connection, S: Scheduler> core::fmt::Debug for Engine<C, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("epoch", &self.epoch)
            .field("open", &self.is_open())
            .field("max_inbound", &self.max_inbound)
            .field("last_req", &self.last_req.get())
            .field("last_ack", &self.last_ack.get())
            .field("awaiting", &self.awaiting.get())
            .finish_non_exhaustive()
    }
}

impl<C: Connection, S: Scheduler> Engine<C, S> {
    /// Wrap `stream` without talking to the broker yet.
    ///
    /// Every blocking read or write is bounded by `response_ms`.
    pub fn new(stream: C, scheduler: S, response_ms: u64, epoch: u32) -> Self {
        let now = scheduler.now_ms();
        Self {
            stream: RefCell::new(Some(stream)),
            send_lock: Mutex::new(()),
            scheduler,
            response_ms,
            max_inbound: DEFAULT_MAX_INBOUND_LEN,
            last_req: Cell::new(now),
            last_ack: Cell::new(now),
            awaiting: Cell::new(false),
            epoch,
        }
    }

    /// Refuse inbound PUBLISH packets whose remaining length exceeds `len`.
    ///
    /// Nothing is allocated for a refused packet.
    pub fn with_max_inbound(mut self, len: usize) -> Self {
        self.max_inbound = len;
        self
    }

    /// Perform the CONNECT/CONNACK handshake on a freshly opened stream.
    ///
    /// On failure the stream is closed and the error returned; there is no
    /// engine to reuse.
    pub async fn connect(
        stream: C,
        config: &Config<'_>,
        scheduler: S,
        epoch: u32,
    ) -> Result<Self, Error> {
        let engine = Self::new(stream, scheduler, config.response_ms(), epoch)
            .with_max_inbound(config.max_inbound_len());
        match engine.handshake(config).await {
            Ok(()) => Ok(engine),
            Err(e) => {
                engine.close();
                Err(e)
            }
        }
    }

    async fn handshake(&self, config: &Config<'_>) -> Result<(), Error> {
        let client_id = config.client_id().as_bytes();
        let will = config.will();
        info!("connecting as {} clean={}", config.client_id(), config.clean());

        let keepalive = match will {
            None => 0,
            Some(_) if config.keepalive() == 0 => 0,
            Some(_) => {
                let min = (self.response_ms * 3).div_ceil(2000);
                let min = u16::try_from(min).unwrap_or(u16::MAX);
                config.keepalive().max(min)
            }
        };

        let mut flags = u8::from(config.clean()) << 1;
        let mut remaining = 10 + 2 + client_id.len();
        if let Some(will) = will {
            flags |= 0x04 | (will.qos() as u8) << 3 | u8::from(will.retain()) << 5;
            remaining += 2 + will.topic().len() + 2 + will.payload().len();
        }
        if let Some(creds) = config.credentials() {
            flags |= 0x80;
            remaining += 2 + creds.user.len();
            if let Some(password) = creds.password {
                flags |= 0x40;
                remaining += 2 + password.len();
            }
        }

        let mut packet = Vec::with_capacity(remaining + 5);
        packet.push(CONNECT);
        packet.extend_from_slice(&varint::encode(remaining)?);
        put_str(&mut packet, PROTOCOL_NAME)?;
        packet.push(PROTOCOL_LEVEL);
        packet.push(flags);
        packet.extend_from_slice(&keepalive.to_be_bytes());
        put_str(&mut packet, client_id)?;
        if let Some(will) = will {
            put_str(&mut packet, will.topic())?;
            put_str(&mut packet, &will.payload().to_vec())?;
        }
        if let Some(creds) = config.credentials() {
            put_str(&mut packet, creds.user.as_bytes())?;
            if let Some(password) = creds.password {
                put_str(&mut packet, password)?;
            }
        }

        self.send([packet.as_slice()]).await?;
        self.mark_request();

        let mut connack = [0u8; 4];
        self.read_exact(&mut connack).await?;
        if connack[0] != CONNACK || connack[1] != 0x02 {
            return Err(ProtocolError::BadConnack.into());
        }
        if connack[3] != 0 {
            warn!("broker refused connection, code {}", connack[3]);
            return Err(ProtocolError::ConnectionRefused(connack[3]).into());
        }
        self.touch_ack();
        debug!("connected, epoch {}", self.epoch);
        Ok(())
    }

    /// Connection epoch this engine was created for.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Whether the stream has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.stream.borrow().is_some()
    }

    /// When a request expecting an answer was last sent, in scheduler ms.
    pub fn last_request(&self) -> u64 {
        self.last_req.get()
    }

    /// When an answer was last received, in scheduler ms.
    pub fn last_ack(&self) -> u64 {
        self.last_ack.get()
    }

    /// Whether a request has been sent that the broker has not answered.
    pub fn is_outstanding(&self) -> bool {
        self.awaiting.get()
    }

    /// Send PINGREQ. The PINGRESP is picked up by [`Engine::poll`].
    pub async fn ping(&self) -> Result<(), Error> {
        self.send([&[PINGREQ, 0][..]]).await?;
        self.mark_request();
        Ok(())
    }

    /// Send a PUBLISH, setting the DUP flag for retransmissions.
    ///
    /// The payload chunks are written one after another under the send lock,
    /// so the body is never copied into a single buffer.
    pub async fn publish(&self, message: &Message, dup: bool) -> Result<(), Error> {
        let remaining = message.remaining_length();
        if remaining >= MAX_PUBLISH_LEN {
            return Err(ConfigError::MessageTooLong.into());
        }
        let topic = message.topic();
        // DUP must stay clear on QoS 0
        let dup = dup && message.qos() == QoS::AtLeastOnce;
        let mut head = Vec::with_capacity(1 + varint::MAX_LEN + 2 + topic.len() + 2);
        head.push(
            PUBLISH
                | (message.qos() as u8) << 1
                | u8::from(message.retain())
                | u8::from(dup) << 3,
        );
        head.extend_from_slice(&varint::encode(remaining)?);
        put_str(&mut head, topic)?;
        if let Some(pid) = message.pid() {
            head.extend_from_slice(&pid.to_be_bytes());
        }
        trace!("publish pid {} dup {}", message.pid().unwrap_or(0), dup);

        self.send(core::iter::once(head.as_slice()).chain(message.payload().chunks()))
            .await?;
        if message.qos() == QoS::AtLeastOnce {
            self.mark_request();
        }
        Ok(())
    }

    /// Send a SUBSCRIBE for one topic filter.
    pub async fn subscribe(&self, topic: &[u8], qos: QoS, pid: u16) -> Result<(), Error> {
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic.into());
        }
        let remaining = 2 + 2 + topic.len() + 1;
        let mut packet = Vec::with_capacity(1 + varint::MAX_LEN + remaining);
        packet.push(SUBSCRIBE);
        packet.extend_from_slice(&varint::encode(remaining)?);
        packet.extend_from_slice(&pid.to_be_bytes());
        put_str(&mut packet, topic)?;
        packet.push(qos as u8);

        self.send([packet.as_slice()]).await?;
        self.mark_request();
        Ok(())
    }

    /// Try once to send DISCONNECT, then close the stream.
    ///
    /// Sending DISCONNECT keeps the broker from publishing the last will.
    /// The attempt is skipped if another packet is halfway through the
    /// stream, and its outcome is ignored.
    pub fn disconnect(&self) {
        if let Ok(_guard) = self.send_lock.try_lock() {
            let _ = self.io(|s| {
                let _ = s.write(&[DISCONNECT, 0]);
                let _ = s.flush();
            });
        }
        self.close();
    }

    /// Close the stream without saying goodbye.
    pub fn close(&self) {
        let stream = self.stream.borrow_mut().take();
        if let Some(stream) = stream {
            if let Err(e) = stream.close() {
                debug!("close failed: {:?}", e.kind());
            }
        }
    }

    /// Process at most one incoming packet.
    ///
    /// Returns `Ok(None)` right away when nothing is waiting on the stream.
    /// Once the first byte of a packet has arrived the rest is read in full,
    /// bounded by its declared length and by the response time.
    pub async fn poll<D: Dispatch>(&self, dispatch: &D) -> Result<Option<PacketType>, Error> {
        let mut op = [0u8; 1];
        match self.io(|s| s.read(&mut op))? {
            Ok(0) => return Err(NetError::ConnectionClosed.into()),
            Ok(_) => {}
            Err(e) if e.kind().is_transient() => return Ok(None),
            Err(e) => return Err(e.kind().into()),
        }
        let op = op[0];
        let len = self.read_len().await?;
        trace!("received op {} len {}", op, len);

        match op {
            PINGRESP => {
                expect_len(len, 0)?;
                self.touch_ack();
                dispatch.on_pingresp();
                Ok(Some(PacketType::PingResp))
            }
            PUBACK => {
                expect_len(len, 2)?;
                let mut body = [0u8; 2];
                self.read_exact(&mut body).await?;
                self.touch_ack();
                dispatch.on_puback(u16::from_be_bytes(body));
                Ok(Some(PacketType::PubAck))
            }
            SUBACK => {
                expect_len(len, 3)?;
                let mut body = [0u8; 3];
                self.read_exact(&mut body).await?;
                self.touch_ack();
                dispatch.on_suback(u16::from_be_bytes([body[0], body[1]]), body[2]);
                Ok(Some(PacketType::SubAck))
            }
            op if op & 0xF0 == PUBLISH => {
                self.receive_publish(op, len, dispatch).await?;
                Ok(Some(PacketType::Publish))
            }
            other => Err(ProtocolError::UnexpectedPacket(other).into()),
        }
    }

    async fn receive_publish<D: Dispatch>(
        &self,
        op: u8,
        len: usize,
        dispatch: &D,
    ) -> Result<(), Error> {
        let qos = match (op >> 1) & 0x03 {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            q => {
                warn!("inbound publish with QoS {}", q);
                return Err(ProtocolError::UnsupportedQos(q).into());
            }
        };
        let retain = op & 0x01 != 0;
        let pid_len = if qos == QoS::AtLeastOnce { 2 } else { 0 };
        if len < 2 + pid_len || len > self.max_inbound {
            warn!("inbound publish of length {} refused", len);
            return Err(ProtocolError::LengthMismatch.into());
        }

        let mut topic_len = [0u8; 2];
        self.read_exact(&mut topic_len).await?;
        let topic_len = usize::from(u16::from_be_bytes(topic_len));
        let Some(payload_len) = len.checked_sub(2 + topic_len + pid_len) else {
            return Err(ProtocolError::LengthMismatch.into());
        };

        let mut topic = vec![0u8; topic_len];
        self.read_exact(&mut topic).await?;
        let pid = if qos == QoS::AtLeastOnce {
            let mut pid = [0u8; 2];
            self.read_exact(&mut pid).await?;
            Some(u16::from_be_bytes(pid))
        } else {
            None
        };
        let mut payload = vec![0u8; payload_len];
        self.read_exact(&mut payload).await?;

        dispatch.on_publish(&Message::from_wire(topic, payload, retain, qos, pid));

        if let Some(pid) = pid {
            let [hi, lo] = pid.to_be_bytes();
            self.send([&[PUBACK, 0x02, hi, lo][..]]).await?;
        }
        Ok(())
    }

    async fn read_len(&self) -> Result<usize, Error> {
        let mut decoder = varint::Decoder::new();
        loop {
            let mut byte = [0u8; 1];
            self.read_exact(&mut byte).await?;
            if let Some(len) = decoder.push(byte[0])? {
                return Ok(len);
            }
        }
    }

    /// Write every part in order as one packet, holding the send lock.
    async fn send<'p>(&self, parts: impl IntoIterator<Item = &'p [u8]>) -> Result<(), Error> {
        let _guard = self.send_lock.lock().await;
        for part in parts {
            self.write_all(part).await?;
        }
        match self.io(|s| s.flush())? {
            Err(e) if !e.kind().is_transient() => Err(e.kind().into()),
            _ => Ok(()),
        }
    }

    async fn write_all(&self, mut buf: &[u8]) -> Result<(), Error> {
        let mut start = self.scheduler.now_ms();
        while !buf.is_empty() {
            match self.io(|s| s.write(buf))? {
                Ok(n) if n > 0 => {
                    buf = &buf[n..];
                    start = self.scheduler.now_ms();
                    continue;
                }
                Ok(_) => {}
                Err(e) if e.kind().is_transient() => {}
                Err(e) => return Err(e.kind().into()),
            }
            self.wait_for_progress(start).await?;
        }
        Ok(())
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        let mut start = self.scheduler.now_ms();
        while filled < buf.len() {
            match self.io(|s| s.read(&mut buf[filled..]))? {
                Ok(0) => return Err(NetError::ConnectionClosed.into()),
                Ok(n) => {
                    filled += n;
                    start = self.scheduler.now_ms();
                    continue;
                }
                Err(e) if e.kind().is_transient() => {}
                Err(e) => return Err(e.kind().into()),
            }
            self.wait_for_progress(start).await?;
        }
        Ok(())
    }

    async fn wait_for_progress(&self, since: u64) -> Result<(), Error> {
        if self.scheduler.elapsed_ms(since) > self.response_ms {
            return Err(Error::Timeout);
        }
        self.scheduler.sleep_ms(POLL_DELAY_MS).await;
        Ok(())
    }

    /// Run `f` on the stream. The borrow never outlives the call.
    fn io<R>(&self, f: impl FnOnce(&mut C) -> R) -> Result<R, Error> {
        let mut slot = self.stream.borrow_mut();
        let stream = slot.as_mut().ok_or(Error::Transport(NetError::NotOpen))?;
        Ok(f(stream))
    }

    // Only the oldest unanswered request counts.
    fn mark_request(&self) {
        if !self.awaiting.replace(true) {
            self.last_req.set(self.scheduler.now_ms());
        }
    }

    fn touch_ack(&self) {
        self.last_ack.set(self.scheduler.now_ms());
        self.awaiting.set(false);
    }
}

fn expect_len(len: usize, expected: usize) -> Result<(), Error> {
    if len == expected {
        Ok(())
    } else {
        Err(ProtocolError::LengthMismatch.into())
    }
}

/// Append a 16-bit length prefixed string.
fn put_str(out: &mut Vec<u8>, s: &[u8]) -> Result<(), Error> {
    let len = u16::try_from(s.len()).map_err(|_| ConfigError::MessageTooLong)?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s);
    Ok(())
}
