//! Test doubles shared by the MQTT integration tests.
//!
//! - [`Clock`] is a virtual-time [`Scheduler`]. [`run`] drives a future to
//!   completion and, whenever nothing is runnable, jumps the clock to the
//!   earliest pending sleep. Timeouts are therefore exact and tests finish
//!   instantly no matter how much virtual time passes.
//! - [`Broker`] is a scripted in-memory MQTT broker. [`FakeNetwork`] and
//!   [`FakeInterface`] reach it and count every call.
//! - [`Wire`] is a bare byte pipe for driving one [`Engine`] directly.
//!
//! [`Engine`]: durable_mqtt::network::application::mqtt::Engine

#![allow(dead_code)]

use durable_mqtt::network::application::mqtt::{varint, Dispatch, Hooks, Message};
use durable_mqtt::network::error::Error as NetError;
use durable_mqtt::network::{
    Close, Connect, Connection, Interface, JoinCredentials, Read, Resolve, Write,
};
use durable_mqtt::system::Scheduler;
use futures::task::{waker, ArcWake};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::{pin, Pin};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Host name the fake resolver knows.
pub const BROKER_HOST: &str = "broker";

const VIRTUAL_LIMIT_MS: u64 = 24 * 3600 * 1000;

// ---------------------------------------------------------------------------
// virtual time

#[derive(Default)]
struct ClockState {
    now: Cell<u64>,
    timers: RefCell<Vec<(u64, Waker)>>,
}

/// Virtual millisecond clock.
#[derive(Clone, Default)]
pub struct Clock(Rc<ClockState>);

impl Clock {
    pub fn now(&self) -> u64 {
        self.0.now.get()
    }

    /// Jump to the earliest deadline and wake its sleepers.
    fn advance(&self) -> bool {
        let due: Vec<(u64, Waker)> = {
            let mut timers = self.0.timers.borrow_mut();
            let Some(next) = timers.iter().map(|(d, _)| *d).min() else {
                return false;
            };
            if next > self.now() {
                self.0.now.set(next);
            }
            let now = self.now();
            let (due, rest) = timers.drain(..).partition(|(d, _)| *d <= now);
            *timers = rest;
            due
        };
        for (_, w) in due {
            w.wake();
        }
        true
    }
}

struct Sleep {
    clock: Clock,
    deadline: u64,
    registered: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.registered && this.clock.now() >= this.deadline {
            return Poll::Ready(());
        }
        if !this.registered {
            this.registered = true;
            this.clock
                .0
                .timers
                .borrow_mut()
                .push((this.deadline, cx.waker().clone()));
        }
        Poll::Pending
    }
}

impl Scheduler for Clock {
    fn now_ms(&self) -> u64 {
        self.now()
    }

    async fn sleep_ms(&self, ms: u64) {
        Sleep {
            clock: self.clone(),
            deadline: self.now() + ms,
            registered: false,
        }
        .await
    }
}

struct Flag(AtomicBool);

impl ArcWake for Flag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::SeqCst);
    }
}

/// Drive `fut` to completion on virtual time.
///
/// Panics if everything is blocked with no timer left, or if a day of
/// virtual time goes by.
pub fn run<F: Future>(clock: &Clock, fut: F) -> F::Output {
    let flag = Arc::new(Flag(AtomicBool::new(false)));
    let waker = waker(flag.clone());
    let mut cx = Context::from_waker(&waker);
    let mut fut = pin!(fut);
    loop {
        flag.0.store(false, Ordering::SeqCst);
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }
        if flag.0.load(Ordering::SeqCst) {
            continue;
        }
        assert!(clock.advance(), "deadlock: no runnable task and no timer");
        assert!(clock.now() < VIRTUAL_LIMIT_MS, "virtual time ran away");
    }
}

/// Sleep in 10 ms steps until `cond` holds, failing after `limit_ms`.
pub async fn wait_until(clock: &Clock, limit_ms: u64, mut cond: impl FnMut() -> bool) {
    let start = clock.now();
    while !cond() {
        assert!(
            clock.now() - start <= limit_ms,
            "condition not met within {} ms",
            limit_ms
        );
        clock.sleep_ms(10).await;
    }
}

// ---------------------------------------------------------------------------
// application hooks

/// Records every hook call.
#[derive(Default)]
pub struct Recorder {
    pub messages: RefCell<Vec<Message>>,
    pub pubacks: RefCell<Vec<u16>>,
    pub subacks: RefCell<Vec<(u16, u8)>>,
    pub interface: RefCell<Vec<bool>>,
    pub connects: Cell<usize>,
}

impl Hooks for Recorder {
    fn on_message(&self, message: &Message) {
        self.messages.borrow_mut().push(message.clone());
    }

    fn on_interface(&self, up: bool) {
        self.interface.borrow_mut().push(up);
    }

    fn on_connect(&self) {
        self.connects.set(self.connects.get() + 1);
    }

    fn on_puback(&self, pid: u16) {
        self.pubacks.borrow_mut().push(pid);
    }

    fn on_suback(&self, pid: u16, granted: u8) {
        self.subacks.borrow_mut().push((pid, granted));
    }
}

impl Dispatch for Recorder {
    fn on_publish(&self, message: &Message) {
        self.on_message(message);
    }

    fn on_puback(&self, pid: u16) {
        Hooks::on_puback(self, pid);
    }

    fn on_suback(&self, pid: u16, granted: u8) {
        Hooks::on_suback(self, pid, granted);
    }
}

// ---------------------------------------------------------------------------
// bare pipe

#[derive(Default)]
struct WireState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    eof: bool,
    closed: bool,
    write_chunk: usize,
}

/// Both ends of one engine's stream: the test pushes what the broker
/// "sends" and inspects what the engine wrote.
#[derive(Clone, Default)]
pub struct Wire(Rc<RefCell<WireState>>);

impl Wire {
    pub fn stream(&self) -> WireStream {
        WireStream(self.clone())
    }

    pub fn push(&self, bytes: &[u8]) {
        self.0.borrow_mut().inbound.extend(bytes.iter().copied());
    }

    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.borrow_mut().outbound)
    }

    /// Reads report end of stream once the pushed bytes are consumed.
    pub fn set_eof(&self) {
        self.0.borrow_mut().eof = true;
    }

    /// Accept at most `n` bytes per write call.
    pub fn set_write_chunk(&self, n: usize) {
        self.0.borrow_mut().write_chunk = n;
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    pub fn pending_inbound(&self) -> usize {
        self.0.borrow().inbound.len()
    }
}

pub struct WireStream(Wire);

impl Read for WireStream {
    type Error = NetError;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut state = self.0 .0.borrow_mut();
        if state.closed {
            return Err(NetError::NotOpen);
        }
        if state.inbound.is_empty() {
            return if state.eof {
                Ok(0)
            } else {
                Err(NetError::WouldBlock)
            };
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for WireStream {
    type Error = NetError;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut state = self.0 .0.borrow_mut();
        if state.closed {
            return Err(NetError::NotOpen);
        }
        let n = match state.write_chunk {
            0 => buf.len(),
            chunk => buf.len().min(chunk),
        };
        state.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Close for WireStream {
    type Error = NetError;

    fn close(self) -> Result<(), Self::Error> {
        self.0 .0.borrow_mut().closed = true;
        Ok(())
    }
}

impl Connection for WireStream {}

// ---------------------------------------------------------------------------
// scripted broker

/// A packet the broker received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect {
        flags: u8,
        keepalive: u16,
        client_id: Vec<u8>,
    },
    Publish {
        topic: Vec<u8>,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
        dup: bool,
        pid: Option<u16>,
    },
    Subscribe {
        pid: u16,
        topic: Vec<u8>,
        qos: u8,
    },
    PingReq,
    Disconnect,
    Other(u8),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    #[default]
    Open,
    /// Peer gone: reads see end of stream, writes stall.
    Dropped,
    /// Closed by the client.
    Closed,
}

#[derive(Default)]
struct Link {
    inbound: Vec<u8>,
    outbound: VecDeque<(u64, Vec<u8>)>,
    state: LinkState,
}

/// Call counters for the transport collaborators.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub connects: usize,
    pub resolves: usize,
    pub joins: usize,
    pub leaves: usize,
    pub join_checks: usize,
}

struct BrokerState {
    clock: Clock,
    links: Vec<Link>,
    log: Vec<(usize, Packet)>,
    subscriptions: Vec<Vec<u8>>,
    connack_code: u8,
    suback_grant: Option<u8>,
    ack_subscribes: bool,
    ack_publishes: bool,
    ack_delay_ms: u64,
    answer_pings: bool,
    pings: Vec<u64>,
    loopback: bool,
    joined: bool,
    join_ok: bool,
    counters: Counters,
}

impl BrokerState {
    fn send(&mut self, link: usize, delay_ms: u64, bytes: Vec<u8>) {
        let at = self.clock.now() + delay_ms;
        self.links[link].outbound.push_back((at, bytes));
    }

    /// Handle every complete packet buffered on `link`.
    fn process(&mut self, link: usize) {
        loop {
            let inbound = &self.links[link].inbound;
            if inbound.is_empty() {
                return;
            }
            let Ok(Some((len, n))) = varint::decode(&inbound[1..]) else {
                return;
            };
            let total = 1 + n + len;
            if inbound.len() < total {
                return;
            }
            let packet: Vec<u8> = self.links[link].inbound.drain(..total).collect();
            self.handle(link, packet[0], &packet[1 + n..]);
        }
    }

    fn handle(&mut self, link: usize, op: u8, body: &[u8]) {
        let packet = match op & 0xF0 {
            0x10 => {
                let id_len = usize::from(u16::from_be_bytes([body[10], body[11]]));
                let code = self.connack_code;
                self.send(link, 0, vec![0x20, 0x02, 0x00, code]);
                Packet::Connect {
                    flags: body[7],
                    keepalive: u16::from_be_bytes([body[8], body[9]]),
                    client_id: body[12..12 + id_len].to_vec(),
                }
            }
            0x30 => {
                let qos = (op >> 1) & 0x03;
                let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                let topic = body[2..2 + topic_len].to_vec();
                let mut pos = 2 + topic_len;
                let pid = (qos > 0).then(|| {
                    pos += 2;
                    u16::from_be_bytes([body[pos - 2], body[pos - 1]])
                });
                let payload = body[pos..].to_vec();
                if let Some(pid) = pid {
                    if self.ack_publishes {
                        let [hi, lo] = pid.to_be_bytes();
                        self.send(link, self.ack_delay_ms, vec![0x40, 0x02, hi, lo]);
                    }
                }
                if self.loopback && self.subscriptions.contains(&topic) {
                    let mut out = vec![0x30];
                    out.extend_from_slice(&varint::encode(2 + topic.len() + payload.len()).unwrap());
                    out.extend_from_slice(&(topic.len() as u16).to_be_bytes());
                    out.extend_from_slice(&topic);
                    out.extend_from_slice(&payload);
                    self.send(link, 0, out);
                }
                Packet::Publish {
                    topic,
                    payload,
                    qos,
                    retain: op & 0x01 != 0,
                    dup: op & 0x08 != 0,
                    pid,
                }
            }
            0x80 => {
                let pid = u16::from_be_bytes([body[0], body[1]]);
                let topic_len = usize::from(u16::from_be_bytes([body[2], body[3]]));
                let topic = body[4..4 + topic_len].to_vec();
                let qos = body[4 + topic_len];
                let granted = self.suback_grant.unwrap_or(qos);
                if self.ack_subscribes {
                    let [hi, lo] = pid.to_be_bytes();
                    self.send(link, 0, vec![0x90, 0x03, hi, lo, granted]);
                }
                if granted != 0x80 {
                    self.subscriptions.push(topic.clone());
                }
                Packet::Subscribe { pid, topic, qos }
            }
            0xC0 => {
                let now = self.clock.now();
                self.pings.push(now);
                if self.answer_pings {
                    self.send(link, 0, vec![0xD0, 0x00]);
                }
                Packet::PingReq
            }
            0xE0 => Packet::Disconnect,
            _ => Packet::Other(op),
        };
        self.log.push((link, packet));
    }
}

/// Handle on the scripted broker. Clones share state.
#[derive(Clone)]
pub struct Broker(Rc<RefCell<BrokerState>>);

impl Broker {
    /// A broker that accepts connections, acknowledges everything and
    /// answers pings. The interface starts joined.
    pub fn new(clock: &Clock) -> Self {
        Self(Rc::new(RefCell::new(BrokerState {
            clock: clock.clone(),
            links: Vec::new(),
            log: Vec::new(),
            subscriptions: Vec::new(),
            connack_code: 0,
            suback_grant: None,
            ack_subscribes: true,
            ack_publishes: true,
            ack_delay_ms: 0,
            answer_pings: true,
            pings: Vec::new(),
            loopback: false,
            joined: true,
            join_ok: true,
            counters: Counters::default(),
        })))
    }

    pub fn network(&self) -> FakeNetwork {
        FakeNetwork(self.clone())
    }

    pub fn interface(&self) -> FakeInterface {
        FakeInterface(self.clone())
    }

    pub fn set_connack_code(&self, code: u8) {
        self.0.borrow_mut().connack_code = code;
    }

    /// Answer every SUBSCRIBE with `granted` instead of the requested QoS.
    pub fn set_suback_grant(&self, granted: u8) {
        self.0.borrow_mut().suback_grant = Some(granted);
    }

    pub fn set_ack_subscribes(&self, on: bool) {
        self.0.borrow_mut().ack_subscribes = on;
    }

    pub fn set_ack_publishes(&self, on: bool) {
        self.0.borrow_mut().ack_publishes = on;
    }

    pub fn set_ack_delay(&self, ms: u64) {
        self.0.borrow_mut().ack_delay_ms = ms;
    }

    pub fn set_answer_pings(&self, on: bool) {
        self.0.borrow_mut().answer_pings = on;
    }

    /// Deliver publishes back to the client on topics it subscribed to.
    pub fn set_loopback(&self, on: bool) {
        self.0.borrow_mut().loopback = on;
    }

    pub fn set_joined(&self, joined: bool) {
        self.0.borrow_mut().joined = joined;
    }

    pub fn set_join_ok(&self, ok: bool) {
        self.0.borrow_mut().join_ok = ok;
    }

    /// Kill the newest connection as a vanished peer would.
    pub fn drop_link(&self) {
        let mut state = self.0.borrow_mut();
        if let Some(link) = state.links.last_mut() {
            link.state = LinkState::Dropped;
        }
    }

    pub fn counters(&self) -> Counters {
        self.0.borrow().counters
    }

    /// Number of connections opened so far.
    pub fn links(&self) -> usize {
        self.0.borrow().links.len()
    }

    /// Everything received, tagged with the connection index.
    pub fn log(&self) -> Vec<(usize, Packet)> {
        self.0.borrow().log.clone()
    }

    /// When each PINGREQ arrived.
    pub fn ping_times(&self) -> Vec<u64> {
        self.0.borrow().pings.clone()
    }

    pub fn publishes(&self) -> Vec<(usize, Packet)> {
        self.log()
            .into_iter()
            .filter(|(_, p)| matches!(p, Packet::Publish { .. }))
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Packet) -> bool) -> usize {
        self.0.borrow().log.iter().filter(|(_, p)| pred(p)).count()
    }
}

/// Broker-side stream of one connection.
pub struct FakeStream {
    broker: Broker,
    id: usize,
}

impl Read for FakeStream {
    type Error = NetError;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut guard = self.broker.0.borrow_mut();
        let state = &mut *guard;
        let now = state.clock.now();
        let link = &mut state.links[self.id];
        match link.state {
            LinkState::Closed => return Err(NetError::NotOpen),
            LinkState::Dropped => return Ok(0),
            LinkState::Open => {}
        }
        let Some((ready, bytes)) = link.outbound.front_mut() else {
            return Err(NetError::WouldBlock);
        };
        if *ready > now {
            return Err(NetError::WouldBlock);
        }
        let n = buf.len().min(bytes.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        bytes.drain(..n);
        if bytes.is_empty() {
            link.outbound.pop_front();
        }
        Ok(n)
    }
}

impl Write for FakeStream {
    type Error = NetError;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut state = self.broker.0.borrow_mut();
        match state.links[self.id].state {
            LinkState::Closed => Err(NetError::NotOpen),
            LinkState::Dropped => Err(NetError::WouldBlock),
            LinkState::Open => {
                state.links[self.id].inbound.extend_from_slice(buf);
                state.process(self.id);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Close for FakeStream {
    type Error = NetError;

    fn close(self) -> Result<(), Self::Error> {
        self.broker.0.borrow_mut().links[self.id].state = LinkState::Closed;
        Ok(())
    }
}

impl Connection for FakeStream {}

/// Opens [`FakeStream`]s and resolves [`BROKER_HOST`].
pub struct FakeNetwork(Broker);

impl Connect for FakeNetwork {
    type Connection = FakeStream;
    type Error = NetError;

    fn connect(&mut self, _remote: SocketAddr, _tls: bool) -> Result<FakeStream, NetError> {
        let mut state = self.0 .0.borrow_mut();
        state.counters.connects += 1;
        if !state.joined {
            return Err(NetError::HostUnreachable);
        }
        state.links.push(Link::default());
        Ok(FakeStream {
            broker: self.0.clone(),
            id: state.links.len() - 1,
        })
    }
}

impl Resolve for FakeNetwork {
    type Error = NetError;

    fn resolve(&mut self, host: &str, port: u16) -> Result<SocketAddr, NetError> {
        self.0 .0.borrow_mut().counters.resolves += 1;
        if host != BROKER_HOST {
            return Err(NetError::ResolveFailed);
        }
        Ok(SocketAddr::from(([127, 0, 0, 1], port)))
    }
}

/// A network interface whose state lives in the broker handle.
pub struct FakeInterface(Broker);

impl Interface for FakeInterface {
    type Error = NetError;

    fn is_joined(&self) -> bool {
        let mut state = self.0 .0.borrow_mut();
        state.counters.join_checks += 1;
        state.joined
    }

    async fn join(&self, _credentials: Option<&JoinCredentials<'_>>) -> Result<(), NetError> {
        let mut state = self.0 .0.borrow_mut();
        state.counters.joins += 1;
        if state.join_ok {
            state.joined = true;
            Ok(())
        } else {
            Err(NetError::JoinFailed)
        }
    }

    fn leave(&self) {
        let mut state = self.0 .0.borrow_mut();
        state.counters.leaves += 1;
        state.joined = false;
    }
}
