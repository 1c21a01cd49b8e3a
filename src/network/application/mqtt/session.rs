//! The resilient session client.
//!
//! [`Client`] keeps one broker session alive across network and broker
//! outages. It owns at most one [`Engine`] at a time and three duties,
//! driven together by [`Client::run`]:
//!
//! - the message pump reads and dispatches incoming packets;
//! - the keepalive pump pings an idle broker and declares the connection
//!   dead when a request stays unanswered for a full response time;
//! - the supervisor re-establishes the session after a failure, first at the
//!   broker level and, if that fails, by rejoining the network interface.
//!
//! Any duty (or a publish/subscribe call) that sees the connection fail
//! escalates to a single reconnect routine. The routine only tears down the
//! engine if it is still the one that failed, compared by connection epoch,
//! so concurrent failures on one dead connection cause one reconnection.
//!
//! Application calls never fail because of the network. `publish` and
//! `subscribe` wait until they succeed or the client is disconnected; only
//! configuration errors and broker refusals are returned.

use super::ack::{AckTable, Expect, ACK_POLL_MS};
use super::config::{Config, Hooks};
use super::error::{ConfigError, Error};
use super::message::{Message, Payload, QoS};
use super::proto::{Dispatch, Engine, MAX_PUBLISH_LEN, POLL_DELAY_MS};
use crate::fmt::{debug, info, warn};
use crate::network::error::{Error as NetError, NetworkError};
use crate::network::{Connect, Interface, Resolve};
use crate::system::Scheduler;
use alloc::rc::Rc;
use core::cell::{Cell, RefCell};
use core::net::SocketAddr;
use embassy_futures::join::join3;
use embassy_futures::select::select;
use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;

/// Pause between supervisor checks while connected, and after a failed
/// reconnection attempt.
pub const RETRY_PAUSE_MS: u64 = 1000;

/// How often a blocked publish or subscribe checks for a new connection.
pub const ENGINE_WAIT_MS: u64 = 100;

/// Lifecycle of a [`Client`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Created; [`Client::connect`] has not succeeded yet.
    Init,
    /// A broker session is up.
    Connected,
    /// The last session failed and the supervisor is re-establishing it.
    Retrying,
    /// [`Client::disconnect`] was called. Terminal.
    Dead,
}

type EngineOf<N, S> = Engine<<N as Connect>::Connection, S>;

struct PendingPublish {
    message: Message,
    pid: u16,
    epoch: Cell<u32>,
}

/// Routes decoded packets to the ack table and the application hooks.
struct Router<'r> {
    acks: &'r AckTable,
    hooks: &'r dyn Hooks,
}

impl Dispatch for Router<'_> {
    fn on_publish(&self, message: &Message) {
        self.hooks.on_message(message);
    }

    fn on_puback(&self, pid: u16) {
        self.acks.on_puback(pid);
        self.hooks.on_puback(pid);
    }

    fn on_suback(&self, pid: u16, granted: u8) {
        self.acks.on_suback(pid, granted);
        self.hooks.on_suback(pid, granted);
    }
}

/// An MQTT client that reconnects on its own.
///
/// # Type Parameters
///
/// * `N` - opens broker streams and resolves the broker name
/// * `I` - the network interface joined before connecting
/// * `S` - clock and cooperative sleep
///
/// # Examples
///
/// ```rust,ignore
/// let config = Config::builder("broker.local", "sensor-17").build()?;
/// let client = Client::new(config, stack, wifi, EmbassyScheduler);
///
/// client.connect().await?;
/// join(client.run(), async {
///     client.subscribe("devices/sensor-17/cmd", QoS::AtLeastOnce).await?;
///     loop {
///         client.publish("devices/sensor-17/temp", "21.5", false, QoS::AtLeastOnce, true).await?;
///         Timer::after_secs(60).await;
///     }
/// })
/// .await;
/// ```
pub struct Client<'a, N, I, S>
where
    N: Connect + Resolve,
    I: Interface,
    S: Scheduler + Clone,
{
    config: Config<'a>,
    network: RefCell<N>,
    interface: I,
    scheduler: S,
    state: Cell<State>,
    engine: RefCell<Option<Rc<EngineOf<N, S>>>>,
    epoch: Cell<u32>,
    next_epoch: Cell<u32>,
    addr: Cell<Option<SocketAddr>>,
    acks: AckTable,
    pending_pub: RefCell<Option<Rc<PendingPublish>>>,
    publish_lock: Mutex<NoopRawMutex, ()>,
    wake: Signal<NoopRawMutex, ()>,
}

impl<N, I, S> core::fmt::Debug for Client<'_, N, I, S>
where
    N: Connect + Resolve,
    I: Interface,
    S: Scheduler + Clone,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("state", &self.state.get())
            .field("epoch", &self.epoch.get())
            .field("addr", &self.addr.get())
            .field("acks", &self.acks)
            .finish_non_exhaustive()
    }
}

impl<'a, N, I, S> Client<'a, N, I, S>
where
    N: Connect + Resolve,
    I: Interface,
    S: Scheduler + Clone,
{
    /// Create a client. Nothing is sent until [`Client::connect`].
    pub fn new(config: Config<'a>, network: N, interface: I, scheduler: S) -> Self {
        Self {
            config,
            network: RefCell::new(network),
            interface,
            scheduler,
            state: Cell::new(State::Init),
            engine: RefCell::new(None),
            epoch: Cell::new(0),
            next_epoch: Cell::new(0),
            addr: Cell::new(None),
            acks: AckTable::new(),
            pending_pub: RefCell::new(None),
            publish_lock: Mutex::new(()),
            wake: Signal::new(),
        }
    }

    /// The configuration the client was built with.
    pub fn config(&self) -> &Config<'a> {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Whether a broker session is currently up.
    pub fn is_connected(&self) -> bool {
        self.engine.borrow().is_some()
    }

    /// Epoch of the most recent successful connection; 0 before the first.
    pub fn epoch(&self) -> u32 {
        self.epoch.get()
    }

    /// Number of QoS 1 publishes and subscribes still awaiting an answer.
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    fn is_dead(&self) -> bool {
        self.state.get() == State::Dead
    }

    fn current(&self) -> Option<Rc<EngineOf<N, S>>> {
        self.engine.borrow().clone()
    }

    /// Join the network if needed and open a broker session.
    ///
    /// Failures are returned, not retried; retrying belongs to the
    /// supervisor once a first session has been established.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.is_dead() {
            return Err(Error::Disconnected);
        }
        if !self.interface.is_joined() {
            self.join_interface().await?;
        }
        self.open_session().await
    }

    /// Close the session for good. Every duty stops and blocked calls return
    /// [`Error::Disconnected`].
    pub async fn disconnect(&self) {
        info!("disconnecting");
        self.state.set(State::Dead);
        let engine = self.engine.borrow_mut().take();
        if let Some(engine) = engine {
            engine.disconnect();
        }
        self.wake.signal(());
    }

    /// Drive the message pump, the keepalive pump and the supervisor.
    ///
    /// Must run alongside the application for the client to work. Returns
    /// once the client has been disconnected.
    pub async fn run(&self) {
        join3(self.message_pump(), self.keepalive_pump(), self.supervisor()).await;
        debug!("client duties stopped");
    }

    async fn join_interface(&self) -> Result<(), Error> {
        debug!("joining network interface");
        self.interface
            .join(self.config.interface_credentials())
            .await
            .map_err(|e| Error::from(e.kind()))?;
        if !self.interface.is_joined() {
            return Err(NetError::JoinFailed.into());
        }
        Ok(())
    }

    fn broker_addr(&self) -> Result<SocketAddr, Error> {
        if let Some(addr) = self.addr.get() {
            return Ok(addr);
        }
        let addr = self
            .network
            .borrow_mut()
            .resolve(self.config.host(), self.config.port())
            .map_err(|e| {
                warn!("resolving {} failed: {:?}", self.config.host(), e.kind());
                Error::from(e.kind())
            })?;
        self.addr.set(Some(addr));
        Ok(addr)
    }

    async fn open_session(&self) -> Result<(), Error> {
        let addr = self.broker_addr()?;
        let stream = self
            .network
            .borrow_mut()
            .connect(addr, self.config.tls())
            .map_err(|e| Error::from(e.kind()))?;

        let epoch = self.next_epoch.get().wrapping_add(1);
        self.next_epoch.set(epoch);
        let engine = Engine::connect(stream, &self.config, self.scheduler.clone(), epoch).await?;
        if self.is_dead() {
            engine.disconnect();
            return Err(Error::Disconnected);
        }

        let previous = self.engine.borrow_mut().replace(Rc::new(engine));
        if let Some(previous) = previous {
            previous.disconnect();
        }
        self.epoch.set(epoch);
        self.state.set(State::Connected);
        self.wake.signal(());
        info!("session up, epoch {}", epoch);

        let hooks = self.config.hooks();
        hooks.on_interface(true);
        hooks.on_connect();
        Ok(())
    }

    /// Tear down `failed` unless it has already been replaced.
    fn escalate(&self, failed: &EngineOf<N, S>, why: &'static str) {
        if self.is_dead() {
            return;
        }
        let engine = {
            let mut slot = self.engine.borrow_mut();
            match slot.as_ref() {
                Some(current) if current.epoch() == failed.epoch() => slot.take(),
                _ => return,
            }
        };
        warn!("{} failed on epoch {}, reconnecting", why, failed.epoch());
        self.state.set(State::Retrying);
        if let Some(engine) = engine {
            engine.disconnect();
        }
        self.config.hooks().on_interface(false);
        self.wake.signal(());
    }

    async fn message_pump(&self) {
        let router = Router {
            acks: &self.acks,
            hooks: self.config.hooks(),
        };
        while !self.is_dead() {
            let Some(engine) = self.current() else {
                self.scheduler.sleep_ms(ENGINE_WAIT_MS).await;
                continue;
            };
            match engine.poll(&router).await {
                Ok(Some(_)) => yield_now().await,
                Ok(None) => self.scheduler.sleep_ms(POLL_DELAY_MS).await,
                Err(e) => {
                    debug!("read error: {:?}", e);
                    self.escalate(&engine, "read");
                }
            }
        }
    }

    async fn keepalive_pump(&self) {
        let rt = self.config.response_ms();
        while !self.is_dead() {
            let Some(engine) = self.current() else {
                self.wake.wait().await;
                continue;
            };
            let dt = self.scheduler.elapsed_ms(engine.last_ack());
            let sleep = if engine.is_outstanding() {
                if dt > rt {
                    self.escalate(&engine, "keepalive");
                    continue;
                }
                rt - dt + 1
            } else if dt >= rt / 2 {
                if let Err(e) = engine.ping().await {
                    debug!("ping failed: {:?}", e);
                    self.escalate(&engine, "keepalive");
                }
                continue;
            } else {
                rt / 2 - dt
            };
            drop(engine);
            select(self.scheduler.sleep_ms(sleep), self.wake.wait()).await;
        }
    }

    async fn supervisor(&self) {
        loop {
            match self.state.get() {
                State::Dead => break,
                State::Init | State::Connected => {
                    self.scheduler.sleep_ms(RETRY_PAUSE_MS).await;
                }
                State::Retrying if self.interface.is_joined() => {
                    info!("interface up, reconnecting to broker");
                    match self.open_session().await {
                        Ok(()) => continue,
                        Err(e) => warn!("broker reconnect failed: {:?}", e),
                    }
                    if self.is_dead() {
                        break;
                    }
                    self.interface.leave();
                    self.scheduler.sleep_ms(RETRY_PAUSE_MS).await;
                }
                State::Retrying => {
                    info!("rejoining network interface");
                    if let Err(e) = self.join_interface().await {
                        warn!("interface join failed: {:?}", e);
                        self.scheduler.sleep_ms(RETRY_PAUSE_MS).await;
                    }
                }
            }
        }
        debug!("supervisor stopped");
    }

    async fn wait_engine(&self) -> Result<Rc<EngineOf<N, S>>, Error> {
        loop {
            if self.is_dead() {
                return Err(Error::Disconnected);
            }
            if let Some(engine) = self.current() {
                return Ok(engine);
            }
            self.scheduler.sleep_ms(ENGINE_WAIT_MS).await;
        }
    }

    /// Allocate a packet id and register it, waiting while the table is full.
    async fn register(&self, expect: Expect) -> Result<u16, Error> {
        loop {
            if self.is_dead() {
                return Err(Error::Disconnected);
            }
            if !self.acks.is_full() {
                let pid = self.acks.new_pid();
                if self.acks.register(pid, expect) {
                    return Ok(pid);
                }
            }
            self.scheduler.sleep_ms(ACK_POLL_MS).await;
        }
    }

    /// Publish `payload` on `topic`.
    ///
    /// QoS 0 returns once the message is written. QoS 1 with `sync` returns
    /// once the broker acknowledged it. QoS 1 without `sync` returns after
    /// writing, and the acknowledgement is awaited at the start of the next
    /// publish call; if the connection changed in between, that message is
    /// sent again with DUP set.
    ///
    /// Connection failures are absorbed by reconnecting and retrying. The
    /// call only fails for invalid arguments or after [`Client::disconnect`].
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        retain: bool,
        qos: QoS,
        sync: bool,
    ) -> Result<(), Error> {
        let payload = payload.into();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic.into());
        }
        let pid_len = if qos == QoS::AtLeastOnce { 2 } else { 0 };
        if 2 + topic.len() + pid_len + payload.len() >= MAX_PUBLISH_LEN {
            return Err(ConfigError::MessageTooLong.into());
        }

        let _serial = self.publish_lock.lock().await;
        let pid = match qos {
            QoS::AtLeastOnce => Some(self.register(Expect::Puback).await?),
            QoS::AtMostOnce => None,
        };
        let message = Message::new(topic, payload, retain, qos, pid)?;
        let rt = self.config.response_ms();

        let mut dup = false;
        loop {
            let engine = match self.wait_engine().await {
                Ok(engine) => engine,
                Err(e) => {
                    self.forget(pid);
                    return Err(e);
                }
            };
            let result = match self.transmit(&engine, &message, dup).await {
                Ok(()) => match message.pid() {
                    Some(pid) if sync => self.acks.await_ack(pid, &self.scheduler, rt).await,
                    _ => Ok(()),
                },
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    if let (Some(pid), false) = (message.pid(), sync) {
                        let pending = PendingPublish {
                            message,
                            pid,
                            epoch: Cell::new(engine.epoch()),
                        };
                        *self.pending_pub.borrow_mut() = Some(Rc::new(pending));
                    }
                    return Ok(());
                }
                Err(e) if e.is_connection_failure() => {
                    debug!("publish failed: {:?}", e);
                    self.escalate(&engine, "publish");
                    dup = true;
                }
                Err(e) => {
                    self.forget(pid);
                    return Err(e);
                }
            }
        }
    }

    /// Retransmit the previous unacknowledged publish if it was sent on an
    /// older connection, send `message`, then wait for the previous ack.
    async fn transmit(
        &self,
        engine: &EngineOf<N, S>,
        message: &Message,
        dup: bool,
    ) -> Result<(), Error> {
        let previous = self.pending_pub.borrow().clone();
        if let Some(prev) = &previous {
            if self.acks.is_pending(prev.pid) && prev.epoch.get() != engine.epoch() {
                info!("retransmitting pid {} on epoch {}", prev.pid, engine.epoch());
                prev.epoch.set(engine.epoch());
                engine.publish(&prev.message, true).await?;
            }
        }

        engine.publish(message, dup).await?;

        if let Some(prev) = previous {
            self.acks
                .await_ack(prev.pid, &self.scheduler, self.config.response_ms())
                .await?;
            self.pending_pub.borrow_mut().take();
        }
        Ok(())
    }

    fn forget(&self, pid: Option<u16>) {
        if let Some(pid) = pid {
            self.acks.remove(pid);
        }
    }

    /// Subscribe to `topic`, returning once the broker granted `qos`.
    ///
    /// The same packet id is reused on every retry. A refusal or a
    /// different granted QoS is returned as [`Error::Ack`] without retrying.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Error> {
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic.into());
        }
        let pid = self.register(Expect::Suback(qos)).await?;
        let rt = self.config.response_ms();
        loop {
            let engine = match self.wait_engine().await {
                Ok(engine) => engine,
                Err(e) => {
                    self.acks.remove(pid);
                    return Err(e);
                }
            };
            let result = match engine.subscribe(topic.as_bytes(), qos, pid).await {
                Ok(()) => self.acks.await_ack(pid, &self.scheduler, rt).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection_failure() => {
                    debug!("subscribe pid {} failed: {:?}", pid, e);
                    self.escalate(&engine, "subscribe");
                }
                Err(e) => {
                    warn!("subscribe pid {} rejected: {:?}", pid, e);
                    self.acks.remove(pid);
                    return Err(e);
                }
            }
        }
    }
}
