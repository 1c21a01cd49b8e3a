//! Client configuration.
//!
//! A [`Config`] is produced by [`ConfigBuilder::build`], which validates every
//! invariant once; afterwards the configuration is read-only and shared by
//! the client and each connection it opens.

use super::error::{ConfigError, Error};
use super::message::{LastWill, Message, Payload, QoS};
use super::proto::DEFAULT_MAX_INBOUND_LEN;
use crate::network::JoinCredentials;
use core::fmt;

/// Broker port used when none is configured and TLS is off.
pub const DEFAULT_PORT: u16 = 1883;
/// Broker port used when none is configured and TLS is on.
pub const DEFAULT_TLS_PORT: u16 = 8883;
/// Default broker response time in seconds.
pub const DEFAULT_RESPONSE_TIME: u32 = 60;
/// Default MQTT keepalive in seconds.
pub const DEFAULT_KEEPALIVE: u16 = 600;

/// Notifications delivered to the application.
///
/// All methods default to doing nothing. They run synchronously on the
/// client's duties and must return promptly.
pub trait Hooks {
    /// A PUBLISH arrived from the broker.
    fn on_message(&self, _message: &Message) {}
    /// The network path came up (`true`) or the connection was lost (`false`).
    fn on_interface(&self, _up: bool) {}
    /// A broker session was established.
    fn on_connect(&self) {}
    /// The broker acknowledged the QoS 1 publish `pid`.
    fn on_puback(&self, _pid: u16) {}
    /// The broker answered subscription `pid` with `granted`.
    fn on_suback(&self, _pid: u16, _granted: u8) {}
}

/// Hooks that ignore every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Broker login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials<'a> {
    /// User name.
    pub user: &'a str,
    /// Optional password.
    pub password: Option<&'a [u8]>,
}

/// Validated, immutable client configuration.
#[derive(Clone)]
pub struct Config<'a> {
    client_id: &'a str,
    host: &'a str,
    port: u16,
    credentials: Option<Credentials<'a>>,
    clean: bool,
    response_time: u32,
    keepalive: u16,
    will: Option<LastWill>,
    tls: bool,
    interface: Option<JoinCredentials<'a>>,
    max_inbound_len: usize,
    hooks: &'a dyn Hooks,
}

impl<'a> Config<'a> {
    /// Start building a configuration for `client_id` talking to `host`.
    pub fn builder(host: &'a str, client_id: &'a str) -> ConfigBuilder<'a> {
        ConfigBuilder::new(host, client_id)
    }

    /// Client identifier sent in CONNECT.
    pub fn client_id(&self) -> &'a str {
        self.client_id
    }

    /// Broker host name.
    pub fn host(&self) -> &'a str {
        self.host
    }

    /// Broker port, with the TLS-dependent default applied.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Broker login, if any.
    pub fn credentials(&self) -> Option<&Credentials<'a>> {
        self.credentials.as_ref()
    }

    /// MQTT clean-session flag.
    pub fn clean(&self) -> bool {
        self.clean
    }

    /// Broker response time in seconds.
    pub fn response_time(&self) -> u32 {
        self.response_time
    }

    /// Broker response time in milliseconds.
    pub fn response_ms(&self) -> u64 {
        u64::from(self.response_time) * 1000
    }

    /// Keepalive in seconds; 0 when disabled.
    pub fn keepalive(&self) -> u16 {
        self.keepalive
    }

    /// Last will, if any.
    pub fn will(&self) -> Option<&LastWill> {
        self.will.as_ref()
    }

    /// Whether streams are opened with TLS.
    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Credentials handed to the network interface when joining.
    pub fn interface_credentials(&self) -> Option<&JoinCredentials<'a>> {
        self.interface.as_ref()
    }

    /// Largest inbound PUBLISH remaining length accepted.
    pub fn max_inbound_len(&self) -> usize {
        self.max_inbound_len
    }

    /// Application notifications.
    pub fn hooks(&self) -> &'a dyn Hooks {
        self.hooks
    }
}

impl fmt::Debug for Config<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.credentials.map(|c| c.user))
            .field("clean", &self.clean)
            .field("response_time", &self.response_time)
            .field("keepalive", &self.keepalive)
            .field("will", &self.will)
            .field("tls", &self.tls)
            .field("max_inbound_len", &self.max_inbound_len)
            .finish_non_exhaustive()
    }
}

/// A fluent builder for [`Config`].
///
/// ```rust
/// use durable_mqtt::network::application::mqtt::{Config, QoS};
///
/// let config = Config::builder("broker.local", "sensor-17")
///     .set_response_time(30)
///     .set_keepalive(120)
///     .set_last_will("devices/sensor-17/status", "offline", true, QoS::AtLeastOnce)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.port(), 1883);
/// assert_eq!(config.keepalive(), 120);
/// ```
pub struct ConfigBuilder<'a> {
    client_id: &'a str,
    host: &'a str,
    port: u16,
    credentials: Option<Credentials<'a>>,
    clean: bool,
    response_time: u32,
    keepalive: u16,
    will: Option<(&'a [u8], Payload, bool, QoS)>,
    tls: bool,
    interface: Option<JoinCredentials<'a>>,
    max_inbound_len: usize,
    hooks: &'a dyn Hooks,
}

impl fmt::Debug for ConfigBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("response_time", &self.response_time)
            .field("keepalive", &self.keepalive)
            .finish_non_exhaustive()
    }
}

impl<'a> ConfigBuilder<'a> {
    fn new(host: &'a str, client_id: &'a str) -> Self {
        Self {
            client_id,
            host,
            port: 0,
            credentials: None,
            clean: true,
            response_time: DEFAULT_RESPONSE_TIME,
            keepalive: DEFAULT_KEEPALIVE,
            will: None,
            tls: false,
            interface: None,
            max_inbound_len: DEFAULT_MAX_INBOUND_LEN,
            hooks: &NoHooks,
        }
    }

    /// Set the broker port. 0 selects 1883, or 8883 with TLS.
    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    /// Set the broker login.
    pub fn set_credentials(&mut self, user: &'a str, password: Option<&'a [u8]>) -> &mut Self {
        self.credentials = Some(Credentials { user, password });
        self
    }

    /// Set the MQTT clean-session flag. Defaults to `true`.
    pub fn set_clean(&mut self, clean: bool) -> &mut Self {
        self.clean = clean;
        self
    }

    /// Set the broker response time in seconds. Defaults to 60.
    ///
    /// Every blocking operation is bounded by it, and a connection with an
    /// unanswered request older than this is considered dead.
    pub fn set_response_time(&mut self, seconds: u32) -> &mut Self {
        self.response_time = seconds;
        self
    }

    /// Set the MQTT keepalive in seconds; 0 disables it. Defaults to 600.
    ///
    /// It only matters with a last will, since it decides when the broker
    /// gives up on the client and publishes the will.
    pub fn set_keepalive(&mut self, seconds: u16) -> &mut Self {
        self.keepalive = seconds;
        self
    }

    /// Set the last will published by the broker if the connection drops
    /// without a DISCONNECT.
    pub fn set_last_will(
        &mut self,
        topic: &'a str,
        payload: impl Into<Payload>,
        retain: bool,
        qos: QoS,
    ) -> &mut Self {
        self.will = Some((topic.as_bytes(), payload.into(), retain, qos));
        self
    }

    /// Open broker streams with TLS.
    pub fn set_tls(&mut self, tls: bool) -> &mut Self {
        self.tls = tls;
        self
    }

    /// Credentials passed to the network interface on join.
    pub fn set_interface_credentials(&mut self, ssid: &'a str, password: &'a str) -> &mut Self {
        self.interface = Some(JoinCredentials { ssid, password });
        self
    }

    /// Cap the remaining length of PUBLISH packets accepted from the
    /// broker. Longer packets are a protocol error and end the connection.
    /// Defaults to 2,097,151.
    pub fn set_max_inbound_len(&mut self, len: usize) -> &mut Self {
        self.max_inbound_len = len;
        self
    }

    /// Set the application notification hooks.
    pub fn set_hooks(&mut self, hooks: &'a dyn Hooks) -> &mut Self {
        self.hooks = hooks;
        self
    }

    /// Validate and build the configuration.
    pub fn build(&self) -> Result<Config<'a>, Error> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingHost.into());
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::MissingClientId.into());
        }
        if self.response_time == 0 {
            return Err(ConfigError::InvalidResponseTime.into());
        }
        let will = match &self.will {
            Some((topic, payload, retain, qos)) => {
                Some(LastWill::new(topic, payload.clone(), *retain, *qos)?)
            }
            None => None,
        };
        // without a will there is nothing for the broker to act on
        let keepalive = if will.is_some() { self.keepalive } else { 0 };
        if keepalive > 0 && u64::from(keepalive) * 2 < u64::from(self.response_time) * 3 {
            return Err(ConfigError::KeepaliveTooShort.into());
        }
        let port = match (self.port, self.tls) {
            (0, true) => DEFAULT_TLS_PORT,
            (0, false) => DEFAULT_PORT,
            (p, _) => p,
        };
        Ok(Config {
            client_id: self.client_id,
            host: self.host,
            port,
            credentials: self.credentials,
            clean: self.clean,
            response_time: self.response_time,
            keepalive,
            will,
            tls: self.tls,
            interface: self.interface,
            max_inbound_len: self.max_inbound_len,
            hooks: self.hooks,
        })
    }
}
