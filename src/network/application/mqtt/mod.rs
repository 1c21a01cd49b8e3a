//! MQTT 3.1.1 client for devices on unreliable links.
//!
//! The stack is split in two layers:
//!
//! - [`Engine`] speaks the wire protocol over exactly one connection. It is
//!   cheap, strict and disposable: the first failure ends its life.
//! - [`Client`] owns the session. It replaces engines as connections die,
//!   retransmits what may have been lost, and keeps `publish` and
//!   `subscribe` blocking until they succeed or the client is
//!   disconnected.
//!
//! Only QoS 0 and 1 are supported. QoS 1 gives at-least-once delivery: a
//! message whose acknowledgement was lost during a reconnection is sent
//! again and may reach subscribers twice.
//!
//! # Usage
//!
//! ```rust,ignore
//! use durable_mqtt::network::application::mqtt::{Client, Config, QoS};
//!
//! let config = Config::builder("broker.local", "sensor-17")
//!     .set_response_time(10)
//!     .set_hooks(&hooks)
//!     .build()?;
//! let client = Client::new(config, tcp_stack, wifi, scheduler);
//!
//! client.connect().await?;
//! embassy_futures::join::join(client.run(), async {
//!     client.subscribe("devices/sensor-17/cmd", QoS::AtMostOnce).await?;
//!     client.publish("devices/sensor-17/status", "online", true, QoS::AtLeastOnce, true).await
//! })
//! .await;
//! ```

/// Acknowledgement tracking shared by every connection of a session.
pub mod ack;
/// Client configuration and application hooks.
pub mod config;
/// Error kinds.
pub mod error;
/// Messages, payloads and QoS.
pub mod message;
/// The wire protocol engine.
pub mod proto;
/// The reconnecting session client.
pub mod session;
/// Remaining-length codec.
pub mod varint;

pub use ack::AckTable;
pub use config::{Config, ConfigBuilder, Credentials, Hooks, NoHooks};
pub use error::{AckError, ConfigError, Error, ProtocolError};
pub use message::{LastWill, Message, Payload, QoS};
pub use proto::{Dispatch, Engine, PacketType};
pub use session::{Client, State};
