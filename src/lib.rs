//! # durable-mqtt
//!
//! An MQTT 3.1.1 client for memory-constrained devices whose network link
//! is unreliable: Wi-Fi that drops, brokers that restart, routers that
//! silently forget TCP connections. The client detects dead connections on
//! its own, reconnects (rejoining the network interface when needed) and
//! keeps QoS 1 delivery at-least-once across reconnections.
//!
//! The crate is `no_std` and runtime agnostic. It needs an allocator and
//! talks to the platform through a few traits:
//!
//! - [`network::Connect`], [`network::Resolve`] and [`network::Connection`]
//!   for broker streams,
//! - [`network::Interface`] for the link that must be up before connecting,
//! - [`system::Scheduler`] for time and cooperative sleeping.
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! durable-mqtt = "0.1.0"
//! ```
//!
//! Build a configuration, create the client, connect once, then drive
//! [`Client::run`](network::application::mqtt::Client::run) next to the
//! application code:
//!
//! ```rust,ignore
//! use durable_mqtt::network::application::mqtt::{Client, Config, QoS};
//!
//! let config = Config::builder("broker.local", "sensor-17")
//!     .set_last_will("devices/sensor-17/status", "offline", true, QoS::AtLeastOnce)
//!     .set_keepalive(120)
//!     .build()?;
//! let client = Client::new(config, stack, wifi, scheduler);
//! client.connect().await?;
//! embassy_futures::join::join(client.run(), app(&client)).await;
//! ```
//!
//! ## Optional Features
//!
//! - `std`: Enable standard library support (default: disabled)
//! - `defmt`: Log through `defmt` and derive `defmt::Format` for error types
//! - `log`: Log through the `log` facade

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

extern crate alloc;

// must come first so the macros are visible to every module below
mod fmt;

/// Network abstraction layer and the protocols built on it.
///
/// Holds the transport contracts the client is written against and the
/// MQTT implementation itself.
pub mod network;

/// System utilities for embedded devices.
///
/// Contains the scheduler contract used for every wait and timestamp.
pub mod system;
