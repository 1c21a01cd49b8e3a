//! # Application Layer Network Protocols
//!
//! Protocols built on top of the transport traits in [`crate::network`].
//! They work with any type implementing [`Connection`](crate::network::Connection)
//! and never assume a particular TCP/IP stack.
//!
//! ## Available Protocols
//!
//! - **[`mqtt`]**: MQTT 3.1.1 publish-subscribe client that survives
//!   network and broker outages.

/// MQTT client implementation.
///
/// Provides an MQTT 3.1.1 client for lightweight publish-subscribe messaging,
/// built to keep a session alive on links that drop without warning.
pub mod mqtt;
