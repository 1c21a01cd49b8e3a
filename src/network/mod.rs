//! A network abstraction layer for embedded systems
//!
//! This module defines the collaborator contracts the MQTT stack is written
//! against: a non-blocking duplex byte stream ([`Connection`]), a way to open
//! one ([`Connect`]), broker name resolution ([`Resolve`]) and the network
//! interface (Wi-Fi station, Ethernet link, cellular modem) that must be
//! joined before any stream can be opened ([`Interface`]).
//!
//! Streams are expected to be non-blocking: an operation that cannot make
//! progress right now returns an error whose [`NetworkError::kind`] is
//! transient (see [`error::Error::is_transient`]), and the protocol layer
//! retries it after yielding to the scheduler.

#![allow(missing_docs)]
#![allow(async_fn_in_trait)]
#![deny(unsafe_code)]

use core::net::SocketAddr;

/// Common error types for network operations
pub mod error;

/// Protocol implementations built on top of these traits
pub mod application;

use error::NetworkError;

/// Re-exports of common traits
pub mod prelude {
    pub use super::error::NetworkError;
    pub use super::{Close, Connect, Connection, Interface, Read, Resolve, Write};
}

pub trait Read {
    /// Associated error type
    type Error: NetworkError;
    /// Read available data without blocking.
    ///
    /// `Ok(0)` means the peer closed the stream. When nothing is available
    /// yet the implementation returns a transient error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

pub trait Write {
    /// Associated error type
    type Error: NetworkError;
    /// Write as much of `buf` as the transport accepts right now
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error>;
    /// Flush the write buffer
    fn flush(&mut self) -> Result<(), Self::Error>;
}

pub trait Close {
    /// Associated error type
    type Error: NetworkError;
    /// Close the connection
    fn close(self) -> Result<(), Self::Error>;
}

/// A non-blocking duplex byte stream
pub trait Connection: Read + Write + Close {}

/// Opens byte streams to a remote endpoint
pub trait Connect {
    /// Associated connection type
    type Connection: Connection;
    /// Associated error type
    type Error: NetworkError;
    /// Start opening a connection.
    ///
    /// The returned stream may still be completing its handshake; until it
    /// is established, reads and writes report transient errors. `tls`
    /// asks the transport to wrap the stream in TLS.
    fn connect(&mut self, remote: SocketAddr, tls: bool) -> Result<Self::Connection, Self::Error>;
}

/// Resolves a host name to a socket address
pub trait Resolve {
    /// Associated error type
    type Error: NetworkError;
    /// Look up `host` and pair the result with `port`
    fn resolve(&mut self, host: &str, port: u16) -> Result<SocketAddr, Self::Error>;
}

/// Credentials used to join a network interface (e.g. Wi-Fi SSID and passphrase)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinCredentials<'a> {
    /// Network name
    pub ssid: &'a str,
    /// Network passphrase
    pub password: &'a str,
}

/// The link-layer interface the device uses to reach the network.
///
/// Methods take `&self`; implementations hold whatever interior state the
/// driver needs. `join` suspends cooperatively until the link is up or the
/// attempt failed.
pub trait Interface {
    /// Associated error type
    type Error: NetworkError;
    /// Whether the interface currently reports being joined
    fn is_joined(&self) -> bool;
    /// Join the network, waiting until joined or failed
    async fn join(&self, credentials: Option<&JoinCredentials<'_>>) -> Result<(), Self::Error>;
    /// Leave the network
    fn leave(&self);
}
