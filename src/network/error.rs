//! Common error types for network operations

/// A common error type for network operations.
///
/// This enum defines a set of common errors that can occur when working with
/// network devices. It is designed to be simple and portable for `no_std`
/// environments.
///
/// Non-blocking transports report "try again later" conditions through the
/// transient variants (see [`Error::is_transient`]); every other variant is
/// treated as fatal for the connection it was raised on.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// An operation was attempted on a connection that is not open.
    NotOpen,
    /// An error occurred during a write operation.
    WriteError,
    /// An error occurred during a read operation.
    ReadError,
    /// A connection attempt was refused.
    ConnectionRefused,
    /// A timeout occurred.
    Timeout,
    /// The connection was closed.
    ConnectionClosed,
    /// An invalid address was provided.
    InvalidAddress,
    /// A protocol-specific error occurred.
    ProtocolError,
    /// The operation would block; retry later.
    WouldBlock,
    /// A non-blocking connect has not completed yet.
    InProgress,
    /// The remote host is temporarily unreachable (e.g. radio out of range).
    HostUnreachable,
    /// Name resolution failed.
    ResolveFailed,
    /// Joining the network interface failed.
    JoinFailed,
}

impl Error {
    /// Whether the operation that produced this error may simply be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::WouldBlock | Error::InProgress | Error::Timeout | Error::HostUnreachable
        )
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            Error::NotOpen => "connection not open",
            Error::WriteError => "write failed",
            Error::ReadError => "read failed",
            Error::ConnectionRefused => "connection refused",
            Error::Timeout => "timed out",
            Error::ConnectionClosed => "connection closed",
            Error::InvalidAddress => "invalid address",
            Error::ProtocolError => "protocol error",
            Error::WouldBlock => "operation would block",
            Error::InProgress => "operation in progress",
            Error::HostUnreachable => "host unreachable",
            Error::ResolveFailed => "name resolution failed",
            Error::JoinFailed => "interface join failed",
        };
        f.write_str(text)
    }
}

/// Classifies a transport specific error into the common [`Error`] kinds.
///
/// Every error type used by the transport traits implements this so the
/// protocol layer can tell transient conditions from fatal ones without
/// knowing the concrete stack.
pub trait NetworkError: core::fmt::Debug {
    /// The common error kind this error maps to.
    fn kind(&self) -> Error;
}

impl NetworkError for Error {
    fn kind(&self) -> Error {
        *self
    }
}
