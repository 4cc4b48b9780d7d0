//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the toy API.
#[derive(Debug, Error)]
pub enum Error {
    /// Establishing or tearing down the physical link failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The connection has been closed; no further commands are accepted.
    #[error("connection closed")]
    ConnectionClosed,

    /// A write or read failed on an otherwise active connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// No matching response or notification arrived within the wait bound.
    #[error("timed out waiting for the device")]
    Timeout,

    /// The device rejected or could not process a command.
    #[error("device rejected command (error code {0:#04x})")]
    Command(u8),

    /// The connected model does not support this operation.
    #[error("operation not supported by the connected model")]
    Unsupported,

    /// A value is not valid for the connected model.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The listener handle was not found in the registry.
    #[error("listener not found")]
    NotFound,

    /// A malformed frame arrived on the wire.
    #[error("bad packet: {0}")]
    BadPacket(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
