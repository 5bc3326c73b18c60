use std::io;

use thiserror::Error;

pub type PeerResult<T> = Result<T, PeerError>;

/// Everything that can go wrong between "open a socket" and "hand a parsed
/// message to the caller".
///
/// Only [`PeerError::PayloadTooShort`] is recoverable: it carries the total
/// number of bytes the receive buffer must reach before the decode can be
/// retried. All other kinds bubble up to the caller.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("tor proxy is required to connect to .onion address")]
    ProxyRequired,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("{0} closed connection")]
    RemoteHostClosedConnection(String),

    #[error("got {got} of 24 header bytes")]
    HeaderTooShort { got: usize },

    #[error("invalid magic number {got:#010x}")]
    InvalidMagicNumber { got: u32 },

    #[error("got {got} of {required} bytes")]
    PayloadTooShort { got: usize, required: usize },

    #[error("payload checksum {computed} != {expected}")]
    InvalidPayloadChecksum { computed: String, expected: String },

    #[error("protocol version {version} < {min}")]
    IncompatibleClient { version: i32, min: i32 },

    #[error("read error: {0}")]
    Read(String),
}

impl From<io::Error> for PeerError {
    fn from(err: io::Error) -> Self {
        PeerError::Connection(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PeerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PeerError::Connection("socket operation timed out".to_string())
    }
}

impl From<tokio_socks::Error> for PeerError {
    fn from(err: tokio_socks::Error) -> Self {
        PeerError::Connection(err.to_string())
    }
}
