use std::{io, net::SocketAddr};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("packet from unknown client {0:?}")]
    UnknownClient(Option<SocketAddr>),

    #[error("invalid message number: expected {expected}, got {actual}")]
    InvalidMessageNumber { expected: u32, actual: u32 },

    #[error("unknown packet type {0}")]
    UnknownPacketType(u32),

    #[error("system error: {0}")]
    SystemError(#[source] io::Error),

    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("cannot decode field `{field}`")]
    Decoding { field: &'static str },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("handshake with {0} failed")]
    HandshakeFailed(SocketAddr),

    #[error("connection is not established")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors scoped to a single packet; the receive loop keeps running after them.
    #[must_use]
    pub fn is_per_packet(&self) -> bool {
        matches!(
            self,
            Error::InvalidMessageNumber { .. }
                | Error::UnknownPacketType(_)
                | Error::UnknownClient(_)
                | Error::Decoding { .. }
        )
    }

    #[must_use]
    pub(crate) fn is_timeout(e: &io::Error) -> bool {
        matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        )
    }
}
