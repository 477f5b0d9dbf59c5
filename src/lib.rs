//! Private remote access over a UDT-like reliable datagram transport.
//!
//! - [`protocol`]: wire structures
//! - [`arq`]: fragmentation, acknowledgment and handshake over UDP
//! - [`transport`]: one API over TCP, UDP and ARQ
//! - [`secure`]: authenticated key exchange and encrypted sessions

pub mod arq;
pub mod config;
pub mod error;
pub mod protocol;
pub mod secure;
pub mod transport;

pub use error::{Error, Result};
