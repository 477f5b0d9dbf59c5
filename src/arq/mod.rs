//! Reliable, ordered messages over UDP.
//!
//! [`engine::Engine`] is the sans-IO packet-parse state machine;
//! [`socket::ArqSocket`] drives it from the thread that owns the socket;
//! [`server::ArqServer`] spawns one worker per accepted handshake.

pub mod context;
pub mod engine;
pub mod reassembly;
pub mod sender;
pub mod server;
pub mod socket;

use std::time::Duration;

pub use context::*;
pub use engine::*;
pub use server::*;
pub use socket::*;

#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Receive timeout outside reassembly windows. `None` blocks.
    pub recv_timeout: Option<Duration>,
    /// Receive timeout while the fragments of one message are arriving.
    pub reassembly_timeout: Duration,
    pub ack_timeout: Duration,
    /// Retransmissions of a whole message on ACK timeout.
    pub ack_retries: u32,
    pub handshake_timeout: Duration,
    pub handshake_retries: u32,
}

pub struct ArqConfigBuilder {
    pub recv_timeout: Option<Duration>,
    pub reassembly_timeout: Duration,
    pub ack_timeout: Duration,
    pub ack_retries: u32,
    pub handshake_timeout: Duration,
    pub handshake_retries: u32,
}

impl ArqConfigBuilder {
    pub fn build(self) -> Result<ArqConfig, BuildError> {
        if self.reassembly_timeout.is_zero() {
            return Err(BuildError::ZeroTimeout("reassembly_timeout"));
        }
        if self.ack_timeout.is_zero() {
            return Err(BuildError::ZeroTimeout("ack_timeout"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(BuildError::ZeroTimeout("handshake_timeout"));
        }
        if let Some(t) = self.recv_timeout {
            if t.is_zero() {
                return Err(BuildError::ZeroTimeout("recv_timeout"));
            }
        }
        Ok(ArqConfig {
            recv_timeout: self.recv_timeout,
            reassembly_timeout: self.reassembly_timeout,
            ack_timeout: self.ack_timeout,
            ack_retries: self.ack_retries,
            handshake_timeout: self.handshake_timeout,
            handshake_retries: self.handshake_retries,
        })
    }

    pub fn default() -> Self {
        ArqConfigBuilder {
            recv_timeout: None,
            reassembly_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(1),
            ack_retries: 0,
            handshake_timeout: Duration::from_secs(1),
            handshake_retries: 3,
        }
    }
}

impl Default for ArqConfig {
    fn default() -> Self {
        ArqConfigBuilder::default().build().unwrap()
    }
}

#[derive(Debug)]
pub enum BuildError {
    ZeroTimeout(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_rejected() {
        let builder = ArqConfigBuilder {
            ack_timeout: Duration::ZERO,
            ..ArqConfigBuilder::default()
        };
        assert!(matches!(
            builder.build(),
            Err(BuildError::ZeroTimeout("ack_timeout"))
        ));
    }
}
