use std::{net::SocketAddr, time::Duration};

use crate::transport::TransportKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Handshaking,
    Connected,
    Closed,
}

/// Per-session state. Owned by exactly one receive loop.
#[derive(Debug)]
pub struct ConnectionContext {
    kind: TransportKind,
    role: Role,
    state: ConnState,
    peer: Option<SocketAddr>,
    connection_id: u32,
    /// Number of the last fragment accepted for the message being reassembled.
    pub(crate) last_packet_number: u32,
    /// Message number whose ACK the sender is waiting for.
    pub(crate) awaited_ack: Option<u32>,
    recv_timeout: Option<Duration>,
    saved_timeout: Option<Option<Duration>>,
}

pub struct ConnectionContextBuilder {
    pub kind: TransportKind,
    pub role: Role,
    pub peer: Option<SocketAddr>,
    pub connection_id: u32,
    pub recv_timeout: Option<Duration>,
}

impl ConnectionContextBuilder {
    #[must_use]
    pub fn build(self) -> ConnectionContext {
        let this = ConnectionContext {
            kind: self.kind,
            role: self.role,
            state: ConnState::New,
            peer: self.peer,
            connection_id: self.connection_id,
            last_packet_number: 0,
            awaited_ack: None,
            recv_timeout: self.recv_timeout,
            saved_timeout: None,
        };
        this.check_rep();
        this
    }
}

impl ConnectionContext {
    #[inline]
    fn check_rep(&self) {
        if self.state == ConnState::Connected {
            assert!(self.peer.is_some());
        }
    }

    #[must_use]
    #[inline]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    #[must_use]
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == Role::Initiator
    }

    #[must_use]
    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    #[must_use]
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    #[must_use]
    #[inline]
    pub fn is_in_wait(&self) -> bool {
        self.awaited_ack.is_some()
    }

    #[must_use]
    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    #[inline]
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    #[must_use]
    #[inline]
    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout
    }

    pub fn set_recv_timeout(&mut self, timeout: Option<Duration>) {
        self.recv_timeout = timeout;
    }

    pub(crate) fn start_handshake(&mut self) {
        if self.state == ConnState::New {
            self.state = ConnState::Handshaking;
        }
    }

    pub(crate) fn establish(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
        self.state = ConnState::Connected;
        self.check_rep();
    }

    pub(crate) fn close(&mut self) {
        self.state = ConnState::Closed;
        self.awaited_ack = None;
        self.check_rep();
    }

    /// Installs the reassembly window, remembering the timeout it replaces.
    pub(crate) fn enter_reassembly(&mut self, window: Duration) {
        if self.saved_timeout.is_none() {
            self.saved_timeout = Some(self.recv_timeout);
        }
        self.recv_timeout = Some(window);
    }

    pub(crate) fn leave_reassembly(&mut self) {
        if let Some(saved) = self.saved_timeout.take() {
            self.recv_timeout = saved;
        }
    }

    #[must_use]
    pub fn in_reassembly(&self) -> bool {
        self.saved_timeout.is_some()
    }
}
