use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::mpsc,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    protocol::{
        ctl_message::{ControlMessageBuilder, MessageType},
        handshake::HandshakeInfo,
        PACKET_DATA_SIZE, PACKET_LEN,
    },
    transport::TransportKind,
};

use super::{
    context::{ConnectionContext, ConnectionContextBuilder, Role},
    engine::{Engine, Event, Reply},
    ArqConfig,
};

const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);
const RECV_BUF_LEN: usize = PACKET_LEN + 64;

/// One end of an established ARQ session.
///
/// The socket is the only owner of its [`Engine`]; every receive, including
/// the ones made while waiting for an ACK or a handshake reply, goes
/// through [`ArqSocket::pump`].
pub struct ArqSocket {
    socket: UdpSocket,
    engine: Engine,
    cfg: ArqConfig,
    /// Set on an accepted session until the first datagram of its peer.
    unconfirmed_until: Option<Instant>,
}

impl ArqSocket {
    /// Runs the initiator half of the handshake against `addr`.
    pub fn connect(addr: SocketAddr, cfg: ArqConfig) -> Result<Self> {
        let socket = UdpSocket::bind(unspecified(addr)).map_err(Error::SystemError)?;
        let ctx = ConnectionContextBuilder {
            kind: TransportKind::Arq,
            role: Role::Initiator,
            peer: Some(addr),
            connection_id: rand::random(),
            recv_timeout: cfg.recv_timeout,
        }
        .build();
        let mut this = ArqSocket {
            socket,
            engine: Engine::new(ctx, cfg.reassembly_timeout),
            cfg,
            unconfirmed_until: None,
        };

        let (tx, rx) = mpsc::sync_channel(1);
        this.engine.on_handshake(tx);
        for attempt in 0..=this.cfg.handshake_retries {
            let request = this.engine.handshake_packet()?;
            this.socket.send_to(&request, addr)?;
            debug!(%addr, attempt, "handshake sent");

            let deadline = Instant::now() + this.cfg.handshake_timeout;
            while let Some(timeout) = remaining(deadline) {
                match this.pump(timeout) {
                    Ok(_) | Err(Error::Timeout(_)) => (),
                    Err(e) if e.is_per_packet() => warn!(%e, "handshake: packet dropped"),
                    Err(e) => return Err(e),
                }
                if let Ok(info) = rx.try_recv() {
                    let peer = this.peer_addr().ok_or(Error::NotConnected)?;
                    let keepalive = this.engine.keepalive_packet()?;
                    this.socket.send_to(&keepalive, peer)?;
                    info!(%peer, version = info.version, "handshake completed");
                    return Ok(this);
                }
            }
        }
        Err(Error::HandshakeFailed(addr))
    }

    /// Responder half: a fresh socket on `local_ip` takes the session over and
    /// replies to the handshake `request` of `peer`.
    ///
    /// Until the peer sends anything, [`ArqSocket::recv`] gives up after the
    /// time the peer needs to exhaust its handshake retries.
    pub fn accept_session(
        local_ip: IpAddr,
        peer: SocketAddr,
        request: &HandshakeInfo,
        cfg: ArqConfig,
    ) -> Result<Self> {
        Self::accept_with_reply(local_ip, peer, request, cfg).map(|(this, _)| this)
    }

    pub(crate) fn accept_with_reply(
        local_ip: IpAddr,
        peer: SocketAddr,
        request: &HandshakeInfo,
        cfg: ArqConfig,
    ) -> Result<(Self, Vec<u8>)> {
        let socket = UdpSocket::bind((local_ip, 0)).map_err(Error::SystemError)?;
        let ctx = ConnectionContextBuilder {
            kind: TransportKind::Arq,
            role: Role::Responder,
            peer: None,
            connection_id: rand::random(),
            recv_timeout: cfg.recv_timeout,
        }
        .build();
        let mut engine = Engine::new(ctx, cfg.reassembly_timeout);
        let reply = engine.accept(peer, request)?;
        socket.send_to(&reply, peer)?;
        let unconfirmed_until =
            Instant::now() + cfg.handshake_timeout * (cfg.handshake_retries + 2);
        let this = ArqSocket {
            socket,
            engine,
            cfg,
            unconfirmed_until: Some(unconfirmed_until),
        };
        Ok((this, reply))
    }

    /// Sends one message and waits for the ACK of its last fragment.
    pub fn send(&mut self, msg: &[u8]) -> Result<()> {
        let packets = self.engine.outgoing_message(msg)?;
        let res = self.transmit(&packets);
        if res.is_err() {
            self.engine.abandon_wait();
        }
        res
    }

    fn transmit(&mut self, packets: &[Vec<u8>]) -> Result<()> {
        let peer = self.peer_addr().ok_or(Error::NotConnected)?;
        let mut timeout = self.cfg.ack_timeout;
        for attempt in 0..=self.cfg.ack_retries {
            if attempt > 0 {
                warn!(attempt, fragments = packets.len(), "ack timed out; retransmitting");
            }
            for packet in packets {
                self.socket.send_to(packet, peer)?;
            }

            let deadline = Instant::now() + timeout;
            while let Some(wait) = remaining(deadline) {
                match self.pump(wait) {
                    Ok(Event::AckCleared) => return Ok(()),
                    Ok(Event::Shutdown) => return Err(Error::NotConnected),
                    Ok(_) | Err(Error::Timeout(_)) => (),
                    Err(e) if e.is_per_packet() => warn!(%e, "packet dropped"),
                    Err(e) => return Err(e),
                }
            }
            timeout *= 2;
        }
        Err(Error::Timeout("ack"))
    }

    /// Blocks until a whole message is reassembled.
    ///
    /// Returns [`Error::NotConnected`] once the peer has shut the session down
    /// and [`Error::Timeout`] when the receive timeout elapses.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(msg) = self.engine.pop_message() {
                return Ok(msg);
            }
            if !self.engine.ctx().is_connected() {
                return Err(Error::NotConnected);
            }
            let timeout = self.read_timeout();
            match self.pump_opt(timeout) {
                Ok(_) => (),
                Err(Error::Timeout(_)) if self.confirmation_expired() => {
                    let peer = self.peer_addr().ok_or(Error::NotConnected)?;
                    warn!(%peer, "peer never confirmed the session");
                    self.engine.ctx_mut().close();
                    return Err(Error::HandshakeFailed(peer));
                }
                // woke up just short of the confirmation deadline
                Err(Error::Timeout(_))
                    if !self.is_confirmed() && timeout != self.engine.ctx().recv_timeout() => {}
                Err(Error::Timeout(_)) if self.engine.ctx().in_reassembly() => {
                    warn!("reassembly window elapsed; message dropped");
                    self.engine.abandon_reassembly();
                }
                Err(e) if e.is_per_packet() => warn!(%e, "packet dropped"),
                Err(e) => return Err(e),
            }
        }
    }

    fn read_timeout(&self) -> Option<Duration> {
        let timeout = self.engine.ctx().recv_timeout();
        match self.unconfirmed_until {
            None => timeout,
            Some(deadline) => {
                let left = remaining(deadline).unwrap_or(Duration::ZERO);
                Some(timeout.map_or(left, |t| t.min(left)))
            }
        }
    }

    fn confirmation_expired(&self) -> bool {
        self.unconfirmed_until
            .map_or(false, |deadline| Instant::now() >= deadline)
    }

    /// Whether the peer has been heard from since the handshake.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.unconfirmed_until.is_none()
    }

    /// Sends `SHUTDOWN` to a connected peer and closes the context.
    pub fn close(&mut self) -> Result<()> {
        if let (true, Some(peer)) = (self.engine.ctx().is_connected(), self.peer_addr()) {
            let packet = self.engine.shutdown_packet()?;
            self.socket.send_to(&packet, peer)?;
            info!(%peer, "session closed");
        }
        self.engine.ctx_mut().close();
        Ok(())
    }

    /// Waits for one datagram for at most `timeout` and feeds it to the engine.
    fn pump(&mut self, timeout: Duration) -> Result<Event> {
        self.pump_opt(Some(timeout))
    }

    fn pump_opt(&mut self, timeout: Option<Duration>) -> Result<Event> {
        self.socket
            .set_read_timeout(timeout.map(|t| t.max(MIN_READ_TIMEOUT)))
            .map_err(Error::SystemError)?;
        let mut buf = [0; RECV_BUF_LEN];
        let (n, from) = match self.socket.recv_from(&mut buf) {
            Ok(x) => x,
            Err(e) if Error::is_timeout(&e) => return Err(Error::Timeout("datagram")),
            Err(e) => return Err(e.into()),
        };
        if self.unconfirmed_until.is_some() && self.peer_addr() == Some(from) {
            debug!(%from, "session confirmed");
            self.unconfirmed_until = None;
        }
        let outcome = self.engine.handle_datagram(&buf[..n], from)?;
        send_replies(&self.socket, &outcome.replies)?;
        Ok(outcome.event)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub(crate) fn try_clone_socket(&self) -> Result<UdpSocket> {
        self.socket.try_clone().map_err(Error::SystemError)
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.engine.ctx().peer()
    }

    #[must_use]
    pub fn context(&self) -> &ConnectionContext {
        self.engine.ctx()
    }

    pub fn set_recv_timeout(&mut self, timeout: Option<Duration>) {
        self.engine.ctx_mut().set_recv_timeout(timeout);
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

/// Asks the server at `addr` whether it is alive.
pub fn discover(addr: SocketAddr, timeout: Duration) -> Result<SocketAddr> {
    let socket = UdpSocket::bind(unspecified(addr)).map_err(Error::SystemError)?;
    let probe = ControlMessageBuilder::new(MessageType::Broadcast, 0).build()?;
    socket.send_to(&probe.to_bytes(), addr)?;
    socket
        .set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))
        .map_err(Error::SystemError)?;

    let mut buf = [0; RECV_BUF_LEN];
    match socket.recv_from(&mut buf) {
        Ok((PACKET_DATA_SIZE, from)) => Ok(from),
        Ok(_) => Err(Error::Decoding { field: "broadcast reply" }),
        Err(e) if Error::is_timeout(&e) => Err(Error::Timeout("broadcast reply")),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn send_replies(socket: &UdpSocket, replies: &[Reply]) -> io::Result<()> {
    for reply in replies {
        socket.send_to(&reply.bytes, reply.to)?;
    }
    Ok(())
}

fn remaining(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    Some(deadline - now)
}

pub(crate) fn unspecified(peer: SocketAddr) -> SocketAddr {
    let ip = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
