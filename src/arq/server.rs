use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{Arc, Mutex},
    thread,
};

use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    protocol::{handshake::HandshakeInfo, PACKET_LEN},
    transport::TransportKind,
};

use super::{
    context::{ConnectionContextBuilder, Role},
    engine::{Engine, Event},
    socket::{send_replies, ArqSocket},
    ArqConfig,
};

/// Listens for handshakes and hands each new peer its own [`ArqSocket`].
pub struct ArqServer {
    socket: UdpSocket,
    engine: Engine,
    cfg: ArqConfig,
    active: Arc<Mutex<HashMap<SocketAddr, LiveSession>>>,
}

/// What the listener remembers of a session served by [`ArqServer::run`].
struct LiveSession {
    connection_id: u32,
    /// Shares the session worker's socket.
    socket: UdpSocket,
    reply: Vec<u8>,
}

impl ArqServer {
    pub fn bind(addr: impl ToSocketAddrs, cfg: ArqConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(Error::SystemError)?;
        let ctx = ConnectionContextBuilder {
            kind: TransportKind::Arq,
            role: Role::Responder,
            peer: None,
            connection_id: 0,
            recv_timeout: None,
        }
        .build();
        Ok(ArqServer {
            socket,
            engine: Engine::new(ctx, cfg.reassembly_timeout),
            cfg,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Blocks until a peer without a live session completes a handshake.
    pub fn accept(&mut self) -> Result<ArqSocket> {
        self.accept_live().map(|(session, _)| session)
    }

    fn accept_live(&mut self) -> Result<(ArqSocket, LiveSession)> {
        let local_ip = self.local_addr()?.ip();
        loop {
            let (peer, info) = match self.pump() {
                Ok(Event::NewSession { peer, info }) => (peer, info),
                Ok(_) => continue,
                Err(e) if e.is_per_packet() => {
                    warn!(%e, "listener: packet dropped");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if self.answer_live(peer, &info) {
                continue;
            }
            match self.open_session(local_ip, peer, &info) {
                Ok(x) => {
                    info!(%peer, local = ?x.0.local_addr().ok(), "session accepted");
                    return Ok(x);
                }
                // fatal to that session only
                Err(e) => error!(%peer, %e, "cannot set up session"),
            }
        }
    }

    fn open_session(
        &self,
        local_ip: IpAddr,
        peer: SocketAddr,
        info: &HandshakeInfo,
    ) -> Result<(ArqSocket, LiveSession)> {
        let (session, reply) = ArqSocket::accept_with_reply(local_ip, peer, info, self.cfg.clone())?;
        let live = LiveSession {
            connection_id: info.connection_id,
            socket: session.try_clone_socket()?,
            reply,
        };
        Ok((session, live))
    }

    /// Handles a handshake from a peer that already has a session. A repeat
    /// of the original request means our reply was lost; it is sent again
    /// from the session's own socket.
    fn answer_live(&self, peer: SocketAddr, info: &HandshakeInfo) -> bool {
        let active = self.lock_active();
        let live = match active.get(&peer) {
            Some(x) => x,
            None => return false,
        };
        if live.connection_id != info.connection_id {
            debug!(%peer, "handshake from a peer with a live session ignored");
            return true;
        }
        debug!(%peer, "repeated handshake; resending the reply");
        if let Err(e) = live.socket.send_to(&live.reply, peer) {
            warn!(%peer, %e, "cannot resend handshake reply");
        }
        true
    }

    /// Serves forever, one thread per session.
    pub fn run<F>(mut self, handler: F) -> Result<()>
    where
        F: Fn(ArqSocket) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        info!(addr = ?self.local_addr().ok(), "listening");
        loop {
            let (session, live) = self.accept_live()?;
            let peer = session.peer_addr().ok_or(Error::NotConnected)?;
            self.lock_active().insert(peer, live);

            let handler = Arc::clone(&handler);
            let active = Arc::clone(&self.active);
            let spawned = thread::Builder::new()
                .name(format!("session-{}", peer))
                .spawn(move || {
                    handler(session);
                    active
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&peer);
                    info!(%peer, "session ended");
                });
            if let Err(e) = spawned {
                error!(%peer, %e, "cannot spawn session worker");
                self.lock_active().remove(&peer);
            }
        }
    }

    fn pump(&mut self) -> Result<Event> {
        let mut buf = [0; PACKET_LEN + 64];
        let (n, from) = self.socket.recv_from(&mut buf)?;
        let outcome = self.engine.handle_datagram(&buf[..n], from)?;
        send_replies(&self.socket, &outcome.replies)?;
        Ok(outcome.event)
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, LiveSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.lock_active().len()
    }
}
