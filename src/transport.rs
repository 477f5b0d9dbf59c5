//! One socket-like API over plain TCP, plain UDP and ARQ-over-UDP.
//!
//! Stream messages are framed with a big-endian `u32` length:
//!
//! ```text
//! 0               4                 (BYTE)
//! +---------------+-----------------+
//! |    length     |  message  ...   |
//! +---------------+-----------------+
//! ```

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket},
    sync::Arc,
    thread,
    time::Duration,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::{
    arq::{socket::unspecified, ArqConfig, ArqServer, ArqSocket},
    error::{Error, Result},
};

pub const MAX_STREAM_MESSAGE: usize = 16 * 1024 * 1024;
const MAX_DATAGRAM: usize = 65507;
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Deserialize,
)]
#[repr(u32)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stream = 1,
    Datagram = 2,
    Arq = 3,
}

/// Message-oriented operations every transport kind provides.
pub trait Transport {
    fn send_message(&mut self, msg: &[u8]) -> Result<()>;
    fn receive_message(&mut self) -> Result<Vec<u8>>;
    fn close(&mut self) -> Result<()>;
    fn kind(&self) -> TransportKind;
}

pub enum Connection {
    Stream(TcpStream),
    Datagram { socket: UdpSocket, peer: SocketAddr },
    Arq(ArqSocket),
}

impl Connection {
    pub fn connect(kind: TransportKind, addr: SocketAddr, cfg: &ArqConfig) -> Result<Self> {
        let this = match kind {
            TransportKind::Stream => {
                let stream = TcpStream::connect(addr)?;
                stream
                    .set_read_timeout(cfg.recv_timeout)
                    .map_err(Error::SystemError)?;
                Connection::Stream(stream)
            }
            TransportKind::Datagram => {
                let socket = UdpSocket::bind(unspecified(addr)).map_err(Error::SystemError)?;
                socket
                    .set_read_timeout(cfg.recv_timeout)
                    .map_err(Error::SystemError)?;
                Connection::Datagram { socket, peer: addr }
            }
            TransportKind::Arq => Connection::Arq(ArqSocket::connect(addr, cfg.clone())?),
        };
        info!(?kind, %addr, "connected");
        Ok(this)
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Stream(s) => s.peer_addr().ok(),
            Connection::Datagram { peer, .. } => Some(*peer),
            Connection::Arq(s) => s.peer_addr(),
        }
    }
}

impl Transport for Connection {
    fn send_message(&mut self, msg: &[u8]) -> Result<()> {
        match self {
            Connection::Stream(s) => write_frame(s, msg),
            Connection::Datagram { socket, peer } => {
                if msg.len() > MAX_DATAGRAM {
                    return Err(Error::InvalidInput("message exceeds one datagram"));
                }
                socket.send_to(msg, *peer)?;
                Ok(())
            }
            Connection::Arq(s) => s.send(msg),
        }
    }

    fn receive_message(&mut self) -> Result<Vec<u8>> {
        match self {
            Connection::Stream(s) => read_frame(s),
            Connection::Datagram { socket, peer } => {
                let mut buf = vec![0; MAX_DATAGRAM];
                loop {
                    let (n, from) = socket.recv_from(&mut buf).map_err(map_recv_err)?;
                    if from != *peer {
                        warn!(%from, "datagram from unknown client dropped");
                        continue;
                    }
                    buf.truncate(n);
                    return Ok(buf);
                }
            }
            Connection::Arq(s) => s.recv(),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Connection::Stream(s) => match s.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
                _ => Ok(()),
            },
            Connection::Datagram { .. } => Ok(()),
            Connection::Arq(s) => s.close(),
        }
    }

    fn kind(&self) -> TransportKind {
        match self {
            Connection::Stream(_) => TransportKind::Stream,
            Connection::Datagram { .. } => TransportKind::Datagram,
            Connection::Arq(_) => TransportKind::Arq,
        }
    }
}

fn write_frame(wtr: &mut impl Write, msg: &[u8]) -> Result<()> {
    if msg.len() > MAX_STREAM_MESSAGE {
        return Err(Error::InvalidInput("message exceeds MAX_STREAM_MESSAGE"));
    }
    let mut frame = Vec::with_capacity(4 + msg.len());
    frame.write_u32::<BigEndian>(msg.len() as u32)?;
    frame.extend_from_slice(msg);
    wtr.write_all(&frame)?;
    Ok(())
}

fn read_frame(rdr: &mut impl Read) -> Result<Vec<u8>> {
    let len = rdr.read_u32::<BigEndian>().map_err(map_recv_err)? as usize;
    if len > MAX_STREAM_MESSAGE {
        return Err(Error::Decoding { field: "stream frame length" });
    }
    let mut msg = vec![0; len];
    rdr.read_exact(&mut msg).map_err(map_recv_err)?;
    Ok(msg)
}

fn map_recv_err(e: io::Error) -> Error {
    if Error::is_timeout(&e) {
        return Error::Timeout("message");
    }
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => Error::NotConnected,
        _ => Error::Io(e),
    }
}

pub enum Listener {
    Stream { listener: TcpListener, cfg: ArqConfig },
    Datagram { socket: UdpSocket, cfg: ArqConfig },
    Arq(ArqServer),
}

impl Listener {
    pub fn bind(kind: TransportKind, addr: impl ToSocketAddrs, cfg: ArqConfig) -> Result<Self> {
        let this = match kind {
            TransportKind::Stream => Listener::Stream {
                listener: TcpListener::bind(addr).map_err(Error::SystemError)?,
                cfg,
            },
            TransportKind::Datagram => Listener::Datagram {
                socket: UdpSocket::bind(addr).map_err(Error::SystemError)?,
                cfg,
            },
            TransportKind::Arq => Listener::Arq(ArqServer::bind(addr, cfg)?),
        };
        Ok(this)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            Listener::Stream { listener, .. } => Ok(listener.local_addr()?),
            Listener::Datagram { socket, .. } => Ok(socket.local_addr()?),
            Listener::Arq(server) => server.local_addr(),
        }
    }

    /// Datagram listeners take the sender of the next datagram as their peer;
    /// that datagram stays queued for the returned connection.
    pub fn accept(&mut self) -> Result<Connection> {
        match self {
            Listener::Stream { listener, cfg } => {
                let (stream, _) = listener.accept()?;
                stream
                    .set_read_timeout(cfg.recv_timeout)
                    .map_err(Error::SystemError)?;
                Ok(Connection::Stream(stream))
            }
            Listener::Datagram { socket, cfg } => {
                let mut buf = [0; 1];
                socket.set_read_timeout(None).map_err(Error::SystemError)?;
                let (_, peer) = socket.peek_from(&mut buf)?;
                let socket = socket.try_clone().map_err(Error::SystemError)?;
                socket
                    .set_read_timeout(cfg.recv_timeout)
                    .map_err(Error::SystemError)?;
                Ok(Connection::Datagram { socket, peer })
            }
            Listener::Arq(server) => Ok(Connection::Arq(server.accept()?)),
        }
    }

    /// Runs `handler` once per accepted connection.
    ///
    /// Stream and ARQ sessions get a thread each; datagram sessions share the
    /// listening socket and are served one after another.
    pub fn serve<F>(self, handler: F) -> Result<()>
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        match self {
            Listener::Arq(server) => server.run(move |session| handler(Connection::Arq(session))),
            mut this @ Listener::Stream { .. } => {
                let handler = Arc::new(handler);
                let mut backoff = AcceptBackoff::default();
                loop {
                    let conn = match this.accept() {
                        Ok(x) => {
                            backoff.reset();
                            x
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            error!(%e, ?delay, "accept failed");
                            thread::sleep(delay);
                            continue;
                        }
                    };
                    let handler = Arc::clone(&handler);
                    if let Err(e) = thread::Builder::new().spawn(move || handler(conn)) {
                        error!(%e, "cannot spawn session worker");
                    }
                }
            }
            mut this @ Listener::Datagram { .. } => loop {
                let conn = this.accept()?;
                handler(conn);
            },
        }
    }
}

/// Delay before retrying after consecutive `accept` failures.
#[derive(Debug, Default)]
struct AcceptBackoff {
    failures: u32,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = ACCEPT_BACKOFF_MIN
            .saturating_mul(1 << self.failures.min(16))
            .min(ACCEPT_BACKOFF_MAX);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Binds `kind` on `addr` and serves every session with `handler`.
pub fn bind<F>(kind: TransportKind, addr: impl ToSocketAddrs, cfg: ArqConfig, handler: F) -> Result<()>
where
    F: Fn(Connection) + Send + Sync + 'static,
{
    Listener::bind(kind, addr, cfg)?.serve(handler)
}
