use std::{
    net::SocketAddr,
    sync::mpsc,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    protocol::{
        ctl_message::{ControlMessage, MessageType, CTL_MESSAGE_LEN},
        handshake::{HandshakeInfo, DEFAULT_FLIGHT_WINDOW, REQUEST_CONNECT},
        packet::Packet,
        packet_hdr::{ControlType, FragmentRole, PacketKind},
        PACKET_DATA_SIZE, PACKET_LEN, UDT_VERSION,
    },
};

use super::{
    context::{ConnState, ConnectionContext, Role},
    reassembly::Reassembly,
    sender,
};

pub struct Reply {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Accepted and logged, nothing else to do.
    Ignored,
    Broadcast,
    /// A not-yet-connected peer asked for a session.
    NewSession { peer: SocketAddr, info: HandshakeInfo },
    Connected { peer: SocketAddr },
    Delivered,
    AckCleared,
    Shutdown,
}

pub struct Outcome {
    pub replies: Vec<Reply>,
    pub event: Event,
}

impl Outcome {
    fn event(event: Event) -> Self {
        Outcome {
            replies: Vec::new(),
            event,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stat {
    pub packets: u64,
    pub data_fragments: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub signals: u64,
    pub rejected: u64,
}

/// Packet-parse state machine of one connection.
pub struct Engine {
    ctx: ConnectionContext,
    reassembly: Reassembly,
    handshake_waiter: Option<mpsc::SyncSender<HandshakeInfo>>,
    epoch: Instant,
    /// Timestamp of the last outgoing message; strictly increasing.
    last_stamp: u32,
    /// Timestamp of the last message delivered to `reassembly`.
    delivered_stamp: Option<u32>,
    stat: Stat,
}

impl Engine {
    #[must_use]
    pub fn new(ctx: ConnectionContext, reassembly_timeout: Duration) -> Self {
        Engine {
            ctx,
            reassembly: Reassembly::new(reassembly_timeout),
            handshake_waiter: None,
            epoch: Instant::now(),
            last_stamp: 0,
            delivered_stamp: None,
            stat: Stat::default(),
        }
    }

    #[must_use]
    #[inline]
    pub fn ctx(&self) -> &ConnectionContext {
        &self.ctx
    }

    #[must_use]
    #[inline]
    pub fn ctx_mut(&mut self) -> &mut ConnectionContext {
        &mut self.ctx
    }

    #[must_use]
    pub fn stat(&self) -> Stat {
        self.stat.clone()
    }

    fn timestamp(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }

    /// Every fragment of one message, and every retransmission of it, carries
    /// the same stamp. Two messages never share one.
    fn message_stamp(&mut self) -> u32 {
        let now = self.timestamp();
        self.last_stamp = if now > self.last_stamp {
            now
        } else {
            self.last_stamp.wrapping_add(1)
        };
        self.last_stamp
    }

    /// The receive loop resolves `tx` once the handshake reply shows up.
    pub fn on_handshake(&mut self, tx: mpsc::SyncSender<HandshakeInfo>) {
        self.handshake_waiter = Some(tx);
    }

    #[must_use]
    pub fn handshake_info(&self) -> HandshakeInfo {
        HandshakeInfo {
            version: UDT_VERSION,
            transport_kind: self.ctx.kind().into(),
            nonce: rand::random(),
            max_packet_size: PACKET_DATA_SIZE as u32,
            flight_window: DEFAULT_FLIGHT_WINDOW,
            request_type: REQUEST_CONNECT,
            connection_id: self.ctx.connection_id(),
            cookie: 0,
        }
    }

    pub fn handshake_packet(&mut self) -> Result<Vec<u8>> {
        self.ctx.start_handshake();
        let info = self.handshake_info();
        self.encode_handshake(&info)
    }

    fn encode_handshake(&self, info: &HandshakeInfo) -> Result<Vec<u8>> {
        let packet = Packet::control(
            ControlType::Handshake,
            0,
            self.timestamp(),
            self.ctx.connection_id(),
            &info.to_bytes(),
        )?;
        Ok(packet.to_bytes())
    }

    /// Responder side: the session worker takes over `peer` and answers it.
    ///
    /// The reply echoes the connection id and nonce of `request`, so the
    /// connector can tell it apart from a handshake meant for someone else.
    pub fn accept(&mut self, peer: SocketAddr, request: &HandshakeInfo) -> Result<Vec<u8>> {
        self.ctx.start_handshake();
        let info = HandshakeInfo {
            nonce: request.nonce,
            connection_id: request.connection_id,
            ..self.handshake_info()
        };
        let reply = self.encode_handshake(&info)?;
        self.ctx.establish(peer);
        info!(%peer, id = self.ctx.connection_id(), "session established");
        Ok(reply)
    }

    pub fn shutdown_packet(&self) -> Result<Vec<u8>> {
        self.signal_packet(ControlType::Shutdown)
    }

    /// Sent by the connector right after the handshake so the session worker
    /// learns that its reply arrived.
    pub fn keepalive_packet(&self) -> Result<Vec<u8>> {
        self.signal_packet(ControlType::KeepAlive)
    }

    fn signal_packet(&self, ty: ControlType) -> Result<Vec<u8>> {
        let packet = Packet::control(ty, 0, self.timestamp(), self.ctx.connection_id(), &[])?;
        Ok(packet.to_bytes())
    }

    /// Fragments `msg` and marks the connection as waiting for the ACK of the last fragment.
    pub fn outgoing_message(&mut self, msg: &[u8]) -> Result<Vec<Vec<u8>>> {
        if !self.ctx.is_connected() {
            return Err(Error::NotConnected);
        }
        let stamp = self.message_stamp();
        let packets = sender::fragment(msg, stamp, self.ctx.connection_id())?;
        let last = packets
            .last()
            .map(|p| p.hdr().msg_num())
            .ok_or(Error::InvalidInput("no fragments"))?;
        self.ctx.awaited_ack = Some(last);
        Ok(packets.iter().map(|p| p.to_bytes()).collect())
    }

    pub fn abandon_wait(&mut self) {
        self.ctx.awaited_ack = None;
    }

    /// Drops a message whose fragments stopped arriving.
    pub fn abandon_reassembly(&mut self) {
        self.reassembly.abandon(&mut self.ctx);
    }

    #[must_use]
    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.reassembly.pop()
    }

    /// Entry point for every datagram received on the connection's socket.
    pub fn handle_datagram(&mut self, buf: &[u8], from: SocketAddr) -> Result<Outcome> {
        self.stat.packets += 1;
        let res = match buf.len() {
            CTL_MESSAGE_LEN => self.handle_request(buf, from),
            PACKET_LEN => Packet::from_bytes(buf).and_then(|p| self.handle_packet(p, from)),
            _ => Err(Error::Decoding { field: "datagram length" }),
        };
        if res.is_err() {
            self.stat.rejected += 1;
        }
        res
    }

    fn handle_request(&mut self, buf: &[u8], from: SocketAddr) -> Result<Outcome> {
        let msg = ControlMessage::from_bytes(buf)?;
        match msg.msg_type()? {
            MessageType::Broadcast => {
                info!(%from, "packet: broadcast request");
                Ok(Outcome {
                    replies: vec![Reply {
                        to: from,
                        bytes: vec![0; PACKET_DATA_SIZE],
                    }],
                    event: Event::Broadcast,
                })
            }
            _ => Err(Error::Decoding { field: "request type" }),
        }
    }

    fn handle_packet(&mut self, packet: Packet, from: SocketAddr) -> Result<Outcome> {
        match packet.hdr().kind() {
            PacketKind::Control(ty) => self.handle_control(ty, &packet, from),
            PacketKind::Data { role, .. } => {
                debug!(%from, msg_num = packet.hdr().msg_num(), "packet: data");
                if !self.is_from_peer(from) {
                    warn!(%from, "packet: data was from unknown client");
                    return Err(Error::UnknownClient(Some(from)));
                }
                let msg_num = packet.hdr().msg_num();
                let stamp = packet.hdr().timestamp();
                if self.delivered_stamp == Some(stamp) {
                    // the sender missed our ACK and retransmits
                    debug!(%from, msg_num, "packet: fragment of a delivered message");
                    return self.ack(msg_num, from, Event::Ignored);
                }
                self.reassembly
                    .push(&mut self.ctx, role, msg_num, packet.body())?;
                self.stat.data_fragments += 1;
                if matches!(role, FragmentRole::Solo | FragmentRole::Last) {
                    self.delivered_stamp = Some(stamp);
                }
                self.ack(msg_num, from, Event::Delivered)
            }
        }
    }

    fn ack(&mut self, msg_num: u32, to: SocketAddr, event: Event) -> Result<Outcome> {
        let ack = Packet::control(
            ControlType::Ack,
            msg_num,
            self.timestamp(),
            self.ctx.connection_id(),
            &[],
        )?;
        self.stat.acks_sent += 1;
        Ok(Outcome {
            replies: vec![Reply {
                to,
                bytes: ack.to_bytes(),
            }],
            event,
        })
    }

    fn handle_control(&mut self, ty: ControlType, packet: &Packet, from: SocketAddr) -> Result<Outcome> {
        match ty {
            ControlType::Handshake => {
                info!(%from, "packet: handshake");
                self.handle_handshake(packet, from)
            }
            ControlType::Ack => {
                self.stat.acks_received += 1;
                let msg_num = packet.hdr().msg_num();
                debug!(%from, msg_num, "packet: ack");
                if self.is_from_peer(from) && self.ctx.awaited_ack == Some(msg_num) {
                    self.ctx.awaited_ack = None;
                    return Ok(Outcome::event(Event::AckCleared));
                }
                Ok(Outcome::event(Event::Ignored))
            }
            ControlType::Shutdown => {
                info!(%from, "packet: shutdown");
                if !self.is_from_peer(from) {
                    warn!(%from, "unknown client tries to shut the session down");
                    return Err(Error::UnknownClient(Some(from)));
                }
                self.ctx.close();
                Ok(Outcome::event(Event::Shutdown))
            }
            ControlType::KeepAlive
            | ControlType::Nak
            | ControlType::CongestionDelay
            | ControlType::Ack2
            | ControlType::DropRequest
            | ControlType::ErrorSignal => {
                debug!(%from, ?ty, "packet: signal");
                self.stat.signals += 1;
                Ok(Outcome::event(Event::Ignored))
            }
        }
    }

    fn handle_handshake(&mut self, packet: &Packet, from: SocketAddr) -> Result<Outcome> {
        let info = HandshakeInfo::from_bytes(packet.body())?;
        if self.ctx.is_connected() {
            debug!(%from, "duplicate handshake ignored");
            return Ok(Outcome::event(Event::Ignored));
        }
        match self.ctx.role() {
            Role::Initiator => {
                if self.ctx.state() != ConnState::Handshaking {
                    return Ok(Outcome::event(Event::Ignored));
                }
                if info.connection_id != self.ctx.connection_id() {
                    warn!(%from, id = info.connection_id, "handshake reply for another connection");
                    return Err(Error::UnknownClient(Some(from)));
                }
                self.ctx.establish(from);
                if let Some(tx) = self.handshake_waiter.take() {
                    // the connector may have given up already
                    let _ = tx.try_send(info);
                }
                Ok(Outcome::event(Event::Connected { peer: from }))
            }
            Role::Responder => Ok(Outcome::event(Event::NewSession { peer: from, info })),
        }
    }

    #[inline]
    fn is_from_peer(&self, from: SocketAddr) -> bool {
        self.ctx.is_connected() && self.ctx.peer() == Some(from)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        arq::context::ConnectionContextBuilder,
        protocol::ctl_message::ControlMessageBuilder,
        transport::TransportKind,
    };

    use super::*;

    const WINDOW: Duration = Duration::from_millis(200);

    fn engine(role: Role) -> Engine {
        let ctx = ConnectionContextBuilder {
            kind: TransportKind::Arq,
            role,
            peer: None,
            connection_id: 10,
            recv_timeout: Some(Duration::from_secs(1)),
        }
        .build();
        Engine::new(ctx, WINDOW)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:6000".parse().unwrap()
    }

    fn connected(role: Role) -> Engine {
        let mut engine = engine(role);
        engine.ctx_mut().establish(peer());
        engine
    }

    fn data(role: FragmentRole, msg_num: u32, body: &[u8]) -> Vec<u8> {
        Packet::data(role, msg_num, 0, 0, body).unwrap().to_bytes()
    }

    fn control(ty: ControlType, msg_num: u32) -> Vec<u8> {
        Packet::control(ty, msg_num, 0, 0, &[]).unwrap().to_bytes()
    }

    fn ack_num(reply: &Reply) -> u32 {
        let packet = Packet::from_bytes(&reply.bytes).unwrap();
        assert_eq!(packet.hdr().control_type(), Some(ControlType::Ack));
        packet.hdr().msg_num()
    }

    #[test]
    fn fragments_round_trip() {
        let mut tx = connected(Role::Initiator);
        let mut rx = connected(Role::Responder);
        let msg: Vec<u8> = (0..PACKET_DATA_SIZE * 3 + 100).map(|i| i as u8).collect();
        let packets = tx.outgoing_message(&msg).unwrap();
        assert_eq!(packets.len(), 4);
        assert!(tx.ctx().is_in_wait());

        let mut acks = Vec::new();
        for packet in packets {
            let outcome = rx.handle_datagram(&packet, peer()).unwrap();
            assert_eq!(outcome.event, Event::Delivered);
            assert_eq!(outcome.replies.len(), 1);
            acks.push(outcome.replies.into_iter().next().unwrap());
        }
        assert_eq!(
            acks.iter().map(ack_num).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(rx.pop_message().unwrap(), msg);
        assert!(rx.pop_message().is_none());

        // only the last ACK releases the sender
        for ack in &acks[..3] {
            let outcome = tx.handle_datagram(&ack.bytes, peer()).unwrap();
            assert_eq!(outcome.event, Event::Ignored);
            assert!(tx.ctx().is_in_wait());
        }
        let outcome = tx.handle_datagram(&acks[3].bytes, peer()).unwrap();
        assert_eq!(outcome.event, Event::AckCleared);
        assert!(!tx.ctx().is_in_wait());
    }

    #[test]
    fn out_of_sequence_fragment() {
        let mut rx = connected(Role::Responder);
        rx.handle_datagram(&data(FragmentRole::First, 1, &[1]), peer())
            .unwrap();
        rx.handle_datagram(&data(FragmentRole::Middle, 2, &[2]), peer())
            .unwrap();
        match rx.handle_datagram(&data(FragmentRole::Middle, 4, &[4]), peer()) {
            Err(Error::InvalidMessageNumber {
                expected: 3,
                actual: 4,
            }) => (),
            Err(e) => panic!("{}", e),
            Ok(_) => panic!(),
        }
        assert_eq!(rx.stat().acks_sent, 2);
        rx.handle_datagram(&data(FragmentRole::Last, 3, &[3]), peer())
            .unwrap();
        assert_eq!(rx.pop_message().unwrap(), vec![1, 2, 3]);
        assert_eq!(rx.ctx().recv_timeout(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn data_from_unknown_client() {
        let mut rx = engine(Role::Responder);
        let res = rx.handle_datagram(&data(FragmentRole::Solo, 1, &[1]), peer());
        assert!(matches!(res, Err(Error::UnknownClient(_))));
        assert!(rx.pop_message().is_none());
        assert_eq!(rx.ctx().state(), ConnState::New);
        assert_eq!(rx.stat().acks_sent, 0);

        let mut rx = connected(Role::Responder);
        let stranger: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let res = rx.handle_datagram(&data(FragmentRole::Solo, 1, &[1]), stranger);
        assert!(matches!(res, Err(Error::UnknownClient(_))));
    }

    #[test]
    fn shutdown() {
        let mut rx = engine(Role::Responder);
        let res = rx.handle_datagram(&control(ControlType::Shutdown, 0), peer());
        assert!(matches!(res, Err(Error::UnknownClient(_))));
        assert_eq!(rx.ctx().state(), ConnState::New);

        let mut rx = connected(Role::Responder);
        let outcome = rx
            .handle_datagram(&control(ControlType::Shutdown, 0), peer())
            .unwrap();
        assert_eq!(outcome.event, Event::Shutdown);
        assert!(!rx.ctx().is_connected());
    }

    #[test]
    fn signals_have_no_side_effect() {
        let mut rx = connected(Role::Initiator);
        rx.outgoing_message(&[1]).unwrap();
        for ty in [
            ControlType::KeepAlive,
            ControlType::Nak,
            ControlType::CongestionDelay,
            ControlType::Ack2,
            ControlType::DropRequest,
            ControlType::ErrorSignal,
        ] {
            let outcome = rx.handle_datagram(&control(ty, 1), peer()).unwrap();
            assert_eq!(outcome.event, Event::Ignored);
            assert!(outcome.replies.is_empty());
        }
        assert!(rx.ctx().is_in_wait());
        assert!(rx.ctx().is_connected());
        assert_eq!(rx.stat().signals, 6);
    }

    #[test]
    fn unknown_control_type() {
        let mut rx = connected(Role::Responder);
        let mut bytes = control(ControlType::KeepAlive, 0);
        bytes[1] = 0x33;
        let res = rx.handle_datagram(&bytes, peer());
        assert!(matches!(res, Err(Error::UnknownPacketType(0x33))));
        // the engine keeps working
        rx.handle_datagram(&data(FragmentRole::Solo, 1, &[5]), peer())
            .unwrap();
        assert_eq!(rx.pop_message().unwrap(), vec![5]);
    }

    #[test]
    fn handshake() {
        let mut client = engine(Role::Initiator);
        let mut server = engine(Role::Responder);
        let (tx, rx) = mpsc::sync_channel(1);
        client.on_handshake(tx);

        let request = client.handshake_packet().unwrap();
        assert_eq!(client.ctx().state(), ConnState::Handshaking);
        let outcome = server.handle_datagram(&request, client_addr()).unwrap();
        let info = match outcome.event {
            Event::NewSession { peer, info } => {
                assert_eq!(peer, client_addr());
                info
            }
            e => panic!("{:?}", e),
        };
        assert_eq!(info.version, UDT_VERSION);
        assert_eq!(info.max_packet_size, PACKET_DATA_SIZE as u32);
        // the listener itself never becomes connected
        assert_eq!(server.ctx().state(), ConnState::New);

        let mut session = engine(Role::Responder);
        let reply = session.accept(client_addr(), &info).unwrap();
        assert!(session.ctx().is_connected());

        let outcome = client.handle_datagram(&reply, peer()).unwrap();
        assert_eq!(outcome.event, Event::Connected { peer: peer() });
        assert!(client.ctx().is_connected());
        assert_eq!(rx.try_recv().unwrap().transport_kind, u32::from(TransportKind::Arq));

        // a duplicate reply changes nothing
        let other: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let outcome = client.handle_datagram(&reply, other).unwrap();
        assert_eq!(outcome.event, Event::Ignored);
        assert_eq!(client.ctx().peer(), Some(peer()));
    }

    #[test]
    fn handshake_reply_for_another_connection() {
        let mut client = engine(Role::Initiator);
        let request = client.handshake_packet().unwrap();
        let info = HandshakeInfo::from_bytes(Packet::from_bytes(&request).unwrap().body()).unwrap();
        let stranger: SocketAddr = "127.0.0.1:7000".parse().unwrap();

        let mut other = engine(Role::Responder);
        let forged = HandshakeInfo {
            connection_id: info.connection_id + 1,
            ..info
        };
        let reply = other.accept(client_addr(), &forged).unwrap();
        let res = client.handle_datagram(&reply, stranger);
        assert!(matches!(res, Err(Error::UnknownClient(_))));
        assert_eq!(client.ctx().state(), ConnState::Handshaking);
        assert_eq!(client.ctx().peer(), None);

        let mut session = engine(Role::Responder);
        let reply = session.accept(client_addr(), &info).unwrap();
        let outcome = client.handle_datagram(&reply, peer()).unwrap();
        assert_eq!(outcome.event, Event::Connected { peer: peer() });
    }

    #[test]
    fn retransmitted_message_is_delivered_once() {
        let mut tx = connected(Role::Initiator);
        let mut rx = connected(Role::Responder);
        let msg = vec![7; 3000];
        let packets = tx.outgoing_message(&msg).unwrap();
        assert_eq!(packets.len(), 3);

        // every ACK of the first pass is lost, so the sender resends all of it
        for _ in 0..2 {
            for packet in &packets {
                let outcome = rx.handle_datagram(packet, peer()).unwrap();
                assert_eq!(outcome.replies.len(), 1);
            }
        }
        assert_eq!(rx.pop_message().unwrap(), msg);
        assert!(rx.pop_message().is_none());
        assert_eq!(rx.stat().acks_sent, 6);
        assert_eq!(rx.stat().data_fragments, 3);

        // the next message with the same bytes is a new one
        let packets = tx.outgoing_message(&msg).unwrap();
        for packet in &packets {
            let outcome = rx.handle_datagram(packet, peer()).unwrap();
            assert_eq!(outcome.event, Event::Delivered);
        }
        assert_eq!(rx.pop_message().unwrap(), msg);
    }

    #[test]
    fn broadcast() {
        let mut server = engine(Role::Responder);
        let probe = ControlMessageBuilder::new(MessageType::Broadcast, 0)
            .build()
            .unwrap()
            .to_bytes();
        let outcome = server.handle_datagram(&probe, peer()).unwrap();
        assert_eq!(outcome.event, Event::Broadcast);
        assert_eq!(outcome.replies[0].to, peer());
        assert_eq!(outcome.replies[0].bytes, vec![0; PACKET_DATA_SIZE]);
        assert_eq!(server.ctx().state(), ConnState::New);
    }

    #[test]
    fn not_connected_send() {
        let mut tx = engine(Role::Initiator);
        assert!(matches!(tx.outgoing_message(&[1]), Err(Error::NotConnected)));
    }
}
