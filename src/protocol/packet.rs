use std::io::Cursor;

use crate::error::{Error, Result};

use super::{
    packet_hdr::{ControlType, FragmentRole, PacketHeader, PacketHeaderBuilder, PacketKind},
    PACKET_DATA_SIZE, PACKET_HDR_LEN, PACKET_LEN,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    hdr: PacketHeader,
    data: Box<[u8; PACKET_DATA_SIZE]>,
}

impl Packet {
    #[inline]
    fn check_rep(&self) {
        if let PacketKind::Data { len, .. } = self.hdr.kind() {
            assert!(self.data[len as usize..].iter().all(|&b| b == 0));
        }
    }

    /// Zero-fills the payload region and copies `bytes` to its front.
    pub fn new(hdr: PacketHeader, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > PACKET_DATA_SIZE {
            return Err(Error::InvalidInput("payload exceeds PACKET_DATA_SIZE"));
        }
        if let PacketKind::Data { len, .. } = hdr.kind() {
            if len as usize != bytes.len() {
                return Err(Error::InvalidInput("header length disagrees with payload"));
            }
        }
        let mut data = Box::new([0; PACKET_DATA_SIZE]);
        data[..bytes.len()].copy_from_slice(bytes);
        let this = Packet { hdr, data };
        this.check_rep();
        Ok(this)
    }

    pub fn data(
        role: FragmentRole,
        msg_num: u32,
        timestamp: u32,
        id: u32,
        bytes: &[u8],
    ) -> Result<Self> {
        if bytes.len() > PACKET_DATA_SIZE {
            return Err(Error::InvalidInput("payload exceeds PACKET_DATA_SIZE"));
        }
        let hdr = PacketHeaderBuilder {
            kind: PacketKind::Data {
                role,
                len: bytes.len() as u16,
            },
            msg_num,
            timestamp,
            id,
        }
        .build()?;
        Self::new(hdr, bytes)
    }

    pub fn control(
        ty: ControlType,
        msg_num: u32,
        timestamp: u32,
        id: u32,
        bytes: &[u8],
    ) -> Result<Self> {
        let hdr = PacketHeaderBuilder {
            kind: PacketKind::Control(ty),
            msg_num,
            timestamp,
            id,
        }
        .build()?;
        Self::new(hdr, bytes)
    }

    /// Network representation: big-endian header words followed by the payload region.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.hdr.to_bytes();
        buf.extend_from_slice(&self.data[..]);
        assert_eq!(buf.len(), PACKET_LEN);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != PACKET_LEN {
            return Err(Error::Decoding { field: "packet length" });
        }
        let mut rdr = Cursor::new(buf);
        let hdr = PacketHeader::from_bytes(&mut rdr)?;
        assert_eq!(rdr.position() as usize, PACKET_HDR_LEN);
        let mut data = Box::new([0; PACKET_DATA_SIZE]);
        data.copy_from_slice(&buf[PACKET_HDR_LEN..]);
        if let PacketKind::Data { len, .. } = hdr.kind() {
            // padding is not trusted
            data[len as usize..].fill(0);
        }
        let this = Packet { hdr, data };
        this.check_rep();
        Ok(this)
    }

    #[must_use]
    #[inline]
    pub fn hdr(&self) -> &PacketHeader {
        &self.hdr
    }

    /// Meaningful payload bytes: the declared length for data packets, the
    /// whole payload region for control packets.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        match self.hdr.kind() {
            PacketKind::Data { len, .. } => &self.data[..len as usize],
            PacketKind::Control(_) => &self.data[..],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let packet = Packet::data(FragmentRole::First, 1, 99, 3, &[1, 2, 3]).unwrap();
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), PACKET_LEN);
        let packet2 = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(packet, packet2);
        assert_eq!(packet2.body(), &[1, 2, 3]);
    }

    #[test]
    fn payload_is_zero_filled() {
        let packet = Packet::control(ControlType::Handshake, 0, 0, 0, &[9; 4]).unwrap();
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[PACKET_HDR_LEN..PACKET_HDR_LEN + 4], &[9; 4]);
        assert!(bytes[PACKET_HDR_LEN + 4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_payload() {
        let bytes = vec![0; PACKET_DATA_SIZE + 1];
        assert!(matches!(
            Packet::data(FragmentRole::Solo, 1, 0, 0, &bytes),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            Packet::control(ControlType::KeepAlive, 0, 0, 0, &bytes),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn full_payload_fits() {
        let bytes = vec![7; PACKET_DATA_SIZE];
        let packet = Packet::data(FragmentRole::Solo, 1, 0, 0, &bytes).unwrap();
        assert_eq!(packet.body(), &bytes[..]);
    }

    #[test]
    fn truncated_datagram() {
        let packet = Packet::data(FragmentRole::Solo, 1, 0, 0, &[1]).unwrap();
        let bytes = packet.to_bytes();
        assert!(matches!(
            Packet::from_bytes(&bytes[..PACKET_LEN - 1]),
            Err(Error::Decoding { .. })
        ));
    }

    #[test]
    fn garbage_padding_is_dropped() {
        let packet = Packet::data(FragmentRole::Solo, 1, 0, 0, &[1, 2]).unwrap();
        let mut bytes = packet.to_bytes();
        bytes[PACKET_LEN - 1] = 0xff;
        let packet2 = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(packet, packet2);
    }
}
