use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{Error, Result};

use super::{PACKET_DATA_SIZE, PACKET_HDR_LEN, PACKET_HEADER_SIZE};

const CONTROL_BIT: u32 = 0x8000_0000;
const SUBTYPE_SHIFT: u32 = 16;
const SUBTYPE_MASK: u32 = 0x7fff;
const LEN_MASK: u32 = 0xffff;
const FIRST_BIT: u32 = 0x8000_0000;
const LAST_BIT: u32 = 0x4000_0000;
const MSG_NUM_MASK: u32 = 0x3fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ControlType {
    Handshake = 0,
    KeepAlive = 1,
    Ack = 2,
    Nak = 3,
    CongestionDelay = 4,
    Shutdown = 5,
    Ack2 = 6,
    DropRequest = 7,
    ErrorSignal = 8,
}

/// Position of a data packet inside its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentRole {
    Solo,
    First,
    Middle,
    Last,
}

impl FragmentRole {
    #[must_use]
    fn to_bits(self) -> u32 {
        match self {
            FragmentRole::Solo => FIRST_BIT | LAST_BIT,
            FragmentRole::First => FIRST_BIT,
            FragmentRole::Middle => 0,
            FragmentRole::Last => LAST_BIT,
        }
    }

    #[must_use]
    fn from_bits(word: u32) -> Self {
        match (word & FIRST_BIT != 0, word & LAST_BIT != 0) {
            (true, true) => FragmentRole::Solo,
            (true, false) => FragmentRole::First,
            (false, false) => FragmentRole::Middle,
            (false, true) => FragmentRole::Last,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Control(ControlType),
    Data { role: FragmentRole, len: u16 },
}

/// Host-order view of the header words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    kind: PacketKind,
    msg_num: u32,
    timestamp: u32,
    id: u32,
}

pub struct PacketHeaderBuilder {
    pub kind: PacketKind,
    pub msg_num: u32,
    pub timestamp: u32,
    pub id: u32,
}

impl PacketHeaderBuilder {
    pub fn build(self) -> Result<PacketHeader> {
        if self.msg_num > MSG_NUM_MASK {
            return Err(Error::InvalidInput("message number exceeds 30 bits"));
        }
        if let PacketKind::Data { len, .. } = self.kind {
            if len as usize > PACKET_DATA_SIZE {
                return Err(Error::InvalidInput("payload length exceeds PACKET_DATA_SIZE"));
            }
        }
        let this = PacketHeader {
            kind: self.kind,
            msg_num: self.msg_num,
            timestamp: self.timestamp,
            id: self.id,
        };
        this.check_rep();
        Ok(this)
    }
}

impl PacketHeader {
    #[inline]
    fn check_rep(&self) {
        assert!(self.msg_num <= MSG_NUM_MASK);
        if let PacketKind::Data { len, .. } = self.kind {
            assert!(len as usize <= PACKET_DATA_SIZE);
        }
    }

    #[must_use]
    pub fn to_words(&self) -> [u32; PACKET_HEADER_SIZE] {
        let (word0, role_bits) = match self.kind {
            PacketKind::Control(ty) => {
                let ty: u32 = ty.into();
                (CONTROL_BIT | (ty & SUBTYPE_MASK) << SUBTYPE_SHIFT, 0)
            }
            PacketKind::Data { role, len } => (len as u32 & LEN_MASK, role.to_bits()),
        };
        [
            word0,
            role_bits | self.msg_num,
            self.timestamp,
            self.id,
        ]
    }

    pub fn from_words(words: [u32; PACKET_HEADER_SIZE]) -> Result<Self> {
        let kind = if words[0] & CONTROL_BIT != 0 {
            let ty = (words[0] >> SUBTYPE_SHIFT) & SUBTYPE_MASK;
            let ty = ControlType::try_from(ty).map_err(|_e| Error::UnknownPacketType(ty))?;
            PacketKind::Control(ty)
        } else {
            let len = (words[0] & LEN_MASK) as u16;
            if len as usize > PACKET_DATA_SIZE {
                return Err(Error::Decoding { field: "length" });
            }
            PacketKind::Data {
                role: FragmentRole::from_bits(words[1]),
                len,
            }
        };
        let this = PacketHeader {
            kind,
            msg_num: words[1] & MSG_NUM_MASK,
            timestamp: words[2],
            id: words[3],
        };
        this.check_rep();
        Ok(this)
    }

    pub fn from_bytes(rdr: &mut io::Cursor<&[u8]>) -> Result<Self> {
        let mut words = [0; PACKET_HEADER_SIZE];
        for word in words.iter_mut() {
            *word = rdr
                .read_u32::<BigEndian>()
                .map_err(|_e| Error::Decoding { field: "header" })?;
        }
        Self::from_words(words)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut hdr = Vec::with_capacity(PACKET_HDR_LEN);
        for word in self.to_words() {
            hdr.write_u32::<BigEndian>(word).unwrap();
        }
        assert_eq!(hdr.len(), PACKET_HDR_LEN);
        hdr
    }

    #[must_use]
    #[inline]
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    #[must_use]
    #[inline]
    pub fn msg_num(&self) -> u32 {
        self.msg_num
    }

    #[must_use]
    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    #[must_use]
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn control_type(&self) -> Option<ControlType> {
        match self.kind {
            PacketKind::Control(ty) => Some(ty),
            PacketKind::Data { .. } => None,
        }
    }
}
