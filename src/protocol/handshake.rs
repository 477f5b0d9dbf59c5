use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub const HANDSHAKE_WORDS: usize = 8;
pub const HANDSHAKE_LEN: usize = HANDSHAKE_WORDS * 4;
pub const DEFAULT_FLIGHT_WINDOW: u32 = 10;
pub const REQUEST_CONNECT: u32 = 0;

/// Connection parameters carried in the payload of a `HANDSHAKE` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub version: u32,
    pub transport_kind: u32,
    pub nonce: u32,
    pub max_packet_size: u32,
    pub flight_window: u32,
    pub request_type: u32,
    pub connection_id: u32,
    /// Reserved for anti-spoofing.
    pub cookie: u32,
}

impl HandshakeInfo {
    #[must_use]
    fn to_words(&self) -> [u32; HANDSHAKE_WORDS] {
        [
            self.version,
            self.transport_kind,
            self.nonce,
            self.max_packet_size,
            self.flight_window,
            self.request_type,
            self.connection_id,
            self.cookie,
        ]
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);
        for word in self.to_words() {
            buf.write_u32::<BigEndian>(word).unwrap();
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut rdr = Cursor::new(buf);
        let mut words = [0; HANDSHAKE_WORDS];
        for word in words.iter_mut() {
            *word = rdr
                .read_u32::<BigEndian>()
                .map_err(|_e| Error::Decoding { field: "handshake" })?;
        }
        Ok(HandshakeInfo {
            version: words[0],
            transport_kind: words[1],
            nonce: words[2],
            max_packet_size: words[3],
            flight_window: words[4],
            request_type: words[5],
            connection_id: words[6],
            cookie: words[7],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_order() {
        let info = HandshakeInfo {
            version: 4,
            transport_kind: 2,
            nonce: 0x0012_3123,
            max_packet_size: 1024,
            flight_window: 10,
            request_type: 0,
            connection_id: 10,
            cookie: 10,
        };
        let bytes = info.to_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 4]);
        assert_eq!(&bytes[8..12], &[0x00, 0x12, 0x31, 0x23]);
        assert_eq!(HandshakeInfo::from_bytes(&bytes).unwrap(), info);
    }

    #[test]
    fn short_payload() {
        assert!(HandshakeInfo::from_bytes(&[0; HANDSHAKE_LEN - 1]).is_err());
    }
}
