//! # Control message
//!
//! ```text
//! 0               8               16        (BYTE)
//! +---------------+---------------+
//! |     type      |    length     |
//! +---------------+---------------+-------+
//! |      spare fields (32 x u32)          |
//! +---------------------------------------+
//! |      spare buffer 1 (256)             |
//! +---------------------------------------+
//! |      spare buffer 2 (256)             |
//! +---------------------------------------+
//! ```
//!
//! Every integer is big-endian, on every path.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{Error, Result};

pub const SPARE_FIELDS: usize = 32;
pub const SPARE_BUFFER_LEN: usize = 256;
pub const CTL_MESSAGE_LEN: usize = 8 + 8 + SPARE_FIELDS * 4 + SPARE_BUFFER_LEN * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum MessageType {
    MsgHeader = 1,
    BufHeader = 2,
    FileHeader = 3,
    Shutdown = 4,
    Broadcast = 5,
    ShellRequest = 6,
    UsersListRequest = 7,
    EncryptionPgNum = 8,
    EncryptionPubkey = 9,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    msg_type: u64,
    length: u64,
    spare_fields: [u32; SPARE_FIELDS],
    spare_buffer1: [u8; SPARE_BUFFER_LEN],
    spare_buffer2: [u8; SPARE_BUFFER_LEN],
}

pub struct ControlMessageBuilder<'a> {
    pub msg_type: MessageType,
    pub length: u64,
    pub spare_fields: &'a [u32],
    pub spare_buffer1: &'a [u8],
    pub spare_buffer2: &'a [u8],
}

impl<'a> ControlMessageBuilder<'a> {
    pub fn new(msg_type: MessageType, length: u64) -> Self {
        ControlMessageBuilder {
            msg_type,
            length,
            spare_fields: &[],
            spare_buffer1: &[],
            spare_buffer2: &[],
        }
    }

    pub fn build(self) -> Result<ControlMessage> {
        if self.spare_fields.len() > SPARE_FIELDS {
            return Err(Error::InvalidInput("too many spare fields"));
        }
        if self.spare_buffer1.len() > SPARE_BUFFER_LEN
            || self.spare_buffer2.len() > SPARE_BUFFER_LEN
        {
            return Err(Error::InvalidInput("spare buffer too long"));
        }
        let mut this = ControlMessage {
            msg_type: self.msg_type.into(),
            length: self.length,
            spare_fields: [0; SPARE_FIELDS],
            spare_buffer1: [0; SPARE_BUFFER_LEN],
            spare_buffer2: [0; SPARE_BUFFER_LEN],
        };
        this.spare_fields[..self.spare_fields.len()].copy_from_slice(self.spare_fields);
        this.spare_buffer1[..self.spare_buffer1.len()].copy_from_slice(self.spare_buffer1);
        this.spare_buffer2[..self.spare_buffer2.len()].copy_from_slice(self.spare_buffer2);
        Ok(this)
    }
}

impl ControlMessage {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CTL_MESSAGE_LEN);
        buf.write_u64::<BigEndian>(self.msg_type).unwrap();
        buf.write_u64::<BigEndian>(self.length).unwrap();
        for field in self.spare_fields {
            buf.write_u32::<BigEndian>(field).unwrap();
        }
        buf.extend_from_slice(&self.spare_buffer1);
        buf.extend_from_slice(&self.spare_buffer2);
        assert_eq!(buf.len(), CTL_MESSAGE_LEN);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != CTL_MESSAGE_LEN {
            return Err(Error::Decoding { field: "control message length" });
        }
        let mut rdr = Cursor::new(buf);
        let msg_type = rdr
            .read_u64::<BigEndian>()
            .map_err(|_e| Error::Decoding { field: "type" })?;
        let length = rdr
            .read_u64::<BigEndian>()
            .map_err(|_e| Error::Decoding { field: "length" })?;
        let mut spare_fields = [0; SPARE_FIELDS];
        rdr.read_u32_into::<BigEndian>(&mut spare_fields)
            .map_err(|_e| Error::Decoding { field: "spare fields" })?;
        let start = rdr.position() as usize;
        let mut spare_buffer1 = [0; SPARE_BUFFER_LEN];
        let mut spare_buffer2 = [0; SPARE_BUFFER_LEN];
        spare_buffer1.copy_from_slice(&buf[start..start + SPARE_BUFFER_LEN]);
        spare_buffer2.copy_from_slice(&buf[start + SPARE_BUFFER_LEN..]);
        Ok(ControlMessage {
            msg_type,
            length,
            spare_fields,
            spare_buffer1,
            spare_buffer2,
        })
    }

    pub fn msg_type(&self) -> Result<MessageType> {
        MessageType::try_from(self.msg_type)
            .map_err(|_e| Error::Decoding { field: "type" })
    }

    #[must_use]
    #[inline]
    pub fn raw_type(&self) -> u64 {
        self.msg_type
    }

    #[must_use]
    #[inline]
    pub fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    #[inline]
    pub fn spare_fields(&self) -> &[u32; SPARE_FIELDS] {
        &self.spare_fields
    }

    #[must_use]
    #[inline]
    pub fn spare_buffer1(&self) -> &[u8; SPARE_BUFFER_LEN] {
        &self.spare_buffer1
    }

    #[must_use]
    #[inline]
    pub fn spare_buffer2(&self) -> &[u8; SPARE_BUFFER_LEN] {
        &self.spare_buffer2
    }

    /// `spare_buffer1` up to the first NUL.
    #[must_use]
    pub fn spare_str1(&self) -> String {
        nul_terminated(&self.spare_buffer1)
    }

    /// `spare_buffer2` up to the first NUL.
    #[must_use]
    pub fn spare_str2(&self) -> String {
        nul_terminated(&self.spare_buffer2)
    }
}

fn nul_terminated(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
