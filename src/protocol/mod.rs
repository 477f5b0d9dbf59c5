//! # Packet header
//!
//! ```text
//! 0 1               16              32 (BIT)
//! +-+---------------+---------------+
//! |C|    subtype    |    length     |  word 0
//! +-+-+-------------+---------------+
//! |F|L|        message number       |  word 1
//! +-+-+-----------------------------+
//! |           timestamp             |  word 2
//! +---------------------------------+
//! |         connection id           |  word 3
//! +---------------------------------+
//! |                                 |
//! |     payload (PACKET_DATA_SIZE)  |
//! |                                 |
//! +---------------------------------+
//! ```
//!
//! - `C`: control flag; `subtype` is only meaningful when set
//! - `length`: meaningful payload bytes of a data packet
//! - `F`/`L`: fragment role of a data packet (`F|L` = solo)
//! - `message number`: fragment number of a data packet, acked number of an `ACK`
//!
//! # Invariants
//!
//! - every datagram is exactly `PACKET_LEN` bytes
//! - `length` never exceeds `PACKET_DATA_SIZE`

pub mod ctl_message;
pub mod handshake;
pub mod packet;
pub mod packet_hdr;

/// Header size in 32-bit words.
pub const PACKET_HEADER_SIZE: usize = 4;
pub const PACKET_HDR_LEN: usize = PACKET_HEADER_SIZE * 4;
pub const PACKET_DATA_SIZE: usize = 1024;
pub const PACKET_LEN: usize = PACKET_HDR_LEN + PACKET_DATA_SIZE;

pub const UDT_VERSION: u32 = 4;
