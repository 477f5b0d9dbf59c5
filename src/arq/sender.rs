use crate::{
    error::{Error, Result},
    protocol::{packet::Packet, packet_hdr::FragmentRole, PACKET_DATA_SIZE},
};

const MAX_FRAGMENTS: usize = 0x3fff_ffff;

/// Number of fragments `len` bytes are split into.
#[must_use]
pub fn fragment_count(len: usize) -> usize {
    if len <= PACKET_DATA_SIZE {
        1
    } else {
        (len + PACKET_DATA_SIZE - 1) / PACKET_DATA_SIZE
    }
}

/// Splits `msg` into data packets numbered from 1.
pub fn fragment(msg: &[u8], timestamp: u32, id: u32) -> Result<Vec<Packet>> {
    let n = fragment_count(msg.len());
    if n > MAX_FRAGMENTS {
        return Err(Error::InvalidInput("message too large"));
    }
    if n == 1 {
        let packet = Packet::data(FragmentRole::Solo, 1, timestamp, id, msg)?;
        return Ok(vec![packet]);
    }

    let mut packets = Vec::with_capacity(n);
    for (i, chunk) in msg.chunks(PACKET_DATA_SIZE).enumerate() {
        let role = match i {
            0 => FragmentRole::First,
            i if i == n - 1 => FragmentRole::Last,
            _ => FragmentRole::Middle,
        };
        let packet = Packet::data(role, i as u32 + 1, timestamp, id, chunk)?;
        packets.push(packet);
    }
    assert_eq!(packets.len(), n);
    Ok(packets)
}
