//! Wire format for bounce datagrams.
//!
//! Every datagram carries the server key in its first eight bytes,
//! little-endian, followed by random filler up to the requested size:
//!
//! ```text
//! 0        8                                  len
//! +--------+-----------------------------------+
//! |  key   |  filler (never inspected)         |
//! +--------+-----------------------------------+
//! ```
//!
//! Sizes handed to [`build`] are IP packet sizes. The IP and UDP headers
//! (28 bytes) are subtracted to get the datagram length, so the smallest
//! packet carries only the key.

use bytes::{Bytes, BytesMut};
use rand::Rng;

/// Width of the key header in bytes.
pub const KEY_LEN: usize = 8;

/// IPv4 (20) + UDP (8) header bytes that the kernel adds to every datagram.
pub const HEADER_OVERHEAD: usize = 28;

/// Smallest packet that can carry the key header.
pub const MIN_PACKET_SIZE: usize = HEADER_OVERHEAD + KEY_LEN;

/// Largest IP packet.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Largest datagram the bouncer will ever have to read.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Clamp a requested packet size into the supported range.
pub fn clamp_packet_size(packet_size: usize) -> usize {
    packet_size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE)
}

/// Datagram length for a packet size, after clamping.
pub fn datagram_len(packet_size: usize) -> usize {
    clamp_packet_size(packet_size) - HEADER_OVERHEAD
}

/// Build a datagram for `packet_size` carrying `key`.
///
/// The filler is drawn once; callers reuse the returned buffer for every
/// send.
pub fn build(packet_size: usize, key: i64) -> Bytes {
    let mut buf = BytesMut::zeroed(datagram_len(packet_size));
    rand::thread_rng().fill(&mut buf[..]);
    buf[..KEY_LEN].copy_from_slice(&key.to_le_bytes());
    buf.freeze()
}

/// Read the key header, or `None` if the datagram is too short to have one.
pub fn read_key(datagram: &[u8]) -> Option<i64> {
    let header: [u8; KEY_LEN] = datagram.get(..KEY_LEN)?.try_into().ok()?;
    Some(i64::from_le_bytes(header))
}

/// Check whether `datagram` is authorized by `expected`.
pub fn validate(datagram: &[u8], expected: i64) -> bool {
    read_key(datagram) == Some(expected)
}
