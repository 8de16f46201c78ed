//! Ethernet II framing.

use alloc::vec::Vec;

use crate::net::wire::{EtherType, MacAddress, read_be16, write_be16};

/// Ethernet header length: two MACs and the EtherType.
pub const HEADER_LEN: usize = 14;
/// Minimum frame length on the wire (without FCS); shorter frames are padded
/// by the NIC driver.
pub const MIN_FRAME_LEN: usize = 60;
/// Maximum payload carried in one frame.
pub const MAX_PAYLOAD: usize = 1500;

/// A parsed frame; the payload borrows the input buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    /// Destination MAC.
    pub destination: MacAddress,
    /// Source MAC.
    pub source: MacAddress,
    /// Payload type.
    pub ether_type: EtherType,
    /// The payload bytes.
    pub payload: &'a [u8],
}

/// Parses an Ethernet II frame. Returns `None` for runts.
#[must_use]
pub fn parse_frame(bytes: &[u8]) -> Option<Frame<'_>> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let mut destination = [0u8; 6];
    destination.copy_from_slice(&bytes[0..6]);
    let mut source = [0u8; 6];
    source.copy_from_slice(&bytes[6..12]);

    Some(Frame {
        destination: MacAddress(destination),
        source: MacAddress(source),
        ether_type: EtherType::from_wire(read_be16(bytes, 12)),
        payload: &bytes[HEADER_LEN..],
    })
}

/// Builds an Ethernet II frame around `payload`.
#[must_use]
pub fn build_frame(
    destination: MacAddress,
    source: MacAddress,
    ether_type: EtherType,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&destination.0);
    frame.extend_from_slice(&source.0);
    let mut ty = [0u8; 2];
    write_be16(&mut ty, 0, ether_type.to_wire());
    frame.extend_from_slice(&ty);
    frame.extend_from_slice(payload);
    frame
}
