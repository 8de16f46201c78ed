//! IPv4 (RFC 791): header build/parse, checksum, next-hop routing.
//!
//! Fragments and options are not supported; packets carrying either are
//! dropped on receive and never generated on send.

use alloc::vec::Vec;

use palmyra_core::ktrace;

use crate::net::wire::{
    Ipv4Address, internet_checksum, read_be16, write_be16,
};

/// ICMP protocol number.
pub const PROTO_ICMP: u8 = 1;
/// TCP protocol number (recognized, not implemented).
pub const PROTO_TCP: u8 = 6;
/// UDP protocol number.
pub const PROTO_UDP: u8 = 17;

/// Header length without options.
pub const HEADER_LEN: usize = 20;
/// Default time-to-live on transmitted packets.
pub const DEFAULT_TTL: u8 = 64;

/// A validated incoming datagram; the payload borrows the input packet.
#[derive(Debug)]
pub struct Ipv4Datagram<'a> {
    /// Sender address.
    pub source: Ipv4Address,
    /// Destination address (ours or broadcast).
    pub destination: Ipv4Address,
    /// Transport protocol number.
    pub protocol: u8,
    /// Transport payload.
    pub payload: &'a [u8],
}

/// IPv4 endpoint state: addressing plus the outgoing identification counter.
pub struct Ipv4 {
    local_ip: Ipv4Address,
    netmask: Ipv4Address,
    gateway: Ipv4Address,
    next_id: u16,
}

impl Ipv4 {
    /// Creates the endpoint.
    #[must_use]
    pub fn new(local_ip: Ipv4Address, netmask: Ipv4Address, gateway: Ipv4Address) -> Self {
        Self {
            local_ip,
            netmask,
            gateway,
            next_id: 1,
        }
    }

    /// Our address.
    #[must_use]
    pub fn local_ip(&self) -> Ipv4Address {
        self.local_ip
    }

    /// The configured netmask.
    #[must_use]
    pub fn netmask(&self) -> Ipv4Address {
        self.netmask
    }

    /// The configured gateway.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Address {
        self.gateway
    }

    /// The address ARP must resolve to reach `destination`: the destination
    /// itself on the local subnet, the gateway otherwise.
    #[must_use]
    pub fn next_hop(&self, destination: Ipv4Address) -> Ipv4Address {
        if destination == Ipv4Address::BROADCAST
            || destination.same_subnet(self.local_ip, self.netmask)
        {
            destination
        } else {
            self.gateway
        }
    }

    /// Validates an incoming packet and extracts the transport payload.
    ///
    /// Checks: version 4, sane IHL/total length, TTL > 0, destination is us
    /// or broadcast. The header checksum is not re-verified here — ICMP and
    /// UDP carry their own end-to-end checksums.
    pub fn parse_incoming<'a>(&mut self, packet: &'a [u8]) -> Option<Ipv4Datagram<'a>> {
        if packet.len() < HEADER_LEN {
            return None;
        }

        let version = packet[0] >> 4;
        if version != 4 {
            return None;
        }
        let ihl = usize::from(packet[0] & 0x0F) * 4;
        let total_len = usize::from(read_be16(packet, 2));
        if ihl < HEADER_LEN || total_len < ihl || total_len > packet.len() {
            return None;
        }

        let ttl = packet[8];
        if ttl == 0 {
            return None;
        }

        let source = Ipv4Address([packet[12], packet[13], packet[14], packet[15]]);
        let destination = Ipv4Address([packet[16], packet[17], packet[18], packet[19]]);
        if destination != self.local_ip && destination != Ipv4Address::BROADCAST {
            ktrace!("ipv4: dropping packet for {}", destination);
            return None;
        }

        Some(Ipv4Datagram {
            source,
            destination,
            protocol: packet[9],
            payload: &packet[ihl..total_len],
        })
    }

    /// Builds a complete packet around `payload`.
    #[must_use]
    pub fn build_packet(
        &mut self,
        destination: Ipv4Address,
        protocol: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = HEADER_LEN + payload.len();
        let mut packet = Vec::with_capacity(total_len);
        packet.resize(HEADER_LEN, 0);

        packet[0] = 0x45; // version 4, IHL 5
        packet[1] = 0; // DSCP/ECN
        write_be16(&mut packet, 2, total_len as u16);
        write_be16(&mut packet, 4, self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        write_be16(&mut packet, 6, 0); // flags + fragment offset
        packet[8] = DEFAULT_TTL;
        packet[9] = protocol;
        // Checksum filled below.
        packet[12..16].copy_from_slice(&self.local_ip.0);
        packet[16..20].copy_from_slice(&destination.0);

        let checksum = internet_checksum(&packet[..HEADER_LEN], 0);
        write_be16(&mut packet, 10, checksum);

        packet.extend_from_slice(payload);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Ipv4 {
        Ipv4::new(
            Ipv4Address::new(192, 168, 1, 10),
            Ipv4Address::new(255, 255, 255, 0),
            Ipv4Address::new(192, 168, 1, 1),
        )
    }

    #[test]
    fn built_packet_checksum_verifies() {
        let mut ip = endpoint();
        let packet = ip.build_packet(Ipv4Address::new(8, 8, 8, 8), PROTO_UDP, b"hi");
        assert_eq!(internet_checksum(&packet[..HEADER_LEN], 0), 0);
        assert_eq!(packet[8], DEFAULT_TTL);
        assert_eq!(packet[9], PROTO_UDP);
        assert_eq!(&packet[HEADER_LEN..], b"hi");
    }

    #[test]
    fn identification_increments() {
        let mut ip = endpoint();
        let p1 = ip.build_packet(Ipv4Address::new(8, 8, 8, 8), PROTO_UDP, &[]);
        let p2 = ip.build_packet(Ipv4Address::new(8, 8, 8, 8), PROTO_UDP, &[]);
        assert_ne!(read_be16(&p1, 4), read_be16(&p2, 4));
    }

    #[test]
    fn receive_accepts_only_us() {
        let mut ip = endpoint();
        let mut other = Ipv4::new(
            Ipv4Address::new(192, 168, 1, 99),
            Ipv4Address::new(255, 255, 255, 0),
            Ipv4Address::new(192, 168, 1, 1),
        );
        let packet = other.build_packet(Ipv4Address::new(192, 168, 1, 10), PROTO_ICMP, b"x");

        let datagram = ip.parse_incoming(&packet).unwrap();
        assert_eq!(datagram.source, Ipv4Address::new(192, 168, 1, 99));
        assert_eq!(datagram.protocol, PROTO_ICMP);
        assert_eq!(datagram.payload, b"x");

        // The same packet aimed elsewhere is dropped.
        let stray = other.build_packet(Ipv4Address::new(192, 168, 1, 50), PROTO_ICMP, b"x");
        assert!(ip.parse_incoming(&stray).is_none());
    }

    #[test]
    fn zero_ttl_dropped() {
        let mut ip = endpoint();
        let mut packet =
            endpoint().build_packet(Ipv4Address::new(192, 168, 1, 10), PROTO_UDP, &[]);
        packet[8] = 0;
        assert!(ip.parse_incoming(&packet).is_none());
    }

    #[test]
    fn truncated_dropped() {
        let mut ip = endpoint();
        let packet = endpoint().build_packet(Ipv4Address::new(192, 168, 1, 10), PROTO_UDP, b"abc");
        assert!(ip.parse_incoming(&packet[..HEADER_LEN + 1]).is_none());
    }

    #[test]
    fn next_hop_routing() {
        let ip = endpoint();
        // On-link: resolve the destination itself.
        assert_eq!(
            ip.next_hop(Ipv4Address::new(192, 168, 1, 77)),
            Ipv4Address::new(192, 168, 1, 77)
        );
        // Off-link: resolve the gateway.
        assert_eq!(
            ip.next_hop(Ipv4Address::new(8, 8, 8, 8)),
            Ipv4Address::new(192, 168, 1, 1)
        );
        // Broadcast stays broadcast.
        assert_eq!(ip.next_hop(Ipv4Address::BROADCAST), Ipv4Address::BROADCAST);
    }
}
