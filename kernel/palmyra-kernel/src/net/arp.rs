//! Address Resolution Protocol (RFC 826).
//!
//! A 32-entry IP→MAC cache plus the request/reply machinery. Every received
//! ARP packet updates the cache with the sender's binding; requests aimed at
//! our IP are answered with a unicast reply. Cache entries carry a timestamp
//! from the global clock: once the HPET is installed, entries expire after
//! [`CACHE_TIMEOUT_SECONDS`]; under the boot-time null clock every timestamp
//! is zero and entries are permanent.

use palmyra_core::{clock, kdebug, ktrace};

use crate::net::device::NetworkDevice;
use crate::net::ethernet;
use crate::net::wire::{EtherType, Ipv4Address, MacAddress, read_be16, write_be16};

/// Maximum cache entries.
pub const CACHE_SIZE: usize = 32;
/// Cache entry validity period (once a clock is installed).
pub const CACHE_TIMEOUT_SECONDS: u64 = 300;
/// Wait per request before retrying.
pub const REQUEST_TIMEOUT_MS: u64 = 3_000;
/// Request retries before giving up.
pub const MAX_RETRIES: u32 = 3;
/// Poll iterations per request when no clock is installed.
pub const POLL_BUDGET: u32 = 10_000;

/// ARP operation: request.
pub const OPERATION_REQUEST: u16 = 1;
/// ARP operation: reply.
pub const OPERATION_REPLY: u16 = 2;

/// Wire size of an Ethernet/IPv4 ARP packet.
pub const PACKET_LEN: usize = 28;

/// One cache slot.
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    ip: Ipv4Address,
    mac: MacAddress,
    /// Insertion time in milliseconds (0 under the null clock).
    timestamp_ms: u64,
    valid: bool,
}

impl CacheEntry {
    const EMPTY: Self = Self {
        ip: Ipv4Address::UNSPECIFIED,
        mac: MacAddress::ZERO,
        timestamp_ms: 0,
        valid: false,
    };

    fn expired(&self, now_ms: u64) -> bool {
        // Expiry is only meaningful when time actually advances.
        clock::clock_installed()
            && now_ms.saturating_sub(self.timestamp_ms) > CACHE_TIMEOUT_SECONDS * 1_000
    }
}

/// ARP resolver state.
pub struct Arp {
    local_ip: Ipv4Address,
    local_mac: MacAddress,
    cache: [CacheEntry; CACHE_SIZE],
}

impl Arp {
    /// Creates the resolver for the given local binding.
    #[must_use]
    pub fn new(local_ip: Ipv4Address, local_mac: MacAddress) -> Self {
        Self {
            local_ip,
            local_mac,
            cache: [CacheEntry::EMPTY; CACHE_SIZE],
        }
    }

    /// Our IPv4 address.
    #[must_use]
    pub fn local_ip(&self) -> Ipv4Address {
        self.local_ip
    }

    /// Our MAC address.
    #[must_use]
    pub fn local_mac(&self) -> MacAddress {
        self.local_mac
    }

    /// Looks up an unexpired cache entry.
    #[must_use]
    pub fn lookup(&self, ip: Ipv4Address) -> Option<MacAddress> {
        let now = clock::monotonic_millis();
        self.cache
            .iter()
            .find(|e| e.valid && e.ip == ip && !e.expired(now))
            .map(|e| e.mac)
    }

    /// Inserts or refreshes a binding.
    ///
    /// An existing entry for the same IP is overwritten; otherwise the first
    /// free slot is used; when the cache is full, the oldest entry is
    /// evicted.
    pub fn insert(&mut self, ip: Ipv4Address, mac: MacAddress) {
        let now = clock::monotonic_millis();
        let entry = CacheEntry {
            ip,
            mac,
            timestamp_ms: now,
            valid: true,
        };

        if let Some(slot) = self.cache.iter_mut().find(|e| e.valid && e.ip == ip) {
            *slot = entry;
            return;
        }
        if let Some(slot) = self.cache.iter_mut().find(|e| !e.valid) {
            *slot = entry;
            return;
        }
        // Full: evict the oldest binding.
        if let Some(slot) = self
            .cache
            .iter_mut()
            .min_by_key(|e| e.timestamp_ms)
        {
            *slot = entry;
        }
    }

    /// Number of valid entries.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.iter().filter(|e| e.valid).count()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.cache = [CacheEntry::EMPTY; CACHE_SIZE];
    }
}

/// A decoded ARP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    /// Operation: request or reply.
    pub operation: u16,
    /// Sender hardware address.
    pub sender_mac: MacAddress,
    /// Sender protocol address.
    pub sender_ip: Ipv4Address,
    /// Target hardware address.
    pub target_mac: MacAddress,
    /// Target protocol address.
    pub target_ip: Ipv4Address,
}

/// Parses an ARP payload; `None` unless it is Ethernet/IPv4 ARP.
#[must_use]
pub fn parse_packet(bytes: &[u8]) -> Option<ArpPacket> {
    if bytes.len() < PACKET_LEN {
        return None;
    }
    // Hardware type 1 (Ethernet), protocol 0x0800, sizes 6 and 4.
    if read_be16(bytes, 0) != 1
        || read_be16(bytes, 2) != 0x0800
        || bytes[4] != 6
        || bytes[5] != 4
    {
        return None;
    }

    let mut sender_mac = [0u8; 6];
    sender_mac.copy_from_slice(&bytes[8..14]);
    let mut sender_ip = [0u8; 4];
    sender_ip.copy_from_slice(&bytes[14..18]);
    let mut target_mac = [0u8; 6];
    target_mac.copy_from_slice(&bytes[18..24]);
    let mut target_ip = [0u8; 4];
    target_ip.copy_from_slice(&bytes[24..28]);

    Some(ArpPacket {
        operation: read_be16(bytes, 6),
        sender_mac: MacAddress(sender_mac),
        sender_ip: Ipv4Address(sender_ip),
        target_mac: MacAddress(target_mac),
        target_ip: Ipv4Address(target_ip),
    })
}

/// Serializes an ARP packet.
#[must_use]
pub fn build_packet(packet: &ArpPacket) -> [u8; PACKET_LEN] {
    let mut bytes = [0u8; PACKET_LEN];
    write_be16(&mut bytes, 0, 1);
    write_be16(&mut bytes, 2, 0x0800);
    bytes[4] = 6;
    bytes[5] = 4;
    write_be16(&mut bytes, 6, packet.operation);
    bytes[8..14].copy_from_slice(&packet.sender_mac.0);
    bytes[14..18].copy_from_slice(&packet.sender_ip.0);
    bytes[18..24].copy_from_slice(&packet.target_mac.0);
    bytes[24..28].copy_from_slice(&packet.target_ip.0);
    bytes
}

/// Broadcasts a who-has request for `target_ip`.
pub fn send_request(arp: &Arp, device: &mut (impl NetworkDevice + ?Sized), target_ip: Ipv4Address) {
    let packet = build_packet(&ArpPacket {
        operation: OPERATION_REQUEST,
        sender_mac: arp.local_mac,
        sender_ip: arp.local_ip,
        target_mac: MacAddress::ZERO,
        target_ip,
    });
    let frame = ethernet::build_frame(
        MacAddress::BROADCAST,
        arp.local_mac,
        EtherType::Arp,
        &packet,
    );
    ktrace!("arp: who-has {}", target_ip);
    let _ = device.send_frame(&frame);
}

/// Handles a received ARP payload: learns the sender's binding and answers
/// requests aimed at our IP with a unicast reply.
pub fn handle_packet(
    arp: &mut Arp,
    device: &mut (impl NetworkDevice + ?Sized),
    payload: &[u8],
) {
    let Some(packet) = parse_packet(payload) else {
        return;
    };

    // Requests and replies both reveal the sender's binding.
    arp.insert(packet.sender_ip, packet.sender_mac);

    if packet.operation == OPERATION_REQUEST && packet.target_ip == arp.local_ip {
        kdebug!("arp: answering who-has {} from {}", packet.target_ip, packet.sender_ip);
        let reply = build_packet(&ArpPacket {
            operation: OPERATION_REPLY,
            sender_mac: arp.local_mac,
            sender_ip: arp.local_ip,
            target_mac: packet.sender_mac,
            target_ip: packet.sender_ip,
        });
        let frame = ethernet::build_frame(
            packet.sender_mac,
            arp.local_mac,
            EtherType::Arp,
            &reply,
        );
        let _ = device.send_frame(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testutil::MockDevice;

    fn test_arp() -> Arp {
        Arp::new(
            Ipv4Address::new(192, 168, 1, 10),
            MacAddress([0x02, 0, 0, 0, 0, 1]),
        )
    }

    #[test]
    fn packet_round_trip() {
        let packet = ArpPacket {
            operation: OPERATION_REPLY,
            sender_mac: MacAddress([1, 2, 3, 4, 5, 6]),
            sender_ip: Ipv4Address::new(10, 0, 0, 1),
            target_mac: MacAddress([7, 8, 9, 10, 11, 12]),
            target_ip: Ipv4Address::new(10, 0, 0, 2),
        };
        assert_eq!(parse_packet(&build_packet(&packet)), Some(packet));
    }

    #[test]
    fn malformed_rejected() {
        let mut bytes = build_packet(&ArpPacket {
            operation: OPERATION_REQUEST,
            sender_mac: MacAddress::ZERO,
            sender_ip: Ipv4Address::UNSPECIFIED,
            target_mac: MacAddress::ZERO,
            target_ip: Ipv4Address::UNSPECIFIED,
        });
        bytes[4] = 8; // wrong hardware size
        assert!(parse_packet(&bytes).is_none());
        assert!(parse_packet(&bytes[..20]).is_none());
    }

    #[test]
    fn insert_is_idempotent() {
        let mut arp = test_arp();
        let ip = Ipv4Address::new(192, 168, 1, 1);
        arp.insert(ip, MacAddress([1; 6]));
        arp.insert(ip, MacAddress([2; 6]));
        assert_eq!(arp.cache_len(), 1);
        assert_eq!(arp.lookup(ip), Some(MacAddress([2; 6])));
    }

    #[test]
    fn full_cache_evicts_rather_than_rejects() {
        let mut arp = test_arp();
        for i in 0..CACHE_SIZE as u8 {
            arp.insert(Ipv4Address::new(10, 0, 0, i), MacAddress([i; 6]));
        }
        assert_eq!(arp.cache_len(), CACHE_SIZE);
        let newcomer = Ipv4Address::new(10, 0, 1, 1);
        arp.insert(newcomer, MacAddress([0xEE; 6]));
        assert_eq!(arp.cache_len(), CACHE_SIZE);
        assert_eq!(arp.lookup(newcomer), Some(MacAddress([0xEE; 6])));
    }

    #[test]
    fn request_for_our_ip_gets_unicast_reply() {
        let mut arp = test_arp();
        let mut device = MockDevice::new([0x02, 0, 0, 0, 0, 1]);

        let request = build_packet(&ArpPacket {
            operation: OPERATION_REQUEST,
            sender_mac: MacAddress([0xAA; 6]),
            sender_ip: Ipv4Address::new(192, 168, 1, 1),
            target_mac: MacAddress::ZERO,
            target_ip: Ipv4Address::new(192, 168, 1, 10),
        });
        handle_packet(&mut arp, &mut device, &request);

        // The sender was learned.
        assert_eq!(
            arp.lookup(Ipv4Address::new(192, 168, 1, 1)),
            Some(MacAddress([0xAA; 6]))
        );

        // A unicast reply went out.
        assert_eq!(device.sent.len(), 1);
        let frame = crate::net::ethernet::parse_frame(&device.sent[0]).unwrap();
        assert_eq!(frame.destination, MacAddress([0xAA; 6]));
        let reply = parse_packet(frame.payload).unwrap();
        assert_eq!(reply.operation, OPERATION_REPLY);
        assert_eq!(reply.sender_ip, Ipv4Address::new(192, 168, 1, 10));
    }

    #[test]
    fn request_for_other_ip_not_answered() {
        let mut arp = test_arp();
        let mut device = MockDevice::new([0x02, 0, 0, 0, 0, 1]);

        let request = build_packet(&ArpPacket {
            operation: OPERATION_REQUEST,
            sender_mac: MacAddress([0xAA; 6]),
            sender_ip: Ipv4Address::new(192, 168, 1, 1),
            target_mac: MacAddress::ZERO,
            target_ip: Ipv4Address::new(192, 168, 1, 99),
        });
        handle_packet(&mut arp, &mut device, &request);
        assert!(device.sent.is_empty());
    }
}
