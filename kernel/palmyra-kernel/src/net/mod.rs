//! Network stack: Ethernet framing, ARP, IPv4, ICMP, UDP, DNS, sockets.
//!
//! [`NetStack`] composes one [`NetworkDevice`](device::NetworkDevice) with
//! the protocol state (ARP cache, IPv4 configuration, UDP port table, ICMP
//! registry, DNS cache). Inbound frames flow `poll` → Ethernet dispatch →
//! ARP / IPv4 → ICMP / UDP → socket queues; outbound datagrams flow the
//! same path in reverse, resolving next-hop MACs through ARP.

pub mod arp;
pub mod device;
pub mod dns;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod socket;
pub mod udp;
pub mod wire;

use alloc::boxed::Box;
use alloc::vec::Vec;

use palmyra_core::sync::SpinLock;

pub use device::{NetError, NetworkDevice};
pub use wire::{EtherType, Ipv4Address, MacAddress};

/// The assembled network stack.
pub struct NetStack {
    /// The NIC.
    pub device: Box<dyn NetworkDevice + Send>,
    /// ARP resolver state.
    pub arp: arp::Arp,
    /// IPv4 configuration and counters.
    pub ipv4: ipv4::Ipv4,
    /// UDP port bindings.
    pub udp: udp::Udp,
    /// ICMP echo state and raw-socket registry.
    pub icmp: icmp::Icmp,
    /// DNS resolver cache.
    pub dns: dns::Dns,
}

impl NetStack {
    /// Builds a stack over `device` with the given IPv4 configuration.
    pub fn new(
        device: Box<dyn NetworkDevice + Send>,
        local_ip: Ipv4Address,
        netmask: Ipv4Address,
        gateway: Ipv4Address,
    ) -> Self {
        let mac = device.mac_address();
        Self {
            device,
            arp: arp::Arp::new(local_ip, mac),
            ipv4: ipv4::Ipv4::new(local_ip, netmask, gateway),
            udp: udp::Udp::new(),
            icmp: icmp::Icmp::new(),
            dns: dns::Dns::new(),
        }
    }

    /// Drains received frames from the NIC and dispatches them by EtherType.
    ///
    /// Called from the NIC interrupt tail and from polling loops (ARP
    /// resolve, ICMP ping). Frames are delivered to the protocol handlers in
    /// arrival order.
    pub fn poll(&mut self) {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        self.device.poll_frames(&mut |frame| frames.push(frame.to_vec()));
        for frame in frames {
            self.handle_frame(&frame);
        }
    }

    /// Dispatches one received Ethernet frame.
    pub fn handle_frame(&mut self, frame: &[u8]) {
        let Some(parsed) = ethernet::parse_frame(frame) else {
            return;
        };
        match parsed.ether_type {
            EtherType::Arp => {
                arp::handle_packet(&mut self.arp, self.device.as_mut(), parsed.payload);
            }
            EtherType::Ipv4 => self.handle_ipv4(parsed.payload),
            // Recognized but not processed.
            EtherType::Ipv6 | EtherType::Unknown(_) => {}
        }
    }

    fn handle_ipv4(&mut self, packet: &[u8]) {
        let Some(datagram) = self.ipv4.parse_incoming(packet) else {
            return;
        };
        match datagram.protocol {
            ipv4::PROTO_ICMP => {
                icmp::handle_packet(self, datagram.source, datagram.payload);
            }
            ipv4::PROTO_UDP => {
                udp::handle_packet(&mut self.udp, datagram.source, datagram.payload);
            }
            // TCP and the rest are not implemented.
            _ => {}
        }
    }

    /// Resolves the MAC address for `ip`.
    ///
    /// Cache hit returns immediately. Otherwise a request is broadcast and
    /// the NIC is polled (full protocol dispatch, so unrelated traffic is
    /// not dropped while waiting) for up to ~3 s, retrying up to 3 times.
    /// Broadcast resolves to the broadcast MAC without any traffic.
    pub fn resolve_mac(&mut self, ip: Ipv4Address) -> Option<MacAddress> {
        if ip == Ipv4Address::BROADCAST {
            return Some(MacAddress::BROADCAST);
        }
        if let Some(mac) = self.arp.lookup(ip) {
            return Some(mac);
        }

        for _retry in 0..arp::MAX_RETRIES {
            arp::send_request(&self.arp, self.device.as_mut(), ip);

            let deadline =
                palmyra_core::clock::monotonic_millis() + arp::REQUEST_TIMEOUT_MS;
            let mut budget = arp::POLL_BUDGET;
            loop {
                self.poll();
                if let Some(mac) = self.arp.lookup(ip) {
                    return Some(mac);
                }
                if palmyra_core::clock::clock_installed() {
                    if palmyra_core::clock::monotonic_millis() > deadline {
                        break;
                    }
                } else {
                    budget -= 1;
                    if budget == 0 {
                        break;
                    }
                }
                palmyra_core::sched::yield_now();
            }
        }
        None
    }

    /// Sends an IPv4 payload, resolving the next-hop MAC through ARP.
    ///
    /// # Errors
    ///
    /// [`NetError::Unresolved`] when ARP cannot find the next hop,
    /// [`NetError::PacketTooLarge`] / device errors from transmission.
    pub fn send_ipv4(
        &mut self,
        destination: Ipv4Address,
        protocol: u8,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let next_hop = self.ipv4.next_hop(destination);
        let dest_mac = self.resolve_mac(next_hop).ok_or(NetError::Unresolved)?;

        let packet = self.ipv4.build_packet(destination, protocol, payload);
        let frame = ethernet::build_frame(
            dest_mac,
            self.device.mac_address(),
            EtherType::Ipv4,
            &packet,
        );
        self.device.send_frame(&frame)
    }

    /// ICMP echo to `target`; returns the round-trip time in milliseconds.
    ///
    /// # Errors
    ///
    /// [`NetError::Timeout`] after the 5 s deadline; send errors propagate.
    pub fn ping(&mut self, target: Ipv4Address) -> Result<u32, NetError> {
        icmp::ping(self, target)
    }
}

// ---------------------------------------------------------------------------
// Global stack
// ---------------------------------------------------------------------------

/// The system network stack, installed once the NIC is up.
static NET: SpinLock<Option<NetStack>> = SpinLock::new(None);

/// Installs the global network stack.
///
/// # Panics
///
/// Panics when called twice.
pub fn init(stack: NetStack) {
    let mut net = NET.lock();
    assert!(net.is_none(), "network stack already initialized");
    *net = Some(stack);
}

/// Executes a closure with the global network stack, when initialized.
pub fn with_stack<R>(f: impl FnOnce(&mut NetStack) -> R) -> Option<R> {
    let mut net = NET.lock();
    net.as_mut().map(f)
}

#[cfg(test)]
mod tests {
    use super::device::testutil::{MockDevice, SharedMockDevice};
    use super::*;

    #[test]
    fn stack_construction_uses_device_mac() {
        let device = MockDevice::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let stack = NetStack::new(
            Box::new(device),
            Ipv4Address::new(192, 168, 1, 10),
            Ipv4Address::new(255, 255, 255, 0),
            Ipv4Address::new(192, 168, 1, 1),
        );
        assert_eq!(
            stack.device.mac_address(),
            MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
        );
    }

    #[test]
    fn injected_arp_reply_resolves_without_a_request() {
        let our_mac = [0x02, 0, 0, 0, 0, 0x70];
        let device = SharedMockDevice::new(our_mac);
        let handle = device.clone();
        let mut stack = NetStack::new(
            Box::new(device),
            Ipv4Address::new(192, 168, 1, 10),
            Ipv4Address::new(255, 255, 255, 0),
            Ipv4Address::new(192, 168, 1, 1),
        );

        // A gratuitous reply from the gateway arrives before anyone asks.
        let reply = arp::build_packet(&arp::ArpPacket {
            operation: arp::OPERATION_REPLY,
            sender_mac: MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            sender_ip: Ipv4Address::new(192, 168, 1, 1),
            target_mac: MacAddress(our_mac),
            target_ip: Ipv4Address::new(192, 168, 1, 10),
        });
        handle.inject(ethernet::build_frame(
            MacAddress(our_mac),
            MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            EtherType::Arp,
            &reply,
        ));
        stack.poll();

        // Resolution hits the cache; nothing goes out on the wire.
        assert_eq!(
            stack.resolve_mac(Ipv4Address::new(192, 168, 1, 1)),
            Some(MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]))
        );
        assert!(handle.take_sent().is_empty());
    }

    #[test]
    fn unresolvable_next_hop_fails_send() {
        let device = SharedMockDevice::new([0x02, 0, 0, 0, 0, 0x71]);
        let handle = device.clone();
        let mut stack = NetStack::new(
            Box::new(device),
            Ipv4Address::new(192, 168, 1, 10),
            Ipv4Address::new(255, 255, 255, 0),
            Ipv4Address::new(192, 168, 1, 1),
        );

        // Nobody answers: off-subnet traffic cannot resolve the gateway.
        assert_eq!(
            stack.send_ipv4(Ipv4Address::new(8, 8, 8, 8), ipv4::PROTO_UDP, b"x"),
            Err(NetError::Unresolved)
        );
        // Three retries worth of broadcast who-has requests went out.
        let sent = handle.take_sent();
        assert_eq!(sent.len(), arp::MAX_RETRIES as usize);
        for frame in &sent {
            let parsed = ethernet::parse_frame(frame).unwrap();
            assert!(parsed.destination.is_broadcast());
            assert_eq!(parsed.ether_type, EtherType::Arp);
            let packet = arp::parse_packet(parsed.payload).unwrap();
            assert_eq!(packet.operation, arp::OPERATION_REQUEST);
            assert_eq!(packet.target_ip, Ipv4Address::new(192, 168, 1, 1));
        }
    }
}
