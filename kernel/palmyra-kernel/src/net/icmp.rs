//! ICMP Echo (RFC 792, types 8 and 0).
//!
//! Inbound echo requests are answered immediately with the same identifier,
//! sequence number, and data. `ping` sends a request and polls the stack
//! until the matching reply arrives or the 5 s deadline passes. Every
//! inbound ICMP message is also fanned out to the registered raw sockets
//! (Linux `SOCK_RAW`/`IPPROTO_ICMP` semantics: ports do not exist, everyone
//! registered sees everything).

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use palmyra_core::sync::SpinLock;
use palmyra_core::{clock, kdebug, sched};

use crate::net::device::NetError;
use crate::net::ipv4::PROTO_ICMP;
use crate::net::wire::{Ipv4Address, internet_checksum, read_be16, write_be16};

/// Echo request type.
pub const TYPE_ECHO_REQUEST: u8 = 8;
/// Echo reply type.
pub const TYPE_ECHO_REPLY: u8 = 0;

/// Echo header length (type, code, checksum, identifier, sequence).
pub const ECHO_HEADER_LEN: usize = 8;

/// Ping deadline.
pub const PING_TIMEOUT_MS: u64 = 5_000;
/// Poll iterations when no clock is installed.
const PING_POLL_BUDGET: u32 = 20_000;

/// Maximum number of registered raw ICMP sockets.
pub const RAW_SOCKET_CAPACITY: usize = 16;

/// Receive queue shared between the ICMP layer and a raw socket: the source
/// address and the complete ICMP message.
pub type RawQueue = Arc<SpinLock<VecDeque<(Ipv4Address, Vec<u8>)>>>;

/// An echo transaction in flight.
#[derive(Debug, Clone, Copy)]
struct PendingEcho {
    ident: u16,
    sequence: u16,
    target: Ipv4Address,
    sent_at_ms: u64,
    /// Round-trip time, set when the matching reply arrives.
    rtt_ms: Option<u64>,
}

/// ICMP layer state.
pub struct Icmp {
    next_ident: u16,
    next_sequence: u16,
    pending: Option<PendingEcho>,
    raw_queues: [Option<RawQueue>; RAW_SOCKET_CAPACITY],
}

impl Icmp {
    /// Creates the layer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_ident: 0x1A00,
            next_sequence: 1,
            pending: None,
            raw_queues: [const { None }; RAW_SOCKET_CAPACITY],
        }
    }

    /// Registers a raw socket queue; returns its slot, or `None` when the
    /// registry is full.
    pub fn register_raw(&mut self, queue: RawQueue) -> Option<usize> {
        for (slot, entry) in self.raw_queues.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(queue);
                return Some(slot);
            }
        }
        None
    }

    /// Unregisters a raw socket queue.
    pub fn unregister_raw(&mut self, slot: usize) {
        if let Some(entry) = self.raw_queues.get_mut(slot) {
            *entry = None;
        }
    }

    /// Number of registered raw sockets.
    #[must_use]
    pub fn raw_socket_count(&self) -> usize {
        self.raw_queues.iter().flatten().count()
    }
}

impl Default for Icmp {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds an echo message with a valid checksum.
#[must_use]
pub fn build_echo(msg_type: u8, ident: u16, sequence: u16, data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(ECHO_HEADER_LEN + data.len());
    message.resize(ECHO_HEADER_LEN, 0);
    message[0] = msg_type;
    message[1] = 0; // code
    write_be16(&mut message, 4, ident);
    write_be16(&mut message, 6, sequence);
    message.extend_from_slice(data);

    let checksum = internet_checksum(&message, 0);
    write_be16(&mut message, 2, checksum);
    message
}

/// Verifies the whole-message checksum.
#[must_use]
pub fn checksum_ok(message: &[u8]) -> bool {
    message.len() >= ECHO_HEADER_LEN && internet_checksum(message, 0) == 0
}

/// Handles an inbound ICMP message.
pub fn handle_packet(stack: &mut super::NetStack, source: Ipv4Address, message: &[u8]) {
    if !checksum_ok(message) {
        kdebug!("icmp: dropping message with bad checksum from {}", source);
        return;
    }

    // Raw sockets see every inbound message, echo or otherwise.
    for queue in stack.icmp.raw_queues.iter().flatten() {
        let mut q = queue.lock();
        if q.len() >= crate::net::udp::RECV_QUEUE_CAPACITY {
            q.pop_front();
        }
        q.push_back((source, message.to_vec()));
    }

    match message[0] {
        TYPE_ECHO_REQUEST => {
            let ident = read_be16(message, 4);
            let sequence = read_be16(message, 6);
            let reply = build_echo(
                TYPE_ECHO_REPLY,
                ident,
                sequence,
                &message[ECHO_HEADER_LEN..],
            );
            let _ = stack.send_ipv4(source, PROTO_ICMP, &reply);
        }
        TYPE_ECHO_REPLY => {
            let ident = read_be16(message, 4);
            let sequence = read_be16(message, 6);
            if let Some(pending) = stack.icmp.pending.as_mut() {
                if pending.ident == ident
                    && pending.sequence == sequence
                    && pending.target == source
                    && pending.rtt_ms.is_none()
                {
                    let now = clock::monotonic_millis();
                    pending.rtt_ms = Some(now.saturating_sub(pending.sent_at_ms));
                }
            }
        }
        _ => {}
    }
}

/// Sends an echo request to `target` and waits for the matching reply.
///
/// Returns the round-trip time in milliseconds (0 before the HPET clock is
/// installed, since time does not advance).
///
/// # Errors
///
/// [`NetError::Timeout`] when no matching reply arrives within 5 s; send
/// failures propagate.
pub fn ping(stack: &mut super::NetStack, target: Ipv4Address) -> Result<u32, NetError> {
    let ident = stack.icmp.next_ident;
    let sequence = stack.icmp.next_sequence;
    stack.icmp.next_ident = stack.icmp.next_ident.wrapping_add(1);
    stack.icmp.next_sequence = stack.icmp.next_sequence.wrapping_add(1);

    let sent_at = clock::monotonic_millis();
    stack.icmp.pending = Some(PendingEcho {
        ident,
        sequence,
        target,
        sent_at_ms: sent_at,
        rtt_ms: None,
    });

    let request = build_echo(TYPE_ECHO_REQUEST, ident, sequence, b"palmyra-ping");
    if let Err(err) = stack.send_ipv4(target, PROTO_ICMP, &request) {
        stack.icmp.pending = None;
        return Err(err);
    }

    let deadline = sent_at + PING_TIMEOUT_MS;
    let mut budget = PING_POLL_BUDGET;
    loop {
        stack.poll();

        if let Some(rtt) = stack.icmp.pending.and_then(|p| p.rtt_ms) {
            stack.icmp.pending = None;
            return Ok(rtt as u32);
        }

        if clock::clock_installed() {
            if clock::monotonic_millis() > deadline {
                break;
            }
        } else {
            budget -= 1;
            if budget == 0 {
                break;
            }
        }
        sched::yield_now();
    }

    stack.icmp.pending = None;
    Err(NetError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testutil::SharedMockDevice;
    use crate::net::wire::MacAddress;
    use crate::net::{NetStack, ethernet, ipv4};
    use alloc::boxed::Box;

    const OUR_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x10];
    const OUR_IP: Ipv4Address = Ipv4Address([192, 168, 1, 10]);
    const PEER_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x20]);
    const PEER_IP: Ipv4Address = Ipv4Address([192, 168, 1, 99]);

    fn test_stack() -> (NetStack, SharedMockDevice) {
        let device = SharedMockDevice::new(OUR_MAC);
        let handle = device.clone();
        let mut stack = NetStack::new(
            Box::new(device),
            OUR_IP,
            Ipv4Address::new(255, 255, 255, 0),
            Ipv4Address::new(192, 168, 1, 1),
        );
        // Pre-seed ARP so replies do not trigger resolution traffic.
        stack.arp.insert(PEER_IP, PEER_MAC);
        (stack, handle)
    }

    /// Wraps an ICMP message into a full Ethernet frame addressed to us.
    fn frame_from(source: Ipv4Address, message: &[u8]) -> Vec<u8> {
        let mut sender = ipv4::Ipv4::new(source, Ipv4Address::new(255, 255, 255, 0), source);
        let packet = sender.build_packet(OUR_IP, PROTO_ICMP, message);
        ethernet::build_frame(
            MacAddress(OUR_MAC),
            PEER_MAC,
            crate::net::EtherType::Ipv4,
            &packet,
        )
    }

    #[test]
    fn echo_checksum_law() {
        let message = build_echo(TYPE_ECHO_REQUEST, 0x1234, 7, b"abc");
        assert!(checksum_ok(&message));
        let mut corrupted = message.clone();
        corrupted[9] ^= 0xFF;
        assert!(!checksum_ok(&corrupted));
    }

    #[test]
    fn ping_succeeds_with_injected_reply() {
        let (mut stack, device) = test_stack();

        // Queue the reply the peer would send; the first poll delivers it.
        let ident = stack.icmp.next_ident;
        let sequence = stack.icmp.next_sequence;
        let reply = build_echo(TYPE_ECHO_REPLY, ident, sequence, b"palmyra-ping");
        device.inject(frame_from(PEER_IP, &reply));

        let rtt = stack.ping(PEER_IP).unwrap();
        assert!(rtt <= PING_TIMEOUT_MS as u32);

        // Exactly one frame went out: the echo request.
        let sent = device.take_sent();
        assert_eq!(sent.len(), 1);
        let frame = ethernet::parse_frame(&sent[0]).unwrap();
        assert_eq!(frame.payload[ipv4::HEADER_LEN], TYPE_ECHO_REQUEST);
    }

    #[test]
    fn ping_times_out_without_reply() {
        let (mut stack, _device) = test_stack();
        assert_eq!(stack.ping(PEER_IP), Err(NetError::Timeout));
        assert!(stack.icmp.pending.is_none());
    }

    #[test]
    fn mismatched_reply_ignored() {
        let (mut stack, device) = test_stack();
        // Reply with a wrong sequence number: must not complete the ping.
        let reply = build_echo(TYPE_ECHO_REPLY, stack.icmp.next_ident, 999, b"palmyra-ping");
        device.inject(frame_from(PEER_IP, &reply));
        assert_eq!(stack.ping(PEER_IP), Err(NetError::Timeout));
    }

    #[test]
    fn inbound_request_answered_in_kind() {
        let (mut stack, device) = test_stack();
        let request = build_echo(TYPE_ECHO_REQUEST, 0x77, 3, b"data!");
        handle_packet(&mut stack, PEER_IP, &request);

        // The reply must mirror ident, sequence, and data.
        let sent = device.take_sent();
        assert_eq!(sent.len(), 1);
        let frame = ethernet::parse_frame(&sent[0]).unwrap();
        let ip_payload = &frame.payload[ipv4::HEADER_LEN..];
        assert_eq!(ip_payload[0], TYPE_ECHO_REPLY);
        assert_eq!(read_be16(ip_payload, 4), 0x77);
        assert_eq!(read_be16(ip_payload, 6), 3);
        assert_eq!(&ip_payload[ECHO_HEADER_LEN..], b"data!");
        assert!(checksum_ok(ip_payload));
    }

    #[test]
    fn raw_sockets_see_all_inbound() {
        let (mut stack, _device) = test_stack();
        let queue: RawQueue = Arc::new(SpinLock::new(VecDeque::new()));
        let slot = stack.icmp.register_raw(Arc::clone(&queue)).unwrap();

        let request = build_echo(TYPE_ECHO_REQUEST, 1, 1, b"x");
        handle_packet(&mut stack, PEER_IP, &request);
        let reply = build_echo(TYPE_ECHO_REPLY, 9, 9, b"y");
        handle_packet(&mut stack, PEER_IP, &reply);

        assert_eq!(queue.lock().len(), 2);
        stack.icmp.unregister_raw(slot);
        assert_eq!(stack.icmp.raw_socket_count(), 0);
    }
}
