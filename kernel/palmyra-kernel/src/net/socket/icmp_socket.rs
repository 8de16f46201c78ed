//! Raw ICMP protocol socket.
//!
//! Linux `SOCK_RAW` + `IPPROTO_ICMP` semantics: there are no ports, and
//! every registered raw socket receives a copy of every inbound ICMP
//! message. Sends transmit a complete ICMP message (the caller builds the
//! echo header).

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use palmyra_core::sched;
use palmyra_core::sync::SpinLock;

use crate::net::NetStack;
use crate::net::icmp::RawQueue;
use crate::net::ipv4::PROTO_ICMP;
use crate::net::socket::{Endpoint, SocketError};
use crate::net::wire::Ipv4Address;

/// A raw ICMP socket.
pub struct IcmpSocket {
    queue: RawQueue,
    /// Registry slot while registered.
    slot: Option<usize>,
}

impl IcmpSocket {
    /// Opens the socket, registering its queue with the ICMP layer.
    ///
    /// # Errors
    ///
    /// [`SocketError::OutOfMemory`] when the 16-slot registry is full.
    pub fn open(stack: &mut NetStack) -> Result<Self, SocketError> {
        let queue: RawQueue = Arc::new(SpinLock::new(VecDeque::new()));
        let slot = stack
            .icmp
            .register_raw(Arc::clone(&queue))
            .ok_or(SocketError::OutOfMemory)?;
        Ok(Self {
            queue,
            slot: Some(slot),
        })
    }

    /// Whether the socket is registered with the ICMP layer.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.slot.is_some()
    }

    /// Transmits a complete ICMP message to `destination`.
    ///
    /// # Errors
    ///
    /// Resolution and transmit failures propagate.
    pub fn send_to(
        &mut self,
        stack: &mut NetStack,
        message: &[u8],
        destination: Ipv4Address,
    ) -> Result<usize, SocketError> {
        stack.send_ipv4(destination, PROTO_ICMP, message)?;
        Ok(message.len())
    }

    /// Receives one inbound ICMP message (truncating into `buf`). The
    /// origin's port is always 0.
    ///
    /// # Errors
    ///
    /// [`SocketError::WouldBlock`] when `nonblocking` and nothing is queued.
    pub fn recv_from(
        &mut self,
        stack: &mut NetStack,
        buf: &mut [u8],
        nonblocking: bool,
    ) -> Result<(usize, Endpoint), SocketError> {
        loop {
            if let Some((source, message)) = self.queue.lock().pop_front() {
                let len = message.len().min(buf.len());
                buf[..len].copy_from_slice(&message[..len]);
                return Ok((len, Endpoint { ip: source, port: 0 }));
            }
            if nonblocking {
                return Err(SocketError::WouldBlock);
            }
            stack.poll();
            sched::yield_now();
        }
    }

    /// Bytes in the head message, per `FIONREAD`.
    #[must_use]
    pub fn bytes_available(&self) -> usize {
        self.queue.lock().front().map_or(0, |(_, m)| m.len())
    }

    /// Unregisters from the ICMP layer.
    pub fn close(&mut self, stack: &mut NetStack) {
        if let Some(slot) = self.slot.take() {
            stack.icmp.unregister_raw(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testutil::SharedMockDevice;
    use crate::net::icmp::{self, TYPE_ECHO_REPLY};
    use alloc::boxed::Box;

    fn test_stack() -> NetStack {
        let device = SharedMockDevice::new([0x02, 0, 0, 0, 0, 0x60]);
        NetStack::new(
            Box::new(device),
            Ipv4Address::new(10, 0, 0, 2),
            Ipv4Address::new(255, 0, 0, 0),
            Ipv4Address::new(10, 0, 0, 1),
        )
    }

    #[test]
    fn every_raw_socket_sees_inbound() {
        let mut stack = test_stack();
        let mut a = IcmpSocket::open(&mut stack).unwrap();
        let mut b = IcmpSocket::open(&mut stack).unwrap();

        let message = icmp::build_echo(TYPE_ECHO_REPLY, 0x10, 1, b"fanout");
        icmp::handle_packet(&mut stack, Ipv4Address::new(10, 0, 0, 3), &message);

        let mut buf = [0u8; 64];
        let (len_a, origin_a) = a.recv_from(&mut stack, &mut buf, true).unwrap();
        assert_eq!(&buf[..len_a], &message[..]);
        assert_eq!(origin_a.ip, Ipv4Address::new(10, 0, 0, 3));
        assert_eq!(origin_a.port, 0);

        let (len_b, _) = b.recv_from(&mut stack, &mut buf, true).unwrap();
        assert_eq!(len_b, message.len());

        a.close(&mut stack);
        b.close(&mut stack);
        assert_eq!(stack.icmp.raw_socket_count(), 0);
    }

    #[test]
    fn registry_capacity() {
        let mut stack = test_stack();
        let mut sockets = alloc::vec::Vec::new();
        for _ in 0..icmp::RAW_SOCKET_CAPACITY {
            sockets.push(IcmpSocket::open(&mut stack).unwrap());
        }
        assert!(matches!(
            IcmpSocket::open(&mut stack),
            Err(SocketError::OutOfMemory)
        ));
        for mut socket in sockets {
            socket.close(&mut stack);
        }
    }

    #[test]
    fn nonblocking_empty_would_block() {
        let mut stack = test_stack();
        let mut socket = IcmpSocket::open(&mut stack).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            socket.recv_from(&mut stack, &mut buf, true),
            Err(SocketError::WouldBlock)
        );
    }
}
