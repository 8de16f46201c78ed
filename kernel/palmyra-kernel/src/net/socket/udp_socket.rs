//! UDP protocol socket.
//!
//! Owns a heap-allocated receive queue (bounded at
//! [`RECV_QUEUE_CAPACITY`](crate::net::udp::RECV_QUEUE_CAPACITY) packets)
//! that the UDP layer clones incoming datagrams into. Binding registers the
//! queue in the port table; an unbound socket auto-binds an ephemeral port on
//! its first send so replies have somewhere to land.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use palmyra_core::sched;
use palmyra_core::sync::SpinLock;

use crate::net::socket::{Endpoint, SocketError};
use crate::net::udp::{self, UdpQueue};
use crate::net::wire::Ipv4Address;
use crate::net::NetStack;

/// A UDP datagram socket.
pub struct UdpSocket {
    queue: UdpQueue,
    local_port: Option<u16>,
}

impl UdpSocket {
    /// Creates an unbound socket with an empty receive queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Arc::new(SpinLock::new(VecDeque::new())),
            local_port: None,
        }
    }

    /// Whether the socket holds a port binding.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.local_port.is_some()
    }

    /// The bound local port.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Binds to `port` (`0` = allocate an ephemeral port).
    ///
    /// # Errors
    ///
    /// [`SocketError::AddressInUse`] when taken,
    /// [`SocketError::OutOfMemory`] when the table or ephemeral range is
    /// exhausted, [`SocketError::InvalidArgument`] when already bound.
    pub fn bind(&mut self, stack: &mut NetStack, port: u16) -> Result<(), SocketError> {
        if self.local_port.is_some() {
            return Err(SocketError::InvalidArgument);
        }
        let port = if port == 0 {
            stack
                .udp
                .allocate_ephemeral()
                .ok_or(SocketError::OutOfMemory)?
        } else {
            port
        };
        stack.udp.bind(port, Arc::clone(&self.queue))?;
        self.local_port = Some(port);
        Ok(())
    }

    /// Sends a datagram, auto-binding an ephemeral port first when unbound.
    ///
    /// # Errors
    ///
    /// Binding and transmit failures propagate.
    pub fn send_to(
        &mut self,
        stack: &mut NetStack,
        data: &[u8],
        destination: Ipv4Address,
        destination_port: u16,
    ) -> Result<usize, SocketError> {
        if self.local_port.is_none() {
            self.bind(stack, 0)?;
        }
        let source_port = self.local_port.expect("bound above");
        udp::send(stack, source_port, destination, destination_port, data)?;
        Ok(data.len())
    }

    /// Receives one datagram, copying its payload into `buf` (truncating).
    ///
    /// Blocking mode polls the stack and yields between polls until a packet
    /// arrives.
    ///
    /// # Errors
    ///
    /// [`SocketError::WouldBlock`] when `nonblocking` and the queue is
    /// empty.
    pub fn recv_from(
        &mut self,
        stack: &mut NetStack,
        buf: &mut [u8],
        nonblocking: bool,
    ) -> Result<(usize, Endpoint), SocketError> {
        loop {
            if let Some(packet) = self.queue.lock().pop_front() {
                let len = packet.data.len().min(buf.len());
                buf[..len].copy_from_slice(&packet.data[..len]);
                return Ok((
                    len,
                    Endpoint {
                        ip: packet.source_ip,
                        port: packet.source_port,
                    },
                ));
            }
            if nonblocking {
                return Err(SocketError::WouldBlock);
            }
            stack.poll();
            sched::yield_now();
        }
    }

    /// Bytes in the head packet, per `FIONREAD`.
    #[must_use]
    pub fn bytes_available(&self) -> usize {
        self.queue.lock().front().map_or(0, |p| p.data.len())
    }

    /// Packets queued.
    #[must_use]
    pub fn queued_packets(&self) -> usize {
        self.queue.lock().len()
    }

    /// Releases the port binding.
    pub fn close(&mut self, stack: &mut NetStack) {
        if let Some(port) = self.local_port.take() {
            stack.udp.unbind(port);
        }
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::testutil::SharedMockDevice;
    use alloc::boxed::Box;

    fn test_stack() -> NetStack {
        let device = SharedMockDevice::new([0x02, 0, 0, 0, 0, 0x50]);
        let mut stack = NetStack::new(
            Box::new(device),
            Ipv4Address::new(10, 0, 0, 2),
            Ipv4Address::new(255, 0, 0, 0),
            Ipv4Address::new(10, 0, 0, 1),
        );
        stack
            .arp
            .insert(Ipv4Address::new(10, 0, 0, 3), crate::net::MacAddress([9; 6]));
        stack
    }

    #[test]
    fn first_send_auto_binds_ephemeral() {
        let mut stack = test_stack();
        let mut socket = UdpSocket::new();
        assert!(!socket.is_bound());

        socket
            .send_to(&mut stack, b"ping", Ipv4Address::new(10, 0, 0, 3), 4000)
            .unwrap();

        let port = socket.local_port().unwrap();
        assert!(port >= udp::EPHEMERAL_MIN);
        assert!(stack.udp.is_bound(port));
    }

    #[test]
    fn double_bind_rejected() {
        let mut stack = test_stack();
        let mut socket = UdpSocket::new();
        socket.bind(&mut stack, 6000).unwrap();
        assert_eq!(
            socket.bind(&mut stack, 6001),
            Err(SocketError::InvalidArgument)
        );
    }

    #[test]
    fn close_releases_binding() {
        let mut stack = test_stack();
        let mut socket = UdpSocket::new();
        socket.bind(&mut stack, 6002).unwrap();
        socket.close(&mut stack);
        assert!(!socket.is_bound());
        assert!(!stack.udp.is_bound(6002));
    }
}
