//! Socket layer.
//!
//! Two levels, mirroring the classic BSD split:
//!
//! - [`ProtocolSocket`] — a tagged union over the protocol implementations
//!   ([`UdpSocket`], [`IcmpSocket`]) with match-based dispatch. TCP-shaped
//!   operations exist on the interface and uniformly answer
//!   [`SocketError::Unsupported`].
//! - [`SocketDescriptor`] — the file-descriptor-like wrapper owning one
//!   protocol socket, holding the connected peer, the non-blocking flag, and
//!   the `ioctl` surface (`FIONBIO`, `FIONREAD`).
//!
//! Operations that touch the network take the owning [`NetStack`]
//! explicitly; descriptors never hide a global.

mod icmp_socket;
mod udp_socket;

pub use icmp_socket::IcmpSocket;
pub use udp_socket::UdpSocket;

use core::fmt;

use crate::net::NetStack;
use crate::net::wire::Ipv4Address;

/// Bound on socket receive queues (packets, not bytes).
pub use crate::net::udp::RECV_QUEUE_CAPACITY;

/// `ioctl` request: toggle non-blocking mode.
pub const FIONBIO: u32 = 0x5421;
/// `ioctl` request: bytes ready in the head packet.
pub const FIONREAD: u32 = 0x541B;

/// Socket-layer errors, each with a Linux-flavored errno value for the
/// descriptor boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Nothing to read on a non-blocking socket.
    WouldBlock,
    /// Bad buffer, address family, or request.
    InvalidArgument,
    /// Operation not supported by this protocol (TCP ops on UDP, etc.).
    Unsupported,
    /// `read`/`write` on an unconnected socket.
    NotConnected,
    /// Allocation or table capacity failure.
    OutOfMemory,
    /// The requested port is already bound.
    AddressInUse,
    /// The network stack is not initialized or the address is unreachable.
    Unreachable,
    /// A deadline expired.
    TimedOut,
}

impl SocketError {
    /// The errno-style value (negated at the descriptor boundary).
    #[must_use]
    pub fn errno(self) -> i32 {
        match self {
            Self::WouldBlock => 11,       // EAGAIN
            Self::OutOfMemory => 12,      // ENOMEM
            Self::InvalidArgument => 22,  // EINVAL
            Self::Unsupported => 95,      // EOPNOTSUPP
            Self::AddressInUse => 98,     // EADDRINUSE
            Self::Unreachable => 101,     // ENETUNREACH
            Self::NotConnected => 107,    // ENOTCONN
            Self::TimedOut => 110,        // ETIMEDOUT
        }
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket error (errno {})", self.errno())
    }
}

impl From<crate::net::NetError> for SocketError {
    fn from(err: crate::net::NetError) -> Self {
        use crate::net::NetError;
        match err {
            NetError::WouldBlock => Self::WouldBlock,
            NetError::OutOfMemory | NetError::NoEphemeralPorts => Self::OutOfMemory,
            NetError::PortInUse => Self::AddressInUse,
            NetError::Unsupported => Self::Unsupported,
            NetError::Timeout => Self::TimedOut,
            NetError::Unresolved | NetError::NotReady => Self::Unreachable,
            _ => Self::InvalidArgument,
        }
    }
}

/// Address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// IPv4.
    Inet,
}

/// Socket semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Datagram (UDP).
    Datagram,
    /// Raw protocol access (ICMP).
    Raw,
}

/// A received datagram's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Peer address.
    pub ip: Ipv4Address,
    /// Peer port (0 for raw sockets).
    pub port: u16,
}

/// Protocol-level socket: a tagged union with match dispatch.
pub enum ProtocolSocket {
    /// A UDP datagram socket.
    Udp(UdpSocket),
    /// A raw ICMP socket.
    Icmp(IcmpSocket),
}

impl ProtocolSocket {
    /// Binds to a local port (`0` = allocate ephemeral). Raw ICMP sockets
    /// ignore ports and accept any bind.
    ///
    /// # Errors
    ///
    /// [`SocketError::AddressInUse`] / [`SocketError::OutOfMemory`] from the
    /// port table.
    pub fn bind(&mut self, stack: &mut NetStack, port: u16) -> Result<(), SocketError> {
        match self {
            Self::Udp(socket) => socket.bind(stack, port),
            Self::Icmp(_) => Ok(()),
        }
    }

    /// Sends to an explicit destination.
    ///
    /// # Errors
    ///
    /// Propagated transmit/resolution failures.
    pub fn send_to(
        &mut self,
        stack: &mut NetStack,
        data: &[u8],
        destination: Endpoint,
    ) -> Result<usize, SocketError> {
        match self {
            Self::Udp(socket) => socket.send_to(stack, data, destination.ip, destination.port),
            Self::Icmp(socket) => socket.send_to(stack, data, destination.ip),
        }
    }

    /// Receives one packet into `buf`.
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
        match self {
            Self::Udp(socket) => socket.recv_from(stack, buf, nonblocking),
            Self::Icmp(socket) => socket.recv_from(stack, buf, nonblocking),
        }
    }

    /// Bytes ready in the head packet of the receive queue.
    #[must_use]
    pub fn bytes_available(&self) -> usize {
        match self {
            Self::Udp(socket) => socket.bytes_available(),
            Self::Icmp(socket) => socket.bytes_available(),
        }
    }

    /// Whether the socket has a local binding.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        match self {
            Self::Udp(socket) => socket.is_bound(),
            Self::Icmp(socket) => socket.is_registered(),
        }
    }

    /// The bound local port, when one exists.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        match self {
            Self::Udp(socket) => socket.local_port(),
            Self::Icmp(_) => None,
        }
    }

    /// Releases protocol resources (port binding / raw registration).
    pub fn close(&mut self, stack: &mut NetStack) {
        match self {
            Self::Udp(socket) => socket.close(stack),
            Self::Icmp(socket) => socket.close(stack),
        }
    }

    /// TCP-style listen — not a datagram concept.
    ///
    /// # Errors
    ///
    /// Always [`SocketError::Unsupported`].
    pub fn listen(&mut self, _backlog: usize) -> Result<(), SocketError> {
        Err(SocketError::Unsupported)
    }

    /// TCP-style accept — not a datagram concept.
    ///
    /// # Errors
    ///
    /// Always [`SocketError::Unsupported`].
    pub fn accept(&mut self) -> Result<Self, SocketError> {
        Err(SocketError::Unsupported)
    }
}

/// File-descriptor-level socket object.
pub struct SocketDescriptor {
    domain: Domain,
    socket_type: SocketType,
    inner: ProtocolSocket,
    peer: Option<Endpoint>,
    nonblocking: bool,
}

impl SocketDescriptor {
    /// Creates a UDP datagram socket.
    #[must_use]
    pub fn udp() -> Self {
        Self {
            domain: Domain::Inet,
            socket_type: SocketType::Datagram,
            inner: ProtocolSocket::Udp(UdpSocket::new()),
            peer: None,
            nonblocking: false,
        }
    }

    /// Creates a raw ICMP socket, registering it with the ICMP layer.
    ///
    /// # Errors
    ///
    /// [`SocketError::OutOfMemory`] when the raw-socket registry is full.
    pub fn icmp(stack: &mut NetStack) -> Result<Self, SocketError> {
        Ok(Self {
            domain: Domain::Inet,
            socket_type: SocketType::Raw,
            inner: ProtocolSocket::Icmp(IcmpSocket::open(stack)?),
            peer: None,
            nonblocking: false,
        })
    }

    /// The address family.
    #[must_use]
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// The socket semantics.
    #[must_use]
    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    /// The protocol socket, for protocol-specific inspection.
    #[must_use]
    pub fn protocol(&self) -> &ProtocolSocket {
        &self.inner
    }

    /// Binds the local end.
    ///
    /// # Errors
    ///
    /// See [`ProtocolSocket::bind`].
    pub fn bind(&mut self, stack: &mut NetStack, port: u16) -> Result<(), SocketError> {
        self.inner.bind(stack, port)
    }

    /// Stores the peer for subsequent [`read`](Self::read) /
    /// [`write`](Self::write).
    pub fn connect(&mut self, peer: Endpoint) {
        self.peer = Some(peer);
    }

    /// The connected peer, if any.
    #[must_use]
    pub fn peer(&self) -> Option<Endpoint> {
        self.peer
    }

    /// Sends to an explicit destination.
    ///
    /// # Errors
    ///
    /// See [`ProtocolSocket::send_to`].
    pub fn send_to(
        &mut self,
        stack: &mut NetStack,
        data: &[u8],
        destination: Endpoint,
    ) -> Result<usize, SocketError> {
        self.inner.send_to(stack, data, destination)
    }

    /// Receives one packet.
    ///
    /// # Errors
    ///
    /// See [`ProtocolSocket::recv_from`].
    pub fn recv_from(
        &mut self,
        stack: &mut NetStack,
        buf: &mut [u8],
    ) -> Result<(usize, Endpoint), SocketError> {
        self.inner.recv_from(stack, buf, self.nonblocking)
    }

    /// `write` on a connected socket equals `send_to` with the stored peer.
    ///
    /// # Errors
    ///
    /// [`SocketError::NotConnected`] without a stored peer.
    pub fn write(&mut self, stack: &mut NetStack, data: &[u8]) -> Result<usize, SocketError> {
        let peer = self.peer.ok_or(SocketError::NotConnected)?;
        self.inner.send_to(stack, data, peer)
    }

    /// `read` on a connected socket equals `recv_from` discarding the
    /// origin.
    ///
    /// # Errors
    ///
    /// [`SocketError::NotConnected`] without a stored peer; receive errors
    /// propagate.
    pub fn read(&mut self, stack: &mut NetStack, buf: &mut [u8]) -> Result<usize, SocketError> {
        if self.peer.is_none() {
            return Err(SocketError::NotConnected);
        }
        let (len, _origin) = self.inner.recv_from(stack, buf, self.nonblocking)?;
        Ok(len)
    }

    /// `ioctl`: `FIONBIO` toggles non-blocking mode (`*arg != 0` sets it);
    /// `FIONREAD` writes the bytes ready in the head packet into `*arg`.
    ///
    /// # Errors
    ///
    /// [`SocketError::InvalidArgument`] on an unknown request.
    pub fn ioctl(&mut self, request: u32, arg: &mut u32) -> Result<(), SocketError> {
        match request {
            FIONBIO => {
                self.nonblocking = *arg != 0;
                Ok(())
            }
            FIONREAD => {
                *arg = self.inner.bytes_available() as u32;
                Ok(())
            }
            _ => Err(SocketError::InvalidArgument),
        }
    }

    /// Whether the descriptor is in non-blocking mode.
    #[must_use]
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Closes the descriptor, dropping the inner protocol socket's
    /// resources.
    pub fn close(&mut self, stack: &mut NetStack) {
        self.inner.close(stack);
        self.peer = None;
    }
}
