//! Network device interface.
//!
//! Drivers implementing [`NetworkDevice`] provide Ethernet frame I/O to the
//! protocol stack. The PCnet driver is the production implementation; tests
//! run the stack over [`testutil::MockDevice`], which records transmitted
//! frames and replays injected ones.

use core::fmt;

use crate::net::wire::MacAddress;

/// Errors from network I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// The device reported a hardware error.
    DeviceError,
    /// The frame exceeds the device's buffer size.
    PacketTooLarge,
    /// The transmit ring is full (all descriptors NIC-owned).
    TxRingFull,
    /// The device is not initialized or not up.
    NotReady,
    /// A deadline expired.
    Timeout,
    /// ARP could not resolve the next hop.
    Unresolved,
    /// The requested port is already bound.
    PortInUse,
    /// No ephemeral port could be allocated.
    NoEphemeralPorts,
    /// Nothing available on a non-blocking operation.
    WouldBlock,
    /// The operation is not supported by this protocol.
    Unsupported,
    /// An allocation failed.
    OutOfMemory,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceError => f.write_str("device error"),
            Self::PacketTooLarge => f.write_str("packet too large"),
            Self::TxRingFull => f.write_str("transmit ring full"),
            Self::NotReady => f.write_str("device not ready"),
            Self::Timeout => f.write_str("timed out"),
            Self::Unresolved => f.write_str("address unresolved"),
            Self::PortInUse => f.write_str("port in use"),
            Self::NoEphemeralPorts => f.write_str("no ephemeral ports"),
            Self::WouldBlock => f.write_str("would block"),
            Self::Unsupported => f.write_str("operation not supported"),
            Self::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

/// Ethernet frame I/O as seen by the protocol stack.
pub trait NetworkDevice {
    /// The device's MAC address.
    fn mac_address(&self) -> MacAddress;

    /// Queues one Ethernet frame for transmission.
    ///
    /// # Errors
    ///
    /// See [`NetError`].
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), NetError>;

    /// Drains completed receive descriptors, handing each frame to `sink` in
    /// arrival order. Equivalent to servicing the receive interrupt.
    fn poll_frames(&mut self, sink: &mut dyn FnMut(&[u8]));

    /// Whether the link is up and frames can flow.
    fn link_up(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod testutil {
    //! In-memory device for protocol tests.

    use alloc::collections::VecDeque;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use palmyra_core::sync::SpinLock;

    use super::{MacAddress, NetError, NetworkDevice};

    /// Records transmitted frames; replays frames queued via `inject`.
    pub struct MockDevice {
        mac: MacAddress,
        /// Frames the stack transmitted, oldest first.
        pub sent: Vec<Vec<u8>>,
        /// Frames waiting to be "received" on the next poll.
        pub pending_rx: VecDeque<Vec<u8>>,
        /// When set, `send_frame` fails with this error.
        pub fail_send: Option<NetError>,
    }

    impl MockDevice {
        pub fn new(mac: [u8; 6]) -> Self {
            Self {
                mac: MacAddress(mac),
                sent: Vec::new(),
                pending_rx: VecDeque::new(),
                fail_send: None,
            }
        }

        /// Queues a frame for delivery on the next poll.
        pub fn inject(&mut self, frame: Vec<u8>) {
            self.pending_rx.push_back(frame);
        }
    }

    impl NetworkDevice for MockDevice {
        fn mac_address(&self) -> MacAddress {
            self.mac
        }

        fn send_frame(&mut self, frame: &[u8]) -> Result<(), NetError> {
            if let Some(err) = self.fail_send {
                return Err(err);
            }
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn poll_frames(&mut self, sink: &mut dyn FnMut(&[u8])) {
            while let Some(frame) = self.pending_rx.pop_front() {
                sink(&frame);
            }
        }

        fn link_up(&self) -> bool {
            true
        }
    }

    /// A [`MockDevice`] behind a shared handle, so a test can keep injecting
    /// and inspecting frames after the stack has taken ownership of the
    /// device.
    #[derive(Clone)]
    pub struct SharedMockDevice(pub Arc<SpinLock<MockDevice>>);

    impl SharedMockDevice {
        pub fn new(mac: [u8; 6]) -> Self {
            Self(Arc::new(SpinLock::new(MockDevice::new(mac))))
        }

        /// Queues a frame for delivery on the next poll.
        pub fn inject(&self, frame: Vec<u8>) {
            self.0.lock().inject(frame);
        }

        /// Takes every frame transmitted so far.
        pub fn take_sent(&self) -> Vec<Vec<u8>> {
            core::mem::take(&mut self.0.lock().sent)
        }
    }

    impl NetworkDevice for SharedMockDevice {
        fn mac_address(&self) -> MacAddress {
            self.0.lock().mac
        }

        fn send_frame(&mut self, frame: &[u8]) -> Result<(), NetError> {
            self.0.lock().send_frame(frame)
        }

        fn poll_frames(&mut self, sink: &mut dyn FnMut(&[u8])) {
            self.0.lock().poll_frames(sink);
        }

        fn link_up(&self) -> bool {
            true
        }
    }
}
