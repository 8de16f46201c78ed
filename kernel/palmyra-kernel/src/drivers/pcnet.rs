//! AMD PCnet-PCI II (Am79C970A) network driver.
//!
//! Word-I/O register access through the RAP/RDP/BDP protocol, 16-byte-aligned
//! descriptor rings of 8 entries each, and 1536-byte packet buffers, all in
//! identity-mapped DMA memory. Descriptor ownership alternates between CPU
//! and NIC strictly through the OWN bit. The driver is generic over
//! [`PortIo`] and [`DmaAllocator`], so the full init/transmit/receive state
//! machine runs against an emulated register file in host tests.

use palmyra_core::{kdebug, kerr, kinfo, kwarn};

use crate::arch::PortIo;
use crate::drivers::{DmaAllocator, DmaRegion};
use crate::net::device::{NetError, NetworkDevice};
use crate::net::wire::MacAddress;

/// TX descriptor ring entries.
pub const TX_RING_SIZE: usize = 8;
/// RX descriptor ring entries.
pub const RX_RING_SIZE: usize = 8;
/// Per-slot packet buffer size (MTU + headers + FCS slack).
pub const BUFFER_SIZE: usize = 1536;
/// Minimum Ethernet frame length; shorter frames are zero-padded.
pub const MIN_FRAME_LEN: usize = 60;

// I/O port offsets (word I/O mode).
const APROM0: u16 = 0x00;
const RDP: u16 = 0x10;
const RAP: u16 = 0x12;
const BDP: u16 = 0x16;
const RESET: u16 = 0x18;

// CSR numbers.
const CSR0: u16 = 0;
const CSR1: u16 = 1;
const CSR2: u16 = 2;
const CSR3: u16 = 3;
const CSR4: u16 = 4;
const CSR15: u16 = 15;
const BCR20: u16 = 20;

// CSR0 bits.
const CSR0_INIT: u16 = 1 << 0;
const CSR0_STRT: u16 = 1 << 1;
const CSR0_STOP: u16 = 1 << 2;
const CSR0_TDMD: u16 = 1 << 3;
const CSR0_TXON: u16 = 1 << 4;
const CSR0_RXON: u16 = 1 << 5;
const CSR0_INEA: u16 = 1 << 6;
const CSR0_IDON: u16 = 1 << 8;
const CSR0_TINT: u16 = 1 << 9;
const CSR0_RINT: u16 = 1 << 10;
const CSR0_ERR: u16 = 1 << 15;

// Descriptor status bits.
const DESC_OWN: u16 = 1 << 15;
const DESC_ERR: u16 = 1 << 14;
const DESC_STP: u16 = 1 << 9;
const DESC_ENP: u16 = 1 << 8;

// Register values.
const BCR20_SW_STYLE_32BIT: u16 = 0x0102;
const CSR3_INIT_MASK: u16 = 0x5F00;
const CSR3_NORMAL_MASK: u16 = 0x0040;
const CSR4_FEATURES: u16 = 0x0915;
const CSR15_NORMAL_MODE: u16 = 0x0000;

/// RAP settling iterations between RAP and RDP/BDP access.
const RAP_SETTLE: u32 = 10;
/// Reset settle iterations after reading the RESET register.
const RESET_SETTLE: u32 = 100_000;
/// Bounded iterations waiting for IDON after INIT.
const INIT_TIMEOUT_ITERS: u32 = 1_000;
/// Bounded iterations waiting for TXON/RXON after STRT.
const START_TIMEOUT_ITERS: u32 = 1_000;
/// Busy-wait iterations between status polls.
const STATUS_POLL_DELAY: u32 = 10_000;

/// 16-byte hardware descriptor (32-bit software style).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Descriptor {
    /// Physical buffer address.
    address: u32,
    /// Buffer length in two's-complement form.
    length: u16,
    /// Status flags (OWN, ERR, STP, ENP).
    status: u16,
    /// Message byte count (RX) / error info.
    misc: u32,
    reserved: u32,
}

/// Size of a descriptor in bytes.
const DESC_SIZE: usize = 16;

/// 28-byte initialization block (32-bit software style).
#[repr(C, packed)]
struct InitBlock {
    mode: u16,
    /// RX ring length: log2(count) in the upper nibble.
    rlen: u8,
    /// TX ring length: log2(count) in the upper nibble.
    tlen: u8,
    mac: [u8; 6],
    reserved: u16,
    /// Logical address filter (multicast), all zero = reject multicast.
    ladrf: [u32; 2],
    rx_ring_addr: u32,
    tx_ring_addr: u32,
}

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcnetState {
    /// Hardware untouched.
    Uninitialized,
    /// Init block accepted (IDON), TX/RX not started.
    Down,
    /// TX/RX online.
    Up,
}

/// Interface packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    /// Frames transmitted.
    pub tx_packets: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Transmit failures (ring full, oversize).
    pub tx_errors: u64,
    /// Frames received.
    pub rx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Receive errors reported by hardware.
    pub rx_errors: u64,
}

/// The PCnet driver.
pub struct Pcnet<P: PortIo> {
    io: P,
    mac: MacAddress,
    state: PcnetState,
    init_block: Option<DmaRegion>,
    tx_ring: Option<DmaRegion>,
    rx_ring: Option<DmaRegion>,
    tx_buffers: [Option<DmaRegion>; TX_RING_SIZE],
    rx_buffers: [Option<DmaRegion>; RX_RING_SIZE],
    current_tx: usize,
    current_rx: usize,
    stats: NetStats,
}

// SAFETY: the DMA regions are exclusively owned by the driver and only
// touched through &mut self; the raw pointers never alias other Rust data.
unsafe impl<P: PortIo + Send> Send for Pcnet<P> {}

impl<P: PortIo> Pcnet<P> {
    /// Creates the driver over an I/O window based at the device's BAR0.
    ///
    /// The caller has already read BAR0 (verifying the I/O-space bit) and
    /// enabled I/O decoding plus bus mastering in the PCI command register.
    pub fn new(io: P) -> Self {
        Self {
            io,
            mac: MacAddress::ZERO,
            state: PcnetState::Uninitialized,
            init_block: None,
            tx_ring: None,
            rx_ring: None,
            tx_buffers: [None; TX_RING_SIZE],
            rx_buffers: [None; RX_RING_SIZE],
            current_tx: 0,
            current_rx: 0,
            stats: NetStats::default(),
        }
    }

    /// Driver state.
    #[must_use]
    pub fn state(&self) -> PcnetState {
        self.state
    }

    /// Interface counters.
    #[must_use]
    pub fn stats(&self) -> NetStats {
        self.stats
    }

    /// Full hardware initialization: reset, MAC read, 32-bit mode, DMA ring
    /// setup, init block, INIT command, IDON wait.
    ///
    /// Idempotent: a second call on an initialized driver is a no-op.
    ///
    /// # Errors
    ///
    /// [`NetError::OutOfMemory`] when DMA allocation fails,
    /// [`NetError::Timeout`] when IDON never sets.
    pub fn initialize(&mut self, dma: &mut impl DmaAllocator) -> Result<(), NetError> {
        if self.state != PcnetState::Uninitialized {
            return Ok(());
        }

        // Hardware reset: reading the RESET register triggers it.
        let _ = self.io.read16(RESET);
        settle(RESET_SETTLE);

        // MAC from the APROM bytes 0-5.
        let mut mac = [0u8; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = self.io.read8(APROM0 + i as u16);
        }
        self.mac = MacAddress(mac);
        kinfo!("pcnet: MAC address {}", self.mac);

        // 32-bit software style for descriptor/init-block layout.
        self.write_bcr(BCR20, BCR20_SW_STYLE_32BIT);

        self.allocate_dma(dma)?;
        self.setup_rings();

        // Program the init block address and configuration registers.
        let init_phys = self.init_block.as_ref().expect("allocated above").phys;
        self.write_csr(CSR1, (init_phys & 0xFFFF) as u16);
        self.write_csr(CSR2, (init_phys >> 16) as u16);
        self.write_csr(CSR3, CSR3_INIT_MASK);
        self.write_csr(CSR4, CSR4_FEATURES);
        self.write_csr(CSR15, CSR15_NORMAL_MODE);

        // Kick INIT and wait for IDON with a bounded spin.
        self.write_csr(CSR0, CSR0_INIT);
        for _ in 0..INIT_TIMEOUT_ITERS {
            if self.read_csr(CSR0) & CSR0_IDON != 0 {
                self.write_csr(CSR3, CSR3_NORMAL_MASK);
                self.state = PcnetState::Down;
                kinfo!("pcnet: initialization complete");
                return Ok(());
            }
            settle(STATUS_POLL_DELAY);
        }

        kerr!("pcnet: IDON never set, initialization failed");
        Err(NetError::Timeout)
    }

    /// Starts TX/RX: clears stale flags, sets STRT + INEA, waits for both
    /// TXON and RXON.
    ///
    /// # Errors
    ///
    /// [`NetError::NotReady`] before initialization or without IDON,
    /// [`NetError::Timeout`] when the transceiver never comes online.
    pub fn enable(&mut self) -> Result<(), NetError> {
        if self.init_block.is_none() {
            return Err(NetError::NotReady);
        }

        let csr0 = self.read_csr(CSR0);
        if csr0 & CSR0_IDON == 0 {
            kerr!("pcnet: cannot start, IDON not set (CSR0={:#06x})", csr0);
            return Err(NetError::NotReady);
        }

        let start = (csr0 & !(CSR0_ERR | CSR0_TINT | CSR0_RINT)) | CSR0_STRT | CSR0_INEA;
        self.write_csr(CSR0, start);

        for _ in 0..START_TIMEOUT_ITERS {
            let csr0 = self.read_csr(CSR0);
            if csr0 & (CSR0_TXON | CSR0_RXON) == (CSR0_TXON | CSR0_RXON) {
                self.state = PcnetState::Up;
                kinfo!("pcnet: interface up (CSR0={:#06x})", csr0);
                return Ok(());
            }
            settle(STATUS_POLL_DELAY);
        }

        kerr!("pcnet: TXON/RXON never set");
        Err(NetError::Timeout)
    }

    /// Stops TX/RX.
    pub fn disable(&mut self) {
        if self.init_block.is_some() {
            self.write_csr(CSR0, CSR0_STOP);
        }
        if self.state == PcnetState::Up {
            self.state = PcnetState::Down;
        }
    }

    /// Queues one frame for transmission.
    ///
    /// # Errors
    ///
    /// [`NetError::NotReady`] unless Up, [`NetError::PacketTooLarge`] over
    /// [`BUFFER_SIZE`], [`NetError::TxRingFull`] when the current descriptor
    /// is still NIC-owned.
    pub fn transmit(&mut self, frame: &[u8]) -> Result<(), NetError> {
        if self.state != PcnetState::Up {
            return Err(NetError::NotReady);
        }
        if frame.len() > BUFFER_SIZE {
            self.stats.tx_errors += 1;
            return Err(NetError::PacketTooLarge);
        }

        let slot = self.current_tx;
        let desc = self.read_tx_descriptor(slot);
        if desc.status & DESC_OWN != 0 {
            kwarn!("pcnet: TX ring full");
            self.stats.tx_errors += 1;
            return Err(NetError::TxRingFull);
        }

        // Copy the frame into the slot buffer, zero-padding up to the
        // Ethernet minimum.
        let tx_len = frame.len().max(MIN_FRAME_LEN);
        let buffer = self.tx_buffers[slot].expect("rings allocated");
        // SAFETY: the buffer is BUFFER_SIZE bytes of exclusively owned DMA
        // memory and tx_len <= BUFFER_SIZE.
        unsafe {
            core::ptr::copy_nonoverlapping(frame.as_ptr(), buffer.virt, frame.len());
            if tx_len > frame.len() {
                core::ptr::write_bytes(buffer.virt.add(frame.len()), 0, tx_len - frame.len());
            }
        }

        self.write_tx_descriptor(
            slot,
            Descriptor {
                address: buffer.phys,
                length: (tx_len as u16).wrapping_neg(),
                status: DESC_OWN | DESC_STP | DESC_ENP,
                misc: 0,
                reserved: 0,
            },
        );

        // Transmit demand: tell the NIC to look at the ring now.
        let csr0 = self.read_csr(CSR0);
        self.write_csr(CSR0, csr0 | CSR0_TDMD);

        self.stats.tx_packets += 1;
        self.stats.tx_bytes += tx_len as u64;
        self.current_tx = (self.current_tx + 1) % TX_RING_SIZE;
        Ok(())
    }

    /// Services the device: drains completed RX descriptors into `sink` and
    /// acknowledges RINT/TINT/ERR by writing them back.
    pub fn handle_interrupt(&mut self, sink: &mut dyn FnMut(&[u8])) {
        let csr0 = self.read_csr(CSR0);

        self.process_received(sink);

        if csr0 & CSR0_RINT != 0 {
            self.write_csr(CSR0, csr0 | CSR0_RINT);
        }
        if csr0 & CSR0_TINT != 0 {
            self.write_csr(CSR0, csr0 | CSR0_TINT);
        }
        if csr0 & CSR0_ERR != 0 {
            kerr!("pcnet: error interrupt (CSR0={:#06x})", csr0);
            self.write_csr(CSR0, csr0 | CSR0_ERR);
        }
    }

    /// Walks CPU-owned RX descriptors from `current_rx`, delivering complete
    /// error-free frames and returning each descriptor to the NIC.
    fn process_received(&mut self, sink: &mut dyn FnMut(&[u8])) {
        loop {
            let slot = self.current_rx;
            let desc = self.read_rx_descriptor(slot);
            if desc.status & DESC_OWN != 0 {
                break;
            }

            let frame_len = (desc.misc & 0xFFF) as usize;
            if desc.status & DESC_ERR != 0 {
                kwarn!("pcnet: RX error on descriptor {} (status={:#06x})", slot, desc.status);
                self.stats.rx_errors += 1;
            } else if desc.status & (DESC_STP | DESC_ENP) == (DESC_STP | DESC_ENP) {
                // Complete single-descriptor frame.
                if (14..=1518).contains(&frame_len) {
                    let buffer = self.rx_buffers[slot].expect("rings allocated");
                    // SAFETY: the NIC wrote frame_len (<= BUFFER_SIZE by the
                    // 12-bit mask) bytes into our exclusively owned buffer.
                    let frame =
                        unsafe { core::slice::from_raw_parts(buffer.virt, frame_len) };
                    self.stats.rx_packets += 1;
                    self.stats.rx_bytes += frame_len as u64;
                    sink(frame);
                } else {
                    kwarn!("pcnet: bogus frame length {}", frame_len);
                    self.stats.rx_errors += 1;
                }
            }

            // Hand the descriptor back to the NIC for reuse.
            let buffer_phys = self.rx_buffers[slot].expect("rings allocated").phys;
            self.write_rx_descriptor(
                slot,
                Descriptor {
                    address: buffer_phys,
                    length: (BUFFER_SIZE as u16).wrapping_neg(),
                    status: DESC_OWN,
                    misc: 0,
                    reserved: 0,
                },
            );
            self.current_rx = (self.current_rx + 1) % RX_RING_SIZE;
        }
    }

    /// Allocates the init block, both rings, and all packet buffers.
    fn allocate_dma(&mut self, dma: &mut impl DmaAllocator) -> Result<(), NetError> {
        // The allocator guarantees 16-byte alignment, which both the init
        // block (4 required) and rings (16 required) rely on.
        self.init_block = Some(dma.alloc_dma(size_of::<InitBlock>()).ok_or(NetError::OutOfMemory)?);
        self.tx_ring = Some(
            dma.alloc_dma(DESC_SIZE * TX_RING_SIZE)
                .ok_or(NetError::OutOfMemory)?,
        );
        self.rx_ring = Some(
            dma.alloc_dma(DESC_SIZE * RX_RING_SIZE)
                .ok_or(NetError::OutOfMemory)?,
        );
        for slot in &mut self.tx_buffers {
            *slot = Some(dma.alloc_dma(BUFFER_SIZE).ok_or(NetError::OutOfMemory)?);
        }
        for slot in &mut self.rx_buffers {
            *slot = Some(dma.alloc_dma(BUFFER_SIZE).ok_or(NetError::OutOfMemory)?);
        }

        debug_assert_eq!(self.tx_ring.as_ref().unwrap().phys % 16, 0);
        debug_assert_eq!(self.rx_ring.as_ref().unwrap().phys % 16, 0);
        Ok(())
    }

    /// Fills the descriptor rings and the init block.
    fn setup_rings(&mut self) {
        for slot in 0..RX_RING_SIZE {
            let phys = self.rx_buffers[slot].as_ref().expect("allocated").phys;
            self.write_rx_descriptor(
                slot,
                Descriptor {
                    address: phys,
                    length: (BUFFER_SIZE as u16).wrapping_neg(),
                    // The NIC owns every RX descriptor from the start.
                    status: DESC_OWN,
                    misc: 0,
                    reserved: 0,
                },
            );
        }
        for slot in 0..TX_RING_SIZE {
            let phys = self.tx_buffers[slot].as_ref().expect("allocated").phys;
            self.write_tx_descriptor(
                slot,
                Descriptor {
                    address: phys,
                    length: 0,
                    // The CPU owns every TX descriptor from the start.
                    status: 0,
                    misc: 0,
                    reserved: 0,
                },
            );
        }

        let rx_phys = self.rx_ring.as_ref().expect("allocated").phys;
        let tx_phys = self.tx_ring.as_ref().expect("allocated").phys;
        let block = InitBlock {
            mode: 0, // normal mode, not promiscuous
            rlen: (RX_RING_SIZE.ilog2() as u8) << 4,
            tlen: (TX_RING_SIZE.ilog2() as u8) << 4,
            mac: self.mac.0,
            reserved: 0,
            ladrf: [0, 0], // reject all multicast
            rx_ring_addr: rx_phys,
            tx_ring_addr: tx_phys,
        };
        let region = self.init_block.as_ref().expect("allocated");
        // SAFETY: the init block region is at least size_of::<InitBlock>()
        // bytes of exclusively owned DMA memory.
        unsafe { core::ptr::write_volatile(region.virt.cast::<InitBlock>(), block) };

        kdebug!(
            "pcnet: rings ready (rx={:#010x}, tx={:#010x})",
            rx_phys,
            tx_phys
        );
    }

    // Descriptor accessors: all volatile, the NIC writes concurrently.

    fn read_tx_descriptor(&self, slot: usize) -> Descriptor {
        let ring = self.tx_ring.expect("rings allocated");
        // SAFETY: slot < TX_RING_SIZE and the ring holds TX_RING_SIZE
        // descriptors.
        unsafe { ring.virt.cast::<Descriptor>().add(slot).read_volatile() }
    }

    fn write_tx_descriptor(&mut self, slot: usize, desc: Descriptor) {
        let ring = self.tx_ring.expect("rings allocated");
        // SAFETY: as above.
        unsafe { ring.virt.cast::<Descriptor>().add(slot).write_volatile(desc) }
    }

    fn read_rx_descriptor(&self, slot: usize) -> Descriptor {
        let ring = self.rx_ring.expect("rings allocated");
        // SAFETY: slot < RX_RING_SIZE and the ring holds RX_RING_SIZE
        // descriptors.
        unsafe { ring.virt.cast::<Descriptor>().add(slot).read_volatile() }
    }

    fn write_rx_descriptor(&mut self, slot: usize, desc: Descriptor) {
        let ring = self.rx_ring.expect("rings allocated");
        // SAFETY: as above.
        unsafe { ring.virt.cast::<Descriptor>().add(slot).write_volatile(desc) }
    }

    // RAP/RDP/BDP register protocol.

    fn read_csr(&mut self, csr: u16) -> u16 {
        self.io.write16(RAP, csr);
        settle(RAP_SETTLE);
        self.io.read16(RDP)
    }

    fn write_csr(&mut self, csr: u16, value: u16) {
        self.io.write16(RAP, csr);
        settle(RAP_SETTLE);
        self.io.write16(RDP, value);
    }

    #[allow(dead_code)]
    fn read_bcr(&mut self, bcr: u16) -> u16 {
        self.io.write16(RAP, bcr);
        settle(RAP_SETTLE);
        self.io.read16(BDP)
    }

    fn write_bcr(&mut self, bcr: u16, value: u16) {
        self.io.write16(RAP, bcr);
        settle(RAP_SETTLE);
        self.io.write16(BDP, value);
    }
}

impl<P: PortIo> NetworkDevice for Pcnet<P> {
    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), NetError> {
        self.transmit(frame)
    }

    fn poll_frames(&mut self, sink: &mut dyn FnMut(&[u8])) {
        self.handle_interrupt(sink);
    }

    fn link_up(&self) -> bool {
        self.state == PcnetState::Up
    }
}

/// Short busy loop used for register settling.
fn settle(iterations: u32) {
    for _ in 0..iterations {
        core::hint::spin_loop();
    }
}

/// PCnet PCI identification.
pub const PCNET_VENDOR_ID: u16 = 0x1022;
/// PCnet-PCI II device id.
pub const PCNET_DEVICE_ID: u16 = 0x2000;

/// Probes the PCI function, enables it, and builds the driver over its BAR0.
///
/// Returns `None` when BAR0 is not an I/O BAR.
#[cfg(target_os = "none")]
pub fn probe(
    access: &mut impl crate::pci::ConfigAccess,
    info: &crate::pci::PciDeviceInfo,
) -> Option<Pcnet<crate::arch::X86PortIo>> {
    let bar0 = crate::pci::read_bar(access, info.address, 0);
    if bar0 & 1 == 0 {
        kerr!("pcnet: BAR0 is not I/O space ({:#010x})", bar0);
        return None;
    }
    let io_base = (bar0 & 0xFFF0) as u16;

    crate::pci::enable_command(
        access,
        info.address,
        crate::pci::Command::IO_SPACE | crate::pci::Command::BUS_MASTER,
    );

    // SAFETY: BAR0 designates this I/O range as the NIC's registers.
    Some(Pcnet::new(unsafe { crate::arch::X86PortIo::new(io_base) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Backing "physical" memory shared by the fake DMA allocator and the
    /// emulated NIC: phys addresses are offsets into this arena.
    struct Arena {
        base: *mut u8,
        len: usize,
        next: usize,
    }

    impl Arena {
        fn new(len: usize) -> Self {
            let base = Box::leak(vec![0u8; len].into_boxed_slice()).as_mut_ptr();
            Self { base, len, next: 16 }
        }

        fn slice(&self, phys: u32, len: usize) -> &mut [u8] {
            assert!(phys as usize + len <= self.len);
            // SAFETY: bounds asserted; the arena is leaked for the test.
            unsafe { core::slice::from_raw_parts_mut(self.base.add(phys as usize), len) }
        }

        fn read_u32(&self, phys: u32) -> u32 {
            let s = self.slice(phys, 4);
            u32::from_le_bytes([s[0], s[1], s[2], s[3]])
        }
    }

    struct ArenaDma(*mut Arena);

    impl DmaAllocator for ArenaDma {
        fn alloc_dma(&mut self, len: usize) -> Option<DmaRegion> {
            // SAFETY: the arena outlives the test.
            let arena = unsafe { &mut *self.0 };
            let aligned = (arena.next + 15) & !15;
            if aligned + len > arena.len {
                return None;
            }
            arena.next = aligned + len;
            Some(DmaRegion {
                // SAFETY: within the arena allocation.
                virt: unsafe { arena.base.add(aligned) },
                phys: aligned as u32,
                len,
            })
        }
    }

    /// Emulated PCnet register file plus enough DMA behavior to exercise the
    /// driver: INIT sets IDON, STRT sets TXON/RXON, TDMD "transmits" by
    /// capturing OWN-set TX descriptors, and `inject_frame` plays the NIC's
    /// receive side.
    struct EmulatedNic {
        arena: *mut Arena,
        rap: u16,
        csr: [u16; 128],
        bcr: [u16; 128],
        mac: [u8; 6],
        resets: u32,
        /// Frames captured from TX descriptors.
        transmitted: Vec<Vec<u8>>,
        /// Next RX descriptor index for injection.
        inject_slot: usize,
    }

    impl EmulatedNic {
        fn new(arena: *mut Arena, mac: [u8; 6]) -> Self {
            Self {
                arena,
                rap: 0,
                csr: [0; 128],
                bcr: [0; 128],
                mac,
                resets: 0,
                transmitted: Vec::new(),
                inject_slot: 0,
            }
        }

        fn arena(&self) -> &Arena {
            // SAFETY: the arena outlives the test.
            unsafe { &*self.arena }
        }

        fn init_block_phys(&self) -> u32 {
            u32::from(self.csr[CSR1 as usize]) | (u32::from(self.csr[CSR2 as usize]) << 16)
        }

        fn ring_addr(&self, rx: bool) -> u32 {
            let block = self.init_block_phys();
            self.arena().read_u32(block + if rx { 20 } else { 24 })
        }

        /// Emulates the NIC's transmit engine: consume OWN-set descriptors.
        fn run_tx(&mut self) {
            let tx_ring = self.ring_addr(false);
            for slot in 0..TX_RING_SIZE as u32 {
                let desc_phys = tx_ring + slot * DESC_SIZE as u32;
                let desc = self.arena().slice(desc_phys, DESC_SIZE);
                let status = u16::from_le_bytes([desc[6], desc[7]]);
                if status & DESC_OWN == 0 {
                    continue;
                }
                let addr = u32::from_le_bytes([desc[0], desc[1], desc[2], desc[3]]);
                let neg_len = u16::from_le_bytes([desc[4], desc[5]]);
                let len = neg_len.wrapping_neg() as usize;
                let frame = self.arena().slice(addr, len).to_vec();
                self.transmitted.push(frame);
                // Return ownership to the CPU.
                let desc = self.arena().slice(desc_phys, DESC_SIZE);
                let cleared = status & !DESC_OWN;
                desc[6..8].copy_from_slice(&cleared.to_le_bytes());
            }
        }

        /// Plays a frame into the next RX descriptor.
        fn inject_frame(&mut self, frame: &[u8]) {
            let rx_ring = self.ring_addr(true);
            let slot = self.inject_slot as u32;
            let desc_phys = rx_ring + slot * DESC_SIZE as u32;
            let desc = self.arena().slice(desc_phys, DESC_SIZE);
            let status = u16::from_le_bytes([desc[6], desc[7]]);
            assert!(status & DESC_OWN != 0, "NIC does not own RX slot {slot}");
            let addr = u32::from_le_bytes([desc[0], desc[1], desc[2], desc[3]]);

            self.arena().slice(addr, frame.len()).copy_from_slice(frame);

            let desc = self.arena().slice(desc_phys, DESC_SIZE);
            let new_status = (status & !DESC_OWN) | DESC_STP | DESC_ENP;
            desc[6..8].copy_from_slice(&new_status.to_le_bytes());
            desc[8..12].copy_from_slice(&(frame.len() as u32).to_le_bytes());

            self.inject_slot = (self.inject_slot + 1) % RX_RING_SIZE;
            self.csr[0] |= CSR0_RINT;
        }
    }

    impl PortIo for EmulatedNic {
        fn read8(&mut self, offset: u16) -> u8 {
            match offset {
                0..=5 => self.mac[offset as usize],
                _ => 0,
            }
        }

        fn read16(&mut self, offset: u16) -> u16 {
            match offset {
                RDP => self.csr[self.rap as usize & 0x7F],
                BDP => self.bcr[self.rap as usize & 0x7F],
                RESET => {
                    self.resets += 1;
                    0
                }
                _ => 0,
            }
        }

        fn read32(&mut self, _offset: u16) -> u32 {
            0
        }

        fn write8(&mut self, _offset: u16, _value: u8) {}

        fn write16(&mut self, offset: u16, value: u16) {
            match offset {
                RAP => self.rap = value,
                BDP => self.bcr[self.rap as usize & 0x7F] = value,
                RDP => {
                    let reg = self.rap as usize & 0x7F;
                    if reg == 0 {
                        // CSR0 command bits.
                        if value & CSR0_INIT != 0 {
                            self.csr[0] |= CSR0_IDON;
                        }
                        if value & CSR0_STRT != 0 {
                            self.csr[0] |= CSR0_TXON | CSR0_RXON;
                        }
                        if value & CSR0_STOP != 0 {
                            self.csr[0] &= !(CSR0_TXON | CSR0_RXON);
                        }
                        if value & CSR0_TDMD != 0 {
                            self.run_tx();
                        }
                        // Interrupt flags are cleared by writing them back.
                        for flag in [CSR0_RINT, CSR0_TINT, CSR0_ERR] {
                            if value & flag != 0 {
                                self.csr[0] &= !flag;
                            }
                        }
                        self.csr[0] |= value & CSR0_INEA;
                    } else {
                        self.csr[reg] = value;
                    }
                }
                _ => {}
            }
        }

        fn write32(&mut self, _offset: u16, _value: u32) {}
    }

    fn bring_up() -> (Pcnet<EmulatedNic>, *mut Arena) {
        let arena = Box::leak(Box::new(Arena::new(1 << 17)));
        let arena_ptr: *mut Arena = arena;
        let nic = EmulatedNic::new(arena_ptr, [0x52, 0x54, 0, 0x12, 0x34, 0x56]);
        let mut driver = Pcnet::new(nic);
        driver.initialize(&mut ArenaDma(arena_ptr)).unwrap();
        driver.enable().unwrap();
        (driver, arena_ptr)
    }

    #[test]
    fn initialize_reads_mac_and_reaches_down() {
        let arena = Box::leak(Box::new(Arena::new(1 << 17)));
        let arena_ptr: *mut Arena = arena;
        let nic = EmulatedNic::new(arena_ptr, [0x52, 0x54, 0, 0x12, 0x34, 0x56]);
        let mut driver = Pcnet::new(nic);
        driver.initialize(&mut ArenaDma(arena_ptr)).unwrap();

        assert_eq!(driver.state(), PcnetState::Down);
        assert_eq!(driver.mac_address(), MacAddress([0x52, 0x54, 0, 0x12, 0x34, 0x56]));
        assert_eq!(driver.io.resets, 1);
        // 32-bit software style selected.
        assert_eq!(driver.io.bcr[BCR20 as usize], BCR20_SW_STYLE_32BIT);
        // Init block describes 8-entry rings: log2(8) << 4 = 0x30.
        let block_phys = driver.io.init_block_phys();
        let arena = unsafe { &*arena_ptr };
        let block = arena.slice(block_phys, 28);
        assert_eq!(block[2], 0x30);
        assert_eq!(block[3], 0x30);
        assert_eq!(&block[4..10], &[0x52, 0x54, 0, 0x12, 0x34, 0x56]);
    }

    #[test]
    fn transmit_pads_and_round_robins() {
        let (mut driver, _arena) = bring_up();

        driver.transmit(b"short frame").unwrap();
        assert_eq!(driver.io.transmitted.len(), 1);
        // Zero-padded to the Ethernet minimum.
        let frame = &driver.io.transmitted[0];
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        assert_eq!(&frame[..11], b"short frame");
        assert!(frame[11..].iter().all(|&b| b == 0));

        let stats = driver.stats();
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.tx_bytes, MIN_FRAME_LEN as u64);
        assert_eq!(driver.current_tx, 1);
    }

    #[test]
    fn oversize_frame_rejected() {
        let (mut driver, _arena) = bring_up();
        let huge = vec![0u8; BUFFER_SIZE + 1];
        assert_eq!(driver.transmit(&huge), Err(NetError::PacketTooLarge));
        assert_eq!(driver.stats().tx_errors, 1);
    }

    #[test]
    fn transmit_requires_up() {
        let arena = Box::leak(Box::new(Arena::new(1 << 17)));
        let arena_ptr: *mut Arena = arena;
        let nic = EmulatedNic::new(arena_ptr, [2, 0, 0, 0, 0, 1]);
        let mut driver = Pcnet::new(nic);
        driver.initialize(&mut ArenaDma(arena_ptr)).unwrap();
        assert_eq!(driver.transmit(b"nope"), Err(NetError::NotReady));
    }

    #[test]
    fn receive_walks_ring_in_order() {
        let (mut driver, _arena) = bring_up();

        driver.io.inject_frame(&[0xAA; 64]);
        driver.io.inject_frame(&[0xBB; 72]);

        let mut received: Vec<Vec<u8>> = Vec::new();
        driver.handle_interrupt(&mut |frame| received.push(frame.to_vec()));

        assert_eq!(received.len(), 2);
        assert_eq!(received[0], vec![0xAA; 64]);
        assert_eq!(received[1], vec![0xBB; 72]);
        let stats = driver.stats();
        assert_eq!(stats.rx_packets, 2);
        assert_eq!(stats.rx_bytes, 64 + 72);
        // RINT acknowledged.
        assert_eq!(driver.io.csr[0] & CSR0_RINT, 0);
    }

    #[test]
    fn rx_descriptors_returned_to_nic() {
        let (mut driver, _arena) = bring_up();

        // Fill and drain the ring twice: injection only works while the NIC
        // owns the descriptors, so this proves ownership is returned.
        for round in 0..2 {
            for i in 0..RX_RING_SIZE {
                driver.io.inject_frame(&[round as u8 * 8 + i as u8; 60]);
            }
            let mut count = 0;
            driver.handle_interrupt(&mut |_| count += 1);
            assert_eq!(count, RX_RING_SIZE);
        }
    }

    #[test]
    fn runt_frames_counted_as_errors() {
        let (mut driver, _arena) = bring_up();
        driver.io.inject_frame(&[0xCC; 8]); // below the 14-byte minimum
        let mut received = 0;
        driver.handle_interrupt(&mut |_| received += 1);
        assert_eq!(received, 0);
        assert_eq!(driver.stats().rx_errors, 1);
    }

    #[test]
    fn second_initialize_is_noop() {
        let (mut driver, arena) = bring_up();
        let resets_before = driver.io.resets;
        driver.initialize(&mut ArenaDma(arena)).unwrap();
        assert_eq!(driver.io.resets, resets_before);
    }
}
