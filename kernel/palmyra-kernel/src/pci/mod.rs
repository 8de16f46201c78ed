//! PCIe configuration space access and device enumeration.
//!
//! Config space is reached through the [`ConfigAccess`] trait; the production
//! implementation is [`ecam::EcamAccess`] over the MMIO window the ACPI MCFG
//! table describes, tests use an in-memory model. Enumeration walks bus 0
//! outward, following multi-function bits and PCI-to-PCI bridges.

pub mod ecam;

use alloc::vec::Vec;

use bitflags::bitflags;

/// Standard configuration-space register offsets.
pub mod regs {
    /// Vendor ID (u16).
    pub const VENDOR_ID: u8 = 0x00;
    /// Device ID (u16).
    pub const DEVICE_ID: u8 = 0x02;
    /// Command register (u16).
    pub const COMMAND: u8 = 0x04;
    /// Status register (u16).
    pub const STATUS: u8 = 0x06;
    /// Revision ID (u8).
    pub const REVISION: u8 = 0x08;
    /// Programming interface (u8).
    pub const PROG_IF: u8 = 0x09;
    /// Subclass code (u8).
    pub const SUBCLASS: u8 = 0x0A;
    /// Class code (u8).
    pub const CLASS: u8 = 0x0B;
    /// Header type (u8); bit 7 = multi-function.
    pub const HEADER_TYPE: u8 = 0x0E;
    /// First base address register (u32).
    pub const BAR0: u8 = 0x10;
    /// Secondary bus number on PCI-to-PCI bridges (u8).
    pub const SECONDARY_BUS: u8 = 0x19;
    /// Interrupt line (u8).
    pub const INTERRUPT_LINE: u8 = 0x3C;
}

/// The vendor value read from an empty slot.
pub const VENDOR_NONE: u16 = 0xFFFF;

bitflags! {
    /// PCI command register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        /// Respond to I/O space accesses.
        const IO_SPACE = 1 << 0;
        /// Respond to memory space accesses.
        const MEMORY_SPACE = 1 << 1;
        /// Allow the device to master the bus (DMA).
        const BUS_MASTER = 1 << 2;
        /// Disable INTx interrupt assertion.
        const INTERRUPT_DISABLE = 1 << 10;
    }
}

/// A bus/device/function triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    /// Bus number.
    pub bus: u8,
    /// Device number (0-31).
    pub device: u8,
    /// Function number (0-7).
    pub function: u8,
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Identification data for one discovered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceInfo {
    /// Location of the function.
    pub address: PciAddress,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Class code.
    pub class: u8,
    /// Subclass code.
    pub subclass: u8,
    /// Programming interface.
    pub prog_if: u8,
    /// Revision ID.
    pub revision: u8,
    /// Raw header type byte.
    pub header_type: u8,
    /// Interrupt line.
    pub interrupt_line: u8,
}

/// Typed access to PCI configuration space.
pub trait ConfigAccess {
    /// Reads a 32-bit register. `offset` must be 4-byte aligned.
    fn read32(&mut self, addr: PciAddress, offset: u8) -> u32;
    /// Writes a 32-bit register. `offset` must be 4-byte aligned.
    fn write32(&mut self, addr: PciAddress, offset: u8, value: u32);

    /// Reads a 16-bit register.
    fn read16(&mut self, addr: PciAddress, offset: u8) -> u16 {
        let dword = self.read32(addr, offset & !0x3);
        (dword >> ((offset & 0x2) * 8)) as u16
    }

    /// Reads an 8-bit register.
    fn read8(&mut self, addr: PciAddress, offset: u8) -> u8 {
        let dword = self.read32(addr, offset & !0x3);
        (dword >> ((offset & 0x3) * 8)) as u8
    }

    /// Writes a 16-bit register (read-modify-write of the containing dword).
    fn write16(&mut self, addr: PciAddress, offset: u8, value: u16) {
        let aligned = offset & !0x3;
        let shift = (offset & 0x2) * 8;
        let dword = self.read32(addr, aligned);
        let dword = (dword & !(0xFFFF << shift)) | (u32::from(value) << shift);
        self.write32(addr, aligned, dword);
    }
}

/// Reads the command register.
pub fn command(access: &mut impl ConfigAccess, addr: PciAddress) -> Command {
    Command::from_bits_truncate(access.read16(addr, regs::COMMAND))
}

/// Sets bits in the command register (read-modify-write).
pub fn enable_command(access: &mut impl ConfigAccess, addr: PciAddress, bits: Command) {
    let current = access.read16(addr, regs::COMMAND);
    access.write16(addr, regs::COMMAND, current | bits.bits());
}

/// Reads a base address register.
pub fn read_bar(access: &mut impl ConfigAccess, addr: PciAddress, index: u8) -> u32 {
    debug_assert!(index < 6);
    access.read32(addr, regs::BAR0 + index * 4)
}

/// Enumerates every function reachable from bus 0.
pub fn enumerate(access: &mut impl ConfigAccess) -> Vec<PciDeviceInfo> {
    let mut devices = Vec::new();
    enumerate_bus(access, 0, &mut devices);
    devices
}

/// Finds the first function matching `vendor_id`/`device_id`.
pub fn find_device(
    access: &mut impl ConfigAccess,
    vendor_id: u16,
    device_id: u16,
) -> Option<PciDeviceInfo> {
    enumerate(access)
        .into_iter()
        .find(|d| d.vendor_id == vendor_id && d.device_id == device_id)
}

fn enumerate_bus(access: &mut impl ConfigAccess, bus: u8, devices: &mut Vec<PciDeviceInfo>) {
    for device in 0..32 {
        enumerate_device(access, bus, device, devices);
    }
}

fn enumerate_device(
    access: &mut impl ConfigAccess,
    bus: u8,
    device: u8,
    devices: &mut Vec<PciDeviceInfo>,
) {
    let addr = PciAddress { bus, device, function: 0 };
    if access.read16(addr, regs::VENDOR_ID) == VENDOR_NONE {
        return;
    }

    let info = read_function(access, addr);
    let multi_function = info.header_type & 0x80 != 0;
    visit_function(access, info, devices);

    if multi_function {
        for function in 1..8 {
            let addr = PciAddress { bus, device, function };
            if access.read16(addr, regs::VENDOR_ID) == VENDOR_NONE {
                continue;
            }
            let info = read_function(access, addr);
            visit_function(access, info, devices);
        }
    }
}

/// Records a function and recurses through PCI-to-PCI bridges.
fn visit_function(
    access: &mut impl ConfigAccess,
    info: PciDeviceInfo,
    devices: &mut Vec<PciDeviceInfo>,
) {
    if info.class == 0x06 && info.subclass == 0x04 {
        let secondary = access.read8(info.address, regs::SECONDARY_BUS);
        if secondary != 0 {
            enumerate_bus(access, secondary, devices);
        }
    }
    devices.push(info);
}

fn read_function(access: &mut impl ConfigAccess, addr: PciAddress) -> PciDeviceInfo {
    PciDeviceInfo {
        address: addr,
        vendor_id: access.read16(addr, regs::VENDOR_ID),
        device_id: access.read16(addr, regs::DEVICE_ID),
        class: access.read8(addr, regs::CLASS),
        subclass: access.read8(addr, regs::SUBCLASS),
        prog_if: access.read8(addr, regs::PROG_IF),
        revision: access.read8(addr, regs::REVISION),
        header_type: access.read8(addr, regs::HEADER_TYPE),
        interrupt_line: access.read8(addr, regs::INTERRUPT_LINE),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! In-memory PCI configuration space for tests.

    use super::{ConfigAccess, PciAddress};
    use std::collections::HashMap;

    /// Per-function 256-byte config space model.
    #[derive(Default)]
    pub struct MockConfigSpace {
        functions: HashMap<(u8, u8, u8), [u8; 256]>,
    }

    impl MockConfigSpace {
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds a function with the given identification.
        pub fn add_function(
            &mut self,
            bus: u8,
            device: u8,
            function: u8,
            vendor: u16,
            device_id: u16,
            class: u8,
            subclass: u8,
        ) -> &mut [u8; 256] {
            let space = self.functions.entry((bus, device, function)).or_insert([0; 256]);
            space[0..2].copy_from_slice(&vendor.to_le_bytes());
            space[2..4].copy_from_slice(&device_id.to_le_bytes());
            space[0x0B] = class;
            space[0x0A] = subclass;
            space
        }
    }

    impl ConfigAccess for MockConfigSpace {
        fn read32(&mut self, addr: PciAddress, offset: u8) -> u32 {
            match self.functions.get(&(addr.bus, addr.device, addr.function)) {
                Some(space) => {
                    let off = offset as usize & !0x3;
                    u32::from_le_bytes(space[off..off + 4].try_into().unwrap())
                }
                None => u32::MAX,
            }
        }

        fn write32(&mut self, addr: PciAddress, offset: u8, value: u32) {
            if let Some(space) = self.functions.get_mut(&(addr.bus, addr.device, addr.function)) {
                let off = offset as usize & !0x3;
                space[off..off + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::MockConfigSpace;
    use super::*;

    #[test]
    fn empty_bus_yields_nothing() {
        let mut cfg = MockConfigSpace::new();
        assert!(enumerate(&mut cfg).is_empty());
    }

    #[test]
    fn finds_single_function_device() {
        let mut cfg = MockConfigSpace::new();
        cfg.add_function(0, 3, 0, 0x1022, 0x2000, 0x02, 0x00);

        let devices = enumerate(&mut cfg);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor_id, 0x1022);
        assert_eq!(devices[0].device_id, 0x2000);
        assert_eq!(devices[0].class, 0x02);
        assert_eq!(
            devices[0].address,
            PciAddress { bus: 0, device: 3, function: 0 }
        );
    }

    #[test]
    fn multifunction_device_scanned_fully() {
        let mut cfg = MockConfigSpace::new();
        let space = cfg.add_function(0, 4, 0, 0x8086, 0x1111, 0x06, 0x00);
        space[0x0E] = 0x80; // multi-function
        cfg.add_function(0, 4, 2, 0x8086, 0x2222, 0x0C, 0x03);

        let devices = enumerate(&mut cfg);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].device_id, 0x2222);
        assert_eq!(devices[1].address.function, 2);
    }

    #[test]
    fn bridge_recursion_reaches_secondary_bus() {
        let mut cfg = MockConfigSpace::new();
        let bridge = cfg.add_function(0, 1, 0, 0x8086, 0x3333, 0x06, 0x04);
        bridge[0x19] = 2; // secondary bus
        cfg.add_function(2, 0, 0, 0x10EC, 0x8139, 0x02, 0x00);

        let devices = enumerate(&mut cfg);
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().any(|d| d.address.bus == 2));
    }

    #[test]
    fn find_device_by_id() {
        let mut cfg = MockConfigSpace::new();
        cfg.add_function(0, 3, 0, 0x1022, 0x2000, 0x02, 0x00);
        let nic = find_device(&mut cfg, 0x1022, 0x2000).unwrap();
        assert_eq!(nic.address.device, 3);
        assert!(find_device(&mut cfg, 0x1022, 0x9999).is_none());
    }

    #[test]
    fn command_register_rmw() {
        let mut cfg = MockConfigSpace::new();
        cfg.add_function(0, 3, 0, 0x1022, 0x2000, 0x02, 0x00);
        let addr = PciAddress { bus: 0, device: 3, function: 0 };

        enable_command(&mut cfg, addr, Command::IO_SPACE | Command::BUS_MASTER);
        let cmd = command(&mut cfg, addr);
        assert!(cmd.contains(Command::IO_SPACE));
        assert!(cmd.contains(Command::BUS_MASTER));
        assert!(!cmd.contains(Command::MEMORY_SPACE));
    }

    #[test]
    fn bar_read() {
        let mut cfg = MockConfigSpace::new();
        let space = cfg.add_function(0, 3, 0, 0x1022, 0x2000, 0x02, 0x00);
        space[0x10..0x14].copy_from_slice(&0xC001u32.to_le_bytes());
        let addr = PciAddress { bus: 0, device: 3, function: 0 };
        assert_eq!(read_bar(&mut cfg, addr, 0), 0xC001);
    }
}
