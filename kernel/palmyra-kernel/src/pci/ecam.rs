//! ECAM-backed configuration access.
//!
//! The Enhanced Configuration Access Mechanism exposes the full 4 KiB PCIe
//! configuration space of every function as MMIO at
//! `base + (bus << 20 | device << 15 | function << 12)`. The base address
//! comes from the ACPI MCFG table.

use palmyra_acpi::mcfg::McfgEntry;

use crate::pci::{ConfigAccess, PciAddress};

/// Configuration access through an ECAM MMIO window.
pub struct EcamAccess {
    /// Virtual base of the window (identity-mapped).
    base: usize,
    /// First bus the window decodes.
    start_bus: u8,
    /// Last bus the window decodes.
    end_bus: u8,
}

impl EcamAccess {
    /// Creates an accessor from an MCFG entry.
    ///
    /// # Safety
    ///
    /// The entry's base address must be identity-mapped device memory
    /// covering the described bus range.
    #[must_use]
    pub unsafe fn new(entry: &McfgEntry) -> Self {
        Self {
            base: entry.base_address as usize,
            start_bus: entry.start_bus,
            end_bus: entry.end_bus,
        }
    }

    /// Computes the MMIO address of a register, or `None` when the bus is
    /// outside the window.
    fn register_address(&self, addr: PciAddress, offset: u8) -> Option<usize> {
        if addr.bus < self.start_bus || addr.bus > self.end_bus {
            return None;
        }
        Some(
            self.base
                + ((addr.bus as usize) << 20)
                + ((addr.device as usize) << 15)
                + ((addr.function as usize) << 12)
                + (offset as usize & !0x3),
        )
    }
}

impl ConfigAccess for EcamAccess {
    fn read32(&mut self, addr: PciAddress, offset: u8) -> u32 {
        match self.register_address(addr, offset) {
            // SAFETY: construction guarantees the window is mapped.
            Some(mmio) => unsafe { (mmio as *const u32).read_volatile() },
            None => u32::MAX,
        }
    }

    fn write32(&mut self, addr: PciAddress, offset: u8, value: u32) {
        if let Some(mmio) = self.register_address(addr, offset) {
            // SAFETY: construction guarantees the window is mapped.
            unsafe { (mmio as *mut u32).write_volatile(value) };
        }
    }
}
