//! High Precision Event Timer (HPET) table parsing.
//!
//! The HPET table provides the base address of the HPET register block and a
//! packed capability word (`event_timer_block_id`) describing the comparator
//! count, counter width, and legacy-replacement support. The clock period
//! itself lives in the hardware capability register, not in this table.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler, GenericAddress};

/// HPET table signature.
pub const HPET_SIGNATURE: &[u8; 4] = b"HPET";

/// Raw HPET table fields following the SDT header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct HpetRaw {
    event_timer_block_id: u32,
    base_address: GenericAddress,
    hpet_number: u8,
    minimum_tick: u16,
    page_protection: u8,
}

/// Parsed HPET table.
#[derive(Debug, Clone, Copy)]
pub struct HpetTable {
    /// Packed hardware ID / capability word.
    pub event_timer_block_id: u32,
    /// Base address of the HPET register block.
    pub base_address: GenericAddress,
    /// HPET sequence number (for systems with multiple HPET blocks).
    pub hpet_number: u8,
    /// Minimum clock tick in periodic mode.
    pub minimum_tick: u16,
    /// Page protection and OEM attribute.
    pub page_protection: u8,
}

impl HpetTable {
    /// Parses an HPET table from the given physical address.
    ///
    /// # Errors
    ///
    /// [`AcpiError::InvalidSignature`] if the signature is not `HPET`,
    /// [`AcpiError::InvalidChecksum`] on a bad byte sum, and
    /// [`AcpiError::UnsupportedAddressSpace`] when the register block is not
    /// in system memory (the kernel only supports MMIO HPETs).
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        // SAFETY: the handler maps at least a header.
        let header_ptr = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
        // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
        let header = unsafe { SdtHeader::read_from(header_ptr) };

        if &header.signature() != HPET_SIGNATURE {
            return Err(AcpiError::InvalidSignature);
        }

        let total_len = header.length() as usize;

        // SAFETY: the handler maps the whole table.
        let table_ptr = unsafe { handler.map_physical_region(phys, total_len) };
        // SAFETY: table_ptr is valid for total_len bytes.
        let bytes = unsafe { core::slice::from_raw_parts(table_ptr, total_len) };
        if !crate::sdt::validate_checksum(bytes) {
            return Err(AcpiError::InvalidChecksum);
        }

        // SAFETY: the table is large enough for header + HPET fields.
        let raw: HpetRaw = unsafe { ptr::read_unaligned(table_ptr.add(SdtHeader::SIZE).cast()) };

        let base_address = raw.base_address;
        if base_address.address_space_id != GenericAddress::SPACE_SYSTEM_MEMORY {
            return Err(AcpiError::UnsupportedAddressSpace);
        }

        Ok(Self {
            event_timer_block_id: raw.event_timer_block_id,
            base_address,
            hpet_number: raw.hpet_number,
            minimum_tick: raw.minimum_tick,
            page_protection: raw.page_protection,
        })
    }

    /// Number of comparators in the block (1–32).
    #[must_use]
    pub fn num_comparators(&self) -> u8 {
        (((self.event_timer_block_id >> 8) & 0x1F) + 1) as u8
    }

    /// Whether the main counter is 64 bits wide.
    #[must_use]
    pub fn counter_64bit(&self) -> bool {
        self.event_timer_block_id & (1 << 13) != 0
    }

    /// Whether the block supports legacy-replacement interrupt routing.
    #[must_use]
    pub fn legacy_replacement_capable(&self) -> bool {
        self.event_timer_block_id & (1 << 15) != 0
    }

    /// PCI vendor ID of the HPET implementation.
    #[must_use]
    pub fn pci_vendor(&self) -> u16 {
        (self.event_timer_block_id >> 16) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, build_table};

    fn build_hpet(block_id: u32, space: u8, addr: u64) -> Vec<u8> {
        let mut p = vec![0u8; 20];
        p[0..4].copy_from_slice(&block_id.to_le_bytes());
        p[4] = space;
        p[8..16].copy_from_slice(&addr.to_le_bytes());
        p[16] = 0; // hpet number
        p[17..19].copy_from_slice(&0x80u16.to_le_bytes());
        build_table(HPET_SIGNATURE, &p)
    }

    #[test]
    fn capability_bits_decode() {
        // 3 comparators (encoded 2), 64-bit counter, legacy capable, vendor 0x8086.
        let id = (2u32 << 8) | (1 << 13) | (1 << 15) | (0x8086 << 16);
        let table = build_hpet(id, GenericAddress::SPACE_SYSTEM_MEMORY, 0xFED0_0000);
        let handler = BufferHandler(table);
        let hpet = HpetTable::parse(&handler, 0).unwrap();
        assert_eq!(hpet.num_comparators(), 3);
        assert!(hpet.counter_64bit());
        assert!(hpet.legacy_replacement_capable());
        assert_eq!(hpet.pci_vendor(), 0x8086);
        assert_eq!({ hpet.base_address.address }, 0xFED0_0000);
    }

    #[test]
    fn io_space_hpet_rejected() {
        let table = build_hpet(0, GenericAddress::SPACE_SYSTEM_IO, 0x400);
        let handler = BufferHandler(table);
        assert_eq!(
            HpetTable::parse(&handler, 0).unwrap_err(),
            AcpiError::UnsupportedAddressSpace
        );
    }
}
