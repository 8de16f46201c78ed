//! PCI Express Memory-Mapped Configuration (MCFG) table parsing.
//!
//! The MCFG table lists the ECAM base address for each PCI segment group and
//! the bus range it decodes.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// MCFG table signature.
pub const MCFG_SIGNATURE: &[u8; 4] = b"MCFG";

/// A single MCFG configuration space entry.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct McfgEntry {
    /// Base physical address of the enhanced configuration mechanism.
    pub base_address: u64,
    /// PCI segment group number.
    pub segment_group: u16,
    /// First PCI bus number decoded by this entry.
    pub start_bus: u8,
    /// Last PCI bus number decoded by this entry.
    pub end_bus: u8,
    /// Reserved.
    _reserved: u32,
}

impl McfgEntry {
    /// Size of a single MCFG entry in bytes.
    pub const SIZE: usize = 16;
}

/// Parsed MCFG table.
#[derive(Debug)]
pub struct Mcfg {
    /// Pointer to the first [`McfgEntry`] in the mapped table.
    entries_ptr: *const u8,
    /// Number of entries.
    entry_count: usize,
}

impl Mcfg {
    /// Size of the reserved field between the SDT header and the entries.
    const RESERVED_SIZE: usize = 8;

    /// Parses an MCFG table from the given physical address.
    ///
    /// # Errors
    ///
    /// [`AcpiError::InvalidSignature`] if the signature is not `MCFG`,
    /// [`AcpiError::InvalidChecksum`] on a bad byte sum.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        // SAFETY: the handler maps at least a header.
        let header_ptr = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
        // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
        let header = unsafe { SdtHeader::read_from(header_ptr) };

        if &header.signature() != MCFG_SIGNATURE {
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

        let entries_offset = SdtHeader::SIZE + Self::RESERVED_SIZE;
        let entries_len = total_len.saturating_sub(entries_offset);
        let entry_count = entries_len / McfgEntry::SIZE;

        // SAFETY: entries_offset is within the mapped region.
        let entries_ptr = unsafe { table_ptr.add(entries_offset) };

        Ok(Self {
            entries_ptr,
            entry_count,
        })
    }

    /// Returns an iterator over the configuration space entries.
    #[must_use]
    pub fn entries(&self) -> McfgEntryIter {
        McfgEntryIter {
            ptr: self.entries_ptr,
            remaining: self.entry_count,
        }
    }

    /// Returns the ECAM base covering bus 0 of segment 0, if any.
    #[must_use]
    pub fn segment0_base(&self) -> Option<McfgEntry> {
        self.entries()
            .find(|e| e.segment_group == 0 && e.start_bus == 0)
    }
}

/// Iterator over MCFG configuration space entries.
pub struct McfgEntryIter {
    ptr: *const u8,
    remaining: usize,
}

impl Iterator for McfgEntryIter {
    type Item = McfgEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        // SAFETY: the parser sized the region for entry_count entries.
        let entry = unsafe { ptr::read_unaligned(self.ptr.cast::<McfgEntry>()) };
        // SAFETY: advancing within the valid entry region.
        self.ptr = unsafe { self.ptr.add(McfgEntry::SIZE) };
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for McfgEntryIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, build_table};

    #[test]
    fn parses_segment_entries() {
        let mut p = vec![0u8; 8]; // reserved
        p.extend_from_slice(&0xE000_0000u64.to_le_bytes());
        p.extend_from_slice(&0u16.to_le_bytes());
        p.push(0); // start bus
        p.push(255); // end bus
        p.extend_from_slice(&0u32.to_le_bytes());
        let table = build_table(MCFG_SIGNATURE, &p);
        let handler = BufferHandler(table);

        let mcfg = Mcfg::parse(&handler, 0).unwrap();
        let entry = mcfg.segment0_base().unwrap();
        assert_eq!({ entry.base_address }, 0xE000_0000);
        assert_eq!(entry.start_bus, 0);
        assert_eq!(entry.end_bus, 255);
    }
}
