//! Multiple APIC Description Table (MADT) parsing.
//!
//! The MADT describes the interrupt controller topology: local APICs,
//! I/O APICs, and interrupt source overrides. The kernel core only needs the
//! local APIC address and the entry walk.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// MADT table signature (`b"APIC"`).
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// Raw MADT fields that follow the SDT header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct MadtHeaderFields {
    local_apic_address: u32,
    flags: u32,
}

/// Parsed MADT table.
pub struct Madt {
    /// Physical address of the local APIC.
    pub local_apic_address: u32,
    /// MADT flags (bit 0: dual 8259 PICs installed).
    pub flags: u32,
    /// Pointer to the start of the entry array.
    entries_ptr: *const u8,
    /// Total length of the entry data in bytes.
    entries_len: usize,
}

impl Madt {
    /// Size of the fixed MADT fields after the SDT header.
    const FIELDS_SIZE: usize = 8;

    /// Parses a MADT from the given physical address.
    ///
    /// # Errors
    ///
    /// [`AcpiError::InvalidSignature`] if the signature is not `APIC`,
    /// [`AcpiError::InvalidChecksum`] on a bad byte sum.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        // SAFETY: the handler maps at least a header.
        let header_ptr = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
        // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
        let header = unsafe { SdtHeader::read_from(header_ptr) };

        if &header.signature() != MADT_SIGNATURE {
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

        // SAFETY: the table is at least SdtHeader::SIZE + FIELDS_SIZE bytes.
        let fields: MadtHeaderFields =
            unsafe { ptr::read_unaligned(table_ptr.add(SdtHeader::SIZE).cast()) };

        let entries_offset = SdtHeader::SIZE + Self::FIELDS_SIZE;
        let entries_len = total_len.saturating_sub(entries_offset);
        // SAFETY: entries_offset ≤ total_len.
        let entries_ptr = unsafe { table_ptr.add(entries_offset) };

        Ok(Self {
            local_apic_address: fields.local_apic_address,
            flags: fields.flags,
            entries_ptr,
            entries_len,
        })
    }

    /// Returns an iterator over the interrupt controller entries.
    #[must_use]
    pub fn entries(&self) -> MadtEntryIter {
        MadtEntryIter {
            ptr: self.entries_ptr,
            remaining: self.entries_len,
        }
    }
}

/// A single MADT interrupt controller entry, minimally decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MadtEntry {
    /// Entry type byte (0 = local APIC, 1 = I/O APIC, 2 = override, …).
    pub entry_type: u8,
    /// Entry length including the 2-byte entry header.
    pub length: u8,
}

/// Iterator over MADT entries.
pub struct MadtEntryIter {
    ptr: *const u8,
    remaining: usize,
}

impl Iterator for MadtEntryIter {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining < 2 {
            return None;
        }
        // SAFETY: at least 2 bytes remain in the mapped entry region.
        let (entry_type, length) = unsafe { (self.ptr.read(), self.ptr.add(1).read()) };
        if length < 2 || usize::from(length) > self.remaining {
            // Malformed entry; stop rather than walk off the table.
            self.remaining = 0;
            return None;
        }
        // SAFETY: length bytes remain.
        self.ptr = unsafe { self.ptr.add(usize::from(length)) };
        self.remaining -= usize::from(length);
        Some(MadtEntry { entry_type, length })
    }
}
