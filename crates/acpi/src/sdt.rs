//! System Description Table (SDT) header and checksum utilities.

use core::ptr;

/// Standard ACPI System Description Table header.
///
/// This 36-byte header is present at the start of every ACPI table
/// (RSDT, XSDT, MADT, HPET, FADT, MCFG, DSDT, etc.).
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct SdtHeader {
    /// 4-byte ASCII signature identifying the table type.
    pub signature: [u8; 4],
    /// Total length of the table, including the header, in bytes.
    pub length: u32,
    /// Revision of the table structure.
    pub revision: u8,
    /// Checksum byte. The entire table, including the header, must sum to zero.
    pub checksum: u8,
    /// OEM-supplied identification string.
    pub oem_id: [u8; 6],
    /// OEM-supplied table identification string.
    pub oem_table_id: [u8; 8],
    /// OEM-supplied revision number.
    pub oem_revision: u32,
    /// Vendor ID of the utility that created the table.
    pub creator_id: u32,
    /// Revision of the utility that created the table.
    pub creator_revision: u32,
}

impl SdtHeader {
    /// The size of an SDT header in bytes.
    pub const SIZE: usize = 36;

    /// Reads an [`SdtHeader`] from a raw mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for [`SdtHeader::SIZE`] bytes.
    #[must_use]
    pub unsafe fn read_from(ptr: *const u8) -> Self {
        // SAFETY: caller guarantees the region; the header may be unaligned.
        unsafe { ptr::read_unaligned(ptr.cast::<Self>()) }
    }

    /// Returns the 4-byte signature.
    #[must_use]
    pub fn signature(&self) -> [u8; 4] {
        self.signature
    }

    /// Returns the total length of this table (header included).
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }
}

/// Validates the checksum of a table.
///
/// ACPI tables are designed so that the sum of all bytes in the table equals
/// zero (mod 256). Returns `true` when the checksum is valid.
#[must_use]
pub fn validate_checksum(data: &[u8]) -> bool {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_law() {
        // A table validates iff its byte sum is 0 mod 256.
        let mut table = vec![1u8, 2, 3, 4];
        assert!(!validate_checksum(&table));
        let sum: u8 = table.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        table.push(0u8.wrapping_sub(sum));
        assert!(validate_checksum(&table));
    }

    #[test]
    fn empty_slice_validates() {
        assert!(validate_checksum(&[]));
    }

    #[test]
    fn header_roundtrip() {
        let table = crate::testutil::build_table(b"TEST", &[0xAA; 4]);
        // SAFETY: the buffer holds a full header.
        let header = unsafe { SdtHeader::read_from(table.as_ptr()) };
        assert_eq!(&header.signature(), b"TEST");
        assert_eq!(header.length() as usize, table.len());
        assert!(validate_checksum(&table));
    }
}
