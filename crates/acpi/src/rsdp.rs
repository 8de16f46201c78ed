//! Root System Description Pointer (RSDP) parsing and validation.
//!
//! The RSDP is the entry point into the ACPI table hierarchy. ACPI 1.0
//! defines a 20-byte structure ([`Rsdp`]); ACPI 2.0+ extends it to 36 bytes
//! ([`Rsdp2`]) with a 64-bit XSDT address and an extended checksum.

use core::ptr;

use crate::{AcpiError, AcpiHandler};

/// ACPI 1.0 RSDP — 20 bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp {
    /// Must be `b"RSD PTR "` (8 bytes, note the trailing space).
    pub signature: [u8; 8],
    /// Checksum covering the first 20 bytes.
    pub checksum: u8,
    /// OEM identification string.
    pub oem_id: [u8; 6],
    /// ACPI revision: 0 for ACPI 1.0, 2 for ACPI 2.0+.
    pub revision: u8,
    /// Physical address of the RSDT (32-bit).
    pub rsdt_address: u32,
}

impl Rsdp {
    /// Size of the ACPI 1.0 RSDP structure in bytes.
    pub const SIZE: usize = 20;

    /// Expected signature bytes.
    pub const SIGNATURE: &[u8; 8] = b"RSD PTR ";
}

/// ACPI 2.0+ RSDP extension — 36 bytes total.
///
/// The first 20 bytes are identical to [`Rsdp`]; the remainder carries the
/// 64-bit XSDT address and an extended checksum over all 36 bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp2 {
    /// The ACPI 1.0 portion.
    pub v1: Rsdp,
    /// Total length of this structure (should be 36).
    pub length: u32,
    /// Physical address of the XSDT (64-bit).
    pub xsdt_address: u64,
    /// Checksum covering the entire 36 bytes.
    pub extended_checksum: u8,
    /// Reserved bytes.
    pub reserved: [u8; 3],
}

impl Rsdp2 {
    /// Size of the ACPI 2.0 RSDP structure in bytes.
    pub const SIZE: usize = 36;
}

/// Parses and validates the RSDP at the given physical address.
///
/// Returns `(table_address, is_xsdt)`:
/// - ACPI 1.0, or a revision ≥ 2 with a zero XSDT address: the 32-bit RSDT
///   address and `false`.
/// - Revision ≥ 2 with a nonzero XSDT address: the 64-bit XSDT address and
///   `true`.
///
/// # Errors
///
/// [`AcpiError::InvalidRsdp`] on a bad signature, [`AcpiError::InvalidChecksum`]
/// on a bad 20-byte or 36-byte sum.
pub fn parse_rsdp(handler: &impl AcpiHandler, phys: u64) -> Result<(u64, bool), AcpiError> {
    // Map enough for the larger v2 structure; we need at least 20 bytes and
    // at most 36.
    // SAFETY: the handler maps the requested region.
    let ptr = unsafe { handler.map_physical_region(phys, Rsdp2::SIZE) };

    // SAFETY: ptr is valid for at least Rsdp::SIZE bytes.
    let v1: Rsdp = unsafe { ptr::read_unaligned(ptr.cast::<Rsdp>()) };

    if &v1.signature != Rsdp::SIGNATURE {
        return Err(AcpiError::InvalidRsdp);
    }

    // SAFETY: ptr is valid for 36 bytes, so 20 is fine.
    let v1_bytes = unsafe { core::slice::from_raw_parts(ptr, Rsdp::SIZE) };
    if !crate::sdt::validate_checksum(v1_bytes) {
        return Err(AcpiError::InvalidChecksum);
    }

    if v1.revision < 2 {
        return Ok((u64::from(v1.rsdt_address), false));
    }

    // Revision 2+: the full 36 bytes must also sum to zero.
    // SAFETY: ptr is valid for Rsdp2::SIZE bytes.
    let v2_bytes = unsafe { core::slice::from_raw_parts(ptr, Rsdp2::SIZE) };
    if !crate::sdt::validate_checksum(v2_bytes) {
        return Err(AcpiError::InvalidChecksum);
    }

    // SAFETY: ptr is valid and properly sized.
    let v2: Rsdp2 = unsafe { ptr::read_unaligned(ptr.cast::<Rsdp2>()) };
    if v2.xsdt_address != 0 {
        Ok((v2.xsdt_address, true))
    } else {
        // Some firmware leaves the XSDT pointer empty; fall back to the RSDT.
        Ok((u64::from(v1.rsdt_address), false))
    }
}
