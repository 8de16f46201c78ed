//! RSDT / XSDT child enumeration.
//!
//! The Root System Description Table (RSDT, 32-bit child pointers) and its
//! 64-bit counterpart (XSDT) list the physical addresses of every other ACPI
//! table. [`walk_children`] validates the root and yields each child address.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// RSDT table signature.
pub const RSDT_SIGNATURE: &[u8; 4] = b"RSDT";
/// XSDT table signature.
pub const XSDT_SIGNATURE: &[u8; 4] = b"XSDT";

/// Size in bytes of a single child pointer in the RSDT (32-bit).
const RSDT_ENTRY_SIZE: usize = 4;
/// Size in bytes of a single child pointer in the XSDT (64-bit).
const XSDT_ENTRY_SIZE: usize = 8;

/// Validates the RSDT/XSDT at `root_phys` and invokes `visit` with the
/// physical address of every child table.
///
/// The root's signature and full checksum are verified before any child is
/// visited; child validation is the caller's responsibility.
///
/// # Errors
///
/// [`AcpiError::InvalidSignature`] if the root is neither `RSDT` nor `XSDT`
/// (matching `is_xsdt`), [`AcpiError::InvalidChecksum`] if its byte sum is
/// nonzero.
pub fn walk_children(
    handler: &impl AcpiHandler,
    root_phys: u64,
    is_xsdt: bool,
    mut visit: impl FnMut(u64),
) -> Result<(), AcpiError> {
    // SAFETY: the handler maps at least a header.
    let header_ptr = unsafe { handler.map_physical_region(root_phys, SdtHeader::SIZE) };
    // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
    let header = unsafe { SdtHeader::read_from(header_ptr) };

    let expected = if is_xsdt { XSDT_SIGNATURE } else { RSDT_SIGNATURE };
    if &header.signature() != expected {
        return Err(AcpiError::InvalidSignature);
    }

    let total_len = header.length() as usize;
    if total_len < SdtHeader::SIZE {
        return Err(AcpiError::InvalidChecksum);
    }

    // SAFETY: the handler maps the whole table.
    let table_ptr = unsafe { handler.map_physical_region(root_phys, total_len) };
    // SAFETY: table_ptr is valid for total_len bytes.
    let bytes = unsafe { core::slice::from_raw_parts(table_ptr, total_len) };
    if !crate::sdt::validate_checksum(bytes) {
        return Err(AcpiError::InvalidChecksum);
    }

    let entry_size = if is_xsdt { XSDT_ENTRY_SIZE } else { RSDT_ENTRY_SIZE };
    let entries = &bytes[SdtHeader::SIZE..];

    for chunk in entries.chunks_exact(entry_size) {
        let child = if is_xsdt {
            // SAFETY: chunk is exactly 8 bytes.
            unsafe { ptr::read_unaligned(chunk.as_ptr().cast::<u64>()) }
        } else {
            // SAFETY: chunk is exactly 4 bytes.
            u64::from(unsafe { ptr::read_unaligned(chunk.as_ptr().cast::<u32>()) })
        };
        if child != 0 {
            visit(child);
        }
    }

    Ok(())
}
