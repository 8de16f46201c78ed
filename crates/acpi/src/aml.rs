//! Minimal AML scanning for the `_S5_` sleep-type package.
//!
//! A full AML interpreter is far out of scope; shutting the machine down only
//! needs the two SLP_TYP byte constants from the `_S5_` package, so this
//! module walks the DSDT byte-wise looking for the literal name and decodes
//! just enough of the package encoding that follows it.

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler};

/// AML opcode for `Package`.
const PACKAGE_OP: u8 = 0x12;
/// AML prefix for a byte constant.
const BYTE_PREFIX: u8 = 0x0A;
/// AML `Name` opcode, skipped between the name and the package.
const NAME_OP: u8 = 0x08;

/// The two sleep-type values extracted from the `_S5_` package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepTypes {
    /// `SLP_TYPa`, written to PM1a control.
    pub slp_typ_a: u8,
    /// `SLP_TYPb`, written to PM1b control (when present).
    pub slp_typ_b: u8,
}

/// Scans the DSDT at `dsdt_phys` for the `_S5_` package.
///
/// The DSDT checksum is validated before scanning.
///
/// # Errors
///
/// [`AcpiError::InvalidSignature`] if the table is not a DSDT,
/// [`AcpiError::InvalidChecksum`] on a bad byte sum, and
/// [`AcpiError::NotFound`] when no decodable `_S5_` package exists.
pub fn find_s5(handler: &impl AcpiHandler, dsdt_phys: u64) -> Result<SleepTypes, AcpiError> {
    // SAFETY: the handler maps at least a header.
    let header_ptr = unsafe { handler.map_physical_region(dsdt_phys, SdtHeader::SIZE) };
    // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
    let header = unsafe { SdtHeader::read_from(header_ptr) };

    if &header.signature() != b"DSDT" {
        return Err(AcpiError::InvalidSignature);
    }

    let total_len = header.length() as usize;
    // SAFETY: the handler maps the whole table.
    let table_ptr = unsafe { handler.map_physical_region(dsdt_phys, total_len) };
    // SAFETY: table_ptr is valid for total_len bytes.
    let bytes = unsafe { core::slice::from_raw_parts(table_ptr, total_len) };
    if !crate::sdt::validate_checksum(bytes) {
        return Err(AcpiError::InvalidChecksum);
    }

    scan_s5(&bytes[SdtHeader::SIZE..]).ok_or(AcpiError::NotFound)
}

/// Scans raw AML bytes for `_S5_` followed by a Package of byte constants.
#[must_use]
pub fn scan_s5(aml: &[u8]) -> Option<SleepTypes> {
    let mut i = 0;
    while i + 4 <= aml.len() {
        if &aml[i..i + 4] != b"_S5_" {
            i += 1;
            continue;
        }

        if let Some(types) = decode_package(&aml[i + 4..]) {
            return Some(types);
        }
        i += 4;
    }
    None
}

/// Decodes `Package { SLP_TYPa, SLP_TYPb, ... }` starting right after the
/// `_S5_` name. Returns `None` when the bytes do not form such a package.
fn decode_package(bytes: &[u8]) -> Option<SleepTypes> {
    let mut j = 0;

    // Skip NameOp / padding bytes between the name and the package.
    while j < bytes.len() && (bytes[j] == 0x00 || bytes[j] == NAME_OP) {
        j += 1;
    }

    if bytes.get(j) != Some(&PACKAGE_OP) {
        return None;
    }
    j += 1;

    // PkgLength: the top two bits of the lead byte give the number of
    // following length bytes (0-3); the length value itself is irrelevant.
    let lead = *bytes.get(j)?;
    j += 1 + usize::from(lead >> 6);

    let num_elements = *bytes.get(j)?;
    if num_elements < 2 {
        return None;
    }
    j += 1;

    let mut read_byte_const = |j: &mut usize| -> Option<u8> {
        let b = *bytes.get(*j)?;
        if b == BYTE_PREFIX {
            let v = *bytes.get(*j + 1)?;
            *j += 2;
            Some(v)
        } else {
            *j += 1;
            Some(b)
        }
    };

    let slp_typ_a = read_byte_const(&mut j)?;
    let slp_typ_b = read_byte_const(&mut j)?;

    Some(SleepTypes { slp_typ_a, slp_typ_b })
}
