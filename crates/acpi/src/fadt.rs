//! Fixed ACPI Description Table (FADT) parsing.
//!
//! The FADT carries the fixed hardware configuration the kernel needs for
//! power management: the DSDT address, the PM1a control block, and (for
//! revision ≥ 2 tables) the reset register and reset value.

use core::ptr;

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler, GenericAddress};

/// FADT table signature.
pub const FADT_SIGNATURE: &[u8; 4] = b"FACP";

/// Parsed FADT — only the fields the kernel consumes.
#[derive(Debug, Clone, Copy)]
pub struct Fadt {
    /// Physical address of the DSDT (32-bit field; the 64-bit `X_DSDT` is
    /// preferred when present and nonzero).
    pub dsdt_address: u64,
    /// SCI interrupt vector.
    pub sci_interrupt: u16,
    /// I/O port of the PM1a control block (`SLP_TYPx`/`SLP_EN` live here).
    pub pm1a_control_block: u32,
    /// I/O port of the PM Timer, or zero when absent.
    pub pm_timer_block: u32,
    /// Reset register description (revision ≥ 2, all-zero otherwise).
    pub reset_register: GenericAddress,
    /// Value to write into the reset register.
    pub reset_value: u8,
    /// Fixed feature flags.
    pub flags: u32,
}

impl Fadt {
    /// Byte offset of `dsdt` within the FADT.
    const DSDT_OFFSET: usize = 40;
    /// Byte offset of `sci_int`.
    const SCI_INT_OFFSET: usize = 46;
    /// Byte offset of `pm1a_cnt_blk`.
    const PM1A_CNT_OFFSET: usize = 64;
    /// Byte offset of `pm_tmr_blk`.
    const PM_TMR_OFFSET: usize = 76;
    /// Byte offset of `flags`.
    const FLAGS_OFFSET: usize = 112;
    /// Byte offset of the `reset_reg` Generic Address Structure.
    const RESET_REG_OFFSET: usize = 116;
    /// Byte offset of `reset_value`.
    const RESET_VALUE_OFFSET: usize = 128;
    /// Byte offset of the 64-bit `x_dsdt` field.
    const X_DSDT_OFFSET: usize = 140;

    /// Parses a FADT from the given physical address.
    ///
    /// Older (shorter) revisions yield zeroed reset fields rather than an
    /// error; `reboot` falls back to the keyboard controller in that case.
    ///
    /// # Errors
    ///
    /// [`AcpiError::InvalidSignature`] if the signature is not `FACP`,
    /// [`AcpiError::InvalidChecksum`] on a bad byte sum.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        // SAFETY: the handler maps at least a header.
        let header_ptr = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
        // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
        let header = unsafe { SdtHeader::read_from(header_ptr) };

        if &header.signature() != FADT_SIGNATURE {
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

        let mut dsdt_address = u64::from(read_or_zero::<u32>(bytes, Self::DSDT_OFFSET));
        let x_dsdt = read_or_zero::<u64>(bytes, Self::X_DSDT_OFFSET);
        if x_dsdt != 0 {
            dsdt_address = x_dsdt;
        }

        Ok(Self {
            dsdt_address,
            sci_interrupt: read_or_zero(bytes, Self::SCI_INT_OFFSET),
            pm1a_control_block: read_or_zero(bytes, Self::PM1A_CNT_OFFSET),
            pm_timer_block: read_or_zero(bytes, Self::PM_TMR_OFFSET),
            reset_register: read_or_zero(bytes, Self::RESET_REG_OFFSET),
            reset_value: read_or_zero(bytes, Self::RESET_VALUE_OFFSET),
            flags: read_or_zero(bytes, Self::FLAGS_OFFSET),
        })
    }

    /// Whether the table describes a usable reset register.
    #[must_use]
    pub fn has_reset_register(&self) -> bool {
        self.reset_register.address != 0
            && (self.reset_register.address_space_id == GenericAddress::SPACE_SYSTEM_MEMORY
                || self.reset_register.address_space_id == GenericAddress::SPACE_SYSTEM_IO)
    }
}

/// Reads a `T` at `offset`, or returns the all-zero value when the table is
/// too short (pre-2.0 FADTs are only 116 bytes).
fn read_or_zero<T: Copy + Zeroable>(bytes: &[u8], offset: usize) -> T {
    if offset + size_of::<T>() <= bytes.len() {
        // SAFETY: bounds checked above; reads are unaligned-tolerant.
        unsafe { ptr::read_unaligned(bytes.as_ptr().add(offset).cast::<T>()) }
    } else {
        T::ZERO
    }
}

/// Types with an all-zero default, used for short-table fallbacks.
trait Zeroable {
    /// The all-zero value.
    const ZERO: Self;
}

impl Zeroable for u8 {
    const ZERO: Self = 0;
}
impl Zeroable for u16 {
    const ZERO: Self = 0;
}
impl Zeroable for u32 {
    const ZERO: Self = 0;
}
impl Zeroable for u64 {
    const ZERO: Self = 0;
}
impl Zeroable for GenericAddress {
    const ZERO: Self = GenericAddress {
        address_space_id: 0,
        register_bit_width: 0,
        register_bit_offset: 0,
        access_size: 0,
        address: 0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufferHandler, build_table};

    /// Builds a revision-2-sized FADT payload with the fields we care about.
    fn build_fadt_payload() -> Vec<u8> {
        let mut p = vec![0u8; 148 - SdtHeader::SIZE];
        let at = |off: usize| off - SdtHeader::SIZE;
        p[at(40)..at(40) + 4].copy_from_slice(&0x7FE0_0000u32.to_le_bytes());
        p[at(46)..at(46) + 2].copy_from_slice(&9u16.to_le_bytes());
        p[at(64)..at(64) + 4].copy_from_slice(&0x604u32.to_le_bytes());
        // Reset register: system I/O, port 0xCF9, value 6.
        p[at(116)] = GenericAddress::SPACE_SYSTEM_IO;
        p[at(116) + 1] = 8;
        p[at(116) + 4..at(116) + 12].copy_from_slice(&0xCF9u64.to_le_bytes());
        p[at(128)] = 6;
        p
    }

    #[test]
    fn parses_power_fields() {
        let table = build_table(FADT_SIGNATURE, &build_fadt_payload());
        let handler = BufferHandler(table);
        let fadt = Fadt::parse(&handler, 0).unwrap();
        assert_eq!(fadt.dsdt_address, 0x7FE0_0000);
        assert_eq!(fadt.sci_interrupt, 9);
        assert_eq!(fadt.pm1a_control_block, 0x604);
        assert!(fadt.has_reset_register());
        assert_eq!({ fadt.reset_register.address }, 0xCF9);
        assert_eq!(fadt.reset_value, 6);
    }

    #[test]
    fn short_table_zeroes_reset_fields() {
        // ACPI 1.0 FADT: 116 bytes, no reset register.
        let table = build_table(FADT_SIGNATURE, &vec![0u8; 116 - SdtHeader::SIZE]);
        let handler = BufferHandler(table);
        let fadt = Fadt::parse(&handler, 0).unwrap();
        assert!(!fadt.has_reset_register());
        assert_eq!(fadt.reset_value, 0);
    }

    #[test]
    fn wrong_signature() {
        let table = build_table(b"APIC", &build_fadt_payload());
        let handler = BufferHandler(table);
        assert_eq!(
            Fadt::parse(&handler, 0).unwrap_err(),
            AcpiError::InvalidSignature
        );
    }
}
