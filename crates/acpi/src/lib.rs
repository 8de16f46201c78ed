//! ACPI table discovery and parsing for the Palmyra kernel.
//!
//! This crate is pure table traversal: it validates the RSDP, walks the
//! RSDT/XSDT child array, checks every table's checksum, and exposes typed
//! views of the tables the kernel consumes (MADT, FADT, HPET, MCFG) plus a
//! byte-wise DSDT scan for the `_S5_` sleep package.
//!
//! Physical memory access goes through the [`AcpiHandler`] trait so the crate
//! has no dependency on the kernel's paging code and is fully testable on the
//! host with synthetic tables.

#![cfg_attr(not(test), no_std)]

pub mod aml;
pub mod fadt;
pub mod hpet;
pub mod madt;
pub mod mcfg;
pub mod rsdp;
pub mod rsdt;
pub mod sdt;

pub use fadt::Fadt;
pub use hpet::HpetTable;
pub use madt::Madt;
pub use mcfg::Mcfg;
pub use rsdp::parse_rsdp;
pub use sdt::SdtHeader;

/// Errors produced while locating or validating ACPI tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// The RSDP signature or checksum is wrong.
    InvalidRsdp,
    /// An RSDP revision this crate does not understand.
    InvalidRevision,
    /// A table's byte sum is not zero modulo 256.
    InvalidChecksum,
    /// A table's 4-byte signature does not match the expected one.
    InvalidSignature,
    /// No table with the requested signature exists.
    NotFound,
    /// A Generic Address Structure uses an address space we cannot access.
    UnsupportedAddressSpace,
}

/// Maps physical memory regions on behalf of the parser.
///
/// The kernel implements this on top of its paging code; tests implement it
/// over a plain byte buffer where "physical address" means buffer offset.
pub trait AcpiHandler {
    /// Maps `len` bytes of physical memory starting at `phys` and returns a
    /// pointer to the mapping.
    ///
    /// # Safety
    ///
    /// The caller must only dereference the returned pointer within
    /// `len` bytes. Implementations must keep the mapping valid for the
    /// lifetime of `self`.
    unsafe fn map_physical_region(&self, phys: u64, len: usize) -> *const u8;
}

/// Maximum number of child tables remembered from the RSDT/XSDT walk.
const MAX_TABLES: usize = 32;

/// The validated ACPI table set, indexed by signature.
///
/// Built once at boot by [`AcpiTables::parse`]; immutable afterwards. Tables
/// whose checksum fails are discarded during the walk (the caller is expected
/// to log a warning per [`AcpiTables::discarded`]).
#[derive(Debug)]
pub struct AcpiTables {
    /// `(signature, physical address)` of every table that validated.
    entries: [Option<([u8; 4], u64)>; MAX_TABLES],
    /// Number of valid entries.
    count: usize,
    /// Number of children dropped because their checksum failed.
    discarded: usize,
    /// Whether the walk came from an XSDT (64-bit children).
    from_xsdt: bool,
}

impl AcpiTables {
    /// Walks the RSDT or XSDT at `root_phys` and indexes every child whose
    /// checksum validates.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidChecksum`] if the root table itself fails
    /// validation, or [`AcpiError::InvalidSignature`] if its signature is
    /// neither `RSDT` nor `XSDT`.
    pub fn parse(
        handler: &impl AcpiHandler,
        root_phys: u64,
        is_xsdt: bool,
    ) -> Result<Self, AcpiError> {
        let mut tables = Self {
            entries: [None; MAX_TABLES],
            count: 0,
            discarded: 0,
            from_xsdt: is_xsdt,
        };

        rsdt::walk_children(handler, root_phys, is_xsdt, |child_phys| {
            // SAFETY: child_phys came out of a validated RSDT/XSDT entry and
            // the handler maps at least a full SDT header.
            let header_ptr = unsafe { handler.map_physical_region(child_phys, SdtHeader::SIZE) };
            // SAFETY: header_ptr is valid for SdtHeader::SIZE bytes.
            let header = unsafe { SdtHeader::read_from(header_ptr) };

            let len = header.length() as usize;
            if len < SdtHeader::SIZE {
                tables.discarded += 1;
                return;
            }

            // SAFETY: the handler maps the entire table as described by its
            // own length field.
            let table_ptr = unsafe { handler.map_physical_region(child_phys, len) };
            // SAFETY: table_ptr is valid for len bytes.
            let bytes = unsafe { core::slice::from_raw_parts(table_ptr, len) };
            if !sdt::validate_checksum(bytes) {
                tables.discarded += 1;
                return;
            }

            if tables.count < MAX_TABLES {
                tables.entries[tables.count] = Some((header.signature(), child_phys));
                tables.count += 1;
            }
        })?;

        Ok(tables)
    }

    /// Returns the physical address of the first table matching `signature`.
    #[must_use]
    pub fn find_table(&self, signature: &[u8; 4]) -> Option<u64> {
        self.entries[..self.count]
            .iter()
            .flatten()
            .find(|(sig, _)| sig == signature)
            .map(|&(_, phys)| phys)
    }

    /// Number of tables that validated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no table validated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of children discarded due to checksum failure.
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Whether the index was built from an XSDT.
    #[must_use]
    pub fn from_xsdt(&self) -> bool {
        self.from_xsdt
    }

    /// Parses the MADT, if present.
    ///
    /// # Errors
    ///
    /// [`AcpiError::NotFound`] when the table is absent; parse errors from
    /// [`Madt::parse`] otherwise.
    pub fn madt(&self, handler: &impl AcpiHandler) -> Result<Madt, AcpiError> {
        let phys = self
            .find_table(madt::MADT_SIGNATURE)
            .ok_or(AcpiError::NotFound)?;
        Madt::parse(handler, phys)
    }

    /// Parses the FADT, if present.
    ///
    /// # Errors
    ///
    /// [`AcpiError::NotFound`] when the table is absent; parse errors from
    /// [`Fadt::parse`] otherwise.
    pub fn fadt(&self, handler: &impl AcpiHandler) -> Result<Fadt, AcpiError> {
        let phys = self
            .find_table(fadt::FADT_SIGNATURE)
            .ok_or(AcpiError::NotFound)?;
        Fadt::parse(handler, phys)
    }

    /// Parses the HPET table, if present.
    ///
    /// # Errors
    ///
    /// [`AcpiError::NotFound`] when the table is absent; parse errors from
    /// [`HpetTable::parse`] otherwise.
    pub fn hpet(&self, handler: &impl AcpiHandler) -> Result<HpetTable, AcpiError> {
        let phys = self
            .find_table(hpet::HPET_SIGNATURE)
            .ok_or(AcpiError::NotFound)?;
        HpetTable::parse(handler, phys)
    }

    /// Parses the MCFG table, if present.
    ///
    /// # Errors
    ///
    /// [`AcpiError::NotFound`] when the table is absent; parse errors from
    /// [`Mcfg::parse`] otherwise.
    pub fn mcfg(&self, handler: &impl AcpiHandler) -> Result<Mcfg, AcpiError> {
        let phys = self
            .find_table(mcfg::MCFG_SIGNATURE)
            .ok_or(AcpiError::NotFound)?;
        Mcfg::parse(handler, phys)
    }
}

/// A Generic Address Structure (GAS) as used by the FADT and HPET tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct GenericAddress {
    /// Address space: 0 = system memory, 1 = system I/O.
    pub address_space_id: u8,
    /// Register width in bits.
    pub register_bit_width: u8,
    /// Register offset in bits.
    pub register_bit_offset: u8,
    /// Access size hint.
    pub access_size: u8,
    /// Address within the given address space.
    pub address: u64,
}

impl GenericAddress {
    /// Address space id for system memory.
    pub const SPACE_SYSTEM_MEMORY: u8 = 0;
    /// Address space id for system I/O ports.
    pub const SPACE_SYSTEM_IO: u8 = 1;
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared helpers for building synthetic ACPI tables in host tests.

    use super::AcpiHandler;

    /// An [`AcpiHandler`] over a flat byte buffer: "physical address" is a
    /// plain offset into the buffer.
    pub struct BufferHandler(pub Vec<u8>);

    impl AcpiHandler for BufferHandler {
        unsafe fn map_physical_region(&self, phys: u64, len: usize) -> *const u8 {
            assert!(
                (phys as usize) + len <= self.0.len(),
                "mapping past end of test buffer"
            );
            // SAFETY: bounds asserted above.
            unsafe { self.0.as_ptr().add(phys as usize) }
        }
    }

    /// Fills in the checksum byte (offset 9 of an SDT header) so the whole
    /// table sums to zero.
    pub fn fix_checksum(table: &mut [u8]) {
        table[9] = 0;
        let sum: u8 = table.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        table[9] = 0u8.wrapping_sub(sum);
    }

    /// Builds a minimal SDT with the given signature and payload appended
    /// after the 36-byte header, checksum fixed.
    pub fn build_table(signature: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let len = 36 + payload.len();
        let mut table = vec![0u8; len];
        table[0..4].copy_from_slice(signature);
        table[4..8].copy_from_slice(&(len as u32).to_le_bytes());
        table[8] = 1; // revision
        table[10..16].copy_from_slice(b"PALMYR");
        table[36..].copy_from_slice(payload);
        fix_checksum(&mut table);
        table
    }
}
