//! Volatile MMIO accessors.
//!
//! Thin wrappers so device code reads as `mmio::read32(base, REG)` instead of
//! raw pointer arithmetic at every call site. Addresses are `usize` so the
//! helpers also work in host tests against heap-backed register blocks.

/// Reads a 32-bit register at `base + offset`.
///
/// # Safety
///
/// `base + offset` must be a mapped, device-backed (or test-backed) address
/// valid for a 4-byte volatile read.
#[inline]
#[must_use]
pub unsafe fn read32(base: usize, offset: usize) -> u32 {
    // SAFETY: caller contract.
    unsafe { ((base + offset) as *const u32).read_volatile() }
}

/// Writes a 32-bit register at `base + offset`.
///
/// # Safety
///
/// As [`read32`], for a 4-byte volatile write.
#[inline]
pub unsafe fn write32(base: usize, offset: usize, value: u32) {
    // SAFETY: caller contract.
    unsafe { ((base + offset) as *mut u32).write_volatile(value) }
}

/// Reads a 64-bit register at `base + offset`.
///
/// # Safety
///
/// As [`read32`], for an 8-byte volatile read.
#[inline]
#[must_use]
pub unsafe fn read64(base: usize, offset: usize) -> u64 {
    // SAFETY: caller contract.
    unsafe { ((base + offset) as *const u64).read_volatile() }
}

/// Writes a 64-bit register at `base + offset`.
///
/// # Safety
///
/// As [`read32`], for an 8-byte volatile write.
#[inline]
pub unsafe fn write64(base: usize, offset: usize, value: u64) {
    // SAFETY: caller contract.
    unsafe { ((base + offset) as *mut u64).write_volatile(value) }
}
