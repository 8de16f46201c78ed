//! Device drivers: block devices (ATA, RAM disk), the PCnet NIC, and the
//! 16550 UART used by the serial log sink.

pub mod ata;
pub mod block;
pub mod pcnet;
pub mod ramdisk;
pub mod uart;

pub use block::{BlockDevice, BlockError, SECTOR_SIZE};

/// A DMA-reachable memory region.
///
/// On the target, DMA memory is identity-mapped so `phys == virt`; in tests
/// the two live in a fake arena where `phys` is an arena offset.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    /// CPU-visible address of the region.
    pub virt: *mut u8,
    /// Bus address programmed into the device.
    pub phys: u32,
    /// Region length in bytes.
    pub len: usize,
}

/// Allocates memory a bus-mastering device can reach.
pub trait DmaAllocator {
    /// Allocates `len` bytes of zeroed, 16-byte-aligned DMA memory.
    ///
    /// Regions live for the driver's lifetime; there is no free.
    fn alloc_dma(&mut self, len: usize) -> Option<DmaRegion>;
}

/// DMA allocation backed by identity-mapped pages from the VMM.
#[cfg(target_os = "none")]
pub struct IdentityDma;

#[cfg(target_os = "none")]
impl DmaAllocator for IdentityDma {
    fn alloc_dma(&mut self, len: usize) -> Option<DmaRegion> {
        let pages = len.div_ceil(crate::addr::PAGE_SIZE as usize);
        let virt = crate::mm::paging::allocate_pages(pages)?;
        let ptr = virt.as_u32() as usize as *mut u8;
        // SAFETY: allocate_pages returns exclusive mapped pages.
        unsafe { core::ptr::write_bytes(ptr, 0, pages * crate::addr::PAGE_SIZE as usize) };
        Some(DmaRegion {
            virt: ptr,
            // Identity mapping: the bus address equals the virtual address.
            phys: virt.as_u32(),
            len,
        })
    }
}
