//! Two-level x86 paging.
//!
//! A [`PageDirectory`] is the hardware 1024-slot top-level table; each
//! present slot points at a [`PageTable`] mapping a 4 MiB range. Page tables
//! are created lazily on the first mapping into their range. The kernel
//! directory is process-wide; user directories share the kernel half (the
//! upper 1 GiB, directory slots 768..1024) by copying the kernel's slot
//! values, so the underlying page tables are shared by reference and never
//! duplicated.
//!
//! Table frames are produced and resolved through the [`TableBacking`] trait:
//! on the target the backing is the frame allocator plus identity mapping, in
//! tests it is a fake arena. This keeps every mapping operation host-testable.

use bitflags::bitflags;

use palmyra_core::sync::SpinLock;

use crate::addr::{PAGE_SIZE, PhysAddr, VirtAddr};

bitflags! {
    /// x86 page table / directory entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Entry is present.
        const PRESENT = 1 << 0;
        /// Writes allowed.
        const WRITABLE = 1 << 1;
        /// User-mode access allowed.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled (device memory).
        const NO_CACHE = 1 << 4;
        /// Set by hardware on access.
        const ACCESSED = 1 << 5;
        /// Set by hardware on write.
        const DIRTY = 1 << 6;
        /// 4 MiB page (directory entries only).
        const HUGE = 1 << 7;
    }
}

/// First directory slot of the kernel half (3 GiB split).
pub const KERNEL_SPLIT_SLOT: usize = 768;

/// Number of entries in a directory or table.
pub const ENTRY_COUNT: usize = 1024;

/// A single page directory / page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// An empty (non-present) entry.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether the entry is present.
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// The physical frame this entry points at.
    #[must_use]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & !(PAGE_SIZE - 1))
    }

    /// The flag bits.
    #[must_use]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Points the entry at `frame` with `flags`.
    pub fn set(&mut self, frame: PhysAddr, flags: PageFlags) {
        debug_assert!(frame.is_page_aligned());
        self.0 = frame.as_u32() | flags.bits();
    }

    /// Clears the entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 4 KiB-aligned array of 1024 entries — both levels use the same layout.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The entries.
    pub entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); ENTRY_COUNT],
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces and resolves the physical frames that back page tables.
pub trait TableBacking {
    /// Allocates a zeroed 4 KiB frame for a page table.
    fn alloc_table(&mut self) -> Option<PhysAddr>;

    /// Returns a frame allocated by [`alloc_table`](Self::alloc_table).
    fn free_table(&mut self, frame: PhysAddr);

    /// Resolves a table frame to a usable pointer.
    ///
    /// On the target, table frames are identity-mapped so this is a cast; in
    /// tests it looks the frame up in the fake arena.
    fn table_ptr(&mut self, frame: PhysAddr) -> *mut PageTable;
}

/// Errors from mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame allocator is exhausted.
    OutOfMemory,
    /// The virtual page is already mapped.
    AlreadyMapped,
    /// The virtual page is not mapped.
    NotMapped,
}

/// A per-process page directory.
pub struct PageDirectory {
    /// Frame holding the hardware directory table.
    dir_frame: PhysAddr,
}

impl PageDirectory {
    /// Allocates an empty directory.
    pub fn new(backing: &mut impl TableBacking) -> Option<Self> {
        let dir_frame = backing.alloc_table()?;
        Some(Self { dir_frame })
    }

    /// Allocates a user directory sharing the kernel half of `kernel_dir`.
    ///
    /// The kernel's directory slots 768..1024 are copied by value, so both
    /// directories reference the same kernel page tables.
    pub fn new_user(backing: &mut impl TableBacking, kernel_dir: &Self) -> Option<Self> {
        let dir = Self::new(backing)?;
        let src = backing.table_ptr(kernel_dir.dir_frame);
        let dst = backing.table_ptr(dir.dir_frame);
        for slot in KERNEL_SPLIT_SLOT..ENTRY_COUNT {
            // SAFETY: both frames came from alloc_table and hold PageTables.
            unsafe {
                (*dst).entries[slot] = (*src).entries[slot];
            }
        }
        Some(dir)
    }

    /// The physical address of the directory table (the CR3 value).
    #[must_use]
    pub fn frame(&self) -> PhysAddr {
        self.dir_frame
    }

    /// Maps `virt` to `phys` with `flags`, creating the page table lazily.
    ///
    /// # Errors
    ///
    /// [`MapError::AlreadyMapped`] when the page is taken,
    /// [`MapError::OutOfMemory`] when a needed page table cannot be
    /// allocated.
    pub fn map(
        &mut self,
        backing: &mut impl TableBacking,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let dir = backing.table_ptr(self.dir_frame);
        let slot = virt.directory_index();

        // SAFETY: dir_frame holds a PageTable for the directory's lifetime.
        let dir_entry = unsafe { &mut (*dir).entries[slot] };

        let table_frame = if dir_entry.is_present() {
            dir_entry.addr()
        } else {
            let frame = backing.alloc_table().ok_or(MapError::OutOfMemory)?;
            // Directory entries stay permissive; per-page flags restrict.
            let mut dir_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
            if flags.contains(PageFlags::USER) {
                dir_flags |= PageFlags::USER;
            }
            dir_entry.set(frame, dir_flags);
            frame
        };

        let table = backing.table_ptr(table_frame);
        // SAFETY: table_frame was written by us and holds a PageTable.
        let entry = unsafe { &mut (*table).entries[virt.table_index()] };
        if entry.is_present() {
            return Err(MapError::AlreadyMapped);
        }
        entry.set(phys, flags | PageFlags::PRESENT);
        Ok(())
    }

    /// Unmaps `virt`, returning the frame it pointed at.
    ///
    /// # Errors
    ///
    /// [`MapError::NotMapped`] when the page is not present.
    pub fn unmap(
        &mut self,
        backing: &mut impl TableBacking,
        virt: VirtAddr,
    ) -> Result<PhysAddr, MapError> {
        let dir = backing.table_ptr(self.dir_frame);
        // SAFETY: dir_frame holds a PageTable.
        let dir_entry = unsafe { (*dir).entries[virt.directory_index()] };
        if !dir_entry.is_present() {
            return Err(MapError::NotMapped);
        }

        let table = backing.table_ptr(dir_entry.addr());
        // SAFETY: present directory entries point at PageTables.
        let entry = unsafe { &mut (*table).entries[virt.table_index()] };
        if !entry.is_present() {
            return Err(MapError::NotMapped);
        }
        let frame = entry.addr();
        entry.clear();
        Ok(frame)
    }

    /// Translates `virt` to the mapped physical address, if any.
    pub fn translate(&self, backing: &mut impl TableBacking, virt: VirtAddr) -> Option<PhysAddr> {
        let dir = backing.table_ptr(self.dir_frame);
        // SAFETY: dir_frame holds a PageTable.
        let dir_entry = unsafe { (*dir).entries[virt.directory_index()] };
        if !dir_entry.is_present() {
            return None;
        }
        let table = backing.table_ptr(dir_entry.addr());
        // SAFETY: present directory entries point at PageTables.
        let entry = unsafe { (*table).entries[virt.table_index()] };
        if !entry.is_present() {
            return None;
        }
        Some(PhysAddr::new(entry.addr().as_u32() | virt.page_offset()))
    }

    /// Loads this directory into CR3.
    ///
    /// # Safety
    ///
    /// The directory must map the currently executing code and stack.
    #[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), target_os = "none"))]
    pub unsafe fn activate(&self) {
        // SAFETY: caller contract.
        unsafe {
            core::arch::asm!(
                "mov cr3, {frame}",
                frame = in(reg) self.dir_frame.as_u32() as usize,
                options(nostack, preserves_flags),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel identity backing + DMA page allocation
// ---------------------------------------------------------------------------

/// Table backing for the kernel: frames come from the global PMM and are
/// identity-mapped, so resolving a table frame is a cast.
#[cfg(target_os = "none")]
pub struct IdentityBacking;

#[cfg(target_os = "none")]
impl TableBacking for IdentityBacking {
    fn alloc_table(&mut self) -> Option<PhysAddr> {
        let frame = crate::mm::pmm::with_frame_allocator(|pmm| pmm.allocate_frame())?;
        // SAFETY: the frame is identity-mapped during early boot.
        unsafe {
            core::ptr::write_bytes(frame.as_u32() as *mut u8, 0, PAGE_SIZE as usize);
        }
        Some(frame)
    }

    fn free_table(&mut self, frame: PhysAddr) {
        let _ = crate::mm::pmm::with_frame_allocator(|pmm| pmm.free_frame(frame));
    }

    fn table_ptr(&mut self, frame: PhysAddr) -> *mut PageTable {
        frame.as_u32() as usize as *mut PageTable
    }
}

/// The kernel's page directory.
static KERNEL_DIR: SpinLock<Option<PageDirectory>> = SpinLock::new(None);

/// Installs the kernel page directory. Called exactly once at boot.
///
/// # Panics
///
/// Panics when called twice.
pub fn init_kernel_directory(dir: PageDirectory) {
    let mut guard = KERNEL_DIR.lock();
    assert!(guard.is_none(), "kernel page directory already initialized");
    *guard = Some(dir);
}

/// Executes a closure with the kernel page directory.
///
/// # Panics
///
/// Panics before [`init_kernel_directory`] has run.
pub fn with_kernel_directory<R>(f: impl FnOnce(&mut PageDirectory) -> R) -> R {
    let mut guard = KERNEL_DIR.lock();
    f(guard.as_mut().expect("kernel page directory not initialized"))
}

/// Allocates `count` contiguous frames and identity-maps them into kernel
/// space, returning the (equal) virtual base. Used exclusively for DMA-safe
/// buffers; returns `None` on exhaustion, which callers treat as
/// out-of-memory.
#[cfg(target_os = "none")]
pub fn allocate_pages(count: usize) -> Option<VirtAddr> {
    let base = crate::mm::pmm::with_frame_allocator(|pmm| pmm.allocate_frames(count))?;

    let mut backing = IdentityBacking;
    let result = with_kernel_directory(|dir| {
        for i in 0..count {
            let addr = base.as_u32() + i as u32 * PAGE_SIZE;
            match dir.map(
                &mut backing,
                VirtAddr::new(addr),
                PhysAddr::new(addr),
                PageFlags::PRESENT | PageFlags::WRITABLE,
            ) {
                Ok(()) | Err(MapError::AlreadyMapped) => {}
                Err(_) => return None,
            }
        }
        Some(VirtAddr::new(base.as_u32()))
    });

    if result.is_none() {
        let _ = crate::mm::pmm::with_frame_allocator(|pmm| pmm.free_frames(base, count));
    }
    result
}

/// Unmaps and frees one page previously obtained from [`allocate_pages`].
#[cfg(target_os = "none")]
pub fn free_page(virt: VirtAddr) -> Result<(), crate::mm::PmmError> {
    let mut backing = IdentityBacking;
    let frame = with_kernel_directory(|dir| dir.unmap(&mut backing, virt))
        .map_err(|_| crate::mm::PmmError::InvalidFrame)?;
    crate::mm::pmm::with_frame_allocator(|pmm| pmm.free_frame(frame))
}
