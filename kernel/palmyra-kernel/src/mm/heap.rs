//! Kernel heap: best-fit allocator over page-granular arenas.
//!
//! Every block, free or allocated, carries a [`ChunkHeader`] and sits in one
//! address-ordered doubly linked list. `alloc` picks the smallest free chunk
//! that fits (optionally requiring a page-aligned payload), splitting off the
//! remainder when it is large enough to be useful. `free` merges with the
//! physically contiguous neighbour on each side, then makes one forward pass
//! merging any remaining adjacent free runs. Arenas grow on demand through a
//! registered callback (backed by `allocate_pages` on the target) and the
//! allocation is retried exactly once after growth.
//!
//! All payloads are 16-byte aligned: sizes are rounded up to 16 and the
//! header size is a multiple of 16, so alignment is preserved across splits.

use core::ptr;

use palmyra_core::sync::SpinLock;

use crate::mm::HeapError;

/// Minimum payload alignment and size granule.
const GRANULE: usize = 16;

/// Page size used for arena growth.
const PAGE_SIZE: usize = 4096;

/// Header preceding every chunk's payload.
#[repr(C, align(16))]
struct ChunkHeader {
    /// Payload size in bytes (excluding this header).
    size: usize,
    /// Whether the payload is currently handed out.
    allocated: bool,
    /// Previous chunk in address order, or null.
    prev: *mut ChunkHeader,
    /// Next chunk in address order, or null.
    next: *mut ChunkHeader,
}

/// Size of the chunk header (a multiple of [`GRANULE`] by its alignment).
const HEADER_SIZE: usize = size_of::<ChunkHeader>();

impl ChunkHeader {
    /// Address of the payload.
    fn payload(&mut self) -> *mut u8 {
        // SAFETY: the payload starts immediately after the header.
        unsafe { (self as *mut Self).cast::<u8>().add(HEADER_SIZE) }
    }

    /// Whether `other` starts exactly where this chunk's payload ends.
    fn is_contiguous_with(&self, other: *const ChunkHeader) -> bool {
        (self as *const Self as usize) + HEADER_SIZE + self.size == other as usize
    }
}

/// Callback used to grow the heap: takes the minimum number of bytes needed,
/// returns the new region and its actual size.
pub type GrowFn = fn(usize) -> Option<(*mut u8, usize)>;

struct HeapInner {
    /// First chunk in address order, or null before the first arena.
    head: *mut ChunkHeader,
    /// Total bytes under management (headers included).
    total_bytes: usize,
    /// Bytes currently allocated (payloads only).
    allocated_bytes: usize,
    /// Arena growth callback.
    grow_fn: Option<GrowFn>,
}

// SAFETY: the raw pointers are only touched under the SpinLock.
unsafe impl Send for HeapInner {}

/// The kernel heap allocator.
pub struct HeapAllocator {
    inner: SpinLock<HeapInner>,
}

impl HeapAllocator {
    /// Creates an empty heap. Useless until [`add_region`](Self::add_region)
    /// or a grow callback provides memory.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(HeapInner {
                head: ptr::null_mut(),
                total_bytes: 0,
                allocated_bytes: 0,
                grow_fn: None,
            }),
        }
    }

    /// Registers the arena growth callback.
    pub fn register_grow_fn(&self, f: GrowFn) {
        self.inner.lock().grow_fn = Some(f);
    }

    /// Donates a memory region to the heap.
    ///
    /// # Safety
    ///
    /// The region must be mapped, unused, at least `GRANULE`-aligned, and
    /// must not overlap any region previously donated.
    pub unsafe fn add_region(&self, start: *mut u8, size: usize) {
        let mut inner = self.inner.lock();
        // SAFETY: forwarded caller contract.
        unsafe { Self::append_region(&mut inner, start, size) };
    }

    /// Allocates `size` bytes; `page_align` forces a 4 KiB-aligned payload.
    ///
    /// Returns null when the request cannot be satisfied even after growing
    /// the arena once.
    pub fn alloc(&self, size: usize, page_align: bool) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let size = size.div_ceil(GRANULE) * GRANULE;

        let mut inner = self.inner.lock();

        if let Some(chunk) = Self::find_best_fit(&inner, size, page_align) {
            return Self::take(&mut inner, chunk, size);
        }

        // Grow by at least the request (header included), page-rounded, and
        // retry exactly once.
        let Some(grow) = inner.grow_fn else {
            return ptr::null_mut();
        };
        let want = (size + HEADER_SIZE).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        drop(inner); // The grow callback may need other locks (PMM).

        let Some((region, actual)) = grow(want) else {
            return ptr::null_mut();
        };

        let mut inner = self.inner.lock();
        // SAFETY: the grow callback handed us a fresh mapped region.
        unsafe { Self::append_region(&mut inner, region, actual) };

        match Self::find_best_fit(&inner, size, page_align) {
            Some(chunk) => Self::take(&mut inner, chunk, size),
            None => ptr::null_mut(),
        }
    }

    /// Frees a pointer previously returned by [`alloc`](Self::alloc).
    ///
    /// # Errors
    ///
    /// [`HeapError::DoubleFree`] when the chunk is not marked allocated; the
    /// chunk is left untouched in that case.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by `alloc` on this heap and not
    /// freed since.
    pub unsafe fn free(&self, payload: *mut u8) -> Result<(), HeapError> {
        if payload.is_null() {
            return Ok(());
        }
        let mut inner = self.inner.lock();

        // SAFETY: payload points just past its header per the alloc contract.
        let chunk = unsafe { payload.sub(HEADER_SIZE).cast::<ChunkHeader>() };
        // SAFETY: chunk is a live header.
        let header = unsafe { &mut *chunk };

        if !header.allocated {
            return Err(HeapError::DoubleFree);
        }

        header.allocated = false;
        inner.allocated_bytes -= header.size;

        // One merge step on each side, then a single forward pass to collapse
        // any remaining adjacent free runs.
        Self::try_merge(chunk);
        Self::coalesce(&mut inner);
        Ok(())
    }

    /// Total bytes under management.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.inner.lock().allocated_bytes
    }

    /// Number of free chunks on the list.
    #[must_use]
    pub fn free_chunk_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut count = 0;
        let mut cur = inner.head;
        while !cur.is_null() {
            // SAFETY: list links are maintained under the lock.
            unsafe {
                if !(*cur).allocated {
                    count += 1;
                }
                cur = (*cur).next;
            }
        }
        count
    }

    /// Payload sizes of the free chunks, in address order. Test support.
    #[cfg(test)]
    fn free_list_snapshot(&self) -> Vec<usize> {
        let inner = self.inner.lock();
        let mut sizes = Vec::new();
        let mut cur = inner.head;
        while !cur.is_null() {
            // SAFETY: list links are maintained under the lock.
            unsafe {
                if !(*cur).allocated {
                    sizes.push((*cur).size);
                }
                cur = (*cur).next;
            }
        }
        sizes
    }

    /// Appends a raw region as one free chunk at the list tail.
    ///
    /// # Safety
    ///
    /// `start`/`size` must describe a mapped, exclusive region.
    unsafe fn append_region(inner: &mut HeapInner, start: *mut u8, size: usize) {
        debug_assert!(size > HEADER_SIZE);
        debug_assert_eq!(start as usize % GRANULE, 0);

        let chunk = start.cast::<ChunkHeader>();
        // SAFETY: the region is exclusive and large enough for a header.
        unsafe {
            (*chunk).size = size - HEADER_SIZE;
            (*chunk).allocated = false;
            (*chunk).next = ptr::null_mut();
            (*chunk).prev = ptr::null_mut();
        }

        if inner.head.is_null() {
            inner.head = chunk;
        } else {
            let mut last = inner.head;
            // SAFETY: list links are valid under the lock.
            unsafe {
                while !(*last).next.is_null() {
                    last = (*last).next;
                }
                (*last).next = chunk;
                (*chunk).prev = last;
            }
        }
        inner.total_bytes += size;
    }

    /// Best-fit scan: smallest free chunk that fits, honoring `page_align`.
    fn find_best_fit(
        inner: &HeapInner,
        size: usize,
        page_align: bool,
    ) -> Option<*mut ChunkHeader> {
        let mut best: Option<(*mut ChunkHeader, usize)> = None;
        let mut cur = inner.head;
        while !cur.is_null() {
            // SAFETY: list links are valid under the lock.
            unsafe {
                let cur_size = (*cur).size;
                let fits = !(*cur).allocated && cur_size >= size;
                let aligned =
                    !page_align || (cur as usize + HEADER_SIZE) % PAGE_SIZE == 0;
                if fits && aligned && best.is_none_or(|(_, b)| cur_size < b) {
                    best = Some((cur, cur_size));
                }
                cur = (*cur).next;
            }
        }
        best.map(|(chunk, _)| chunk)
    }

    /// Splits `chunk` down to `size`, marks it allocated, returns its payload.
    fn take(inner: &mut HeapInner, chunk: *mut ChunkHeader, size: usize) -> *mut u8 {
        Self::split(chunk, size);
        // SAFETY: chunk is a live header owned by this list.
        let header = unsafe { &mut *chunk };
        header.allocated = true;
        inner.allocated_bytes += header.size;
        header.payload()
    }

    /// Splits the tail of `chunk` into a new free chunk when the remainder
    /// can hold a header plus at least one byte.
    fn split(chunk: *mut ChunkHeader, size: usize) {
        // SAFETY: chunk is a live header.
        unsafe {
            if (*chunk).size <= size + HEADER_SIZE {
                return;
            }

            let rest = (chunk.cast::<u8>().add(HEADER_SIZE + size)).cast::<ChunkHeader>();
            (*rest).size = (*chunk).size - size - HEADER_SIZE;
            (*rest).allocated = false;
            (*rest).next = (*chunk).next;
            (*rest).prev = chunk;

            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = rest;
            }
            (*chunk).next = rest;
            (*chunk).size = size;
        }
    }

    /// Merges `chunk` with its free, physically contiguous neighbours — one
    /// step forward, one step backward.
    fn try_merge(chunk: *mut ChunkHeader) {
        // SAFETY: chunk and its links are live headers.
        unsafe {
            let next = (*chunk).next;
            if !next.is_null() && !(*next).allocated && (*chunk).is_contiguous_with(next) {
                (*chunk).size += (*next).size + HEADER_SIZE;
                (*chunk).next = (*next).next;
                if !(*chunk).next.is_null() {
                    (*(*chunk).next).prev = chunk;
                }
            }

            let prev = (*chunk).prev;
            if !prev.is_null() && !(*prev).allocated && (*prev).is_contiguous_with(chunk) {
                (*prev).size += (*chunk).size + HEADER_SIZE;
                (*prev).next = (*chunk).next;
                if !(*chunk).next.is_null() {
                    (*(*chunk).next).prev = prev;
                }
            }
        }
    }

    /// One forward pass merging every adjacent free run.
    fn coalesce(inner: &mut HeapInner) {
        let mut cur = inner.head;
        while !cur.is_null() {
            // SAFETY: list links are valid under the lock.
            unsafe {
                if !(*cur).allocated {
                    Self::try_merge(cur);
                }
                cur = (*cur).next;
            }
        }
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global allocator wiring (target only)
// ---------------------------------------------------------------------------

/// The kernel's global heap.
pub static KERNEL_HEAP: HeapAllocator = HeapAllocator::new();

#[cfg(target_os = "none")]
mod global {
    use core::alloc::{GlobalAlloc, Layout};

    use super::{GRANULE, KERNEL_HEAP, PAGE_SIZE};

    struct KernelAlloc;

    // SAFETY: alloc/dealloc delegate to the heap allocator, which hands out
    // exclusive, well-aligned payloads.
    unsafe impl GlobalAlloc for KernelAlloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            // Payloads are GRANULE-aligned by construction; anything stricter
            // rides the page-aligned path.
            let page_align = layout.align() > GRANULE;
            debug_assert!(layout.align() <= PAGE_SIZE);
            KERNEL_HEAP.alloc(layout.size(), page_align)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            // SAFETY: ptr came from alloc above.
            let _ = unsafe { KERNEL_HEAP.free(ptr) };
        }
    }

    #[global_allocator]
    static GLOBAL: KernelAlloc = KernelAlloc;

    /// Grow callback: identity-mapped DMA-safe pages from the VMM.
    fn grow_from_vmm(min_bytes: usize) -> Option<(*mut u8, usize)> {
        let pages = min_bytes.div_ceil(PAGE_SIZE);
        let virt = crate::mm::paging::allocate_pages(pages)?;
        Some((virt.as_u32() as usize as *mut u8, pages * PAGE_SIZE))
    }

    /// Wires the global heap to the VMM. Called once paging is up.
    pub fn init() {
        KERNEL_HEAP.register_grow_fn(grow_from_vmm);
    }
}

#[cfg(target_os = "none")]
pub use global::init;
