//! Bitmap-based physical frame allocator.
//!
//! One bit per 4 KiB frame; bit = 1 means allocated or reserved. At boot the
//! allocator reserves everything below the "safe end" (kernel image plus boot
//! structures) and hands out frames above it. Word-level scanning with
//! `trailing_zeros()` keeps single-frame allocation cheap; contiguous runs
//! use a first-fit linear scan where the lowest index wins.

use palmyra_core::{kwarn, sync::SpinLock};

use crate::addr::{PAGE_SIZE, PhysAddr};
use crate::mm::PmmError;

const BITS_PER_WORD: usize = 32;

/// A bitmap-based physical frame allocator.
///
/// The bitmap storage is provided by the caller: the boot code carves it out
/// of the region just past the kernel image, tests lease it from the host
/// heap.
pub struct FrameAllocator {
    /// One bit per frame; set = allocated.
    bitmap: &'static mut [u32],
    /// Total number of frames tracked.
    total_frames: usize,
    /// Number of currently free frames.
    free_count: usize,
    /// Word index hint for the next single-frame search.
    search_hint: usize,
}

impl FrameAllocator {
    /// Creates the allocator over `bitmap` storage, tracking `total_ram`
    /// bytes of physical memory and reserving every frame below `safe_end`.
    ///
    /// # Panics
    ///
    /// Panics when `bitmap` is too small for `total_ram / 4096` bits — that
    /// is a boot-code sizing bug, not a runtime condition.
    pub fn new(bitmap: &'static mut [u32], total_ram: u32, safe_end: PhysAddr) -> Self {
        let total_frames = (total_ram / PAGE_SIZE) as usize;
        assert!(
            bitmap.len() * BITS_PER_WORD >= total_frames,
            "frame bitmap storage too small"
        );

        bitmap.fill(0);

        let mut alloc = Self {
            bitmap,
            total_frames,
            free_count: total_frames,
            search_hint: 0,
        };

        // Everything below the safe end belongs to the kernel image, the
        // boot structures, and this bitmap itself.
        let reserved = safe_end.as_u32().div_ceil(PAGE_SIZE) as usize;
        for frame in 0..reserved.min(total_frames) {
            alloc.set_bit(frame);
            alloc.free_count -= 1;
        }
        alloc.search_hint = reserved / BITS_PER_WORD;

        alloc
    }

    /// Allocates a single frame. Returns its base address.
    pub fn allocate_frame(&mut self) -> Option<PhysAddr> {
        if self.free_count == 0 {
            return None;
        }

        let words = self.bitmap.len();
        let start = self.search_hint;

        for offset in 0..words {
            let word_idx = (start + offset) % words;
            let word = self.bitmap[word_idx];
            if word == u32::MAX {
                continue;
            }

            let bit_idx = (!word).trailing_zeros() as usize;
            let frame_idx = word_idx * BITS_PER_WORD + bit_idx;
            if frame_idx >= self.total_frames {
                continue;
            }

            self.bitmap[word_idx] |= 1 << bit_idx;
            self.free_count -= 1;
            self.search_hint = word_idx;
            return Some(frame_addr(frame_idx));
        }

        None
    }

    /// Allocates `count` contiguous frames; returns the base of the run.
    ///
    /// First-fit: among all runs that fit, the one at the lowest frame index
    /// wins.
    pub fn allocate_frames(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.allocate_frame();
        }
        if self.free_count < count {
            return None;
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;

        for frame_idx in 0..self.total_frames {
            if self.bit(frame_idx) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame_idx;
                }
                run_len += 1;
                if run_len == count {
                    for f in run_start..run_start + count {
                        self.set_bit(f);
                    }
                    self.free_count -= count;
                    self.search_hint = (run_start + count) / BITS_PER_WORD;
                    return Some(frame_addr(run_start));
                }
            }
        }

        None
    }

    /// Frees a single frame.
    ///
    /// # Errors
    ///
    /// [`PmmError::InvalidFrame`] outside the tracked range,
    /// [`PmmError::DoubleFree`] when the frame is already free (reported and
    /// left untouched — a double free means some owner's bookkeeping is
    /// wrong).
    pub fn free_frame(&mut self, frame: PhysAddr) -> Result<(), PmmError> {
        let frame_idx = frame.frame_index();
        if frame_idx >= self.total_frames {
            return Err(PmmError::InvalidFrame);
        }
        if !self.bit(frame_idx) {
            kwarn!("pmm: double free of frame {}", frame);
            return Err(PmmError::DoubleFree);
        }

        self.clear_bit(frame_idx);
        self.free_count += 1;
        let word = frame_idx / BITS_PER_WORD;
        if word < self.search_hint {
            self.search_hint = word;
        }
        Ok(())
    }

    /// Frees `count` frames starting at `frame`.
    ///
    /// # Errors
    ///
    /// As [`free_frame`](Self::free_frame); stops at the first failure.
    pub fn free_frames(&mut self, frame: PhysAddr, count: usize) -> Result<(), PmmError> {
        let start = frame.frame_index();
        if start + count > self.total_frames {
            return Err(PmmError::InvalidFrame);
        }
        for idx in start..start + count {
            self.free_frame(frame_addr(idx))?;
        }
        Ok(())
    }

    /// Marks a specific frame as allocated (for firmware/device regions).
    ///
    /// # Errors
    ///
    /// [`PmmError::InvalidFrame`] outside the tracked range,
    /// [`PmmError::AlreadyAllocated`] when the frame is taken.
    pub fn reserve_frame(&mut self, frame: PhysAddr) -> Result<(), PmmError> {
        let frame_idx = frame.frame_index();
        if frame_idx >= self.total_frames {
            return Err(PmmError::InvalidFrame);
        }
        if self.bit(frame_idx) {
            return Err(PmmError::AlreadyAllocated);
        }
        self.set_bit(frame_idx);
        self.free_count -= 1;
        Ok(())
    }

    /// Number of free frames.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Number of allocated (or reserved) frames.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.total_frames - self.free_count
    }

    /// Total number of tracked frames.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    #[inline]
    fn bit(&self, frame_idx: usize) -> bool {
        self.bitmap[frame_idx / BITS_PER_WORD] & (1 << (frame_idx % BITS_PER_WORD)) != 0
    }

    #[inline]
    fn set_bit(&mut self, frame_idx: usize) {
        self.bitmap[frame_idx / BITS_PER_WORD] |= 1 << (frame_idx % BITS_PER_WORD);
    }

    #[inline]
    fn clear_bit(&mut self, frame_idx: usize) {
        self.bitmap[frame_idx / BITS_PER_WORD] &= !(1 << (frame_idx % BITS_PER_WORD));
    }
}

#[inline]
fn frame_addr(frame_idx: usize) -> PhysAddr {
    PhysAddr::new(frame_idx as u32 * PAGE_SIZE)
}

// ---------------------------------------------------------------------------
// Global frame allocator
// ---------------------------------------------------------------------------

/// Global physical memory manager.
static PMM: SpinLock<Option<FrameAllocator>> = SpinLock::new(None);

/// Installs the global frame allocator. Called exactly once at boot.
///
/// # Panics
///
/// Panics when called twice.
pub fn init(allocator: FrameAllocator) {
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(allocator);
}

/// Executes a closure with the global frame allocator.
///
/// # Panics
///
/// Panics when the PMM has not been initialized.
pub fn with_frame_allocator<R>(f: impl FnOnce(&mut FrameAllocator) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_RAM: u32 = 64 * PAGE_SIZE; // 64 frames
    const SAFE_END: u32 = 8 * PAGE_SIZE; // first 8 reserved

    fn test_allocator() -> FrameAllocator {
        let bitmap = Box::leak(vec![0u32; 2].into_boxed_slice());
        FrameAllocator::new(bitmap, TEST_RAM, PhysAddr::new(SAFE_END))
    }

    #[test]
    fn boot_reservation() {
        let alloc = test_allocator();
        assert_eq!(alloc.total_frames(), 64);
        assert_eq!(alloc.free_count(), 56);
        assert_eq!(alloc.allocated_count(), 8);
    }

    #[test]
    fn first_allocation_is_lowest_free_frame() {
        let mut alloc = test_allocator();
        assert_eq!(alloc.allocate_frame(), Some(PhysAddr::new(SAFE_END)));
    }

    #[test]
    fn conservation_invariant_holds_through_churn() {
        let mut alloc = test_allocator();
        let mut held = Vec::new();
        for _ in 0..20 {
            held.push(alloc.allocate_frame().unwrap());
            assert_eq!(alloc.free_count() + alloc.allocated_count(), 64);
        }
        for frame in held.drain(10..) {
            alloc.free_frame(frame).unwrap();
            assert_eq!(alloc.free_count() + alloc.allocated_count(), 64);
        }
    }

    #[test]
    fn contiguous_run_lowest_index_wins() {
        let mut alloc = test_allocator();
        // Carve a 3-frame hole at frames 9..12 by allocating 8..16 and
        // freeing 9, 10, 11.
        let base = alloc.allocate_frames(8).unwrap();
        assert_eq!(base, PhysAddr::new(SAFE_END));
        for i in 1..4 {
            alloc
                .free_frame(PhysAddr::new(SAFE_END + i * PAGE_SIZE))
                .unwrap();
        }
        // A 2-frame request must take the low hole, not the big free tail.
        let run = alloc.allocate_frames(2).unwrap();
        assert_eq!(run, PhysAddr::new(SAFE_END + PAGE_SIZE));
    }

    #[test]
    fn contiguous_exhaustion_returns_none() {
        let mut alloc = test_allocator();
        assert!(alloc.allocate_frames(57).is_none());
        assert!(alloc.allocate_frames(56).is_some());
        assert_eq!(alloc.free_count(), 0);
        assert!(alloc.allocate_frame().is_none());
    }

    #[test]
    fn double_free_detected() {
        let mut alloc = test_allocator();
        let frame = alloc.allocate_frame().unwrap();
        alloc.free_frame(frame).unwrap();
        assert_eq!(alloc.free_frame(frame), Err(PmmError::DoubleFree));
        // Counters unharmed by the rejected free.
        assert_eq!(alloc.free_count() + alloc.allocated_count(), 64);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut alloc = test_allocator();
        assert_eq!(
            alloc.free_frame(PhysAddr::new(TEST_RAM)),
            Err(PmmError::InvalidFrame)
        );
        assert_eq!(
            alloc.reserve_frame(PhysAddr::new(TEST_RAM + PAGE_SIZE)),
            Err(PmmError::InvalidFrame)
        );
    }

    #[test]
    fn reserve_specific_frame() {
        let mut alloc = test_allocator();
        let target = PhysAddr::new(20 * PAGE_SIZE);
        alloc.reserve_frame(target).unwrap();
        assert_eq!(alloc.reserve_frame(target), Err(PmmError::AlreadyAllocated));
        // The reserved frame is skipped by allocation.
        for _ in 0..55 {
            assert_ne!(alloc.allocate_frame(), Some(target));
        }
    }

    #[test]
    fn free_frames_bulk() {
        let mut alloc = test_allocator();
        let base = alloc.allocate_frames(4).unwrap();
        let free_before = alloc.free_count();
        alloc.free_frames(base, 4).unwrap();
        assert_eq!(alloc.free_count(), free_before + 4);
    }
}
