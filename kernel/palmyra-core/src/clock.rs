//! Global monotonic clock hook.
//!
//! Subsystems that need wall-clock-ish timing (ARP cache expiry, ICMP ping
//! deadlines, ATA timeouts) read time through [`monotonic_micros`]. The HPET
//! driver installs the real source at boot via [`set_clock_fn`]; until then a
//! null clock that always returns 0 is in effect, which callers must treat as
//! "time does not advance" (timeouts degrade to bounded iteration counts and
//! cache entries never expire). Tests install stepping mock clocks.

use core::sync::atomic::{AtomicPtr, Ordering};

/// The signature of the global clock function: microseconds since boot.
pub type ClockFn = fn() -> u64;

fn null_clock() -> u64 {
    0
}

static CLOCK_FN: AtomicPtr<()> = AtomicPtr::new(null_clock as *mut ());

/// Registers the global monotonic clock source.
///
/// # Safety
///
/// The function must be safe to call from any context, and must be monotonic
/// for the lifetime of the kernel.
pub unsafe fn set_clock_fn(f: ClockFn) {
    CLOCK_FN.store(f as *mut (), Ordering::Release);
}

/// Returns microseconds since boot, or 0 when no clock is installed.
#[inline]
#[must_use]
pub fn monotonic_micros() -> u64 {
    let ptr = CLOCK_FN.load(Ordering::Acquire);
    // SAFETY: only valid `ClockFn` pointers are ever stored into CLOCK_FN.
    let f: ClockFn = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Returns milliseconds since boot, or 0 when no clock is installed.
#[inline]
#[must_use]
pub fn monotonic_millis() -> u64 {
    monotonic_micros() / 1_000
}

/// Whether a real clock source has been installed.
#[must_use]
pub fn clock_installed() -> bool {
    !core::ptr::eq(
        CLOCK_FN.load(Ordering::Acquire),
        null_clock as *mut (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static NOW: AtomicU64 = AtomicU64::new(0);

    fn stepping_clock() -> u64 {
        NOW.fetch_add(100, Ordering::SeqCst)
    }

    // A single test keeps the global hook from racing between test threads.
    #[test]
    fn null_then_installed_clock() {
        // SAFETY: null_clock is safe from any context.
        unsafe { set_clock_fn(null_clock) };
        assert_eq!(monotonic_micros(), 0);
        assert!(!clock_installed());

        // SAFETY: stepping_clock is safe from any context.
        unsafe { set_clock_fn(stepping_clock) };
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b > a);
        assert!(clock_installed());
        // SAFETY: restoring the null clock.
        unsafe { set_clock_fn(null_clock) };
    }
}
