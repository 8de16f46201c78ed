//! Synchronization primitives.
//!
//! [`SpinLock`] is the short-critical-section workhorse; [`Mutex`] is the
//! cooperative sleep lock with FIFO hand-off; [`MutexTracker`] records which
//! mutexes a task holds so the process manager can force-release them when
//! the task dies.

mod mutex;
mod spinlock;
mod tracker;

pub use mutex::{Acquire, Mutex, MutexError};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use tracker::MutexTracker;
