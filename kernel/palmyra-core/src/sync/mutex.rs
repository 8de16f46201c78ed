//! Cooperative sleep mutex with FIFO hand-off.
//!
//! Unlike [`SpinLock`](super::SpinLock), a contended [`Mutex`] parks the
//! calling task in a bounded FIFO wait queue; `release` hands the lock
//! directly to the head waiter, whose pid is returned so the scheduler can
//! mark it runnable. The wait queue is serialized by a short private
//! spinlock rather than by disabling interrupts.
//!
//! The mutex is a pure state machine over pids — it never calls into the
//! scheduler itself. The usual pattern is:
//!
//! ```ignore
//! match fat_mutex.acquire(pid) {
//!     Acquire::Acquired => { /* run critical section */ }
//!     Acquire::Queued => scheduler::park_current(),
//!     Acquire::QueueFull => return Err(FsError::Busy),
//! }
//! ```

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use planck_noalloc::ringbuf::RingBuf;

use super::SpinLock;

/// Maximum number of tasks that can wait on one mutex.
pub const MAX_WAITERS: usize = 32;

/// Outcome of [`Mutex::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The caller now owns the lock.
    Acquired,
    /// The caller was enqueued; it must park until woken.
    Queued,
    /// The wait queue is full; the caller must back off and retry.
    QueueFull,
}

/// Errors from mutex release operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexError {
    /// `release` was called by a task that does not own the lock.
    NotOwner,
}

/// A cooperative sleep mutex owned by at most one pid at a time.
///
/// Invariants: `locked ⇔ owner != 0`; on release with waiters present the
/// head of the queue becomes the owner without the lock ever observing an
/// unlocked state (direct hand-off, FIFO fair).
pub struct Mutex {
    locked: AtomicBool,
    owner: AtomicU32,
    // The ring buffer holds SIZE-1 elements, hence MAX_WAITERS + 1.
    waiters: SpinLock<RingBuf<u32, { MAX_WAITERS + 1 }>>,
}

impl Mutex {
    /// Creates a new unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(0),
            waiters: SpinLock::new(RingBuf::new()),
        }
    }

    /// Atomically takes the lock for `pid` iff it is currently unlocked.
    pub fn try_acquire(&self, pid: u32) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(pid, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Takes the lock or enqueues `pid` as a waiter.
    ///
    /// On [`Acquire::Queued`] the caller must park; it owns the lock when it
    /// is next scheduled (the releasing task hands over ownership).
    pub fn acquire(&self, pid: u32) -> Acquire {
        if self.try_acquire(pid) {
            return Acquire::Acquired;
        }
        let mut queue = self.waiters.lock();
        // The owner may have released between the failed try and taking the
        // queue lock; re-check so the waiter cannot be stranded.
        if self.try_acquire(pid) {
            return Acquire::Acquired;
        }
        if queue.try_push(pid).is_ok() {
            Acquire::Queued
        } else {
            Acquire::QueueFull
        }
    }

    /// Releases the lock held by `pid`.
    ///
    /// Returns the pid of the woken next owner when waiters were queued; the
    /// scheduler must mark that task runnable.
    ///
    /// # Errors
    ///
    /// [`MutexError::NotOwner`] when `pid` does not hold the lock.
    pub fn release(&self, pid: u32) -> Result<Option<u32>, MutexError> {
        if !self.locked.load(Ordering::Acquire) || self.owner.load(Ordering::Acquire) != pid {
            return Err(MutexError::NotOwner);
        }
        Ok(self.unlock_and_wake())
    }

    /// Unconditionally unlocks on behalf of a dying task.
    ///
    /// Invoked by the process manager; only acts when `pid` is the current
    /// owner. Returns the woken next owner, if any.
    pub fn force_unlock(&self, pid: u32) -> Option<u32> {
        if self.owner.load(Ordering::Acquire) != pid {
            return None;
        }
        self.unlock_and_wake()
    }

    /// Enqueues `pid` as a waiter without attempting the lock.
    ///
    /// Returns `false` when the queue is full.
    pub fn enqueue_waiter(&self, pid: u32) -> bool {
        self.waiters.lock().try_push(pid).is_ok()
    }

    /// Pops the head waiter, if any.
    pub fn dequeue_waiter(&self) -> Option<u32> {
        self.waiters.lock().pop()
    }

    /// Whether the lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Pid of the current owner, or 0 when unlocked.
    #[must_use]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Hands the lock to the head waiter or fully unlocks.
    fn unlock_and_wake(&self) -> Option<u32> {
        let next = self.waiters.lock().pop();
        match next {
            Some(next_pid) => {
                // Direct hand-off: the lock never observes an unlocked state,
                // so a latecomer cannot barge ahead of the queue.
                self.owner.store(next_pid, Ordering::Release);
                Some(next_pid)
            }
            None => {
                self.owner.store(0, Ordering::Release);
                self.locked.store(false, Ordering::Release);
                None
            }
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
