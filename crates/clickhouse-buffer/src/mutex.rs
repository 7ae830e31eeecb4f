//! Binary Async Mutex
//!
//! A two-state lock (free / held) used to serialize loads. Waiters are
//! suspended tasks, never blocked threads.
//!
//! ## Algorithm
//!
//! ```text
//! acquire:                         release:
//!   loop {                           held.store(false)
//!     register interest (Notify)     notify_one()
//!     CAS held false → true ─► done
//!     await notification
//!   }
//! ```
//!
//! Interest is registered before the CAS, so a release that lands between
//! a failed CAS and the await still wakes the waiter. A woken waiter that
//! loses the CAS to a fresh acquirer simply re-registers and waits for the
//! next release; no wake-up is lost.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct BinaryMutex {
    held: AtomicBool,
    notify: Notify,
}

/// Proof of holding a [`BinaryMutex`]. The lock is released when the guard
/// is dropped, on every exit path.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct BinaryMutexGuard<'a> {
    mutex: &'a BinaryMutex,
}

impl BinaryMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock without waiting.
    pub fn try_acquire(&self) -> Option<BinaryMutexGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BinaryMutexGuard { mutex: self })
    }

    /// Suspend until the lock is free, then take it.
    pub async fn acquire(&self) -> BinaryMutexGuard<'_> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(guard) = self.try_acquire() {
                return guard;
            }

            notified.await;
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
        self.notify.notify_one();
    }
}

impl BinaryMutexGuard<'_> {
    /// Release the lock explicitly. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BinaryMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}
