//! Wait primitives for blocking network operations.
//!
//! `Signal` is a counting semaphore: `post()` adds one, `pend()` consumes one
//! or gives up after a timeout measured on the caller's clock. The service
//! task pends on its signal when it has no sockets to select on, and posting
//! a message wakes it.
//!
//! `Completion<T>` pairs a signal with a result slot so a poster can block
//! until the receiver has finished with the request.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::time::{elapsed_ms, Clock};
use crate::Spinlock;

/// Counting semaphore.
pub struct Signal {
    count: AtomicU32,
}

impl Signal {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Add one pending wakeup.
    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Consume one pending wakeup if available.
    pub fn try_pend(&self) -> bool {
        let mut cur = self.count.load(Ordering::Acquire);
        while cur > 0 {
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
        false
    }

    /// Wait until posted or timeout.
    ///
    /// ## Arguments
    /// * `timeout_ms` - Maximum time to wait; `None` waits forever
    ///
    /// ## Returns
    /// * `true` if a post was consumed
    /// * `false` if timeout expired
    pub fn pend(&self, timeout_ms: Option<u32>, clock: &dyn Clock) -> bool {
        let start = clock.now_ms();
        loop {
            if self.try_pend() {
                return true;
            }
            if let Some(t) = timeout_ms {
                if elapsed_ms(start, clock.now_ms()) >= t {
                    return false;
                }
            }
            spin_loop();
            #[cfg(test)]
            std::thread::yield_now();
        }
    }

    /// Drop all pending wakeups.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.count.load(Ordering::Acquire) > 0
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot result hand-off between a poster and the thread serving it.
pub struct Completion<T> {
    signal: Signal,
    result: Spinlock<Option<T>>,
}

impl<T> Completion<T> {
    pub const fn new() -> Self {
        Self {
            signal: Signal::new(),
            result: Spinlock::new(None),
        }
    }

    /// Store the result and wake the waiter.
    pub fn complete(&self, val: T) {
        *self.result.lock() = Some(val);
        self.signal.post();
    }

    /// Block until completed or timeout. `None` on timeout.
    pub fn wait(&self, timeout_ms: Option<u32>, clock: &dyn Clock) -> Option<T> {
        if self.signal.pend(timeout_ms, clock) {
            self.result.lock().take()
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.signal.is_pending()
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}
