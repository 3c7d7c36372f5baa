//! Millisecond time source.
//!
//! Every module that needs time takes a `&dyn Clock` from its context
//! object; nothing reads a global timer.

use core::sync::atomic::{AtomicU32, Ordering};

/// Monotonic millisecond tick source. Wraps at `u32::MAX`.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u32;

    /// Longest delay a single pend may request.
    fn max_dly_ms(&self) -> u32 {
        crate::config::SVC_MAX_DLY_MS
    }
}

/// Milliseconds elapsed from `start` to `now`, tolerant of one wrap.
#[inline]
pub fn elapsed_ms(start: u32, now: u32) -> u32 {
    now.wrapping_sub(start)
}

/// Clock advanced by hand. Used on hosts without a tick interrupt and in tests.
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub const fn new(start_ms: u32) -> Self {
        Self {
            now: AtomicU32::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u32) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }

    pub fn set(&self, ms: u32) {
        self.now.store(ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::Acquire)
    }
}
