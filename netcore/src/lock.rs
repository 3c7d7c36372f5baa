//! Spinlock used for the global stack lock and every module lock.
//!
//! ## Lock Ordering Protocol
//!
//! To prevent deadlocks, always acquire locks in this order (lowest to highest):
//! 1. NET_STACK (global stack lock: buffer pools, ICMPv6 state)
//! 2. DNS_CACHE
//! 3. SVC_TASK (per instance: children, timers, message queue)
//! 4. KLOG
//!
//! Callbacks handed out by the service task and the DNS client never run
//! with any of these held.
//!
//! Debug builds check the order per execution context once a context source
//! is installed with [`set_ctx_source`]: taking a lock at or below a level
//! the caller already holds panics.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

// ============================================================================
// Lock IDs for Lock Ordering Validation
// ============================================================================

/// Lock hierarchy levels - lower numbers must be acquired before higher numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockId {
    NetStack = 1,
    DnsCache = 2,
    SvcTask = 3,
    Klog = 4,
    /// For locks that don't participate in ordering
    Unordered = 255,
}

// ============================================================================
// EXECUTION CONTEXT
// ============================================================================

static CTX_SOURCE: AtomicUsize = AtomicUsize::new(0);

/// Install the function naming the calling task (or hart).
///
/// Ids must be nonzero and stay stable for the life of the context.
pub fn set_ctx_source(src: fn() -> usize) {
    CTX_SOURCE.store(src as usize, Ordering::Release);
}

/// Id of the calling execution context, `None` when no source is installed.
pub fn ctx_id() -> Option<usize> {
    let raw = CTX_SOURCE.load(Ordering::Acquire);
    if raw == 0 {
        return ctx_fallback();
    }
    // Safety: only ever stored from a `fn() -> usize` in set_ctx_source
    let src = unsafe { core::mem::transmute::<usize, fn() -> usize>(raw) };
    Some(src()).filter(|&id| id != 0)
}

#[cfg(test)]
fn ctx_fallback() -> Option<usize> {
    Some(crate::testutil::thread_ctx())
}

#[cfg(not(test))]
fn ctx_fallback() -> Option<usize> {
    None
}

/// Levels held per context, debug builds only.
#[cfg(debug_assertions)]
mod order {
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use super::LockId;

    const SLOTS: usize = 64;

    #[allow(clippy::declare_interior_mutable_const)]
    const FREE: AtomicUsize = AtomicUsize::new(0);
    #[allow(clippy::declare_interior_mutable_const)]
    const NONE_HELD: AtomicU32 = AtomicU32::new(0);

    static OWNER: [AtomicUsize; SLOTS] = [FREE; SLOTS];
    static HELD: [AtomicU32; SLOTS] = [NONE_HELD; SLOTS];

    fn bit(id: LockId) -> u32 {
        1 << (id as u8)
    }

    fn slot(ctx: usize) -> Option<usize> {
        if let Some(i) = OWNER.iter().position(|o| o.load(Ordering::Acquire) == ctx) {
            return Some(i);
        }
        OWNER.iter().position(|o| {
            o.compare_exchange(0, ctx, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    /// Panics if the caller holds `id` or a later level. Table full: unchecked.
    pub fn check(id: LockId) -> Option<usize> {
        if id == LockId::Unordered {
            return None;
        }
        let ctx = super::ctx_id()?;
        let i = slot(ctx)?;
        let held = HELD[i].load(Ordering::Relaxed);
        if held >> (id as u8) != 0 {
            panic!("lock order: {:?} taken while holding {:#x}", id, held);
        }
        Some(i)
    }

    pub fn mark(slot: Option<usize>, id: LockId) {
        if let Some(i) = slot {
            HELD[i].fetch_or(bit(id), Ordering::Relaxed);
        }
    }

    pub fn release(slot: Option<usize>, id: LockId) {
        if let Some(i) = slot {
            if HELD[i].fetch_and(!bit(id), Ordering::Relaxed) == bit(id) {
                OWNER[i].store(0, Ordering::Release);
            }
        }
    }
}

// ============================================================================
// BASIC SPINLOCK
// ============================================================================

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A mutual exclusion primitive based on spinning.
///
/// # Example
///
/// ```
/// use netcore::Spinlock;
///
/// static COUNTER: Spinlock<u64> = Spinlock::new(0);
///
/// fn increment() {
///     let mut guard = COUNTER.lock();
///     *guard += 1;
/// }
/// ```
pub struct Spinlock<T> {
    locked: AtomicU32,
    data: UnsafeCell<T>,
    lock_id: LockId,
}

// Safety: Spinlock provides synchronized access to T
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create a new spinlock wrapping the given value.
    pub const fn new(data: T) -> Self {
        Self::new_with_id(data, LockId::Unordered)
    }

    /// Create a new spinlock with a lock ID for ordering validation.
    pub const fn new_with_id(data: T, id: LockId) -> Self {
        Self {
            locked: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
            lock_id: id,
        }
    }

    /// Acquire the lock, spinning until available.
    ///
    /// Returns a guard that releases the lock when dropped.
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        #[cfg(debug_assertions)]
        let slot = order::check(self.lock_id);
        #[cfg(not(debug_assertions))]
        let slot = None;
        let mut spin_count = 0u32;

        loop {
            if self
                .locked
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                #[cfg(debug_assertions)]
                order::mark(slot, self.lock_id);
                return SpinlockGuard { lock: self, slot };
            }

            // Spin on a plain load until the holder releases
            while self.locked.load(Ordering::Relaxed) != UNLOCKED {
                spin_loop();
                spin_count = spin_count.wrapping_add(1);

                #[cfg(debug_assertions)]
                if spin_count > 500_000_000 {
                    panic!("Spinlock {:?}: potential deadlock", self.lock_id);
                }
            }
        }
    }

    /// Try to acquire the lock without blocking.
    ///
    /// Returns `Some(guard)` if successful, `None` if lock is held.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self, slot: None })
        } else {
            None
        }
    }

    /// Check if the lock is currently held (for debugging).
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != UNLOCKED
    }

    pub fn id(&self) -> LockId {
        self.lock_id
    }
}

/// RAII guard that releases the spinlock when dropped.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    /// Ordering table slot, set when `lock` recorded the level
    slot: Option<usize>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock, so exclusive access is guaranteed
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock exclusively
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        order::release(self.slot, self.lock.lock_id);
        self.lock.locked.store(UNLOCKED, Ordering::Release);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use super::*;

    #[test]
    fn test_spinlock_basic() {
        let lock = Spinlock::new(42);
        {
            let mut guard = lock.lock();
            assert_eq!(*guard, 42);
            *guard = 100;
        }
        {
            let guard = lock.lock();
            assert_eq!(*guard, 100);
        }
    }

    #[test]
    fn test_spinlock_try_lock() {
        let lock = Spinlock::new(0);

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.is_locked());

        // Held: a second try must fail instead of spinning
        assert!(lock.try_lock().is_none());
        drop(guard);

        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_spinlock_ordering_id() {
        let lock = Spinlock::new_with_id(vec![1u8], LockId::DnsCache);
        assert_eq!(lock.id(), LockId::DnsCache);
        assert!(LockId::NetStack < LockId::DnsCache);
        assert!(LockId::SvcTask < LockId::Klog);
    }

    #[test]
    fn test_ordered_nesting_allowed() {
        let stack = Spinlock::new_with_id(0u8, LockId::NetStack);
        let cache = Spinlock::new_with_id(0u8, LockId::DnsCache);
        let log = Spinlock::new_with_id(0u8, LockId::Klog);
        let free = Spinlock::new(0u8);
        {
            let _s = stack.lock();
            let _c = cache.lock();
            let _f = free.lock();
            let _l = log.lock();
        }
        // Released levels can be taken again in any order
        drop(cache.lock());
        drop(stack.lock());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order")]
    fn test_reversed_order_panics() {
        let stack = Spinlock::new_with_id(0u8, LockId::NetStack);
        let cache = Spinlock::new_with_id(0u8, LockId::DnsCache);
        let _c = cache.lock();
        let _s = stack.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order")]
    fn test_same_level_nesting_panics() {
        let a = Spinlock::new_with_id(0u8, LockId::SvcTask);
        let b = Spinlock::new_with_id(0u8, LockId::SvcTask);
        let _a = a.lock();
        let _b = b.lock();
    }

    #[test]
    fn test_ctx_id_per_thread() {
        let here = ctx_id().unwrap();
        let there = std::thread::spawn(|| ctx_id().unwrap()).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(ctx_id(), Some(here));
    }

    #[test]
    fn test_spinlock_contended_threads() {
        let lock = Arc::new(Spinlock::new(0u64));
        let mut handles = vec![];
        for _ in 0..4 {
            let l = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *l.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
