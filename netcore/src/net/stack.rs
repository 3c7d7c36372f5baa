//! Network stack context.
//!
//! `NetStack` replaces the module-level singletons of a classic embedded
//! stack: it owns the buffer arena and protocol state behind the global
//! stack lock, plus handles to the collaborators it calls out to. No
//! handle, no calls.

use alloc::sync::Arc;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use super::buf::{BufDir, BufHandle, BufPool};
use super::icmpv6::{Icmpv6State, Icmpv6Upper, NoUpper};
use super::ip::{Ipv6Tx, NetIf};
use super::IfNbr;
use crate::config::IfBufCfg;
use crate::error::NetResult;
use crate::lock::{LockId, SpinlockGuard};
use crate::time::Clock;
use crate::Spinlock;

/// Collaborators the stack calls out to.
#[derive(Clone)]
pub struct StackEnv {
    pub netif: Arc<dyn NetIf>,
    pub ip_tx: Arc<dyn Ipv6Tx>,
    pub clock: Arc<dyn Clock>,
    pub icmp6_upper: Arc<dyn Icmpv6Upper>,
}

impl StackEnv {
    pub fn new(netif: Arc<dyn NetIf>, ip_tx: Arc<dyn Ipv6Tx>, clock: Arc<dyn Clock>) -> Self {
        Self {
            netif,
            ip_tx,
            clock,
            icmp6_upper: Arc::new(NoUpper),
        }
    }

    pub fn with_icmp6_upper(mut self, upper: Arc<dyn Icmpv6Upper>) -> Self {
        self.icmp6_upper = upper;
        self
    }
}

/// State guarded by the global stack lock.
#[derive(Default)]
pub struct StackState {
    pub bufs: BufPool,
    pub icmp6: Icmpv6State,
}

/// Global stack lock guard. Buffer unlink callbacks queued while it was
/// held run after the lock is released, so they may call back into the
/// stack.
pub struct StackGuard<'a> {
    inner: ManuallyDrop<SpinlockGuard<'a, StackState>>,
}

impl Deref for StackGuard<'_> {
    type Target = StackState;

    fn deref(&self) -> &StackState {
        &self.inner
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut StackState {
        &mut self.inner
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        let unlinks = self.inner.bufs.unlink_drain();
        // Safety: inner is never touched again
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        for (h, f) in unlinks {
            f(h);
        }
    }
}

pub struct NetStack {
    state: Spinlock<StackState>,
    env: StackEnv,
}

impl NetStack {
    pub fn new(env: StackEnv) -> Self {
        crate::klog::klog_info("stack", "network stack created");
        Self {
            state: Spinlock::new_with_id(StackState::default(), LockId::NetStack),
            env,
        }
    }

    /// Acquire the global stack lock.
    pub fn lock(&self) -> StackGuard<'_> {
        StackGuard {
            inner: ManuallyDrop::new(self.state.lock()),
        }
    }

    pub fn env(&self) -> &StackEnv {
        &self.env
    }

    /// Add buffer pools for a new interface.
    pub fn if_add(&self, cfg: &IfBufCfg) -> NetResult<IfNbr> {
        self.lock().bufs.if_add(cfg)
    }

    pub fn buf_get(&self, if_nbr: IfNbr, dir: BufDir, size: usize, ix: usize) -> NetResult<BufHandle> {
        self.lock().bufs.get(if_nbr, dir, size, ix)
    }

    pub fn buf_free(&self, buf: BufHandle) {
        self.lock().bufs.free(buf);
    }

    pub fn buf_free_chain(&self, head: BufHandle) {
        self.lock().bufs.free_chain(head);
    }
}
