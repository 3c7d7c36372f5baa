//! Software timers for the service task.
//!
//! Active timers sit in a list sorted by deadline where each entry stores
//! the milliseconds after its predecessor. Newly created timers wait in a
//! FIFO queue stamped with their creation time and join the list at the
//! next processing pass.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::{ChildHandle, ChildId};
use crate::error::NetResult;
use crate::time::elapsed_ms;

pub type TmrFn = Box<dyn FnMut(ChildHandle) -> NetResult<()> + Send>;

/// Timer identity: owning child plus a per-task sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TmrHandle {
    pub(crate) child: ChildId,
    pub(crate) id: u32,
}

impl TmrHandle {
    pub fn child(&self) -> ChildHandle {
        ChildHandle(self.child)
    }
}

pub struct Tmr {
    pub handle: TmrHandle,
    pub timeout_ms: u32,
    pub periodic: bool,
    /// Delta to the predecessor while listed, full timeout while queued
    pub delta_ms: u32,
    /// Creation time while queued
    pub ts_ms: u32,
    pub cb: TmrFn,
}

impl Tmr {
    pub fn new(handle: TmrHandle, timeout_ms: u32, periodic: bool, now: u32, cb: TmrFn) -> Self {
        Self {
            handle,
            timeout_ms,
            periodic,
            delta_ms: timeout_ms,
            ts_ms: now,
            cb,
        }
    }
}

pub struct TmrList {
    active: VecDeque<Tmr>,
    queued: VecDeque<Tmr>,
    /// Time of the last processing pass
    ts_ms: u32,
}

impl TmrList {
    pub fn new(now: u32) -> Self {
        Self {
            active: VecDeque::new(),
            queued: VecDeque::new(),
            ts_ms: now,
        }
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, h: TmrHandle) -> bool {
        self.active.iter().chain(self.queued.iter()).any(|t| t.handle == h)
    }

    /// Add a freshly created (or re-armed) timer.
    pub fn queue(&mut self, tmr: Tmr) {
        self.queued.push_back(tmr);
    }

    /// Sorted insert. Equal deadlines keep insertion order.
    pub fn insert(&mut self, mut tmr: Tmr) {
        let mut pos = self.active.len();
        for (i, node) in self.active.iter_mut().enumerate() {
            if tmr.delta_ms >= node.delta_ms {
                tmr.delta_ms -= node.delta_ms;
            } else {
                node.delta_ms -= tmr.delta_ms;
                pos = i;
                break;
            }
        }
        self.active.insert(pos, tmr);
    }

    /// Unlink a timer, folding its delta into its successor.
    pub fn remove(&mut self, h: TmrHandle) -> Option<Tmr> {
        if let Some(pos) = self.queued.iter().position(|t| t.handle == h) {
            return self.queued.remove(pos);
        }
        let pos = self.active.iter().position(|t| t.handle == h)?;
        let tmr = self.active.remove(pos)?;
        if let Some(next) = self.active.get_mut(pos) {
            next.delta_ms = next.delta_ms.saturating_add(tmr.delta_ms);
        }
        Some(tmr)
    }

    /// Unlink every timer owned by `child`.
    pub fn remove_child(&mut self, child: ChildId) -> usize {
        let handles: Vec<TmrHandle> = self
            .active
            .iter()
            .chain(self.queued.iter())
            .filter(|t| t.handle.child == child)
            .map(|t| t.handle)
            .collect();
        for h in &handles {
            self.remove(*h);
        }
        handles.len()
    }

    /// Time until the next deadline, clamped to `max_dly`; `None` with no
    /// timers at all.
    pub fn timeout_ms(&self, now: u32, max_dly: u32) -> Option<u32> {
        let since = elapsed_ms(self.ts_ms, now);
        let head = self.active.front().map(|t| t.delta_ms.saturating_sub(since));
        let queued = self
            .queued
            .iter()
            .map(|t| t.delta_ms.saturating_sub(elapsed_ms(t.ts_ms, now)))
            .min();
        let next = match (head, queued) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }?;
        Some(next.min(max_dly))
    }

    /// Advance to `now` and return the timers that expired, earliest first.
    pub fn expire(&mut self, now: u32) -> Vec<Tmr> {
        // Queued deadlines are rebased onto the previous pass
        while let Some(mut t) = self.queued.pop_front() {
            t.delta_ms = t.delta_ms.saturating_add(elapsed_ms(self.ts_ms, t.ts_ms));
            self.insert(t);
        }

        let mut elapsed = elapsed_ms(self.ts_ms, now);
        self.ts_ms = now;

        let mut fired = Vec::new();
        while let Some(head) = self.active.front_mut() {
            if head.delta_ms > elapsed {
                head.delta_ms -= elapsed;
                break;
            }
            elapsed -= head.delta_ms;
            if let Some(mut t) = self.active.pop_front() {
                t.delta_ms = 0;
                fired.push(t);
            }
        }
        fired
    }

    /// Put a fired periodic timer back with its full period.
    pub fn rearm(&mut self, mut tmr: Tmr) {
        tmr.delta_ms = tmr.timeout_ms;
        self.insert(tmr);
    }

    #[cfg(test)]
    fn deltas(&self) -> Vec<u32> {
        self.active.iter().map(|t| t.delta_ms).collect()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::Spinlock;

    fn h(id: u32) -> TmrHandle {
        TmrHandle { child: 1, id }
    }

    fn tmr(id: u32, ms: u32, now: u32) -> Tmr {
        Tmr::new(h(id), ms, false, now, Box::new(|_| Ok(())))
    }

    fn ids(v: &[Tmr]) -> Vec<u32> {
        v.iter().map(|t| t.handle.id).collect()
    }

    #[test]
    fn test_delta_insert() {
        let mut l = TmrList::new(0);
        l.insert(tmr(1, 50, 0));
        l.insert(tmr(2, 30, 0));
        l.insert(tmr(3, 80, 0));
        l.insert(tmr(4, 30, 0));
        assert_eq!(l.deltas(), [30, 0, 20, 30]);
        assert_eq!(l.expire(30).len(), 2);
        assert_eq!(l.deltas(), [20, 30]);
    }

    #[test]
    fn test_shorter_fires_first_either_order() {
        for order in [[50, 30], [30, 50]] {
            let mut l = TmrList::new(0);
            l.queue(tmr(order[0], order[0], 0));
            l.queue(tmr(order[1], order[1], 0));
            assert!(l.expire(0).is_empty());
            assert_eq!(l.timeout_ms(0, u32::MAX), Some(30));
            assert_eq!(ids(&l.expire(60)), [30, 50]);
            assert!(l.is_empty());
        }
    }

    #[test]
    fn test_equal_deadlines_fifo() {
        let mut l = TmrList::new(0);
        for id in 1..=4 {
            l.queue(tmr(id, 10, 0));
        }
        assert_eq!(ids(&l.expire(10)), [1, 2, 3, 4]);
    }

    #[test]
    fn test_overdue_queued_fire_by_deadline() {
        let mut l = TmrList::new(0);
        l.queue(tmr(50, 50, 0));
        l.queue(tmr(30, 30, 0));
        l.queue(tmr(45, 35, 10));
        assert_eq!(ids(&l.expire(100)), [30, 45, 50]);
    }

    #[test]
    fn test_queued_time_counts() {
        let mut l = TmrList::new(0);
        l.queue(tmr(1, 100, 0));
        assert_eq!(l.timeout_ms(40, u32::MAX), Some(60));
        assert!(l.expire(40).is_empty());
        assert_eq!(l.deltas(), [60]);
        assert_eq!(ids(&l.expire(100)), [1]);
    }

    #[test]
    fn test_remove_folds_delta() {
        let mut l = TmrList::new(0);
        l.insert(tmr(1, 10, 0));
        l.insert(tmr(2, 25, 0));
        l.insert(tmr(3, 40, 0));
        assert!(l.remove(h(2)).is_some());
        assert_eq!(l.deltas(), [10, 30]);
        assert!(l.remove(h(2)).is_none());
        l.queue(tmr(5, 5, 0));
        assert_eq!(l.remove_child(1), 3);
        assert!(l.is_empty());
    }

    #[test]
    fn test_timeout_clamped_and_infinite() {
        let mut l = TmrList::new(0);
        assert_eq!(l.timeout_ms(0, 1000), None);
        l.insert(tmr(1, 5000, 0));
        assert_eq!(l.timeout_ms(0, 1000), Some(1000));
        assert_eq!(l.timeout_ms(6000, 1000), Some(0));
    }

    #[test]
    fn test_expire_across_clock_wrap() {
        let start = u32::MAX - 10;
        let mut l = TmrList::new(start);
        l.queue(tmr(1, 20, start));
        assert!(l.expire(start.wrapping_add(5)).is_empty());
        assert_eq!(ids(&l.expire(start.wrapping_add(20))), [1]);
    }

    #[test]
    fn test_rearm_and_callback() {
        let hits = Arc::new(Spinlock::new(0u32));
        let c = hits.clone();
        let mut l = TmrList::new(0);
        l.queue(Tmr::new(
            h(1),
            10,
            true,
            0,
            Box::new(move |_| {
                *c.lock() += 1;
                Ok(())
            }),
        ));
        let mut now = 0;
        for _ in 0..3 {
            now += 10;
            for mut t in l.expire(now) {
                (t.cb)(t.handle.child()).unwrap();
                l.rearm(t);
            }
        }
        assert_eq!(*hits.lock(), 3);
        assert_eq!(l.deltas(), [10]);
    }
}
