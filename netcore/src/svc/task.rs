//! Service task instance: lifecycle, children, timers, messages and the
//! loop body.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use smoltcp::wire::IpEndpoint;

use super::sock::{SockHandle, SockOp, SvcSock};
use super::tmr::{Tmr, TmrFn, TmrHandle, TmrList};
use super::{ChildHandle, ChildHooks, ChildId, MsgPayload, SockHooks, TaskId, TaskSpawn};
use crate::config::{SvcChildCfg, SvcTaskCfg};
use crate::error::{NetError, NetResult};
use crate::klog::{klog_debug, klog_info, klog_warning};
use crate::lock::{self, LockId, SpinlockGuard};
use crate::net::sock::{SelectSets, SockApi, SockFamily, SockType};
use crate::net::SockId;
use crate::time::Clock;
use crate::waitqueue::{Completion, Signal};
use crate::Spinlock;

struct Child {
    id: ChildId,
    cfg: SvcChildCfg,
    hooks: Arc<dyn ChildHooks>,
    tmr_cnt: usize,
    msg_cnt: usize,
    socks: Vec<SvcSock>,
}

/// Change requested for a timer whose callback is running.
enum TmrEdit {
    Del,
    Set { timeout_ms: u32, periodic: bool },
}

struct SockReq {
    child: ChildId,
    family: SockFamily,
    typ: SockType,
    addr: Option<IpEndpoint>,
    backlog: Option<usize>,
}

enum SvcMsg {
    StartChild(ChildId),
    StopChild { child: ChildId, hooks: Arc<dyn ChildHooks> },
    ChildPost { child: ChildId, payload: MsgPayload },
    SockClient(SockReq),
    SockServer(SockReq),
}

impl SvcMsg {
    fn child(&self) -> ChildId {
        match self {
            SvcMsg::StartChild(c) => *c,
            SvcMsg::StopChild { child, .. } | SvcMsg::ChildPost { child, .. } => *child,
            SvcMsg::SockClient(r) | SvcMsg::SockServer(r) => r.child,
        }
    }
}

enum MsgOut {
    Done,
    Sock(SockId),
}

type MsgDone = Arc<Completion<NetResult<MsgOut>>>;

struct QueuedMsg {
    msg: SvcMsg,
    /// Blocking poster waiting on the result
    done: Option<MsgDone>,
    /// Holds a block from the message pool
    pooled: bool,
}

struct SvcState {
    children: Vec<Child>,
    tmrs: TmrList,
    firing: BTreeMap<TmrHandle, Option<TmrEdit>>,
    msgs: VecDeque<QueuedMsg>,
    msg_pooled: usize,
    next_child: ChildId,
    next_tmr: u32,
    next_sock: u32,
    task_id: Option<TaskId>,
}

impl SvcState {
    fn child(&self, id: ChildId) -> NetResult<&Child> {
        self.children.iter().find(|c| c.id == id).ok_or(NetError::NotFound)
    }

    fn child_mut(&mut self, id: ChildId) -> NetResult<&mut Child> {
        self.children.iter_mut().find(|c| c.id == id).ok_or(NetError::NotFound)
    }

    fn tmr_freed(&mut self, h: TmrHandle) {
        if let Ok(c) = self.child_mut(h.child) {
            c.tmr_cnt = c.tmr_cnt.saturating_sub(1);
        }
    }

    fn sock_mut(&mut self, h: SockHandle) -> NetResult<&mut SvcSock> {
        self.child_mut(h.child)?
            .socks
            .iter_mut()
            .find(|s| s.handle == h)
            .ok_or(NetError::NotFound)
    }
}

pub struct SvcTask {
    clock: Arc<dyn Clock>,
    sock: Arc<dyn SockApi>,
    spawner: Arc<dyn TaskSpawn>,
    msg_nbr_max: usize,
    prio: AtomicU32,
    state: Spinlock<SvcState>,
    /// Wakes the loop out of its pend or select
    signal: Signal,
    running: AtomicBool,
    in_loop: AtomicBool,
    /// Context running the current pass plus one, zero when unknown
    loop_ctx: AtomicUsize,
    stop_req: AtomicBool,
    stopped: Signal,
}

impl SvcTask {
    pub fn init(
        cfg: &SvcTaskCfg,
        clock: Arc<dyn Clock>,
        sock: Arc<dyn SockApi>,
        spawner: Arc<dyn TaskSpawn>,
    ) -> NetResult<Arc<Self>> {
        if cfg.msg_nbr_max == 0 {
            return Err(NetError::InvalidArg);
        }
        let now = clock.now_ms();
        Ok(Arc::new(Self {
            clock,
            sock,
            spawner,
            msg_nbr_max: cfg.msg_nbr_max,
            prio: AtomicU32::new(cfg.prio),
            state: Spinlock::new_with_id(
                SvcState {
                    children: Vec::new(),
                    tmrs: TmrList::new(now),
                    firing: BTreeMap::new(),
                    msgs: VecDeque::new(),
                    msg_pooled: 0,
                    next_child: 1,
                    next_tmr: 1,
                    next_sock: 1,
                    task_id: None,
                },
                LockId::SvcTask,
            ),
            signal: Signal::new(),
            running: AtomicBool::new(false),
            in_loop: AtomicBool::new(false),
            loop_ctx: AtomicUsize::new(0),
            stop_req: AtomicBool::new(false),
            stopped: Signal::new(),
        }))
    }

    fn lock(&self) -> SpinlockGuard<'_, SvcState> {
        self.state.lock()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Spawn the loop.
    pub fn start(self: &Arc<Self>) -> NetResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyInit);
        }
        self.stop_req.store(false, Ordering::Release);
        self.stopped.reset();

        let task = Arc::clone(self);
        let entry = Box::new(move || {
            klog_info("svc", "service task running");
            while !task.stop_req.load(Ordering::Acquire) {
                task.run_once();
            }
            klog_info("svc", "service task stopped");
            task.stopped.post();
        });
        match self.spawner.spawn("net_svc", self.prio.load(Ordering::Relaxed), entry) {
            Ok(id) => {
                self.lock().task_id = Some(id);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Ask the loop to exit and wait until it has.
    pub fn stop(&self, timeout_ms: Option<u32>) -> NetResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(NetError::NotInit);
        }
        self.stop_req.store(true, Ordering::Release);
        self.wake();
        if !self.stopped.pend(timeout_ms, &*self.clock) {
            return Err(NetError::Timeout);
        }
        self.lock().task_id = None;
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    pub fn prio_set(&self, prio: u32) -> NetResult<()> {
        self.prio.store(prio, Ordering::Relaxed);
        let task = self.lock().task_id;
        match task {
            Some(id) => self.spawner.prio_set(id, prio),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Break the loop out of its current wait.
    pub fn wake(&self) {
        self.sock.select_abort(&self.signal);
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    // =========================================================================
    // CHILDREN
    // =========================================================================

    /// Register a child. `on_start` runs from the loop.
    pub fn child_start(&self, cfg: &SvcChildCfg, hooks: Arc<dyn ChildHooks>) -> NetResult<ChildHandle> {
        let id = {
            let mut st = self.lock();
            if st.msg_pooled >= self.msg_nbr_max {
                return Err(NetError::PoolEmpty);
            }
            let id = st.next_child;
            st.next_child = st.next_child.wrapping_add(1).max(1);
            st.children.push(Child {
                id,
                cfg: *cfg,
                hooks,
                tmr_cnt: 0,
                msg_cnt: 0,
                socks: Vec::new(),
            });
            st.msg_pooled += 1;
            st.msgs.push_back(QueuedMsg {
                msg: SvcMsg::StartChild(id),
                done: None,
                pooled: true,
            });
            id
        };
        klog_info("svc", &format!("child {} registered", id));
        self.wake();
        Ok(ChildHandle(id))
    }

    /// Remove a child with its timers and socket handles; `on_stop` runs
    /// from the loop.
    pub fn child_stop(&self, child: ChildHandle) -> NetResult<()> {
        let orphans = {
            let mut st = self.lock();
            let pos = st
                .children
                .iter()
                .position(|c| c.id == child.0)
                .ok_or(NetError::NotFound)?;
            let c = st.children.remove(pos);
            st.tmrs.remove_child(c.id);

            let (orphans, keep): (Vec<_>, Vec<_>) = core::mem::take(&mut st.msgs)
                .into_iter()
                .partition(|m| matches!(m.msg, SvcMsg::ChildPost { child, .. } if child == c.id));
            st.msgs = keep.into_iter().collect();
            st.msg_pooled -= orphans.iter().filter(|m| m.pooled).count();

            st.msgs.push_back(QueuedMsg {
                msg: SvcMsg::StopChild {
                    child: c.id,
                    hooks: c.hooks,
                },
                done: None,
                pooled: false,
            });
            orphans
        };
        for m in orphans {
            if let Some(done) = m.done {
                done.complete(Err(NetError::NotFound));
            }
        }
        klog_info("svc", &format!("child {} removed", child.0));
        self.wake();
        Ok(())
    }

    /// Queue a message for the child's `on_msg` and return at once.
    pub fn child_msg_post(&self, child: ChildHandle, payload: MsgPayload) -> NetResult<()> {
        {
            let mut st = self.lock();
            if st.msg_pooled >= self.msg_nbr_max {
                return Err(NetError::PoolEmpty);
            }
            let c = st.child_mut(child.0)?;
            if c.msg_cnt >= c.cfg.msg_nbr_max {
                return Err(NetError::PoolEmpty);
            }
            c.msg_cnt += 1;
            st.msg_pooled += 1;
            st.msgs.push_back(QueuedMsg {
                msg: SvcMsg::ChildPost {
                    child: child.0,
                    payload,
                },
                done: None,
                pooled: true,
            });
        }
        self.wake();
        Ok(())
    }

    /// Deliver a message to the child's `on_msg` and wait for its result.
    pub fn child_msg_post_wait(&self, child: ChildHandle, payload: MsgPayload, timeout_ms: Option<u32>) -> NetResult<()> {
        self.lock().child(child.0)?;
        self.post_wait(
            SvcMsg::ChildPost {
                child: child.0,
                payload,
            },
            timeout_ms,
        )
        .map(|_| ())
    }

    fn post_wait(&self, msg: SvcMsg, timeout_ms: Option<u32>) -> NetResult<MsgOut> {
        // Nobody else would serve the queue
        if !self.is_running() || self.on_loop() {
            return self.msg_handle(msg);
        }
        let done: MsgDone = Arc::new(Completion::new());
        self.lock().msgs.push_back(QueuedMsg {
            msg,
            done: Some(done.clone()),
            pooled: false,
        });
        self.wake();
        if let Some(res) = done.wait(timeout_ms, &*self.clock) {
            return res;
        }
        let removed = {
            let mut st = self.lock();
            match st
                .msgs
                .iter()
                .position(|m| m.done.as_ref().map_or(false, |d| Arc::ptr_eq(d, &done)))
            {
                Some(pos) => st.msgs.remove(pos).is_some(),
                None => false,
            }
        };
        if removed {
            return Err(NetError::Timeout);
        }
        // Already being handled
        done.wait(None, &*self.clock).unwrap_or(Err(NetError::Timeout))
    }

    /// Whether the caller is the loop in the middle of a pass.
    ///
    /// Without a context source every caller during a pass counts as the loop.
    fn on_loop(&self) -> bool {
        if !self.in_loop.load(Ordering::Acquire) {
            return false;
        }
        match lock::ctx_id() {
            Some(ctx) => self.loop_ctx.load(Ordering::Acquire) == ctx.wrapping_add(1),
            None => true,
        }
    }

    pub fn child_count(&self) -> usize {
        self.lock().children.len()
    }

    // =========================================================================
    // TIMERS
    // =========================================================================

    pub fn tmr_create(&self, child: ChildHandle, timeout_ms: u32, periodic: bool, cb: TmrFn) -> NetResult<TmrHandle> {
        let now = self.clock.now_ms();
        let h = {
            let mut st = self.lock();
            let id = st.next_tmr;
            let c = st.child_mut(child.0)?;
            if c.tmr_cnt >= c.cfg.tmr_nbr_max {
                return Err(NetError::PoolEmpty);
            }
            c.tmr_cnt += 1;
            st.next_tmr = st.next_tmr.wrapping_add(1);
            let h = TmrHandle { child: child.0, id };
            st.tmrs.queue(Tmr::new(h, timeout_ms, periodic, now, cb));
            h
        };
        self.wake();
        Ok(h)
    }

    /// Re-arm a timer with a new timeout, counted from now.
    pub fn tmr_set(&self, h: TmrHandle, timeout_ms: u32, periodic: bool) -> NetResult<()> {
        let now = self.clock.now_ms();
        {
            let mut st = self.lock();
            if let Some(mut t) = st.tmrs.remove(h) {
                t.timeout_ms = timeout_ms;
                t.periodic = periodic;
                t.delta_ms = timeout_ms;
                t.ts_ms = now;
                st.tmrs.queue(t);
            } else if let Some(edit) = st.firing.get_mut(&h) {
                *edit = Some(TmrEdit::Set { timeout_ms, periodic });
            } else {
                return Err(NetError::NotFound);
            }
        }
        self.wake();
        Ok(())
    }

    pub fn tmr_del(&self, h: TmrHandle) -> NetResult<()> {
        let mut st = self.lock();
        if st.tmrs.remove(h).is_some() {
            st.tmr_freed(h);
            return Ok(());
        }
        match st.firing.get_mut(&h) {
            Some(edit) => {
                *edit = Some(TmrEdit::Del);
                Ok(())
            }
            None => Err(NetError::NotFound),
        }
    }

    pub fn tmr_count(&self) -> usize {
        self.lock().tmrs.len()
    }

    // =========================================================================
    // SOCKETS
    // =========================================================================

    /// Open a socket for a child, optionally bound.
    pub fn sock_create_client(
        &self,
        child: ChildHandle,
        family: SockFamily,
        typ: SockType,
        bind: Option<IpEndpoint>,
    ) -> NetResult<SockId> {
        self.lock().child(child.0)?;
        let req = SockReq {
            child: child.0,
            family,
            typ,
            addr: bind,
            backlog: None,
        };
        match self.post_wait(SvcMsg::SockClient(req), None)? {
            MsgOut::Sock(id) => Ok(id),
            MsgOut::Done => Err(NetError::InvalidState),
        }
    }

    /// Open, bind and (for streams) listen.
    pub fn sock_create_server(
        &self,
        child: ChildHandle,
        family: SockFamily,
        typ: SockType,
        bind: IpEndpoint,
        backlog: usize,
    ) -> NetResult<SockId> {
        self.lock().child(child.0)?;
        let req = SockReq {
            child: child.0,
            family,
            typ,
            addr: Some(bind),
            backlog: Some(backlog),
        };
        match self.post_wait(SvcMsg::SockServer(req), None)? {
            MsgOut::Sock(id) => Ok(id),
            MsgOut::Done => Err(NetError::InvalidState),
        }
    }

    /// Watch `sock` on behalf of a child.
    pub fn sock_handle_create(
        &self,
        child: ChildHandle,
        sock: SockId,
        op: SockOp,
        hooks: Arc<dyn SockHooks>,
    ) -> NetResult<SockHandle> {
        let h = {
            let mut st = self.lock();
            let id = st.next_sock;
            let c = st.child_mut(child.0)?;
            if c.socks.len() >= c.cfg.sock_nbr_max {
                return Err(NetError::PoolEmpty);
            }
            let h = SockHandle { child: child.0, id };
            c.socks.push(SvcSock {
                handle: h,
                sock,
                op,
                hooks,
            });
            st.next_sock = st.next_sock.wrapping_add(1);
            h
        };
        self.wake();
        Ok(h)
    }

    pub fn sock_handle_type_set(&self, h: SockHandle, op: SockOp) -> NetResult<()> {
        self.lock().sock_mut(h)?.op = op;
        self.wake();
        Ok(())
    }

    pub fn sock_handle_del(&self, h: SockHandle) -> NetResult<()> {
        {
            let mut st = self.lock();
            let c = st.child_mut(h.child)?;
            let pos = c.socks.iter().position(|s| s.handle == h).ok_or(NetError::NotFound)?;
            c.socks.remove(pos);
        }
        self.wake();
        Ok(())
    }

    // =========================================================================
    // LOOP
    // =========================================================================

    /// One loop iteration.
    pub fn run_once(&self) {
        let now = self.clock.now_ms();
        let (mut sets, timeout) = {
            let st = self.lock();
            let mut sets = SelectSets::default();
            for c in &st.children {
                for s in &c.socks {
                    s.add_to(&mut sets);
                }
            }
            (sets, st.tmrs.timeout_ms(now, self.clock.max_dly_ms()))
        };

        let ready = if sets.is_empty() {
            self.signal.pend(timeout, &*self.clock);
            0
        } else {
            match self.sock.select(&mut sets, timeout, &self.signal) {
                Ok(n) => n,
                Err(e) => {
                    klog_debug("svc", &format!("select: {}", e));
                    0
                }
            }
        };

        let ctx = lock::ctx_id().map_or(0, |c| c.wrapping_add(1));
        self.loop_ctx.store(ctx, Ordering::Release);
        self.in_loop.store(true, Ordering::Release);
        self.tmr_process();
        self.msg_process();
        if ready > 0 {
            self.sock_process(&sets);
        }

        self.in_loop.store(false, Ordering::Release);
        self.loop_ctx.store(0, Ordering::Release);
    }

    fn tmr_process(&self) {
        let now = self.clock.now_ms();
        let fired = {
            let mut st = self.lock();
            let fired = st.tmrs.expire(now);
            for t in &fired {
                st.firing.insert(t.handle, None);
            }
            fired
        };

        for mut t in fired {
            let child = t.handle.child();
            if let Err(e) = (t.cb)(child) {
                self.child_err(child, e);
            }

            let mut st = self.lock();
            let edit = st.firing.remove(&t.handle).flatten();
            let alive = st.child(t.handle.child).is_ok();
            match edit {
                Some(TmrEdit::Del) => st.tmr_freed(t.handle),
                Some(TmrEdit::Set { timeout_ms, periodic }) if alive => {
                    t.timeout_ms = timeout_ms;
                    t.periodic = periodic;
                    t.delta_ms = timeout_ms;
                    t.ts_ms = self.clock.now_ms();
                    st.tmrs.queue(t);
                }
                _ if alive && t.periodic => st.tmrs.rearm(t),
                _ => st.tmr_freed(t.handle),
            }
        }
    }

    fn msg_process(&self) {
        self.signal.reset();
        let msgs: Vec<QueuedMsg> = {
            let mut st = self.lock();
            let msgs: Vec<QueuedMsg> = st.msgs.drain(..).collect();
            for m in msgs.iter().filter(|m| m.pooled) {
                st.msg_pooled = st.msg_pooled.saturating_sub(1);
                if let SvcMsg::ChildPost { child, .. } = m.msg {
                    if let Ok(c) = st.child_mut(child) {
                        c.msg_cnt = c.msg_cnt.saturating_sub(1);
                    }
                }
            }
            msgs
        };

        for m in msgs {
            let child = ChildHandle(m.msg.child());
            let res = self.msg_handle(m.msg);
            match m.done {
                Some(done) => done.complete(res),
                None => {
                    if let Err(e) = res {
                        self.child_err(child, e);
                    }
                }
            }
        }
    }

    fn msg_handle(&self, msg: SvcMsg) -> NetResult<MsgOut> {
        match msg {
            SvcMsg::StartChild(id) => {
                let hooks = self.child_hooks(id)?;
                hooks.on_start(ChildHandle(id))?;
                klog_info("svc", &format!("child {} started", id));
                Ok(MsgOut::Done)
            }
            SvcMsg::StopChild { child, hooks } => {
                let h = ChildHandle(child);
                if let Err(e) = hooks.on_stop(h) {
                    hooks.on_err(h, e);
                }
                Ok(MsgOut::Done)
            }
            SvcMsg::ChildPost { child, payload } => {
                let hooks = self.child_hooks(child)?;
                hooks.on_msg(ChildHandle(child), payload)?;
                Ok(MsgOut::Done)
            }
            SvcMsg::SockClient(req) | SvcMsg::SockServer(req) => self.sock_open(&req).map(MsgOut::Sock),
        }
    }

    fn sock_open(&self, req: &SockReq) -> NetResult<SockId> {
        let id = self.sock.open(req.family, req.typ)?;
        match self.sock_setup(id, req) {
            Ok(()) => {
                klog_debug("svc", &format!("child {}: sock {} open", req.child, id));
                Ok(id)
            }
            Err(e) => {
                let _ = self.sock.close(id);
                Err(e)
            }
        }
    }

    fn sock_setup(&self, id: SockId, req: &SockReq) -> NetResult<()> {
        if let Some(addr) = req.addr {
            self.sock.bind(id, addr)?;
        }
        if let (Some(backlog), SockType::Stream) = (req.backlog, req.typ) {
            self.sock.listen(id, backlog)?;
        }
        Ok(())
    }

    fn sock_process(&self, sets: &SelectSets) {
        let ready: Vec<SvcSock> = {
            let st = self.lock();
            st.children
                .iter()
                .flat_map(|c| c.socks.iter())
                .filter(|s| s.is_ready(sets))
                .cloned()
                .collect()
        };
        for s in ready {
            match s.dispatch(&*self.sock, sets) {
                Ok(()) | Err(NetError::WouldBlock) => {}
                Err(e) => self.child_err(s.handle.child(), e),
            }
        }
    }

    fn child_hooks(&self, id: ChildId) -> NetResult<Arc<dyn ChildHooks>> {
        Ok(self.lock().child(id)?.hooks.clone())
    }

    /// Report an error to the child's `on_err`.
    fn child_err(&self, child: ChildHandle, e: NetError) {
        klog_warning("svc", &format!("child {}: {}", child.0, e));
        if let Ok(hooks) = self.child_hooks(child.0) {
            hooks.on_err(child, e);
        }
    }
}
