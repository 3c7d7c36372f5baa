//! DNS client context.
//!
//! Without a service task every lookup drives its host object on the
//! caller's thread (blocking sockets, or one non-blocking pass per call with
//! `NO_BLOCK`). After `task_start` a periodic timer on the service task
//! drives all pending hosts with non-blocking sockets and blocking callers
//! sleep on the host's waiter signal.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU16;

use smoltcp::wire::{IpAddress, Ipv4Address};

use super::cache::{DnsCache, HostId, SrchResult};
use super::req::{self, DnsReqCfg, HostReq, HostState, ReqIo, ReqParams};
use super::DnsFlags;
use crate::config::{DnsCfg, SvcChildCfg};
use crate::error::{NetError, NetResult};
use crate::klog::{klog_debug, klog_info, klog_warning};
use crate::lock::LockId;
use crate::net::ip::NetIf;
use crate::net::sock::{SelectSets, SockApi};
use crate::net::stack::NetStack;
use crate::net::utils::parse_ip_literal;
use crate::svc::{ChildHandle, ChildHooks, SvcTask};
use crate::time::Clock;
use crate::waitqueue::Signal;
use crate::Spinlock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsStatus {
    Pending,
    Resolved { count: usize },
    Failed,
}

enum Lookup {
    Hit(usize),
    Wait(HostId),
}

enum Drive {
    Ran,
    /// Someone else is stepping the host; signal posted when it finishes
    Busy(Option<Arc<Signal>>),
}

pub struct DnsClient {
    cfg: DnsCfg,
    cache: Spinlock<DnsCache>,
    sock: Arc<dyn SockApi>,
    netif: Arc<dyn NetIf>,
    clock: Arc<dyn Clock>,
    txid: AtomicU16,
    task: Spinlock<Option<(Arc<SvcTask>, ChildHandle)>>,
}

impl DnsClient {
    pub fn new(
        cfg: &DnsCfg,
        sock: Arc<dyn SockApi>,
        netif: Arc<dyn NetIf>,
        clock: Arc<dyn Clock>,
    ) -> NetResult<Arc<Self>> {
        if cfg.host_name_block_size < 2 || !(cfg.ipv4_en || cfg.ipv6_en) {
            return Err(NetError::InvalidArg);
        }
        klog_info(
            "dns",
            &format!("client ready, server {}:{}", cfg.server.addr, cfg.server.port),
        );
        let txid = AtomicU16::new(txid_seed(cfg, clock.now_ms()));
        Ok(Arc::new(Self {
            cfg: *cfg,
            cache: Spinlock::new_with_id(DnsCache::new(cfg), LockId::DnsCache),
            sock,
            netif,
            clock,
            txid,
            task: Spinlock::new(None),
        }))
    }

    /// Client using the interfaces and clock of `stack`.
    pub fn with_stack(cfg: &DnsCfg, stack: &NetStack, sock: Arc<dyn SockApi>) -> NetResult<Arc<Self>> {
        let env = stack.env();
        Self::new(cfg, sock, env.netif.clone(), env.clock.clone())
    }

    pub fn cfg(&self) -> &DnsCfg {
        &self.cfg
    }

    // =========================================================================
    // LOOKUPS
    // =========================================================================

    /// Resolve `name` into `addrs`.
    ///
    /// Address literals are answered directly unless `FORCE_RESOLUTION` is
    /// set. `FORCE_CACHE` never touches the network and reports a miss as
    /// `NotFound`.
    pub fn get_host(
        &self,
        name: &str,
        addrs: &mut [IpAddress],
        flags: DnsFlags,
        req_cfg: Option<&DnsReqCfg>,
    ) -> NetResult<DnsStatus> {
        if name.is_empty() || addrs.is_empty() {
            return Err(NetError::InvalidArg);
        }
        if flags.contains(DnsFlags::IPV4_ONLY | DnsFlags::IPV6_ONLY) {
            return Err(NetError::InvalidArg);
        }

        if !flags.contains(DnsFlags::FORCE_RESOLUTION) {
            if let Some(ip) = parse_ip_literal(name) {
                let excluded = match ip {
                    IpAddress::Ipv4(_) => flags.contains(DnsFlags::IPV6_ONLY),
                    IpAddress::Ipv6(_) => flags.contains(DnsFlags::IPV4_ONLY),
                };
                if excluded {
                    return Err(NetError::InvalidArg);
                }
                addrs[0] = ip;
                return Ok(DnsStatus::Resolved { count: 1 });
            }
        }

        if flags.contains(DnsFlags::FORCE_CACHE) {
            return self.cache_host_srch(name, addrs, flags);
        }

        match self.lookup(name, addrs, flags, req_cfg)? {
            Lookup::Hit(count) => Ok(DnsStatus::Resolved { count }),
            Lookup::Wait(id) => self.resolve(id, addrs, flags),
        }
    }

    /// Like `get_host`, appending up to `max` addresses to `out`.
    pub fn get_host_addrs(
        &self,
        name: &str,
        out: &mut Vec<IpAddress>,
        max: usize,
        flags: DnsFlags,
        req_cfg: Option<&DnsReqCfg>,
    ) -> NetResult<DnsStatus> {
        if max == 0 {
            return Err(NetError::InvalidArg);
        }
        let mut buf = vec![IpAddress::Ipv4(Ipv4Address::UNSPECIFIED); max];
        let status = self.get_host(name, &mut buf, flags, req_cfg)?;
        if let DnsStatus::Resolved { count } = status {
            out.extend_from_slice(&buf[..count]);
        }
        Ok(status)
    }

    /// Serve from the cache or create the host object to resolve.
    fn lookup(
        &self,
        name: &str,
        addrs: &mut [IpAddress],
        flags: DnsFlags,
        req_cfg: Option<&DnsReqCfg>,
    ) -> NetResult<Lookup> {
        let mut cache = self.cache.lock();

        if let Some((id, state, busy)) = cache.host_srch(name).map(|h| (h.id, h.state(), h.busy)) {
            let renew = flags.contains(DnsFlags::FORCE_RENEW) && !state.is_pending() && !busy;
            match state {
                _ if renew => {
                    cache.host_remove(id);
                }
                HostState::Resolved => {
                    if let Some(h) = cache.host(id) {
                        return Ok(Lookup::Hit(h.copy_addrs(addrs, flags)));
                    }
                }
                HostState::Failed | HostState::Free => {
                    cache.host_remove(id);
                }
                _ => return Ok(Lookup::Wait(id)),
            }
        }

        let ipv4_en = self.cfg.ipv4_en && !flags.contains(DnsFlags::IPV6_ONLY);
        let ipv6_en = self.cfg.ipv6_en && !flags.contains(DnsFlags::IPV4_ONLY);
        if !ipv4_en && !ipv6_en {
            return Err(NetError::InvalidArg);
        }
        let non_blocking = self.task_running() || flags.contains(DnsFlags::NO_BLOCK);
        let params = ReqParams::new(&self.cfg, req_cfg, ipv4_en, ipv6_en, non_blocking);
        let host = cache.host_obj_new(name, HostReq::new(params))?;
        let id = cache.host_insert(host)?;
        klog_debug("dns", &format!("{}: resolving", name));
        Ok(Lookup::Wait(id))
    }

    fn resolve(&self, id: HostId, addrs: &mut [IpAddress], flags: DnsFlags) -> NetResult<DnsStatus> {
        let blocking = !flags.contains(DnsFlags::NO_BLOCK);

        if self.task_running() {
            if let Some((task, _)) = self.task.lock().as_ref() {
                task.wake();
            }
            if blocking {
                if let Some((sig, budget_ms)) = self.waiter(id)? {
                    let limit = budget_ms.saturating_add(self.cfg.task_dly_ms.saturating_mul(2));
                    if !sig.pend(Some(limit), &*self.clock) {
                        klog_warning("dns", &format!("resolver task silent for {} ms", limit));
                    }
                }
            }
        } else {
            while let Drive::Busy(Some(sig)) = self.drive(id, blocking) {
                // The other stepper may stop short of a terminal state
                sig.pend(Some(self.cfg.req_timeout_ms), &*self.clock);
            }
        }

        self.result(id, addrs, flags)
    }

    /// Register a waiter unless the host already finished. Also returns how
    /// long its resolution may take.
    fn waiter(&self, id: HostId) -> NetResult<Option<(Arc<Signal>, u32)>> {
        let mut cache = self.cache.lock();
        let h = cache.host_mut(id).ok_or(NetError::NotFound)?;
        if h.state().is_done() {
            return Ok(None);
        }
        let sig = Arc::new(Signal::new());
        h.waiters.push(sig.clone());
        Ok(Some((sig, h.req.params.budget_ms())))
    }

    fn result(&self, id: HostId, addrs: &mut [IpAddress], flags: DnsFlags) -> NetResult<DnsStatus> {
        let cache = self.cache.lock();
        let h = cache.host(id).ok_or(NetError::NotFound)?;
        Ok(match h.state() {
            HostState::Resolved => DnsStatus::Resolved {
                count: h.copy_addrs(addrs, flags),
            },
            HostState::Failed => DnsStatus::Failed,
            _ => DnsStatus::Pending,
        })
    }

    /// Step one host with the cache unlocked.
    ///
    /// Blocking drives run to a terminal state; non-blocking ones stop as
    /// soon as a receive would block.
    fn drive(&self, id: HostId, blocking: bool) -> Drive {
        let (mut hreq, name) = {
            let mut cache = self.cache.lock();
            let Some(h) = cache.host_mut(id) else {
                return Drive::Ran;
            };
            if h.state().is_done() {
                return Drive::Ran;
            }
            if h.busy {
                if !blocking {
                    return Drive::Busy(None);
                }
                let sig = Arc::new(Signal::new());
                h.waiters.push(sig.clone());
                return Drive::Busy(Some(sig));
            }
            h.busy = true;
            (h.req.clone(), String::from(h.name.as_str()))
        };

        let io = ReqIo {
            sock: &*self.sock,
            netif: &*self.netif,
            clock: &*self.clock,
            txid: &self.txid,
        };
        let mut found = Vec::new();
        loop {
            let progressed = req::step(&mut hreq, &name, &io, &mut found);
            if hreq.state.is_done() {
                break;
            }
            if !progressed {
                if !blocking {
                    break;
                }
                self.rx_wait(&hreq);
            }
        }

        let mut cache = self.cache.lock();
        let Some(h) = cache.host_mut(id) else {
            drop(cache);
            if let Some(sock) = hreq.sock {
                let _ = self.sock.close(sock);
            }
            return Drive::Ran;
        };
        let mut stale = None;
        if h.cancel && !hreq.state.is_done() {
            stale = hreq.sock.take();
            hreq.state = HostState::Failed;
        }
        let state = hreq.state;
        h.req = hreq;
        h.busy = false;
        h.cancel = false;
        for a in found {
            if let Err(e) = cache.addr_insert(id, a) {
                klog_warning("dns", &format!("{}: address {} dropped: {}", name, a, e));
            }
        }
        if state.is_done() {
            let n = cache.host(id).map_or(0, |h| h.addrs.len());
            match state {
                HostState::Resolved => klog_info("dns", &format!("{}: resolved, {} address(es)", name, n)),
                _ => klog_info("dns", &format!("{}: resolution failed", name)),
            }
            if let Some(h) = cache.host_mut(id) {
                h.notify();
            }
        }
        drop(cache);
        if let Some(sock) = stale {
            let _ = self.sock.close(sock);
        }
        Drive::Ran
    }

    /// Sleep until the host's socket is readable or its receive deadline passes.
    fn rx_wait(&self, hreq: &HostReq) {
        let wait_ms = req::rx_wait_ms(hreq, self.clock.now_ms());
        let abort = Signal::new();
        let selected = match hreq.sock {
            Some(sock) => {
                let mut sets = SelectSets::default();
                sets.rd.set(sock);
                self.sock.select(&mut sets, Some(wait_ms), &abort).is_ok()
            }
            None => false,
        };
        if !selected {
            abort.pend(Some(wait_ms), &*self.clock);
        }
    }

    /// Drive every pending host one non-blocking pass.
    pub fn resolve_pending(&self) {
        let ids = self.cache.lock().pending_ids();
        for id in ids {
            self.drive(id, false);
        }
    }

    // =========================================================================
    // SERVICE TASK
    // =========================================================================

    /// Hand resolution over to a service task child with a periodic timer.
    pub fn task_start(self: &Arc<Self>, task: &Arc<SvcTask>) -> NetResult<()> {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return Err(NetError::AlreadyInit);
        }
        let cfg = SvcChildCfg {
            tmr_nbr_max: 1,
            sock_nbr_max: 0,
            msg_nbr_max: 1,
        };
        let child = task.child_start(&cfg, Arc::new(DnsChild))?;
        let client = Arc::downgrade(self);
        let tmr = task.tmr_create(
            child,
            self.cfg.task_dly_ms,
            true,
            Box::new(move |_| {
                if let Some(c) = client.upgrade() {
                    c.resolve_pending();
                }
                Ok(())
            }),
        );
        if let Err(e) = tmr {
            let _ = task.child_stop(child);
            return Err(e);
        }
        *slot = Some((task.clone(), child));
        Ok(())
    }

    /// Return to caller-driven resolution.
    ///
    /// Hosts the task was still resolving fail and their waiters wake.
    pub fn task_stop(&self) -> NetResult<()> {
        let (task, child) = self.task.lock().take().ok_or(NetError::NotInit)?;
        let res = task.child_stop(child);
        let socks = self.cache.lock().fail_pending();
        for sock in socks {
            let _ = self.sock.close(sock);
        }
        res
    }

    fn task_running(&self) -> bool {
        self.task.lock().is_some()
    }

    // =========================================================================
    // CACHE
    // =========================================================================

    pub fn cache_clr_all(&self) {
        let n = self.cache.lock().clr_all();
        klog_debug("dns", &format!("cache cleared, {} host(s)", n));
    }

    pub fn cache_clr_host(&self, name: &str) -> NetResult<()> {
        self.cache.lock().clr_host(name)
    }

    /// Cache lookup without resolution.
    pub fn cache_host_srch(&self, name: &str, addrs: &mut [IpAddress], flags: DnsFlags) -> NetResult<DnsStatus> {
        Ok(match self.cache.lock().srch(name, addrs, flags)? {
            SrchResult::Pending => DnsStatus::Pending,
            SrchResult::Resolved(count) => DnsStatus::Resolved { count },
        })
    }

    /// Add a resolved entry by hand, replacing an idle one of the same name.
    pub fn cache_host_insert(&self, name: &str, addrs: &[IpAddress]) -> NetResult<()> {
        let mut cache = self.cache.lock();
        if let Some(h) = cache.host_srch(name) {
            if h.state().is_pending() || h.busy {
                return Err(NetError::InvalidState);
            }
            let id = h.id;
            cache.host_remove(id);
        }
        let params = ReqParams::new(&self.cfg, None, self.cfg.ipv4_en, self.cfg.ipv6_en, false);
        let mut host = cache.host_obj_new(name, HostReq::new(params))?;
        host.req.state = HostState::Resolved;
        let id = cache.host_insert(host)?;
        for a in addrs {
            cache.addr_insert(id, *a)?;
        }
        Ok(())
    }

    /// Attach another address to a cached host.
    pub fn cache_addr_insert(&self, name: &str, addr: IpAddress) -> NetResult<()> {
        let mut cache = self.cache.lock();
        let id = cache.host_srch(name).ok_or(NetError::NotFound)?.id;
        cache.addr_insert(id, addr)
    }

    pub fn cache_evict_oldest(&self) -> bool {
        self.cache.lock().evict_oldest()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

fn txid_seed(cfg: &DnsCfg, now: u32) -> u16 {
    (now as u16) ^ cfg.server.port.rotate_left(8)
}

/// Service task child owning the resolution timer.
struct DnsChild;

impl ChildHooks for DnsChild {
    fn on_start(&self, child: ChildHandle) -> NetResult<()> {
        klog_info("dns", &format!("resolver child {} started", child.id()));
        Ok(())
    }

    fn on_stop(&self, child: ChildHandle) -> NetResult<()> {
        klog_info("dns", &format!("resolver child {} stopped", child.id()));
        Ok(())
    }

    fn on_err(&self, _child: ChildHandle, err: NetError) {
        klog_warning("dns", &format!("resolver: {}", err));
    }
}

#[cfg(test)]
mod tests {
    use smoltcp::wire::Ipv6Address;

    use super::*;
    use crate::config::SvcTaskCfg;
    use crate::testutil::{FakeIf, FakeSock, NullSpawner, SockScript};
    use crate::time::ManualClock;

    const V4: IpAddress = IpAddress::Ipv4(Ipv4Address::new(192, 0, 2, 10));
    const V4B: IpAddress = IpAddress::Ipv4(Ipv4Address::new(192, 0, 2, 11));
    const V6: IpAddress = IpAddress::Ipv6(Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 10));
    const NONE: IpAddress = IpAddress::Ipv4(Ipv4Address::UNSPECIFIED);

    struct Rig {
        client: Arc<DnsClient>,
        sock: Arc<FakeSock>,
        clock: Arc<ManualClock>,
    }

    fn rig_with(cfg: DnsCfg, script: Vec<SockScript>) -> Rig {
        let clock = Arc::new(ManualClock::new(0));
        let sock = Arc::new(FakeSock::new(script).with_clock(clock.clone()));
        let client = DnsClient::new(&cfg, sock.clone(), Arc::new(FakeIf::new(1460)), clock.clone()).unwrap();
        Rig { client, sock, clock }
    }

    fn rig(script: Vec<SockScript>) -> Rig {
        let mut cfg = DnsCfg::new();
        cfg.req_retry = 1;
        cfg.req_timeout_ms = 100;
        rig_with(cfg, script)
    }

    #[test]
    fn test_literal_short_circuit() {
        let r = rig(vec![]);
        let mut out = [NONE; 1];
        let st = r.client.get_host("192.168.1.1", &mut out, DnsFlags::NONE, None).unwrap();
        assert_eq!(st, DnsStatus::Resolved { count: 1 });
        assert_eq!(out[0], IpAddress::Ipv4(Ipv4Address::new(192, 168, 1, 1)));
        let st = r.client.get_host("fe80::1", &mut out, DnsFlags::NONE, None).unwrap();
        assert_eq!(st, DnsStatus::Resolved { count: 1 });
        assert_eq!(r.sock.tx_count(), 0);
        assert_eq!(r.client.cache_len(), 0);
    }

    #[test]
    fn test_force_resolution_queries_literal() {
        let r = rig(vec![SockScript::Answer(vec![V4]), SockScript::Answer(vec![])]);
        let mut out = [NONE; 2];
        let st = r
            .client
            .get_host("10.0.0.1", &mut out, DnsFlags::FORCE_RESOLUTION, None)
            .unwrap();
        assert_eq!(st, DnsStatus::Resolved { count: 1 });
        assert_eq!(r.sock.tx_count(), 2);
    }

    #[test]
    fn test_blocking_resolve_and_cache_hit() {
        let r = rig(vec![SockScript::Answer(vec![V4, V4B]), SockScript::Answer(vec![V6])]);
        let mut out = [NONE; 4];
        let st = r.client.get_host("example.com", &mut out, DnsFlags::NONE, None).unwrap();
        assert_eq!(st, DnsStatus::Resolved { count: 3 });
        assert_eq!(&out[..3], &[V4, V4B, V6]);
        assert_eq!(r.sock.open_count(), 0);

        // Second lookup is served from the cache, identical answer
        let mut again = [NONE; 4];
        let st = r.client.get_host("EXAMPLE.com", &mut again, DnsFlags::NONE, None).unwrap();
        assert_eq!(st, DnsStatus::Resolved { count: 3 });
        assert_eq!(out, again);
        assert_eq!(r.sock.tx_count(), 2);

        let st = r.client.get_host("example.com", &mut out, DnsFlags::IPV6_ONLY, None).unwrap();
        assert_eq!(st, DnsStatus::Resolved { count: 1 });
        assert_eq!(out[0], V6);
    }

    #[test]
    fn test_force_cache_miss_does_not_mutate() {
        let r = rig(vec![]);
        let mut out = [NONE; 2];
        for _ in 0..2 {
            assert_eq!(
                r.client.get_host("nowhere.lan", &mut out, DnsFlags::FORCE_CACHE, None),
                Err(NetError::NotFound)
            );
        }
        assert_eq!(r.client.cache_len(), 0);
        assert_eq!(r.sock.tx_count(), 0);
    }

    #[test]
    fn test_force_renew_refetches() {
        let r = rig(vec![
            SockScript::Answer(vec![V4]),
            SockScript::Answer(vec![]),
            SockScript::Answer(vec![V4B]),
            SockScript::Answer(vec![]),
        ]);
        let mut out = [NONE; 2];
        r.client.get_host("h.lan", &mut out, DnsFlags::NONE, None).unwrap();
        assert_eq!(out[0], V4);
        let st = r.client.get_host("h.lan", &mut out, DnsFlags::FORCE_RENEW, None).unwrap();
        assert_eq!(st, DnsStatus::Resolved { count: 1 });
        assert_eq!(out[0], V4B);
        assert_eq!(r.client.cache_len(), 1);
    }

    #[test]
    fn test_failed_then_refetched() {
        let r = rig(vec![SockScript::NxDomain, SockScript::Answer(vec![V4]), SockScript::Answer(vec![])]);
        let mut out = [NONE; 2];
        let st = r.client.get_host("gone.lan", &mut out, DnsFlags::NONE, None).unwrap();
        assert_eq!(st, DnsStatus::Failed);
        assert_eq!(
            r.client.get_host("gone.lan", &mut out, DnsFlags::FORCE_CACHE, None),
            Err(NetError::NotFound)
        );
        let st = r.client.get_host("gone.lan", &mut out, DnsFlags::NONE, None).unwrap();
        assert_eq!(st, DnsStatus::Resolved { count: 1 });
        assert_eq!(r.client.cache_len(), 1);
    }

    #[test]
    fn test_timeout_exhaustion_fails() {
        let r = rig(vec![SockScript::Timeout; 8]);
        let mut out = [NONE; 2];
        let st = r.client.get_host("slow.lan", &mut out, DnsFlags::IPV4_ONLY, None).unwrap();
        assert_eq!(st, DnsStatus::Failed);
        // retry 1: two transmissions
        assert_eq!(r.sock.tx_count(), 2);
    }

    #[test]
    fn test_blocking_resolve_waits_out_silent_server() {
        let r = rig(vec![SockScript::Empty; 4]);
        let mut out = [NONE; 1];
        let st = r.client.get_host("mute.lan", &mut out, DnsFlags::IPV4_ONLY, None).unwrap();
        assert_eq!(st, DnsStatus::Failed);
        assert_eq!(r.sock.tx_count(), 2);
        // Each transmission waited its full timeout on the socket
        assert!(r.clock.now_ms() >= 200);
        assert_eq!(r.sock.open_count(), 0);
    }

    #[test]
    fn test_req_cfg_overrides() {
        let r = rig(vec![SockScript::Timeout; 8]);
        let server = smoltcp::wire::IpEndpoint::new(IpAddress::Ipv4(Ipv4Address::new(9, 9, 9, 9)), 5353);
        let over = DnsReqCfg {
            server: Some(server),
            retry: Some(0),
            ..Default::default()
        };
        let mut out = [NONE; 1];
        let st = r.client.get_host("x.lan", &mut out, DnsFlags::IPV4_ONLY, Some(&over)).unwrap();
        assert_eq!(st, DnsStatus::Failed);
        let sent = r.sock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, server);
    }

    #[test]
    fn test_no_block_polls() {
        let r = rig(vec![SockScript::Empty, SockScript::Answer(vec![V4])]);
        let mut out = [NONE; 2];
        let flags = DnsFlags::NO_BLOCK | DnsFlags::IPV4_ONLY;
        assert_eq!(r.client.get_host("p.lan", &mut out, flags, None), Ok(DnsStatus::Pending));
        assert_eq!(r.client.get_host("p.lan", &mut out, flags, None), Ok(DnsStatus::Resolved { count: 1 }));
        assert_eq!(out[0], V4);
    }

    #[test]
    fn test_get_host_addrs_appends() {
        let r = rig(vec![]);
        r.client.cache_host_insert("static.lan", &[V4, V6]).unwrap();
        let mut out = Vec::new();
        let st = r
            .client
            .get_host_addrs("static.lan", &mut out, 1, DnsFlags::NONE, None)
            .unwrap();
        assert_eq!(st, DnsStatus::Resolved { count: 1 });
        assert_eq!(out, [V4]);
        assert_eq!(
            r.client.get_host_addrs("static.lan", &mut out, 0, DnsFlags::NONE, None),
            Err(NetError::InvalidArg)
        );
    }

    #[test]
    fn test_cache_ops() {
        let r = rig(vec![]);
        r.client.cache_host_insert("a.lan", &[V4]).unwrap();
        r.client.cache_addr_insert("a.lan", V4B).unwrap();
        // Past the per-host cap: dropped without error
        r.client
            .cache_addr_insert("a.lan", IpAddress::Ipv4(Ipv4Address::new(192, 0, 2, 12)))
            .unwrap();
        let mut out = [NONE; 4];
        assert_eq!(
            r.client.cache_host_srch("a.lan", &mut out, DnsFlags::NONE),
            Ok(DnsStatus::Resolved { count: 2 })
        );
        r.client.cache_host_insert("b.lan", &[V6]).unwrap();
        r.client.cache_clr_host("a.lan").unwrap();
        assert_eq!(r.client.cache_clr_host("a.lan"), Err(NetError::NotFound));
        assert!(r.client.cache_evict_oldest());
        assert_eq!(r.client.cache_len(), 0);
        r.client.cache_host_insert("c.lan", &[V6]).unwrap();
        r.client.cache_clr_all();
        assert_eq!(r.client.cache_len(), 0);
    }

    #[test]
    fn test_name_too_long() {
        let mut cfg = DnsCfg::new();
        cfg.host_name_block_size = 8;
        let r = rig_with(cfg, vec![]);
        let mut out = [NONE; 1];
        assert_eq!(
            r.client.get_host("eight.ch", &mut out, DnsFlags::NONE, None),
            Err(NetError::InvalidArg)
        );
        assert_eq!(r.sock.tx_count(), 0);
    }

    #[test]
    fn test_task_driven_resolution() {
        let r = rig(vec![SockScript::Empty, SockScript::Answer(vec![V4])]);
        let task = SvcTask::init(&SvcTaskCfg::new(), r.clock.clone(), r.sock.clone(), Arc::new(NullSpawner)).unwrap();
        r.client.task_start(&task).unwrap();
        assert_eq!(r.client.task_start(&task), Err(NetError::AlreadyInit));
        task.run_once();

        let mut out = [NONE; 1];
        let flags = DnsFlags::NO_BLOCK | DnsFlags::IPV4_ONLY;
        assert_eq!(r.client.get_host("t.lan", &mut out, flags, None), Ok(DnsStatus::Pending));

        for _ in 0..2 {
            r.clock.advance(r.client.cfg().task_dly_ms);
            task.wake();
            task.run_once();
        }
        assert_eq!(
            r.client.get_host("t.lan", &mut out, flags, None),
            Ok(DnsStatus::Resolved { count: 1 })
        );
        assert_eq!(out[0], V4);
        r.client.task_stop().unwrap();
        assert_eq!(r.client.task_stop(), Err(NetError::NotInit));
    }

    #[test]
    fn test_task_blocking_caller_wakes() {
        let r = rig(vec![SockScript::Answer(vec![V4])]);
        let task = SvcTask::init(&SvcTaskCfg::new(), r.clock.clone(), r.sock.clone(), Arc::new(NullSpawner)).unwrap();
        r.client.task_start(&task).unwrap();
        task.run_once();

        let client = r.client.clone();
        let caller = std::thread::spawn(move || {
            let mut out = [NONE; 1];
            let st = client.get_host("w.lan", &mut out, DnsFlags::IPV4_ONLY, None);
            (st, out[0])
        });
        while !caller.is_finished() {
            r.clock.advance(r.client.cfg().task_dly_ms);
            task.wake();
            task.run_once();
            std::thread::yield_now();
        }
        let (st, addr) = caller.join().unwrap();
        assert_eq!(st, Ok(DnsStatus::Resolved { count: 1 }));
        assert_eq!(addr, V4);
    }

    #[test]
    fn test_task_stop_fails_blocked_caller() {
        let r = rig(vec![SockScript::Empty; 4]);
        let task = SvcTask::init(&SvcTaskCfg::new(), r.clock.clone(), r.sock.clone(), Arc::new(NullSpawner)).unwrap();
        r.client.task_start(&task).unwrap();
        task.run_once();

        let client = r.client.clone();
        let caller = std::thread::spawn(move || {
            let mut out = [NONE; 1];
            client.get_host("hang.lan", &mut out, DnsFlags::IPV4_ONLY, None)
        });
        while r.client.cache_len() == 0 {
            std::thread::yield_now();
        }
        // One pass sends the query and leaves the host waiting on its socket
        r.clock.advance(r.client.cfg().task_dly_ms);
        task.wake();
        task.run_once();
        assert_eq!(r.sock.open_count(), 1);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!caller.is_finished());

        r.client.task_stop().unwrap();
        assert_eq!(caller.join().unwrap(), Ok(DnsStatus::Failed));
        assert_eq!(r.sock.open_count(), 0);
    }

    #[test]
    fn test_task_wait_bounded_when_task_stalls() {
        let r = rig(vec![]);
        let task = SvcTask::init(&SvcTaskCfg::new(), r.clock.clone(), r.sock.clone(), Arc::new(NullSpawner)).unwrap();
        r.client.task_start(&task).unwrap();
        task.run_once();

        let client = r.client.clone();
        let caller = std::thread::spawn(move || {
            let mut out = [NONE; 1];
            client.get_host("idle.lan", &mut out, DnsFlags::IPV4_ONLY, None)
        });
        // The loop never runs again; only the clock moves
        let limit = 100 * 2 + 2 * r.client.cfg().task_dly_ms;
        while !caller.is_finished() {
            r.clock.advance(limit);
            std::thread::yield_now();
        }
        assert_eq!(caller.join().unwrap(), Ok(DnsStatus::Pending));
        assert_eq!(r.sock.tx_count(), 0);
    }
}
