//! Host cache.
//!
//! Entries live in a bounded list ordered newest first. When the host pool
//! is full the oldest entry without a query in flight is evicted to make
//! room. Addresses count against a shared address pool as well as the
//! per-host caps for each family.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use smoltcp::wire::IpAddress;

use super::req::{HostReq, HostState};
use super::wire;
use super::DnsFlags;
use crate::config::DnsCfg;
use crate::error::{NetError, NetResult};
use crate::klog::{klog_debug, klog_warning};
use crate::net::SockId;
use crate::waitqueue::Signal;

pub type HostId = u32;

pub struct HostObj {
    pub id: HostId,
    pub name: String,
    pub req: HostReq,
    pub addrs: Vec<IpAddress>,
    /// A caller or the service task is stepping this host
    pub busy: bool,
    /// Fail when the current step commits
    pub cancel: bool,
    /// Posted once when the host reaches a terminal state
    pub waiters: Vec<Arc<Signal>>,
}

impl HostObj {
    pub fn state(&self) -> HostState {
        self.req.state
    }

    fn addr_cnt(&self, v4: bool) -> usize {
        self.addrs
            .iter()
            .filter(|a| matches!(a, IpAddress::Ipv4(_)) == v4)
            .count()
    }

    /// Copy addresses allowed by the family flags into `out`.
    pub fn copy_addrs(&self, out: &mut [IpAddress], flags: DnsFlags) -> usize {
        let wanted = self.addrs.iter().filter(|a| match a {
            IpAddress::Ipv4(_) => !flags.contains(DnsFlags::IPV6_ONLY),
            IpAddress::Ipv6(_) => !flags.contains(DnsFlags::IPV4_ONLY),
        });
        let mut n = 0;
        for (slot, a) in out.iter_mut().zip(wanted) {
            *slot = *a;
            n += 1;
        }
        n
    }

    pub fn notify(&mut self) {
        for w in self.waiters.drain(..) {
            w.post();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrchResult {
    Pending,
    Resolved(usize),
}

pub struct DnsCache {
    cfg: DnsCfg,
    /// Newest first
    items: Vec<HostObj>,
    addr_used: usize,
    next_id: HostId,
}

impl DnsCache {
    pub fn new(cfg: &DnsCfg) -> Self {
        Self {
            cfg: *cfg,
            items: Vec::new(),
            addr_used: 0,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn addr_used(&self) -> usize {
        self.addr_used
    }

    pub fn host(&self, id: HostId) -> Option<&HostObj> {
        self.items.iter().find(|h| h.id == id)
    }

    pub fn host_mut(&mut self, id: HostId) -> Option<&mut HostObj> {
        self.items.iter_mut().find(|h| h.id == id)
    }

    pub fn host_srch(&self, name: &str) -> Option<&HostObj> {
        self.items.iter().find(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn host_srch_mut(&mut self, name: &str) -> Option<&mut HostObj> {
        self.items.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Look up `name` and copy its addresses into `out`, filtered by the
    /// family flags. Failed entries read as absent.
    pub fn srch(&self, name: &str, out: &mut [IpAddress], flags: DnsFlags) -> NetResult<SrchResult> {
        let host = self.host_srch(name).ok_or(NetError::NotFound)?;
        match host.state() {
            HostState::Resolved => Ok(SrchResult::Resolved(host.copy_addrs(out, flags))),
            HostState::Failed | HostState::Free => Err(NetError::NotFound),
            _ => Ok(SrchResult::Pending),
        }
    }

    /// Build a host object for `name` without inserting it.
    pub fn host_obj_new(&mut self, name: &str, req: HostReq) -> NetResult<HostObj> {
        if name.is_empty() || name.len() > self.cfg.host_name_len_max() || !wire::name_is_valid(name.as_bytes()) {
            return Err(NetError::InvalidArg);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        Ok(HostObj {
            id,
            name: String::from(name),
            req,
            addrs: Vec::new(),
            busy: false,
            cancel: false,
            waiters: Vec::new(),
        })
    }

    /// Insert at the head, evicting the oldest idle entry if the host pool
    /// is exhausted.
    pub fn host_insert(&mut self, host: HostObj) -> NetResult<HostId> {
        if let Some(max) = self.cfg.host_nbr_max {
            if self.items.len() >= max && !self.evict_oldest() {
                klog_warning("dns", "host pool exhausted");
                return Err(NetError::PoolEmpty);
            }
        }
        let id = host.id;
        self.items.insert(0, host);
        Ok(id)
    }

    /// Attach an address to a host.
    ///
    /// Once a family's cap is reached further addresses are dropped
    /// silently; a cap of zero refuses the first one.
    pub fn addr_insert(&mut self, id: HostId, addr: IpAddress) -> NetResult<()> {
        let pool_full = self
            .cfg
            .addr_nbr_max
            .map_or(false, |max| self.addr_used >= max);
        let cfg = self.cfg;
        let host = self.host_mut(id).ok_or(NetError::NotFound)?;
        let (v4, cap) = match addr {
            IpAddress::Ipv4(_) => (true, cfg.addr_ipv4_max_per_host),
            IpAddress::Ipv6(_) => (false, cfg.addr_ipv6_max_per_host),
        };
        let cnt = host.addr_cnt(v4);
        if cnt >= cap {
            return if cnt == 0 {
                Err(NetError::WouldOverflow)
            } else {
                Ok(())
            };
        }
        if pool_full {
            return Err(NetError::PoolEmpty);
        }
        host.addrs.push(addr);
        self.addr_used += 1;
        Ok(())
    }

    /// Remove the oldest entry with no query in flight. Hosts holding a
    /// socket (`IfSel`) stay too.
    pub fn evict_oldest(&mut self) -> bool {
        let Some(pos) = self
            .items
            .iter()
            .rposition(|h| !h.state().is_in_flight() && h.state() != HostState::IfSel && !h.busy)
        else {
            return false;
        };
        let host = self.items.remove(pos);
        klog_debug("dns", &format!("evict {}", host.name));
        self.release(host);
        true
    }

    pub fn host_remove(&mut self, id: HostId) -> Option<HostObj> {
        let pos = self.items.iter().position(|h| h.id == id)?;
        let mut host = self.items.remove(pos);
        self.addr_used -= host.addrs.len();
        host.notify();
        Some(host)
    }

    fn release(&mut self, mut host: HostObj) {
        self.addr_used -= host.addrs.len();
        host.notify();
    }

    /// Drop every entry that is not being resolved. Returns how many went.
    pub fn clr_all(&mut self) -> usize {
        let (keep, gone): (Vec<_>, Vec<_>) = core::mem::take(&mut self.items)
            .into_iter()
            .partition(|h| h.state().is_pending() || h.busy);
        self.items = keep;
        let n = gone.len();
        for h in gone {
            self.release(h);
        }
        n
    }

    pub fn clr_host(&mut self, name: &str) -> NetResult<()> {
        let host = self.host_srch(name).ok_or(NetError::NotFound)?;
        if host.state().is_pending() || host.busy {
            return Err(NetError::InvalidState);
        }
        let id = host.id;
        self.host_remove(id);
        Ok(())
    }

    /// Hosts still being resolved, oldest first.
    /// Fail every host still resolving and wake its waiters.
    ///
    /// Hosts being stepped are flagged and fail when the step commits.
    /// Returns the sockets the failed hosts held.
    pub fn fail_pending(&mut self) -> Vec<SockId> {
        let mut socks = Vec::new();
        for h in self.items.iter_mut().filter(|h| h.state().is_pending()) {
            if h.busy {
                h.cancel = true;
                continue;
            }
            socks.extend(h.req.sock.take());
            h.req.state = HostState::Failed;
            h.notify();
        }
        socks
    }

    pub fn pending_ids(&self) -> Vec<HostId> {
        self.items
            .iter()
            .rev()
            .filter(|h| h.state().is_pending())
            .map(|h| h.id)
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|h| h.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use smoltcp::wire::{Ipv4Address, Ipv6Address};

    use super::*;
    use crate::dns::req::ReqParams;

    fn cfg() -> DnsCfg {
        let mut c = DnsCfg::new();
        c.host_nbr_max = Some(3);
        c.addr_nbr_max = Some(5);
        c.host_name_block_size = 16;
        c
    }

    fn req(c: &DnsCfg) -> HostReq {
        HostReq::new(ReqParams::new(c, None, true, true, false))
    }

    fn resolved(cache: &mut DnsCache, name: &str) -> HostId {
        let c = cfg();
        let mut h = cache.host_obj_new(name, req(&c)).unwrap();
        h.req.state = HostState::Resolved;
        cache.host_insert(h).unwrap()
    }

    fn v4(n: u8) -> IpAddress {
        IpAddress::Ipv4(Ipv4Address::new(10, 0, 0, n))
    }

    fn v6(n: u16) -> IpAddress {
        IpAddress::Ipv6(Ipv6Address::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n))
    }

    #[test]
    fn test_lifo_and_eviction() {
        let mut cache = DnsCache::new(&cfg());
        resolved(&mut cache, "a");
        resolved(&mut cache, "b");
        resolved(&mut cache, "c");
        assert_eq!(cache.names(), ["c", "b", "a"]);
        resolved(&mut cache, "d");
        assert_eq!(cache.names(), ["d", "c", "b"]);
    }

    #[test]
    fn test_eviction_skips_in_flight() {
        let mut cache = DnsCache::new(&cfg());
        let a = resolved(&mut cache, "a");
        cache.host_mut(a).unwrap().req.state = HostState::RxRespIpv4;
        resolved(&mut cache, "b");
        resolved(&mut cache, "c");
        resolved(&mut cache, "d");
        assert_eq!(cache.names(), ["d", "c", "a"]);
    }

    #[test]
    fn test_pool_empty_when_all_in_flight() {
        let mut cache = DnsCache::new(&cfg());
        for n in ["a", "b", "c"] {
            let id = resolved(&mut cache, n);
            cache.host_mut(id).unwrap().req.state = HostState::TxReqIpv6;
        }
        let c = cfg();
        let h = cache.host_obj_new("d", req(&c)).unwrap();
        assert_eq!(cache.host_insert(h), Err(NetError::PoolEmpty));
    }

    #[test]
    fn test_name_length_limit() {
        let mut cache = DnsCache::new(&cfg());
        let c = cfg();
        assert!(cache.host_obj_new("fifteen-chars.x", req(&c)).is_ok());
        assert_eq!(
            cache.host_obj_new("sixteen-chars.xy", req(&c)).err(),
            Some(NetError::InvalidArg)
        );
        assert_eq!(cache.host_obj_new("", req(&c)).err(), Some(NetError::InvalidArg));
    }

    #[test]
    fn test_malformed_labels_rejected() {
        let c = DnsCfg::new();
        let mut cache = DnsCache::new(&c);
        let long_label = format!("{}.example.com", "x".repeat(64));
        for name in [long_label.as_str(), "a..b", ".lan", "."] {
            assert_eq!(cache.host_obj_new(name, req(&c)).err(), Some(NetError::InvalidArg));
        }
        assert!(cache.host_obj_new("host.lan.", req(&c)).is_ok());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_addr_caps() {
        let mut c = cfg();
        c.addr_ipv6_max_per_host = 0;
        let mut cache = DnsCache::new(&c);
        let id = resolved(&mut cache, "a");
        cache.addr_insert(id, v4(1)).unwrap();
        cache.addr_insert(id, v4(2)).unwrap();
        // Third is dropped silently
        cache.addr_insert(id, v4(3)).unwrap();
        assert_eq!(cache.host(id).unwrap().addrs.len(), 2);
        assert_eq!(cache.addr_insert(id, v6(1)), Err(NetError::WouldOverflow));
        assert_eq!(cache.addr_used(), 2);
    }

    #[test]
    fn test_addr_pool_exhaustion_and_release() {
        let mut cache = DnsCache::new(&cfg());
        let a = resolved(&mut cache, "a");
        let b = resolved(&mut cache, "b");
        let c = resolved(&mut cache, "c");
        cache.addr_insert(a, v4(1)).unwrap();
        cache.addr_insert(a, v6(1)).unwrap();
        cache.addr_insert(b, v4(2)).unwrap();
        cache.addr_insert(b, v6(2)).unwrap();
        cache.addr_insert(c, v4(3)).unwrap();
        assert_eq!(cache.addr_insert(c, v6(3)), Err(NetError::PoolEmpty));
        assert!(cache.evict_oldest());
        assert_eq!(cache.addr_used(), 3);
        cache.addr_insert(c, v6(3)).unwrap();
    }

    #[test]
    fn test_srch_filters_family() {
        let mut cache = DnsCache::new(&cfg());
        let id = resolved(&mut cache, "Host");
        cache.addr_insert(id, v4(1)).unwrap();
        cache.addr_insert(id, v6(1)).unwrap();
        let mut out = [v4(0); 4];
        assert_eq!(cache.srch("host", &mut out, DnsFlags::empty()), Ok(SrchResult::Resolved(2)));
        assert_eq!(cache.srch("host", &mut out, DnsFlags::IPV6_ONLY), Ok(SrchResult::Resolved(1)));
        assert_eq!(out[0], v6(1));
        let mut one = [v4(0); 1];
        assert_eq!(cache.srch("host", &mut one, DnsFlags::empty()), Ok(SrchResult::Resolved(1)));
        assert_eq!(cache.srch("other", &mut out, DnsFlags::empty()), Err(NetError::NotFound));
    }

    #[test]
    fn test_srch_pending_and_failed() {
        let mut cache = DnsCache::new(&cfg());
        let c = cfg();
        let h = cache.host_obj_new("p", req(&c)).unwrap();
        cache.host_insert(h).unwrap();
        let f = resolved(&mut cache, "f");
        cache.host_mut(f).unwrap().req.state = HostState::Failed;
        let mut out = [v4(0); 2];
        assert_eq!(cache.srch("p", &mut out, DnsFlags::empty()), Ok(SrchResult::Pending));
        assert_eq!(cache.srch("f", &mut out, DnsFlags::empty()), Err(NetError::NotFound));
        assert_eq!(cache.pending_ids().len(), 1);
    }

    #[test]
    fn test_clr_keeps_pending() {
        let mut cache = DnsCache::new(&cfg());
        let c = cfg();
        let h = cache.host_obj_new("p", req(&c)).unwrap();
        cache.host_insert(h).unwrap();
        let id = resolved(&mut cache, "r");
        cache.addr_insert(id, v4(1)).unwrap();
        assert_eq!(cache.clr_host("p"), Err(NetError::InvalidState));
        assert_eq!(cache.clr_all(), 1);
        assert_eq!(cache.names(), ["p"]);
        assert_eq!(cache.addr_used(), 0);
        assert_eq!(cache.clr_host("r"), Err(NetError::NotFound));
    }

    #[test]
    fn test_remove_posts_waiters() {
        let mut cache = DnsCache::new(&cfg());
        let id = resolved(&mut cache, "a");
        let sig = Arc::new(Signal::new());
        cache.host_mut(id).unwrap().waiters.push(sig.clone());
        cache.clr_host("a").unwrap();
        assert!(sig.is_pending());
    }

    #[test]
    fn test_fail_pending_wakes_and_returns_sockets() {
        let mut cache = DnsCache::new(&cfg());
        let c = cfg();
        let h = cache.host_obj_new("idle", req(&c)).unwrap();
        let idle = cache.host_insert(h).unwrap();
        let h = cache.host_obj_new("stepped", req(&c)).unwrap();
        let stepped = cache.host_insert(h).unwrap();
        let done = resolved(&mut cache, "done");
        let sig = Arc::new(Signal::new());
        {
            let h = cache.host_mut(idle).unwrap();
            h.req.state = HostState::RxRespIpv4;
            h.req.sock = Some(4);
            h.waiters.push(sig.clone());
        }
        cache.host_mut(stepped).unwrap().busy = true;

        assert_eq!(cache.fail_pending(), [4]);
        assert!(sig.is_pending());
        let h = cache.host(idle).unwrap();
        assert_eq!(h.state(), HostState::Failed);
        assert_eq!(h.req.sock, None);
        // Left to the caller stepping it
        let h = cache.host(stepped).unwrap();
        assert!(h.cancel);
        assert_eq!(h.state(), HostState::InitReq);
        assert_eq!(cache.host(done).unwrap().state(), HostState::Resolved);
    }
}
