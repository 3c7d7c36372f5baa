//! Per-host resolution state machine.
//!
//! `step` runs one transition. It never touches the cache: it works on a
//! copy of the host's `HostReq`, performs socket I/O with no lock held and
//! reports the addresses it learned for the caller to insert.

use alloc::format;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use smoltcp::wire::{IpAddress, IpEndpoint};

use super::wire::{self, DnsResult, QType, DNS_MSG_SIZE_MAX};
use crate::config::DnsCfg;
use crate::error::NetError;
use crate::klog::{klog_debug, klog_info};
use crate::net::ip::NetIf;
use crate::net::sock::{SockApi, SockBlock, SockFamily, SockId, SockType};
use crate::net::IfNbr;
use crate::time::{elapsed_ms, Clock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    Free,
    InitReq,
    IfSel,
    TxReqIpv4,
    RxRespIpv4,
    TxReqIpv6,
    RxRespIpv6,
    Resolved,
    Failed,
}

impl HostState {
    /// A query is on the wire or about to be.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            HostState::TxReqIpv4 | HostState::RxRespIpv4 | HostState::TxReqIpv6 | HostState::RxRespIpv6
        )
    }

    pub fn is_done(self) -> bool {
        matches!(self, HostState::Resolved | HostState::Failed)
    }

    /// Still being resolved.
    pub fn is_pending(self) -> bool {
        !self.is_done() && self != HostState::Free
    }
}

/// Per-request overrides of `DnsCfg`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DnsReqCfg {
    pub server: Option<IpEndpoint>,
    pub if_nbr: Option<IfNbr>,
    pub timeout_ms: Option<u32>,
    pub retry: Option<u8>,
}

/// Effective request parameters after applying overrides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReqParams {
    pub server: IpEndpoint,
    pub if_nbr: Option<IfNbr>,
    pub timeout_ms: u32,
    pub retry_max: u8,
    pub ipv4_en: bool,
    pub ipv6_en: bool,
    /// Sockets are polled rather than blocked on
    pub non_blocking: bool,
}

impl ReqParams {
    pub fn new(cfg: &DnsCfg, over: Option<&DnsReqCfg>, ipv4_en: bool, ipv6_en: bool, non_blocking: bool) -> Self {
        let over = over.copied().unwrap_or_default();
        Self {
            server: over.server.unwrap_or(cfg.server),
            if_nbr: over.if_nbr,
            timeout_ms: over.timeout_ms.unwrap_or(cfg.req_timeout_ms),
            retry_max: over.retry.unwrap_or(cfg.req_retry),
            ipv4_en,
            ipv6_en,
            non_blocking,
        }
    }

    /// Longest a resolution can take: every transmission of every family times out.
    pub fn budget_ms(&self) -> u32 {
        let families = u32::from(self.ipv4_en) + u32::from(self.ipv6_en);
        self.timeout_ms
            .saturating_mul(u32::from(self.retry_max) + 1)
            .saturating_mul(families.max(1))
    }
}

/// Resolution progress of one host object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostReq {
    pub state: HostState,
    pub params: ReqParams,
    pub sock: Option<SockId>,
    pub if_nbr: Option<IfNbr>,
    pub if_tried: Vec<IfNbr>,
    pub query_id: u16,
    /// Transmissions of the current query
    pub retry: u8,
    /// Last transmit time
    pub ts_ms: u32,
    /// Addresses learned so far
    pub addr_cnt: usize,
}

impl HostReq {
    pub fn new(params: ReqParams) -> Self {
        Self {
            state: HostState::InitReq,
            params,
            sock: None,
            if_nbr: None,
            if_tried: Vec::new(),
            query_id: 0,
            retry: 0,
            ts_ms: 0,
            addr_cnt: 0,
        }
    }
}

/// Collaborators a step needs.
pub struct ReqIo<'a> {
    pub sock: &'a dyn SockApi,
    pub netif: &'a dyn NetIf,
    pub clock: &'a dyn Clock,
    pub txid: &'a AtomicU16,
}

impl ReqIo<'_> {
    fn next_txid(&self) -> u16 {
        self.txid.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// Run one transition. Returns `false` when nothing could be done yet
/// (non-blocking receive with the deadline still ahead, or a finished host).
pub fn step(req: &mut HostReq, name: &str, io: &ReqIo<'_>, out: &mut Vec<IpAddress>) -> bool {
    match req.state {
        HostState::Free | HostState::Resolved | HostState::Failed => false,

        HostState::InitReq => {
            let family = match req.params.server.addr {
                IpAddress::Ipv4(_) => SockFamily::Ipv4,
                IpAddress::Ipv6(_) => SockFamily::Ipv6,
            };
            let id = match io.sock.open(family, SockType::Datagram) {
                Ok(id) => id,
                Err(e) => {
                    klog_debug("dns", &format!("{}: socket open failed: {}", name, e));
                    finish(req, HostState::Failed, io);
                    return true;
                }
            };
            req.sock = Some(id);
            let mode = if req.params.non_blocking {
                SockBlock::NonBlocking
            } else {
                SockBlock::Blocking {
                    timeout_ms: req.params.timeout_ms,
                }
            };
            if io.sock.cfg_blocking(id, mode).is_err() {
                finish(req, HostState::Failed, io);
                return true;
            }
            req.state = HostState::IfSel;
            true
        }

        HostState::IfSel => {
            let next = match req.params.if_nbr {
                Some(i) if !req.if_tried.contains(&i) => Some(i),
                Some(_) => None,
                None => io.netif.if_list().into_iter().find(|i| !req.if_tried.contains(i)),
            };
            let Some(if_nbr) = next else {
                let end = if req.addr_cnt > 0 {
                    HostState::Resolved
                } else {
                    HostState::Failed
                };
                finish(req, end, io);
                return true;
            };
            req.if_tried.push(if_nbr);
            req.if_nbr = Some(if_nbr);
            if let Some(sock) = req.sock {
                if io.sock.cfg_if(sock, if_nbr).is_err() {
                    finish(req, HostState::Failed, io);
                    return true;
                }
            }
            req.retry = 0;
            req.query_id = io.next_txid();
            req.state = if req.params.ipv4_en {
                HostState::TxReqIpv4
            } else if req.params.ipv6_en {
                HostState::TxReqIpv6
            } else {
                HostState::Failed
            };
            if req.state == HostState::Failed {
                finish(req, HostState::Failed, io);
            }
            true
        }

        HostState::TxReqIpv4 => tx_req(req, name, io, QType::A, HostState::RxRespIpv4),
        HostState::TxReqIpv6 => tx_req(req, name, io, QType::Aaaa, HostState::RxRespIpv6),
        HostState::RxRespIpv4 => rx_resp(req, name, io, QType::A, out),
        HostState::RxRespIpv6 => rx_resp(req, name, io, QType::Aaaa, out),
    }
}

fn tx_req(req: &mut HostReq, name: &str, io: &ReqIo<'_>, qtype: QType, next: HostState) -> bool {
    let Some(sock) = req.sock else {
        finish(req, HostState::Failed, io);
        return true;
    };
    let query = wire::build_query(req.query_id, name.as_bytes(), qtype);
    match io.sock.tx_data_to(sock, &query, req.params.server) {
        Ok(_) => {
            req.ts_ms = io.clock.now_ms();
            req.retry = req.retry.saturating_add(1);
            req.state = next;
        }
        Err(NetError::LinkDown) => {
            // Try another interface; does not count as a retry
            req.state = HostState::IfSel;
        }
        Err(e) => {
            klog_debug("dns", &format!("{}: tx failed: {}", name, e));
            finish(req, HostState::Failed, io);
        }
    }
    true
}

fn rx_resp(req: &mut HostReq, name: &str, io: &ReqIo<'_>, qtype: QType, out: &mut Vec<IpAddress>) -> bool {
    let Some(sock) = req.sock else {
        finish(req, HostState::Failed, io);
        return true;
    };
    let mut buf = [0u8; DNS_MSG_SIZE_MAX];
    match io.sock.rx_data_from(sock, &mut buf) {
        Ok((n, _from)) => match wire::parse_response(&buf[..n], req.query_id, qtype) {
            DnsResult::Resolved(addrs) => {
                req.addr_cnt += addrs.len();
                out.extend(addrs);
                advance(req, io);
                true
            }
            DnsResult::NoRecords => {
                advance(req, io);
                true
            }
            DnsResult::NotFound => {
                klog_info("dns", &format!("{}: NXDOMAIN", name));
                finish(req, HostState::Failed, io);
                true
            }
            DnsResult::WrongId => {
                if deadline_passed(req, io) {
                    timeout(req, io);
                }
                true
            }
            DnsResult::Error(why) => {
                klog_debug("dns", &format!("{}: bad response: {}", name, why));
                timeout(req, io);
                true
            }
        },
        Err(NetError::Timeout) => {
            timeout(req, io);
            true
        }
        Err(NetError::WouldBlock) => {
            if deadline_passed(req, io) {
                timeout(req, io);
                true
            } else {
                false
            }
        }
        Err(e) => {
            klog_debug("dns", &format!("{}: rx failed: {}", name, e));
            finish(req, HostState::Failed, io);
            true
        }
    }
}

/// Time left before the current receive deadline, at least 1 ms.
pub fn rx_wait_ms(req: &HostReq, now: u32) -> u32 {
    req.params
        .timeout_ms
        .saturating_sub(elapsed_ms(req.ts_ms, now))
        .max(1)
}

fn deadline_passed(req: &HostReq, io: &ReqIo<'_>) -> bool {
    elapsed_ms(req.ts_ms, io.clock.now_ms()) >= req.params.timeout_ms
}

/// Response accepted: move to the next family or finish.
fn advance(req: &mut HostReq, io: &ReqIo<'_>) {
    if req.state == HostState::RxRespIpv4 && req.params.ipv6_en {
        req.retry = 0;
        req.query_id = io.next_txid();
        req.state = HostState::TxReqIpv6;
        return;
    }
    let end = if req.addr_cnt > 0 {
        HostState::Resolved
    } else {
        HostState::Failed
    };
    finish(req, end, io);
}

/// No usable answer within the deadline.
fn timeout(req: &mut HostReq, io: &ReqIo<'_>) {
    let v4 = req.state == HostState::RxRespIpv4;
    if req.retry <= req.params.retry_max {
        // Retransmit with the same query id
        req.state = if v4 {
            HostState::TxReqIpv4
        } else {
            HostState::TxReqIpv6
        };
        return;
    }
    if v4 {
        finish(req, HostState::Failed, io);
        return;
    }
    let untried = req.params.if_nbr.is_none()
        && io
            .netif
            .if_list()
            .into_iter()
            .any(|i| !req.if_tried.contains(&i));
    if untried {
        req.state = HostState::IfSel;
    } else if req.addr_cnt > 0 {
        finish(req, HostState::Resolved, io);
    } else {
        finish(req, HostState::Failed, io);
    }
}

/// Enter a terminal state and release the socket.
fn finish(req: &mut HostReq, end: HostState, io: &ReqIo<'_>) {
    if let Some(sock) = req.sock.take() {
        let _ = io.sock.close(sock);
    }
    req.state = end;
}
