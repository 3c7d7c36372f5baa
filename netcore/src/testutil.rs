//! Fakes shared by unit tests.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use smoltcp::wire::{EthernetAddress, IpAddress, IpEndpoint, IpProtocol, Ipv6Address};

use crate::config::IfBufCfg;
use crate::dns::wire;
use crate::error::{NetError, NetResult};
use crate::net::buf::{BufDir, BufFlags, BufHandle, BufHdr, BufPool};
use crate::net::checksum::{self, Accum};
use crate::net::icmpv6::{Icmpv6Upper, MsgType, NdpVerdict};
use crate::net::ip::{Ipv6Tx, Ipv6TxParams, NetIf};
use crate::net::sock::{SelectSets, SockApi, SockBlock, SockFamily, SockType};
use crate::net::stack::{NetStack, StackEnv};
use crate::net::{IfNbr, SockId};
use crate::svc::{TaskId, TaskSpawn};
use crate::time::ManualClock;
use crate::waitqueue::Signal;
use crate::Spinlock;

pub const HOST_ADDR: Ipv6Address = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
pub const PEER_ADDR: Ipv6Address = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 2);
pub const HOST_HW: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x01]);

pub const LINK_HDR_LEN: usize = 14;
pub const RX_MSG_IX: usize = LINK_HDR_LEN + 40;

static NEXT_CTX: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    static CTX: usize = NEXT_CTX.fetch_add(1, Ordering::Relaxed);
}

/// Execution context id of the calling test thread.
pub fn thread_ctx() -> usize {
    CTX.with(|c| *c)
}

pub fn test_buf_cfg() -> IfBufCfg {
    IfBufCfg {
        rx_large_nbr: 16,
        rx_large_size: 1536,
        tx_large_nbr: 16,
        tx_large_size: 1600,
        tx_small_nbr: 4,
        tx_small_size: 256,
        seg_size: None,
        clr_mem: false,
    }
}

// =============================================================================
// INTERFACES
// =============================================================================

pub struct FakeIf {
    mtu_proto: usize,
    ifs: Spinlock<Vec<(IfNbr, bool)>>,
    no_src: AtomicBool,
}

impl FakeIf {
    pub fn new(mtu_proto: usize) -> Self {
        Self {
            mtu_proto,
            ifs: Spinlock::new(vec![(0, true)]),
            no_src: AtomicBool::new(false),
        }
    }

    /// Source address selection finds nothing while set.
    pub fn set_no_src(&self, on: bool) {
        self.no_src.store(on, Ordering::Relaxed);
    }

    pub fn add(&self, if_nbr: IfNbr, up: bool) {
        self.ifs.lock().push((if_nbr, up));
    }

    pub fn set_link(&self, if_nbr: IfNbr, up: bool) {
        for e in self.ifs.lock().iter_mut() {
            if e.0 == if_nbr {
                e.1 = up;
            }
        }
    }
}

impl NetIf for FakeIf {
    fn if_list(&self) -> Vec<IfNbr> {
        self.ifs.lock().iter().map(|e| e.0).collect()
    }

    fn is_link_up(&self, if_nbr: IfNbr) -> bool {
        self.ifs.lock().iter().any(|e| e.0 == if_nbr && e.1)
    }

    fn mtu_protocol(&self, _if_nbr: IfNbr, _proto: IpProtocol) -> NetResult<usize> {
        Ok(self.mtu_proto)
    }

    fn link_hdr_len(&self, _if_nbr: IfNbr) -> usize {
        LINK_HDR_LEN
    }

    fn hw_addr(&self, _if_nbr: IfNbr) -> Option<EthernetAddress> {
        Some(HOST_HW)
    }

    fn src_addr_sel(&self, _if_nbr: IfNbr, _dst: &Ipv6Address) -> Option<Ipv6Address> {
        if self.no_src.load(Ordering::Relaxed) {
            return None;
        }
        Some(HOST_ADDR)
    }
}

// =============================================================================
// IPv6 TRANSMIT
// =============================================================================

/// One chain handed to the fake IPv6 layer, flattened.
#[derive(Clone, Debug)]
pub struct SentMsg {
    pub params: Ipv6TxParams,
    pub links: Vec<BufHdr>,
    /// ICMPv6 message bytes gathered across the chain
    pub msg: Vec<u8>,
}

impl SentMsg {
    /// Pseudo-header followed by the message, for checksum checks.
    pub fn pseudo_and_msg(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(40 + self.msg.len());
        v.extend_from_slice(&self.params.src.octets());
        v.extend_from_slice(&self.params.dst.octets());
        v.extend_from_slice(&(self.msg.len() as u32).to_be_bytes());
        v.extend_from_slice(&[0, 0, 0, u8::from(self.params.next_hdr)]);
        v.extend_from_slice(&self.msg);
        v
    }
}

/// Records every chain, then frees it like an interface would after sending.
pub struct FakeIpTx {
    sent: Spinlock<Vec<SentMsg>>,
    fail: Spinlock<Option<NetError>>,
}

impl FakeIpTx {
    pub fn new() -> Self {
        Self {
            sent: Spinlock::new(Vec::new()),
            fail: Spinlock::new(None),
        }
    }

    pub fn sent(&self) -> Vec<SentMsg> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<SentMsg> {
        core::mem::take(&mut *self.sent.lock())
    }

    pub fn fail_next(&self, e: NetError) {
        *self.fail.lock() = Some(e);
    }
}

impl Ipv6Tx for FakeIpTx {
    fn tx(&self, pool: &mut BufPool, chain: BufHandle, params: &Ipv6TxParams) -> NetResult<()> {
        if let Some(e) = self.fail.lock().take() {
            return Err(e);
        }
        let mut links = Vec::new();
        let mut msg = Vec::new();
        for h in pool.chain_iter(chain) {
            let hdr = *pool.hdr(h)?;
            let start = hdr.icmp_msg_ix;
            let end = start + hdr.icmp_hdr_len + hdr.data_len;
            msg.extend_from_slice(&pool.data(h)?[start..end]);
            links.push(hdr);
        }
        self.sent.lock().push(SentMsg {
            params: *params,
            links,
            msg,
        });
        pool.free_chain(chain);
        Ok(())
    }
}

/// Answers every Neighbor Solicitation.
pub struct NsResponder;

impl Icmpv6Upper for NsResponder {
    fn echo_reply(&self, _pool: &BufPool, _buf: BufHandle) -> NetResult<()> {
        Ok(())
    }

    fn ndp_rx(&self, _pool: &BufPool, _buf: BufHandle, typ: MsgType) -> NetResult<NdpVerdict> {
        Ok(match typ {
            MsgType::NeighborSol => NdpVerdict::SendAdvert,
            _ => NdpVerdict::Consumed,
        })
    }

    fn mldp_rx(&self, _pool: &BufPool, _buf: BufHandle, _typ: MsgType) -> NetResult<()> {
        Ok(())
    }
}

pub type FakeStack = (Arc<NetStack>, Arc<FakeIf>, Arc<FakeIpTx>, Arc<ManualClock>);

fn build_stack(mtu_proto: usize, upper: Option<Arc<dyn Icmpv6Upper>>) -> FakeStack {
    let netif = Arc::new(FakeIf::new(mtu_proto));
    let ip_tx = Arc::new(FakeIpTx::new());
    let clock = Arc::new(ManualClock::new(0));
    let mut env = StackEnv::new(netif.clone(), ip_tx.clone(), clock.clone());
    if let Some(u) = upper {
        env = env.with_icmp6_upper(u);
    }
    let stack = Arc::new(NetStack::new(env));
    stack.if_add(&test_buf_cfg()).unwrap();
    (stack, netif, ip_tx, clock)
}

/// Stack with interface 0 on a 1500-byte link.
pub fn fake_stack() -> FakeStack {
    build_stack(1500 - 40, None)
}

/// Stack with interface 0 and the given ICMPv6 protocol MTU.
pub fn fake_stack_with(mtu_proto: usize) -> FakeStack {
    build_stack(mtu_proto, None)
}

pub fn fake_stack_answering_ns() -> FakeStack {
    build_stack(1500 - 40, Some(Arc::new(NsResponder)))
}

// =============================================================================
// RECEIVE CHAINS
// =============================================================================

/// Fill in the ICMPv6 checksum of `msg`.
pub fn sign_icmp(msg: &mut [u8], src: &Ipv6Address, dst: &Ipv6Address) {
    msg[2] = 0;
    msg[3] = 0;
    let mut acc = Accum::new();
    checksum::pseudo_hdr_v6(&mut acc, src, dst, msg.len() as u32, IpProtocol::Icmpv6);
    acc.add(msg);
    let c = acc.finish();
    msg[2..4].copy_from_slice(&c.to_be_bytes());
}

/// Split `msg` into an rx chain the way the IPv6 layer hands it up.
pub fn rx_chain(
    pool: &mut BufPool,
    if_nbr: IfNbr,
    src: Ipv6Address,
    dst: Ipv6Address,
    msg: &[u8],
    link: usize,
) -> BufHandle {
    let mut head = None;
    let mut prev: Option<BufHandle> = None;
    for chunk in msg.chunks(link) {
        let h = pool.get(if_nbr, BufDir::Rx, chunk.len(), RX_MSG_IX).unwrap();
        pool.data_wr(h, RX_MSG_IX, chunk).unwrap();
        let b = pool.hdr_mut(h).unwrap();
        b.ip_hdr_ix = LINK_HDR_LEN;
        b.ip_hdr_len = 40;
        b.ip_tot_len = msg.len();
        b.ip_datagram_len = msg.len();
        b.ip_next_hdr = IpProtocol::Icmpv6;
        b.ip_addr_src = src;
        b.ip_addr_dst = dst;
        b.icmp_msg_ix = RX_MSG_IX;
        b.data_ix = RX_MSG_IX;
        b.data_len = chunk.len();
        if dst.is_multicast() {
            b.flags |= BufFlags::RX_MULTICAST;
        }
        match prev {
            Some(p) => pool.chain_append(p, h).unwrap(),
            None => head = Some(h),
        }
        prev = Some(h);
    }
    head.unwrap()
}

/// Feed a sent message back in as a received chain.
pub fn sent_as_rx(pool: &mut BufPool, sent: &SentMsg, link: usize) -> BufHandle {
    rx_chain(pool, 0, sent.params.src, sent.params.dst, &sent.msg, link)
}

// =============================================================================
// SOCKETS
// =============================================================================

/// What the next receive on a DNS socket sees.
#[derive(Clone, Debug, PartialEq)]
pub enum SockScript {
    /// Answer the last query with these records
    Answer(Vec<IpAddress>),
    NxDomain,
    /// Answer with a mismatched transaction id
    WrongId,
    /// Blocking receive gave up
    Timeout,
    /// Nothing queued yet
    Empty,
}

struct FakeSockEntry {
    id: SockId,
    blocking: SockBlock,
    if_nbr: Option<IfNbr>,
    last_query: Option<Vec<u8>>,
    inbox: VecDeque<(Vec<u8>, IpEndpoint)>,
    writable: bool,
}

#[derive(Default)]
struct FakeSockState {
    socks: Vec<FakeSockEntry>,
    next_id: SockId,
    script: VecDeque<SockScript>,
    sent: Vec<(SockId, Vec<u8>, IpEndpoint)>,
    link_down: Vec<IfNbr>,
    fail_open: bool,
}

/// Socket layer with scripted DNS answers and a virtual-time select.
///
/// `select` with a clock attached advances it by the timeout when nothing
/// is ready, so loops driven from a test never sleep.
pub struct FakeSock {
    state: Spinlock<FakeSockState>,
    clock: Option<Arc<ManualClock>>,
}

impl FakeSock {
    pub fn new(script: Vec<SockScript>) -> Self {
        Self {
            state: Spinlock::new(FakeSockState {
                script: script.into(),
                next_id: 1,
                ..Default::default()
            }),
            clock: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn script(&self, more: Vec<SockScript>) {
        self.state.lock().script.extend(more);
    }

    pub fn push_rx(&self, id: SockId, data: &[u8], from: IpEndpoint) {
        if let Some(e) = self.state.lock().socks.iter_mut().find(|e| e.id == id) {
            e.inbox.push_back((data.to_vec(), from));
        }
    }

    pub fn set_writable(&self, id: SockId, on: bool) {
        if let Some(e) = self.state.lock().socks.iter_mut().find(|e| e.id == id) {
            e.writable = on;
        }
    }

    /// Transmits on sockets bound to `if_nbr` fail with `LinkDown`.
    pub fn link_down_on(&self, if_nbr: IfNbr) {
        self.state.lock().link_down.push(if_nbr);
    }

    pub fn fail_open(&self) {
        self.state.lock().fail_open = true;
    }

    /// Sockets currently open.
    pub fn open_count(&self) -> usize {
        self.state.lock().socks.len()
    }

    pub fn tx_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn tx_ids(&self) -> Vec<u16> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|(_, d, _)| wire::txid_of(d))
            .collect()
    }

    pub fn sent(&self) -> Vec<(SockId, Vec<u8>, IpEndpoint)> {
        self.state.lock().sent.clone()
    }
}

impl SockApi for FakeSock {
    fn open(&self, _family: SockFamily, _typ: SockType) -> NetResult<SockId> {
        let mut st = self.state.lock();
        if st.fail_open {
            return Err(NetError::PoolEmpty);
        }
        let id = st.next_id;
        st.next_id += 1;
        st.socks.push(FakeSockEntry {
            id,
            blocking: SockBlock::Blocking { timeout_ms: 0 },
            if_nbr: None,
            last_query: None,
            inbox: VecDeque::new(),
            writable: false,
        });
        Ok(id)
    }

    fn close(&self, id: SockId) -> NetResult<()> {
        let mut st = self.state.lock();
        let pos = st.socks.iter().position(|e| e.id == id).ok_or(NetError::NotFound)?;
        st.socks.remove(pos);
        Ok(())
    }

    fn bind(&self, id: SockId, _local: IpEndpoint) -> NetResult<()> {
        self.state.lock().socks.iter().find(|e| e.id == id).map(|_| ()).ok_or(NetError::NotFound)
    }

    fn connect(&self, _id: SockId, _remote: IpEndpoint) -> NetResult<()> {
        Ok(())
    }

    fn listen(&self, _id: SockId, _backlog: usize) -> NetResult<()> {
        Ok(())
    }

    fn cfg_if(&self, id: SockId, if_nbr: IfNbr) -> NetResult<()> {
        let mut st = self.state.lock();
        let e = st.socks.iter_mut().find(|e| e.id == id).ok_or(NetError::NotFound)?;
        e.if_nbr = Some(if_nbr);
        Ok(())
    }

    fn cfg_blocking(&self, id: SockId, mode: SockBlock) -> NetResult<()> {
        let mut st = self.state.lock();
        let e = st.socks.iter_mut().find(|e| e.id == id).ok_or(NetError::NotFound)?;
        e.blocking = mode;
        Ok(())
    }

    fn rx_data_from(&self, id: SockId, buf: &mut [u8]) -> NetResult<(usize, IpEndpoint)> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let e = st.socks.iter_mut().find(|e| e.id == id).ok_or(NetError::NotFound)?;
        if let Some((data, from)) = e.inbox.pop_front() {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            return Ok((n, from));
        }
        let idle = match e.blocking {
            SockBlock::NonBlocking => NetError::WouldBlock,
            SockBlock::Blocking { .. } => NetError::Timeout,
        };
        let Some(query) = e.last_query.clone() else {
            return Err(idle);
        };
        let from = IpEndpoint::new(IpAddress::Ipv4(crate::config::DNS_SERVER), crate::config::DNS_PORT);
        let resp = match st.script.pop_front() {
            None => return Err(idle),
            Some(SockScript::Timeout) => return Err(NetError::Timeout),
            Some(SockScript::Empty) => return Err(NetError::WouldBlock),
            Some(SockScript::Answer(addrs)) => wire::build_response(&query, 0, &addrs),
            Some(SockScript::NxDomain) => wire::build_response(&query, 3, &[]),
            Some(SockScript::WrongId) => {
                let mut r = wire::build_response(&query, 0, &[]);
                r[0] ^= 0xFF;
                r
            }
        };
        let n = resp.len().min(buf.len());
        buf[..n].copy_from_slice(&resp[..n]);
        Ok((n, from))
    }

    fn tx_data_to(&self, id: SockId, data: &[u8], remote: IpEndpoint) -> NetResult<usize> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let e = st.socks.iter_mut().find(|e| e.id == id).ok_or(NetError::NotFound)?;
        if let Some(i) = e.if_nbr {
            if st.link_down.contains(&i) {
                return Err(NetError::LinkDown);
            }
        }
        e.last_query = Some(data.to_vec());
        st.sent.push((id, data.to_vec(), remote));
        Ok(data.len())
    }

    fn select(&self, sets: &mut SelectSets, timeout_ms: Option<u32>, abort: &Signal) -> NetResult<usize> {
        loop {
            let ready = {
                let st = self.state.lock();
                let mut ready = SelectSets::default();
                for e in &st.socks {
                    if sets.rd.is_set(e.id) && !e.inbox.is_empty() {
                        ready.rd.set(e.id);
                    }
                    if sets.wr.is_set(e.id) && e.writable {
                        ready.wr.set(e.id);
                    }
                }
                ready
            };
            let n = ready.rd.len() + ready.wr.len();
            if n > 0 {
                *sets = ready;
                return Ok(n);
            }
            if abort.try_pend() {
                sets.clear();
                return Ok(0);
            }
            match (timeout_ms, &self.clock) {
                (Some(t), Some(clock)) => {
                    clock.advance(t);
                    sets.clear();
                    return Ok(0);
                }
                (Some(_), None) => {
                    sets.clear();
                    return Ok(0);
                }
                (None, _) => std::thread::yield_now(),
            }
        }
    }
}

// =============================================================================
// TASKS
// =============================================================================

/// Accepts the task but never runs it.
pub struct NullSpawner;

impl TaskSpawn for NullSpawner {
    fn spawn(&self, _name: &str, _prio: u32, _entry: Box<dyn FnOnce() + Send>) -> NetResult<TaskId> {
        Ok(1)
    }

    fn prio_set(&self, _task: TaskId, _prio: u32) -> NetResult<()> {
        Ok(())
    }
}

/// Runs each task on a host thread.
pub struct ThreadSpawner {
    handles: Spinlock<Vec<std::thread::JoinHandle<()>>>,
    prio: Spinlock<Option<u32>>,
}

impl ThreadSpawner {
    pub fn new() -> Self {
        Self {
            handles: Spinlock::new(Vec::new()),
            prio: Spinlock::new(None),
        }
    }

    pub fn prio(&self) -> Option<u32> {
        *self.prio.lock()
    }

    pub fn join(&self) {
        let handles = core::mem::take(&mut *self.handles.lock());
        for h in handles {
            h.join().unwrap();
        }
    }
}

impl TaskSpawn for ThreadSpawner {
    fn spawn(&self, name: &str, _prio: u32, entry: Box<dyn FnOnce() + Send>) -> NetResult<TaskId> {
        let h = std::thread::Builder::new()
            .name(name.into())
            .spawn(entry)
            .map_err(|_| NetError::Fatal)?;
        let mut handles = self.handles.lock();
        handles.push(h);
        Ok(handles.len() as TaskId)
    }

    fn prio_set(&self, _task: TaskId, prio: u32) -> NetResult<()> {
        *self.prio.lock() = Some(prio);
        Ok(())
    }
}
