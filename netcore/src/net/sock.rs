//! Socket layer collaborator.
//!
//! The DNS client and the service task drive sockets only through
//! `SockApi`, so a host can plug in smoltcp, an OS socket table or a fake.

use alloc::collections::BTreeSet;

use smoltcp::wire::IpEndpoint;

use super::IfNbr;
use crate::error::NetResult;
use crate::waitqueue::Signal;

pub type SockId = u16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockFamily {
    Ipv4,
    Ipv6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockType {
    Datagram,
    Stream,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockBlock {
    NonBlocking,
    /// Receives give up with `Timeout` after this many ms
    Blocking { timeout_ms: u32 },
}

/// Set of socket ids for select.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SockDesc {
    ids: BTreeSet<SockId>,
}

impl SockDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: SockId) {
        self.ids.insert(id);
    }

    pub fn clr(&mut self, id: SockId) {
        self.ids.remove(&id);
    }

    pub fn is_set(&self, id: SockId) -> bool {
        self.ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = SockId> + '_ {
        self.ids.iter().copied()
    }
}

/// Read/write/error sets. Select narrows each set to the ready sockets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectSets {
    pub rd: SockDesc,
    pub wr: SockDesc,
    pub err: SockDesc,
}

impl SelectSets {
    pub fn is_empty(&self) -> bool {
        self.rd.is_empty() && self.wr.is_empty() && self.err.is_empty()
    }

    pub fn clear(&mut self) {
        self.rd.clear();
        self.wr.clear();
        self.err.clear();
    }
}

pub trait SockApi: Send + Sync {
    fn open(&self, family: SockFamily, typ: SockType) -> NetResult<SockId>;

    fn close(&self, id: SockId) -> NetResult<()>;

    fn bind(&self, id: SockId, local: IpEndpoint) -> NetResult<()>;

    fn connect(&self, id: SockId, remote: IpEndpoint) -> NetResult<()>;

    fn listen(&self, id: SockId, backlog: usize) -> NetResult<()>;

    /// Restrict the socket to one interface.
    fn cfg_if(&self, id: SockId, if_nbr: IfNbr) -> NetResult<()>;

    fn cfg_blocking(&self, id: SockId, mode: SockBlock) -> NetResult<()>;

    /// Receive one datagram. Non-blocking sockets return `WouldBlock` when
    /// empty; blocking ones return `Timeout` when their timeout elapses.
    fn rx_data_from(&self, id: SockId, buf: &mut [u8]) -> NetResult<(usize, IpEndpoint)>;

    fn tx_data_to(&self, id: SockId, data: &[u8], remote: IpEndpoint) -> NetResult<usize>;

    /// Wait until a socket in `sets` is ready, `timeout_ms` passes
    /// (`None` = forever) or `abort` is posted. On return each set holds
    /// only the ready sockets; the count of ready sockets is returned.
    fn select(&self, sets: &mut SelectSets, timeout_ms: Option<u32>, abort: &Signal) -> NetResult<usize>;

    /// Wake a pending `select` early.
    fn select_abort(&self, abort: &Signal) {
        abort.post();
    }
}
