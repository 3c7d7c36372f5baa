//! Child sockets watched by the service task.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec;

use super::{ChildHandle, ChildId, SockHooks};
use crate::error::NetResult;
use crate::klog::klog_debug;
use crate::net::sock::{SelectSets, SockApi};
use crate::net::SockId;

/// Largest datagram moved by the `RxData`/`TxData` operations.
pub const SVC_SOCK_DATA_MAX: usize = 1472;

/// What the loop does when a socket becomes ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockOp {
    None,
    /// Call `on_rx` when readable
    RxRdy,
    /// Call `on_tx` when writable
    TxRdy,
    RxTxRdy,
    /// Receive a datagram and pass it to `on_rx_data`
    RxData,
    /// Ask `on_tx_data` for a datagram and send it
    TxData,
    RxTxData,
}

impl SockOp {
    pub fn wants_rd(self) -> bool {
        matches!(self, SockOp::RxRdy | SockOp::RxTxRdy | SockOp::RxData | SockOp::RxTxData)
    }

    pub fn wants_wr(self) -> bool {
        matches!(self, SockOp::TxRdy | SockOp::RxTxRdy | SockOp::TxData | SockOp::RxTxData)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SockHandle {
    pub(crate) child: ChildId,
    pub(crate) id: u32,
}

impl SockHandle {
    pub fn child(&self) -> ChildHandle {
        ChildHandle(self.child)
    }
}

#[derive(Clone)]
pub(super) struct SvcSock {
    pub handle: SockHandle,
    pub sock: SockId,
    pub op: SockOp,
    pub hooks: Arc<dyn SockHooks>,
}

impl SvcSock {
    /// Add this socket to the sets its operation needs.
    pub fn add_to(&self, sets: &mut SelectSets) {
        if self.op == SockOp::None {
            return;
        }
        if self.op.wants_rd() {
            sets.rd.set(self.sock);
        }
        if self.op.wants_wr() {
            sets.wr.set(self.sock);
        }
        sets.err.set(self.sock);
    }

    pub fn is_ready(&self, sets: &SelectSets) -> bool {
        sets.rd.is_set(self.sock) || sets.wr.is_set(self.sock) || sets.err.is_set(self.sock)
    }

    /// Run the hooks for a ready socket. Called without the instance lock.
    pub fn dispatch(&self, api: &dyn SockApi, sets: &SelectSets) -> NetResult<()> {
        let child = self.handle.child();
        let rx = sets.rd.is_set(self.sock);
        let tx = sets.wr.is_set(self.sock);

        if sets.err.is_set(self.sock) {
            self.hooks.on_err(child, self.sock);
        }

        match self.op {
            SockOp::None => {}
            SockOp::RxRdy | SockOp::TxRdy | SockOp::RxTxRdy => {
                if rx && self.op.wants_rd() {
                    self.hooks.on_rx(child, self.sock)?;
                }
                if tx && self.op.wants_wr() {
                    self.hooks.on_tx(child, self.sock)?;
                }
            }
            SockOp::RxData | SockOp::TxData | SockOp::RxTxData => {
                if rx && self.op.wants_rd() {
                    self.rx_data(api, child)?;
                }
                if tx && self.op.wants_wr() {
                    self.tx_data(api, child)?;
                }
            }
        }
        Ok(())
    }

    fn rx_data(&self, api: &dyn SockApi, child: ChildHandle) -> NetResult<()> {
        let mut buf = vec![0u8; SVC_SOCK_DATA_MAX];
        let (n, from) = api.rx_data_from(self.sock, &mut buf)?;
        self.hooks.on_rx_data(child, self.sock, &buf[..n], from)
    }

    fn tx_data(&self, api: &dyn SockApi, child: ChildHandle) -> NetResult<()> {
        let mut buf = vec![0u8; SVC_SOCK_DATA_MAX];
        if let Some((n, to)) = self.hooks.on_tx_data(child, self.sock, &mut buf)? {
            let sent = api.tx_data_to(self.sock, &buf[..n.min(buf.len())], to)?;
            klog_debug("svc", &format!("sock {}: sent {} bytes", self.sock, sent));
        }
        Ok(())
    }
}
