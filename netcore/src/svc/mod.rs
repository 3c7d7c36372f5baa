//! Network service task.
//!
//! One cooperative loop serving any number of children. A child owns
//! software timers and sockets; the loop waits for the nearest timer or
//! socket readiness, then runs timer callbacks, queued messages and socket
//! hooks with the instance lock released.
//!
//! ```text
//! run_once:
//!   sets + timeout  (locked)
//!   select / pend   (unlocked)
//!   timers          (expire locked, callbacks unlocked)
//!   messages        (drain locked, handlers unlocked)
//!   socket hooks    (unlocked)
//! ```

mod sock;
mod task;
mod tmr;

use alloc::boxed::Box;
use core::any::Any;

use smoltcp::wire::IpEndpoint;

use crate::error::{NetError, NetResult};
use crate::net::SockId;

pub use sock::{SockHandle, SockOp, SVC_SOCK_DATA_MAX};
pub use task::SvcTask;
pub use tmr::{TmrFn, TmrHandle};

pub type ChildId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildHandle(pub(crate) ChildId);

impl ChildHandle {
    pub fn id(&self) -> ChildId {
        self.0
    }
}

pub type MsgPayload = Box<dyn Any + Send>;

/// Child lifecycle and message hooks. All run on the service task with
/// the instance lock released.
pub trait ChildHooks: Send + Sync {
    fn on_start(&self, _child: ChildHandle) -> NetResult<()> {
        Ok(())
    }

    fn on_stop(&self, _child: ChildHandle) -> NetResult<()> {
        Ok(())
    }

    fn on_msg(&self, _child: ChildHandle, _msg: MsgPayload) -> NetResult<()> {
        Ok(())
    }

    /// Errors from this child's hooks and timer callbacks.
    fn on_err(&self, _child: ChildHandle, _err: NetError) {}
}

/// Socket readiness hooks, selected by the handle's `SockOp`.
pub trait SockHooks: Send + Sync {
    fn on_rx(&self, _child: ChildHandle, _sock: SockId) -> NetResult<()> {
        Ok(())
    }

    fn on_tx(&self, _child: ChildHandle, _sock: SockId) -> NetResult<()> {
        Ok(())
    }

    fn on_err(&self, _child: ChildHandle, _sock: SockId) {}

    /// A datagram the loop received on the child's behalf.
    fn on_rx_data(&self, _child: ChildHandle, _sock: SockId, _data: &[u8], _from: IpEndpoint) -> NetResult<()> {
        Ok(())
    }

    /// Fill `buf` with a datagram to send; `None` sends nothing.
    fn on_tx_data(&self, _child: ChildHandle, _sock: SockId, _buf: &mut [u8]) -> NetResult<Option<(usize, IpEndpoint)>> {
        Ok(None)
    }
}

pub type TaskId = u32;

/// Creates the OS task a `SvcTask` loop runs on.
pub trait TaskSpawn: Send + Sync {
    fn spawn(&self, name: &str, prio: u32, entry: Box<dyn FnOnce() + Send>) -> NetResult<TaskId>;

    fn prio_set(&self, task: TaskId, prio: u32) -> NetResult<()>;
}
