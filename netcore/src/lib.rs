//! Embedded TCP/IP core services.
//!
//! - `net` - buffer pool, checksums and the ICMPv6 codec
//! - `dns` - host cache and resolver state machine
//! - `svc` - service task multiplexing children over timers, messages and sockets
//!
//! Every subsystem reaches its collaborators (interfaces, sockets, clock,
//! task spawner) through traits handed in at construction.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod dns;
pub mod error;
pub mod klog;
pub mod lock;
pub mod net;
pub mod svc;
pub mod time;
pub mod waitqueue;

#[cfg(test)]
mod testutil;

pub use error::{NetError, NetResult};
pub use lock::Spinlock;
