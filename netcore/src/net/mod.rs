//! Network core: buffer pool, checksums, collaborator interfaces and the
//! ICMPv6 codec.
//!
//! ## Module Structure
//!
//! - `buf` - Buffer arena and per-interface pools
//! - `checksum` - Internet checksum over slices and buffer chains
//! - `ip` - IPv6 transmit and interface collaborator traits
//! - `sock` - Socket collaborator trait used by DNS and the service task
//! - `stack` - `NetStack` context object and the global stack lock
//! - `utils` - Address literal parsing and formatting
//! - `icmpv6` - ICMPv6 receive validation/demux and transmit

pub mod buf;
pub mod checksum;
pub mod icmpv6;
pub mod ip;
pub mod sock;
pub mod stack;
pub mod utils;

/// Interface number.
pub type IfNbr = u8;

pub use buf::{BufDir, BufFlags, BufHandle, BufHdr, BufPool, BufType};
pub use ip::{Ipv6Tx, Ipv6TxParams, NetIf};
pub use sock::{SockApi, SockDesc, SockId};
pub use stack::{NetStack, StackEnv, StackState};
pub use utils::{format_ipv4, parse_ip_literal, parse_ipv4};
