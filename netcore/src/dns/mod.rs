//! DNS client.
//!
//! - `wire` - RFC 1035 query/response codec
//! - `cache` - Bounded host cache with per-family address caps
//! - `req` - Per-host resolution state machine
//! - `client` - `DnsClient` context: lookups, flags, sync and task-driven modes

pub mod cache;
pub mod client;
pub mod req;
pub mod wire;

use bitflags::bitflags;

pub use cache::{DnsCache, HostId, HostObj, SrchResult};
pub use client::{DnsClient, DnsStatus};
pub use req::{DnsReqCfg, HostState};

bitflags! {
    /// Lookup flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DnsFlags: u8 {
        /// Return `Pending` instead of waiting
        const NO_BLOCK = 1 << 0;
        /// Answer from the cache only
        const FORCE_CACHE = 1 << 1;
        /// Drop any cached entry and resolve again
        const FORCE_RENEW = 1 << 2;
        /// Query the server even for an address literal
        const FORCE_RESOLUTION = 1 << 3;
        const IPV4_ONLY = 1 << 4;
        const IPV6_ONLY = 1 << 5;
    }
}

impl DnsFlags {
    pub const NONE: Self = Self::empty();
}
