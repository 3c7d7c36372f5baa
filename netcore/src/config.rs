//! Network configuration constants and per-module configuration blocks.

use smoltcp::wire::{IpAddress, IpEndpoint, Ipv4Address};

// =============================================================================
// PROTOCOL CONSTANTS
// =============================================================================

/// IPv6 minimum link MTU (RFC 8200)
pub const IPV6_MTU_MIN: usize = 1280;
/// IPv6 fixed header size
pub const IPV6_HDR_SIZE: usize = 40;
/// IPv6 fragment extension header size
pub const IPV6_FRAG_HDR_SIZE: usize = 8;
/// Non-final fragment payloads must be a multiple of this
pub const IPV6_FRAG_SIZE_UNIT: usize = 8;
/// Largest upper-layer payload an IPv6 datagram can carry
pub const IPV6_PAYLOAD_MAX: usize = 65535;

pub const IPV6_HOP_LIM_DFLT: u8 = 128;
pub const IPV6_HOP_LIM_MAX: u8 = 255;
pub const IPV6_TRAFFIC_CLASS_DFLT: u8 = 0;
pub const IPV6_FLOW_LABEL_DFLT: u32 = 0;

/// DNS server (Google Public DNS)
pub const DNS_SERVER: Ipv4Address = Ipv4Address::new(8, 8, 8, 8);
/// DNS port
pub const DNS_PORT: u16 = 53;

/// Default maximum delay the service task may pend for, in ms
pub const SVC_MAX_DLY_MS: u32 = 0x7FFF_FFFF;

// =============================================================================
// BUFFER POOLS
// =============================================================================

/// Buffer pool sizing for one interface.
#[derive(Clone, Copy, Debug)]
pub struct IfBufCfg {
    pub rx_large_nbr: usize,
    pub rx_large_size: usize,
    pub tx_large_nbr: usize,
    pub tx_large_size: usize,
    pub tx_small_nbr: usize,
    pub tx_small_size: usize,
    /// Byte budget for lazily allocated data blocks (None = unlimited)
    pub seg_size: Option<usize>,
    /// Zero data memory on every get
    pub clr_mem: bool,
}

impl IfBufCfg {
    pub const fn new() -> Self {
        Self {
            rx_large_nbr: 8,
            rx_large_size: 1536,
            tx_large_nbr: 16,
            tx_large_size: 1614,
            tx_small_nbr: 8,
            tx_small_size: 256,
            seg_size: None,
            clr_mem: false,
        }
    }
}

impl Default for IfBufCfg {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// DNS CLIENT
// =============================================================================

/// DNS client and cache configuration.
#[derive(Clone, Copy, Debug)]
pub struct DnsCfg {
    pub server: IpEndpoint,
    /// Maximum number of cached host objects (None = unlimited)
    pub host_nbr_max: Option<usize>,
    /// Name block size; usable name length is one less
    pub host_name_block_size: usize,
    pub addr_ipv4_max_per_host: usize,
    pub addr_ipv6_max_per_host: usize,
    /// Address objects shared by every host (None = unlimited)
    pub addr_nbr_max: Option<usize>,
    pub req_timeout_ms: u32,
    pub req_retry: u8,
    pub ipv4_en: bool,
    pub ipv6_en: bool,
    /// Period of the resolution timer when run by a service task
    pub task_dly_ms: u32,
}

impl DnsCfg {
    pub const fn new() -> Self {
        Self {
            server: IpEndpoint {
                addr: IpAddress::Ipv4(DNS_SERVER),
                port: DNS_PORT,
            },
            host_nbr_max: Some(8),
            host_name_block_size: 256,
            addr_ipv4_max_per_host: 2,
            addr_ipv6_max_per_host: 2,
            addr_nbr_max: Some(32),
            req_timeout_ms: 5000,
            req_retry: 3,
            ipv4_en: true,
            ipv6_en: true,
            task_dly_ms: 50,
        }
    }

    /// Longest host name a host object can hold.
    pub const fn host_name_len_max(&self) -> usize {
        self.host_name_block_size.saturating_sub(1)
    }
}

impl Default for DnsCfg {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERVICE TASK
// =============================================================================

/// Service task instance configuration.
#[derive(Clone, Copy, Debug)]
pub struct SvcTaskCfg {
    pub prio: u32,
    /// Pooled (fire-and-forget) message blocks
    pub msg_nbr_max: usize,
}

impl SvcTaskCfg {
    pub const fn new() -> Self {
        Self {
            prio: 20,
            msg_nbr_max: 16,
        }
    }
}

impl Default for SvcTaskCfg {
    fn default() -> Self {
        Self::new()
    }
}

/// Resource limits for one service task child.
#[derive(Clone, Copy, Debug)]
pub struct SvcChildCfg {
    pub tmr_nbr_max: usize,
    pub sock_nbr_max: usize,
    pub msg_nbr_max: usize,
}

impl SvcChildCfg {
    pub const fn new() -> Self {
        Self {
            tmr_nbr_max: 4,
            sock_nbr_max: 2,
            msg_nbr_max: 4,
        }
    }
}

impl Default for SvcChildCfg {
    fn default() -> Self {
        Self::new()
    }
}
