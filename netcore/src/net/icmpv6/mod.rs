//! ICMPv6 (RFC 4443) message codec.
//!
//! Receive validates a buffer chain handed up by the IPv6 layer, demuxes it
//! and always frees it. Transmit builds a (possibly fragmented) chain,
//! checksums it and hands it to the IPv6 transmit primitive.

mod rx;
mod tx;

use smoltcp::wire::Ipv6Address;

use super::buf::{BufHandle, BufPool};
use super::stack::NetStack;
use crate::error::NetResult;

pub use tx::{Icmpv6ErrMsg, Icmpv6TxReq};

// =============================================================================
// WIRE CONSTANTS
// =============================================================================

pub const HDR_SIZE_ECHO: usize = 8;
pub const HDR_SIZE_ERR: usize = 8;
pub const HDR_SIZE_NDP_NS: usize = 24;
pub const HDR_SIZE_NDP_NA: usize = 24;
pub const HDR_SIZE_NDP_RS: usize = 8;
pub const HDR_SIZE_NDP_RA: usize = 16;
pub const HDR_SIZE_NDP_REDIRECT: usize = 40;
pub const HDR_SIZE_MLD: usize = 24;

/// Smallest invoking-packet excerpt an error message must carry
pub const ERR_DATA_SIZE_MIN: usize = 8;
pub const MSG_LEN_MIN_ERR: usize = HDR_SIZE_ERR + crate::config::IPV6_HDR_SIZE + ERR_DATA_SIZE_MIN;
/// Error messages must fit a minimum-MTU IPv6 packet (RFC 4443 2.4)
pub const MSG_LEN_MAX_ERR: usize = crate::config::IPV6_MTU_MIN - crate::config::IPV6_HDR_SIZE;

/// Offset of the checksum inside every ICMPv6 header
pub const CHKSUM_OFFSET: usize = 2;

pub const NA_FLAG_ROUTER: u32 = 0x8000_0000;
pub const NA_FLAG_SOLICITED: u32 = 0x4000_0000;
pub const NA_FLAG_OVERRIDE: u32 = 0x2000_0000;

pub const NDP_OPT_SRC_LINK_ADDR: u8 = 1;
pub const NDP_OPT_TARGET_LINK_ADDR: u8 = 2;

/// NDP and MLD require these hop limits on transmit.
pub const HOP_LIM_NDP: u8 = 255;
pub const HOP_LIM_MLD: u8 = 1;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    DestUnreach,
    PktTooBig,
    TimeExceed,
    ParamProb,
    EchoReq,
    EchoReply,
    MldQuery,
    MldReportV1,
    MldDone,
    RouterSol,
    RouterAdv,
    NeighborSol,
    NeighborAdv,
    Redirect,
    MldReportV2,
    Unknown(u8),
}

impl From<u8> for MsgType {
    fn from(v: u8) -> Self {
        match v {
            1 => MsgType::DestUnreach,
            2 => MsgType::PktTooBig,
            3 => MsgType::TimeExceed,
            4 => MsgType::ParamProb,
            128 => MsgType::EchoReq,
            129 => MsgType::EchoReply,
            130 => MsgType::MldQuery,
            131 => MsgType::MldReportV1,
            132 => MsgType::MldDone,
            133 => MsgType::RouterSol,
            134 => MsgType::RouterAdv,
            135 => MsgType::NeighborSol,
            136 => MsgType::NeighborAdv,
            137 => MsgType::Redirect,
            143 => MsgType::MldReportV2,
            other => MsgType::Unknown(other),
        }
    }
}

impl From<MsgType> for u8 {
    fn from(t: MsgType) -> u8 {
        match t {
            MsgType::DestUnreach => 1,
            MsgType::PktTooBig => 2,
            MsgType::TimeExceed => 3,
            MsgType::ParamProb => 4,
            MsgType::EchoReq => 128,
            MsgType::EchoReply => 129,
            MsgType::MldQuery => 130,
            MsgType::MldReportV1 => 131,
            MsgType::MldDone => 132,
            MsgType::RouterSol => 133,
            MsgType::RouterAdv => 134,
            MsgType::NeighborSol => 135,
            MsgType::NeighborAdv => 136,
            MsgType::Redirect => 137,
            MsgType::MldReportV2 => 143,
            MsgType::Unknown(v) => v,
        }
    }
}

/// Demux class of a message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgClass {
    Err,
    Req,
    Reply,
    Ndp,
    Mldp,
    Unknown,
}

impl MsgType {
    pub fn class(self) -> MsgClass {
        match self {
            MsgType::DestUnreach | MsgType::PktTooBig | MsgType::TimeExceed | MsgType::ParamProb => {
                MsgClass::Err
            }
            MsgType::EchoReq => MsgClass::Req,
            MsgType::EchoReply => MsgClass::Reply,
            MsgType::RouterSol
            | MsgType::RouterAdv
            | MsgType::NeighborSol
            | MsgType::NeighborAdv
            | MsgType::Redirect => MsgClass::Ndp,
            MsgType::MldQuery | MsgType::MldReportV1 | MsgType::MldDone | MsgType::MldReportV2 => {
                MsgClass::Mldp
            }
            MsgType::Unknown(_) => MsgClass::Unknown,
        }
    }

    pub fn is_err(self) -> bool {
        self.class() == MsgClass::Err
    }

    /// Fixed header length (type, code, checksum and type-specific fields).
    pub fn hdr_len(self) -> usize {
        match self {
            MsgType::DestUnreach | MsgType::PktTooBig | MsgType::TimeExceed | MsgType::ParamProb => {
                HDR_SIZE_ERR
            }
            MsgType::EchoReq | MsgType::EchoReply => HDR_SIZE_ECHO,
            MsgType::NeighborSol => HDR_SIZE_NDP_NS,
            MsgType::NeighborAdv => HDR_SIZE_NDP_NA,
            MsgType::RouterSol => HDR_SIZE_NDP_RS,
            MsgType::RouterAdv => HDR_SIZE_NDP_RA,
            MsgType::Redirect => HDR_SIZE_NDP_REDIRECT,
            MsgType::MldQuery | MsgType::MldReportV1 | MsgType::MldDone => HDR_SIZE_MLD,
            MsgType::MldReportV2 | MsgType::Unknown(_) => 4,
        }
    }

    /// Shortest valid message of this type.
    pub fn msg_len_min(self) -> usize {
        if self.is_err() {
            MSG_LEN_MIN_ERR
        } else {
            self.hdr_len()
        }
    }

    /// Longest valid message of this type.
    pub fn msg_len_max(self) -> usize {
        match self.class() {
            MsgClass::Err => MSG_LEN_MAX_ERR,
            _ if self == MsgType::MldReportV1 || self == MsgType::MldDone => HDR_SIZE_MLD,
            _ => crate::config::IPV6_PAYLOAD_MAX,
        }
    }

    /// Types that may arrive addressed to a multicast group.
    pub fn mcast_allowed(self) -> bool {
        matches!(
            self,
            MsgType::EchoReq
                | MsgType::PktTooBig
                | MsgType::ParamProb
                | MsgType::NeighborSol
                | MsgType::NeighborAdv
                | MsgType::RouterSol
                | MsgType::RouterAdv
                | MsgType::Redirect
                | MsgType::MldQuery
                | MsgType::MldReportV1
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DestUnreachCode {
    NoRoute = 0,
    AdminProhibited = 1,
    BeyondScope = 2,
    AddrUnreach = 3,
    PortUnreach = 4,
    SrcAddrFailed = 5,
    RejectRoute = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeExceedCode {
    HopLimit = 0,
    FragReassembly = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamProbCode {
    BadHdr = 0,
    BadNextHdr = 1,
    BadOpt = 2,
}

// =============================================================================
// STATE AND STATISTICS
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Icmpv6Stats {
    pub rx_msg: u32,
    pub rx_msg_req: u32,
    pub rx_msg_reply: u32,
    pub rx_msg_ndp: u32,
    pub rx_msg_mldp: u32,
    pub rx_msg_err: u32,
    pub rx_msg_compl: u32,
    pub rx_msg_unknown: u32,

    pub rx_err_mcast: u32,
    pub rx_err_code: u32,
    pub rx_err_type: u32,
    pub rx_err_ptr: u32,
    pub rx_err_len: u32,
    pub rx_err_chk: u32,
    pub rx_err_discard: u32,
    pub rx_err_echo_reply: u32,

    pub tx_msg: u32,
    pub tx_msg_req: u32,
    pub tx_msg_reply: u32,
    pub tx_msg_err: u32,
    pub tx_err: u32,
    pub tx_err_suppressed: u32,
}

/// ICMPv6 module state kept under the stack lock.
#[derive(Debug, Default)]
pub struct Icmpv6State {
    pub stats: Icmpv6Stats,
    /// Next echo request sequence number
    pub tx_seq: u16,
}

// =============================================================================
// UPPER-LAYER HANDLERS
// =============================================================================

/// What the neighbor discovery handler wants done with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NdpVerdict {
    Consumed,
    /// Answer the solicitation with a Neighbor Advertisement
    SendAdvert,
}

/// Consumers of validated messages. Called with the stack lock held; the
/// chain is only borrowed and is freed by the codec afterwards.
pub trait Icmpv6Upper: Send + Sync {
    fn echo_reply(&self, pool: &BufPool, buf: BufHandle) -> NetResult<()>;

    fn ndp_rx(&self, pool: &BufPool, buf: BufHandle, typ: MsgType) -> NetResult<NdpVerdict>;

    fn mldp_rx(&self, pool: &BufPool, buf: BufHandle, typ: MsgType) -> NetResult<()>;
}

/// Accepts everything and never answers.
pub struct NoUpper;

impl Icmpv6Upper for NoUpper {
    fn echo_reply(&self, _pool: &BufPool, _buf: BufHandle) -> NetResult<()> {
        Ok(())
    }

    fn ndp_rx(&self, _pool: &BufPool, _buf: BufHandle, _typ: MsgType) -> NetResult<NdpVerdict> {
        Ok(NdpVerdict::Consumed)
    }

    fn mldp_rx(&self, _pool: &BufPool, _buf: BufHandle, _typ: MsgType) -> NetResult<()> {
        Ok(())
    }
}

// =============================================================================
// PUBLIC API
// =============================================================================

impl NetStack {
    /// Process a received ICMPv6 message chain. Always consumes `buf`.
    pub fn icmpv6_rx(&self, buf: BufHandle) {
        let mut st = self.lock();
        rx::rx(&mut st, self.env(), buf);
    }

    /// Send an Echo Request. Returns the sequence number used.
    pub fn icmpv6_tx_echo_req(&self, dst: Ipv6Address, id: u16, data: &[u8]) -> NetResult<u16> {
        let if_nbr = self
            .env()
            .netif
            .if_list()
            .into_iter()
            .find(|&i| self.env().netif.is_link_up(i))
            .ok_or(crate::error::NetError::LinkDown)?;
        let req = Icmpv6TxReq::echo(if_nbr, dst, id, data);
        self.icmpv6_tx_req(&req)
    }

    /// Send a request message (echo, NS, RS, MLD report/done).
    /// Returns the echo sequence number, or 0 for other types.
    pub fn icmpv6_tx_req(&self, req: &Icmpv6TxReq<'_>) -> NetResult<u16> {
        let mut st = self.lock();
        tx::tx_req(&mut st, self.env(), req)
    }

    /// Send an error message about the received packet `offending`.
    /// The caller keeps ownership of `offending`.
    pub fn icmpv6_tx_error(&self, offending: BufHandle, err: Icmpv6ErrMsg) -> NetResult<()> {
        let mut st = self.lock();
        tx::tx_error(&mut st, self.env(), offending, err)
    }

    pub fn icmpv6_stats(&self) -> Icmpv6Stats {
        self.lock().icmp6.stats
    }
}
