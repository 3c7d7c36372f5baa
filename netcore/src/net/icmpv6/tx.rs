//! ICMPv6 transmit: requests, replies and error messages.

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use smoltcp::wire::{IpProtocol, Ipv6Address};

use super::{
    DestUnreachCode, MsgType, ParamProbCode, TimeExceedCode, CHKSUM_OFFSET, HOP_LIM_MLD, HOP_LIM_NDP,
    HDR_SIZE_ECHO, HDR_SIZE_ERR, NA_FLAG_OVERRIDE, NA_FLAG_SOLICITED, NDP_OPT_SRC_LINK_ADDR,
    NDP_OPT_TARGET_LINK_ADDR,
};
use crate::config::{
    IPV6_FRAG_HDR_SIZE, IPV6_FRAG_SIZE_UNIT, IPV6_HDR_SIZE, IPV6_HOP_LIM_DFLT, IPV6_MTU_MIN, IPV6_PAYLOAD_MAX,
};
use crate::error::{NetError, NetResult};
use crate::klog::{klog_debug, klog_warning};
use crate::net::buf::{BufDir, BufFlags, BufHandle};
use crate::net::checksum::{self, Accum};
use crate::net::ip::{solicited_node_mcast, Ipv6ExtHdrs, Ipv6TxParams, IPV6_ALL_NODES, IPV6_ALL_ROUTERS};
use crate::net::stack::{StackEnv, StackState};
use crate::net::IfNbr;

/// A request message to send.
#[derive(Clone, Copy, Debug)]
pub struct Icmpv6TxReq<'a> {
    pub if_nbr: IfNbr,
    pub typ: MsgType,
    pub code: u8,
    /// `None` selects a source for `dst`
    pub src: Option<Ipv6Address>,
    /// `None` uses the type's default destination
    pub dst: Option<Ipv6Address>,
    /// Neighbor solicitation target or MLD group
    pub addr: Option<Ipv6Address>,
    /// Echo identifier
    pub id: u16,
    pub data: &'a [u8],
}

impl<'a> Icmpv6TxReq<'a> {
    pub fn echo(if_nbr: IfNbr, dst: Ipv6Address, id: u16, data: &'a [u8]) -> Self {
        Self {
            if_nbr,
            typ: MsgType::EchoReq,
            code: 0,
            src: None,
            dst: Some(dst),
            addr: None,
            id,
            data,
        }
    }

    /// Neighbor solicitation. `dst` of `None` sends to the target's
    /// solicited-node group.
    pub fn neighbor_sol(if_nbr: IfNbr, target: Ipv6Address, dst: Option<Ipv6Address>) -> Self {
        Self {
            if_nbr,
            typ: MsgType::NeighborSol,
            code: 0,
            src: None,
            dst,
            addr: Some(target),
            id: 0,
            data: &[],
        }
    }

    pub fn router_sol(if_nbr: IfNbr) -> Self {
        Self {
            if_nbr,
            typ: MsgType::RouterSol,
            code: 0,
            src: None,
            dst: None,
            addr: None,
            id: 0,
            data: &[],
        }
    }

    pub fn mld(if_nbr: IfNbr, typ: MsgType, group: Ipv6Address) -> Self {
        Self {
            if_nbr,
            typ,
            code: 0,
            src: None,
            dst: None,
            addr: Some(group),
            id: 0,
            data: &[],
        }
    }
}

/// Error message to send about a received packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Icmpv6ErrMsg {
    DestUnreach(DestUnreachCode),
    PktTooBig { mtu: u32 },
    TimeExceed(TimeExceedCode),
    ParamProb { code: ParamProbCode, ptr: u32 },
}

impl Icmpv6ErrMsg {
    fn type_code(&self) -> (MsgType, u8) {
        match *self {
            Icmpv6ErrMsg::DestUnreach(c) => (MsgType::DestUnreach, c as u8),
            Icmpv6ErrMsg::PktTooBig { .. } => (MsgType::PktTooBig, 0),
            Icmpv6ErrMsg::TimeExceed(c) => (MsgType::TimeExceed, c as u8),
            Icmpv6ErrMsg::ParamProb { code, .. } => (MsgType::ParamProb, code as u8),
        }
    }

    /// Four bytes following the checksum.
    fn word(&self) -> u32 {
        match *self {
            Icmpv6ErrMsg::PktTooBig { mtu } => mtu,
            Icmpv6ErrMsg::ParamProb { ptr, .. } => ptr,
            Icmpv6ErrMsg::DestUnreach(_) | Icmpv6ErrMsg::TimeExceed(_) => 0,
        }
    }

    /// Errors still sent for packets received as broadcast or multicast.
    fn mcast_exempt(&self) -> bool {
        matches!(
            self,
            Icmpv6ErrMsg::PktTooBig { .. } | Icmpv6ErrMsg::ParamProb { code: ParamProbCode::BadOpt, .. }
        )
    }
}

enum Payload<'a> {
    Slice(&'a [u8]),
    /// User data of a received chain, from logical offset 0
    Chain(BufHandle),
}

/// Everything needed to build one outgoing message.
struct TxMsg<'a> {
    if_nbr: IfNbr,
    src: Ipv6Address,
    dst: Ipv6Address,
    typ: MsgType,
    code: u8,
    /// Header bytes after the checksum
    hdr_rest: &'a [u8],
    payload: Payload<'a>,
    payload_len: usize,
    hop_limit: u8,
    /// Fail rather than chain when the message exceeds one buffer
    single_buf: bool,
}

// =============================================================================
// CHAIN BUILDER
// =============================================================================

/// Build, checksum and send `msg`. On error every buffer acquired here has
/// been freed; on success the chain belongs to the IPv6 layer.
fn tx_msg(st: &mut StackState, env: &StackEnv, msg: &TxMsg<'_>) -> NetResult<()> {
    let hdr_len = 4 + msg.hdr_rest.len();
    let msg_len = hdr_len + msg.payload_len;
    if msg_len > IPV6_PAYLOAD_MAX {
        return Err(NetError::Tx);
    }

    let mut mtu = env.netif.mtu_protocol(msg.if_nbr, IpProtocol::Icmpv6)?;
    let mut ext = Ipv6ExtHdrs::default();
    if msg_len > mtu {
        mtu = mtu.saturating_sub(IPV6_FRAG_HDR_SIZE);
        mtu -= mtu % IPV6_FRAG_SIZE_UNIT;
        ext.frag = true;
    }

    let msg_ix = env.netif.link_hdr_len(msg.if_nbr)
        + IPV6_HDR_SIZE
        + if ext.frag { IPV6_FRAG_HDR_SIZE } else { 0 };
    let buf_max = st.bufs.max_size(msg.if_nbr, BufDir::Tx, None, msg_ix);
    let mut max_data = buf_max.min(mtu);
    if ext.frag {
        max_data -= max_data % IPV6_FRAG_SIZE_UNIT;
    }
    if max_data < hdr_len || (msg.single_buf && msg_len > max_data) {
        return Err(NetError::WouldOverflow);
    }

    let head = build_chain(st, msg, msg_ix, hdr_len, msg_len, max_data)?;

    let res = fill_and_send(st, env, msg, head, msg_ix, hdr_len, msg_len, ext);
    if res.is_err() {
        st.bufs.free_chain(head);
    }
    res
}

fn build_chain(
    st: &mut StackState,
    msg: &TxMsg<'_>,
    msg_ix: usize,
    hdr_len: usize,
    msg_len: usize,
    max_data: usize,
) -> NetResult<BufHandle> {
    let pool = &mut st.bufs;
    let mut head: Option<BufHandle> = None;
    let mut prev: Option<BufHandle> = None;
    let mut remaining = msg_len;

    while remaining > 0 {
        let req_len = remaining.min(max_data);
        let h = match pool.get(msg.if_nbr, BufDir::Tx, req_len, msg_ix) {
            Ok(h) => h,
            Err(e) => {
                if let Some(hd) = head {
                    pool.free_chain(hd);
                }
                return Err(e);
            }
        };
        let linked = match prev {
            Some(p) => pool.chain_append(p, h),
            None => {
                head = Some(h);
                Ok(())
            }
        };
        let b = match linked.and_then(|_| pool.hdr_mut(h)) {
            Ok(b) => b,
            Err(e) => {
                if let Some(hd) = head {
                    pool.free_chain(hd);
                }
                if pool.is_used(h) {
                    pool.free(h);
                }
                return Err(e);
            }
        };

        let first = prev.is_none();
        b.flags |= BufFlags::IPV6_FRAME;
        if msg.dst.is_multicast() {
            b.flags |= BufFlags::TX_MULTICAST;
        }
        b.ip_addr_src = msg.src;
        b.ip_addr_dst = msg.dst;
        b.icmp_msg_ix = msg_ix;
        b.icmp_msg_len = msg_len;
        b.tot_len = msg_len;
        b.icmp_hdr_len = if first { hdr_len } else { 0 };
        b.data_ix = msg_ix + b.icmp_hdr_len;
        b.data_len = req_len - b.icmp_hdr_len;

        remaining -= req_len;
        prev = Some(h);
    }

    head.ok_or(NetError::Fatal)
}

#[allow(clippy::too_many_arguments)]
fn fill_and_send(
    st: &mut StackState,
    env: &StackEnv,
    msg: &TxMsg<'_>,
    head: BufHandle,
    msg_ix: usize,
    hdr_len: usize,
    msg_len: usize,
    ext: Ipv6ExtHdrs,
) -> NetResult<()> {
    let pool = &mut st.bufs;

    match msg.payload {
        Payload::Slice(data) => pool.data_wr_chain(head, 0, &data[..msg.payload_len])?,
        Payload::Chain(src) => pool.data_copy(head, src, 0, 0, msg.payload_len)?,
    }

    let mut hdr = vec![0u8; hdr_len];
    hdr[0] = msg.typ.into();
    hdr[1] = msg.code;
    hdr[4..].copy_from_slice(msg.hdr_rest);
    pool.data_wr(head, msg_ix, &hdr)?;

    let mut acc = Accum::new();
    checksum::pseudo_hdr_v6(&mut acc, &msg.src, &msg.dst, msg_len as u32, IpProtocol::Icmpv6);
    checksum::chain_sum(pool, head, &mut acc)?;
    let chk = acc.finish();
    pool.data_wr(head, msg_ix + CHKSUM_OFFSET, &chk.to_be_bytes())?;

    let mut params = Ipv6TxParams::new(msg.src, msg.dst, IpProtocol::Icmpv6);
    params.ext = ext;
    params.hop_limit = msg.hop_limit;
    env.ip_tx.tx(pool, head, &params)
}

fn src_sel(env: &StackEnv, if_nbr: IfNbr, dst: &Ipv6Address) -> NetResult<Ipv6Address> {
    env.netif.src_addr_sel(if_nbr, dst).ok_or(NetError::Tx)
}

fn link_addr_opt(env: &StackEnv, if_nbr: IfNbr, opt_type: u8) -> Option<[u8; 8]> {
    let hw = env.netif.hw_addr(if_nbr)?;
    let mut opt = [0u8; 8];
    opt[0] = opt_type;
    opt[1] = 1;
    opt[2..].copy_from_slice(hw.as_bytes());
    Some(opt)
}

// =============================================================================
// REQUESTS
// =============================================================================

pub(super) fn tx_req(st: &mut StackState, env: &StackEnv, req: &Icmpv6TxReq<'_>) -> NetResult<u16> {
    let res = tx_req_inner(st, env, req);
    match res {
        Ok(_) => {
            st.icmp6.stats.tx_msg += 1;
            st.icmp6.stats.tx_msg_req += 1;
        }
        Err(e) => {
            st.icmp6.stats.tx_err += 1;
            klog_warning("icmp6", &format!("tx {:?} failed: {}", req.typ, e));
        }
    }
    res
}

fn tx_req_inner(st: &mut StackState, env: &StackEnv, req: &Icmpv6TxReq<'_>) -> NetResult<u16> {
    if req.code != 0 {
        return Err(NetError::InvalidType);
    }

    match req.typ {
        MsgType::EchoReq => {
            let dst = req.dst.ok_or(NetError::InvalidArg)?;
            let src = match req.src {
                Some(s) => s,
                None => src_sel(env, req.if_nbr, &dst)?,
            };
            let seq = st.icmp6.tx_seq;
            let mut rest = [0u8; HDR_SIZE_ECHO - 4];
            rest[..2].copy_from_slice(&req.id.to_be_bytes());
            rest[2..].copy_from_slice(&seq.to_be_bytes());
            let msg = TxMsg {
                if_nbr: req.if_nbr,
                src,
                dst,
                typ: MsgType::EchoReq,
                code: 0,
                hdr_rest: &rest,
                payload: Payload::Slice(req.data),
                payload_len: req.data.len(),
                hop_limit: IPV6_HOP_LIM_DFLT,
                single_buf: false,
            };
            tx_msg(st, env, &msg)?;
            st.icmp6.tx_seq = seq.wrapping_add(1);
            Ok(seq)
        }

        MsgType::NeighborSol => {
            let target = req.addr.ok_or(NetError::InvalidArg)?;
            if target.is_multicast() {
                return Err(NetError::InvalidArg);
            }
            let dst = req.dst.unwrap_or_else(|| solicited_node_mcast(&target));
            let src = match req.src {
                Some(s) => s,
                None => src_sel(env, req.if_nbr, &dst)?,
            };
            let mut rest = [0u8; 20];
            rest[4..].copy_from_slice(&target.octets());
            let opt = if src.is_unspecified() {
                None
            } else {
                link_addr_opt(env, req.if_nbr, NDP_OPT_SRC_LINK_ADDR)
            };
            let opt_slice: &[u8] = opt.as_ref().map(|o| &o[..]).unwrap_or(&[]);
            let msg = TxMsg {
                if_nbr: req.if_nbr,
                src,
                dst,
                typ: MsgType::NeighborSol,
                code: 0,
                hdr_rest: &rest,
                payload: Payload::Slice(opt_slice),
                payload_len: opt_slice.len(),
                hop_limit: HOP_LIM_NDP,
                single_buf: true,
            };
            tx_msg(st, env, &msg)?;
            Ok(0)
        }

        MsgType::RouterSol => {
            let dst = req.dst.unwrap_or(IPV6_ALL_ROUTERS);
            let src = req
                .src
                .or_else(|| env.netif.src_addr_sel(req.if_nbr, &dst))
                .unwrap_or(Ipv6Address::UNSPECIFIED);
            let rest = [0u8; 4];
            let opt = if src.is_unspecified() {
                None
            } else {
                link_addr_opt(env, req.if_nbr, NDP_OPT_SRC_LINK_ADDR)
            };
            let opt_slice: &[u8] = opt.as_ref().map(|o| &o[..]).unwrap_or(&[]);
            let msg = TxMsg {
                if_nbr: req.if_nbr,
                src,
                dst,
                typ: MsgType::RouterSol,
                code: 0,
                hdr_rest: &rest,
                payload: Payload::Slice(opt_slice),
                payload_len: opt_slice.len(),
                hop_limit: HOP_LIM_NDP,
                single_buf: true,
            };
            tx_msg(st, env, &msg)?;
            Ok(0)
        }

        MsgType::MldReportV1 | MsgType::MldDone => {
            let group = req.addr.ok_or(NetError::InvalidArg)?;
            if !group.is_multicast() {
                return Err(NetError::InvalidArg);
            }
            let dst = req.dst.unwrap_or(if req.typ == MsgType::MldDone {
                IPV6_ALL_ROUTERS
            } else {
                group
            });
            let src = match req.src {
                Some(s) => s,
                None => src_sel(env, req.if_nbr, &dst)?,
            };
            let mut rest = [0u8; 20];
            rest[4..].copy_from_slice(&group.octets());
            let msg = TxMsg {
                if_nbr: req.if_nbr,
                src,
                dst,
                typ: req.typ,
                code: 0,
                hdr_rest: &rest,
                payload: Payload::Slice(&[]),
                payload_len: 0,
                hop_limit: HOP_LIM_MLD,
                single_buf: true,
            };
            tx_msg(st, env, &msg)?;
            Ok(0)
        }

        MsgType::DestUnreach
        | MsgType::PktTooBig
        | MsgType::TimeExceed
        | MsgType::ParamProb
        | MsgType::EchoReply
        | MsgType::MldQuery
        | MsgType::RouterAdv
        | MsgType::NeighborAdv
        | MsgType::Redirect
        | MsgType::MldReportV2
        | MsgType::Unknown(_) => Err(NetError::InvalidType),
    }
}

// =============================================================================
// REPLIES
// =============================================================================

/// Answer a validated request chain: Echo Request with Echo Reply, Neighbor
/// Solicitation with Neighbor Advertisement. The caller still frees `rx`.
pub(super) fn tx_reply(st: &mut StackState, env: &StackEnv, rx: BufHandle, typ: MsgType) -> NetResult<()> {
    let res = tx_reply_inner(st, env, rx, typ);
    match res {
        Ok(()) => {
            st.icmp6.stats.tx_msg += 1;
            st.icmp6.stats.tx_msg_reply += 1;
        }
        Err(e) => {
            st.icmp6.stats.tx_err += 1;
            klog_warning("icmp6", &format!("reply to {:?} failed: {}", typ, e));
        }
    }
    res
}

fn tx_reply_inner(st: &mut StackState, env: &StackEnv, rx: BufHandle, typ: MsgType) -> NetResult<()> {
    let rx_hdr = *st.bufs.hdr(rx)?;
    let if_nbr = rx_hdr.if_nbr;

    match typ {
        MsgType::EchoReq => {
            let dst = rx_hdr.ip_addr_src;
            let src = if rx_hdr.ip_addr_dst.is_multicast() {
                src_sel(env, if_nbr, &dst)?
            } else {
                rx_hdr.ip_addr_dst
            };
            let mut rest = [0u8; HDR_SIZE_ECHO - 4];
            st.bufs.data_rd(rx, rx_hdr.icmp_msg_ix + 4, &mut rest)?;

            // Truncate rather than fail (RFC 1122 section 3.2.2.6)
            let data_len = rx_hdr.icmp_msg_len.saturating_sub(HDR_SIZE_ECHO);
            let payload_len = data_len.min(IPV6_PAYLOAD_MAX - HDR_SIZE_ECHO);

            let msg = TxMsg {
                if_nbr,
                src,
                dst,
                typ: MsgType::EchoReply,
                code: 0,
                hdr_rest: &rest,
                payload: Payload::Chain(rx),
                payload_len,
                hop_limit: IPV6_HOP_LIM_DFLT,
                single_buf: false,
            };
            tx_msg(st, env, &msg)
        }

        MsgType::NeighborSol => {
            let mut target = [0u8; 16];
            st.bufs.data_rd(rx, rx_hdr.icmp_msg_ix + 8, &mut target)?;
            let target = Ipv6Address::from(target);

            let (flags, dst) = if rx_hdr.ip_addr_src.is_unspecified() {
                (0u32, IPV6_ALL_NODES)
            } else {
                (NA_FLAG_SOLICITED | NA_FLAG_OVERRIDE, rx_hdr.ip_addr_src)
            };
            let mut rest = [0u8; 20];
            rest[..4].copy_from_slice(&flags.to_be_bytes());
            rest[4..].copy_from_slice(&target.octets());
            let opt = link_addr_opt(env, if_nbr, NDP_OPT_TARGET_LINK_ADDR);
            let opt_slice: &[u8] = opt.as_ref().map(|o| &o[..]).unwrap_or(&[]);

            let msg = TxMsg {
                if_nbr,
                src: target,
                dst,
                typ: MsgType::NeighborAdv,
                code: 0,
                hdr_rest: &rest,
                payload: Payload::Slice(opt_slice),
                payload_len: opt_slice.len(),
                hop_limit: HOP_LIM_NDP,
                single_buf: true,
            };
            tx_msg(st, env, &msg)
        }

        _ => Err(NetError::InvalidType),
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Outcome of an error transmit that did not fail.
enum ErrTx {
    Sent,
    /// Generation rules forbid answering this packet
    Suppressed,
}

pub(super) fn tx_error(st: &mut StackState, env: &StackEnv, offending: BufHandle, err: Icmpv6ErrMsg) -> NetResult<()> {
    match tx_error_inner(st, env, offending, err) {
        Ok(ErrTx::Sent) => {
            st.icmp6.stats.tx_msg += 1;
            st.icmp6.stats.tx_msg_err += 1;
            Ok(())
        }
        Ok(ErrTx::Suppressed) => {
            st.icmp6.stats.tx_err_suppressed += 1;
            klog_debug("icmp6", &format!("error {:?} suppressed", err));
            Err(NetError::Tx)
        }
        Err(e) => {
            st.icmp6.stats.tx_err += 1;
            klog_warning("icmp6", &format!("error {:?} tx failed: {}", err, e));
            Err(e)
        }
    }
}

fn tx_error_inner(st: &mut StackState, env: &StackEnv, offending: BufHandle, err: Icmpv6ErrMsg) -> NetResult<ErrTx> {
    let off = *st.bufs.hdr(offending)?;

    let rx_mcast = off
        .flags
        .intersects(BufFlags::RX_BROADCAST | BufFlags::RX_MULTICAST)
        || off.ip_addr_dst.is_multicast();
    if rx_mcast && !err.mcast_exempt() {
        return Ok(ErrTx::Suppressed);
    }
    // Non-initial fragment
    if off.ip_frag_offset != 0 {
        return Ok(ErrTx::Suppressed);
    }
    // Never answer an error with an error
    if off.ip_next_hdr == IpProtocol::Icmpv6 {
        let mut t = [0u8; 1];
        st.bufs.data_rd(offending, off.icmp_msg_ix, &mut t)?;
        if MsgType::from(t[0]).is_err() {
            return Ok(ErrTx::Suppressed);
        }
    }
    if off.ip_addr_src.is_unspecified() || off.ip_addr_src.is_multicast() {
        return Ok(ErrTx::Suppressed);
    }

    let dst = off.ip_addr_src;
    let src = if off.ip_addr_dst.is_multicast() {
        src_sel(env, off.if_nbr, &dst)?
    } else {
        off.ip_addr_dst
    };

    // As much of the invoking packet as fits the minimum MTU
    let cap = IPV6_MTU_MIN - IPV6_HDR_SIZE - HDR_SIZE_ERR;
    let avail = st.bufs.size(offending)?.saturating_sub(off.ip_hdr_ix);
    let len = (off.ip_hdr_len + off.ip_tot_len).min(cap).min(avail);
    let mut excerpt: Vec<u8> = vec![0u8; len];
    st.bufs.data_rd(offending, off.ip_hdr_ix, &mut excerpt)?;

    let (typ, code) = err.type_code();
    let rest = err.word().to_be_bytes();
    let msg = TxMsg {
        if_nbr: off.if_nbr,
        src,
        dst,
        typ,
        code,
        hdr_rest: &rest,
        payload: Payload::Slice(&excerpt),
        payload_len: len,
        hop_limit: IPV6_HOP_LIM_DFLT,
        single_buf: false,
    };
    tx_msg(st, env, &msg).map(|_| ErrTx::Sent)
}
