//! ICMPv6 receive: validate, demux, free.
//!
//! Chains arrive from the IPv6 layer with, on every link, `icmp_msg_ix`
//! and `data_ix` at the first ICMPv6 byte of that link, `data_len` the
//! ICMPv6 bytes in the link, `icmp_hdr_len` zero and `ip_datagram_len` the
//! whole message length.

use alloc::format;

use smoltcp::wire::IpProtocol;

use super::tx;
use super::{MsgClass, MsgType, NdpVerdict};
use crate::error::{NetError, NetResult};
use crate::klog::klog_debug;
use crate::net::buf::{BufFlags, BufHandle};
use crate::net::checksum::{self, Accum};
use crate::net::stack::{StackEnv, StackState};

/// Receive entry point. `head` is freed exactly once on every path.
pub(super) fn rx(st: &mut StackState, env: &StackEnv, head: BufHandle) {
    st.icmp6.stats.rx_msg += 1;

    let res = validate(st, head).and_then(|typ| demux(st, env, head, typ));
    match res {
        Ok(()) => st.icmp6.stats.rx_msg_compl += 1,
        Err(e) => {
            st.icmp6.stats.rx_err_discard += 1;
            klog_debug("icmp6", &format!("rx discard: {}", e));
        }
    }

    st.bufs.free_chain(head);
}

/// Validate header, length and checksum, then fix up per-link lengths.
pub(super) fn validate(st: &mut StackState, head: BufHandle) -> NetResult<MsgType> {
    let stats = &mut st.icmp6.stats;
    let pool = &mut st.bufs;

    let hdr = *pool.hdr(head)?;
    let msg_ix = hdr.icmp_msg_ix;

    let mut fixed = [0u8; 8];
    let avail = hdr.data_len.min(fixed.len());
    if avail < 4 {
        stats.rx_err_len += 1;
        return Err(NetError::ProtocolViolation);
    }
    pool.data_rd(head, msg_ix, &mut fixed[..avail])?;
    let typ = MsgType::from(fixed[0]);
    let code = fixed[1];

    // Multicast destination
    let rx_mcast = hdr.flags.contains(BufFlags::RX_MULTICAST) || hdr.ip_addr_dst.is_multicast();
    if rx_mcast && !typ.mcast_allowed() {
        stats.rx_err_mcast += 1;
        return Err(NetError::ProtocolViolation);
    }

    // Type and code
    let code_ok = match typ {
        MsgType::DestUnreach => code <= 6,
        MsgType::TimeExceed => code <= 1,
        MsgType::ParamProb => code <= 2,
        MsgType::PktTooBig
        | MsgType::EchoReq
        | MsgType::EchoReply
        | MsgType::NeighborSol
        | MsgType::NeighborAdv
        | MsgType::RouterAdv
        | MsgType::Redirect => code == 0,
        MsgType::MldQuery | MsgType::MldReportV1 => true,
        MsgType::RouterSol | MsgType::MldDone | MsgType::MldReportV2 | MsgType::Unknown(_) => {
            stats.rx_err_type += 1;
            return Err(NetError::InvalidType);
        }
    };
    if !code_ok {
        stats.rx_err_code += 1;
        return Err(NetError::InvalidType);
    }

    // Length
    let msg_len = hdr.ip_datagram_len;
    let hdr_len = typ.hdr_len();
    let chain_len: usize = pool
        .chain_iter(head)
        .map(|h| pool.hdr(h).map(|b| b.data_len).unwrap_or(0))
        .sum();
    if msg_len < typ.msg_len_min() || msg_len > typ.msg_len_max() || chain_len != msg_len || hdr.data_len < hdr_len {
        stats.rx_err_len += 1;
        return Err(NetError::ProtocolViolation);
    }
    if typ == MsgType::ParamProb {
        let ptr = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]) as usize;
        if ptr >= msg_len - hdr_len {
            stats.rx_err_ptr += 1;
            return Err(NetError::ProtocolViolation);
        }
    }

    // Checksum over pseudo-header and the whole chain
    let mut acc = Accum::new();
    checksum::pseudo_hdr_v6(&mut acc, &hdr.ip_addr_src, &hdr.ip_addr_dst, msg_len as u32, IpProtocol::Icmpv6);
    checksum::chain_sum(pool, head, &mut acc)?;
    if acc.finish() != 0 {
        stats.rx_err_chk += 1;
        return Err(NetError::ProtocolViolation);
    }

    // Per-link bookkeeping
    let links: alloc::vec::Vec<BufHandle> = pool.chain_iter(head).collect();
    for (i, h) in links.into_iter().enumerate() {
        let b = pool.hdr_mut(h)?;
        b.icmp_msg_len = msg_len;
        if typ.is_err() {
            b.icmp_hdr_len = if i == 0 { hdr_len } else { 0 };
            b.data_ix = 0;
            b.data_len = 0;
        } else if i == 0 {
            b.icmp_hdr_len = hdr_len;
            b.data_ix = b.icmp_msg_ix + hdr_len;
            b.data_len -= hdr_len;
        } else {
            b.icmp_hdr_len = 0;
            b.data_ix = b.icmp_msg_ix;
        }
    }

    Ok(typ)
}

fn demux(st: &mut StackState, env: &StackEnv, head: BufHandle, typ: MsgType) -> NetResult<()> {
    match typ.class() {
        MsgClass::Req => {
            st.icmp6.stats.rx_msg_req += 1;
            tx::tx_reply(st, env, head, typ)
        }
        MsgClass::Reply => {
            st.icmp6.stats.rx_msg_reply += 1;
            env.icmp6_upper.echo_reply(&st.bufs, head).map_err(|e| {
                st.icmp6.stats.rx_err_echo_reply += 1;
                e
            })
        }
        MsgClass::Ndp => {
            st.icmp6.stats.rx_msg_ndp += 1;
            match env.icmp6_upper.ndp_rx(&st.bufs, head, typ)? {
                NdpVerdict::Consumed => Ok(()),
                NdpVerdict::SendAdvert if typ == MsgType::NeighborSol => tx::tx_reply(st, env, head, typ),
                NdpVerdict::SendAdvert => Err(NetError::InvalidType),
            }
        }
        MsgClass::Mldp => {
            st.icmp6.stats.rx_msg_mldp += 1;
            env.icmp6_upper.mldp_rx(&st.bufs, head, typ)
        }
        MsgClass::Err => {
            st.icmp6.stats.rx_msg_err += 1;
            Ok(())
        }
        MsgClass::Unknown => {
            st.icmp6.stats.rx_msg_unknown += 1;
            Err(NetError::InvalidType)
        }
    }
}
