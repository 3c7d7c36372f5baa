//! IPv6 layer collaborators.
//!
//! The IP transmit/fragmentation primitive and the interface table live
//! outside this crate; the stack reaches them through these traits.

use alloc::vec::Vec;

use smoltcp::wire::{EthernetAddress, IpProtocol, Ipv6Address};

use super::buf::{BufHandle, BufPool};
use super::IfNbr;
use crate::config::{IPV6_FLOW_LABEL_DFLT, IPV6_HOP_LIM_DFLT, IPV6_TRAFFIC_CLASS_DFLT};
use crate::error::NetResult;

/// All-nodes link-local multicast (ff02::1)
pub const IPV6_ALL_NODES: Ipv6Address = Ipv6Address::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
/// All-routers link-local multicast (ff02::2)
pub const IPV6_ALL_ROUTERS: Ipv6Address = Ipv6Address::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Extension headers the transmit primitive is asked to insert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ipv6ExtHdrs {
    pub frag: bool,
}

/// Parameters of one `Ipv6Tx::tx` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv6TxParams {
    pub src: Ipv6Address,
    pub dst: Ipv6Address,
    pub next_hdr: IpProtocol,
    pub ext: Ipv6ExtHdrs,
    pub traffic_class: u8,
    pub flow_label: u32,
    pub hop_limit: u8,
}

impl Ipv6TxParams {
    pub fn new(src: Ipv6Address, dst: Ipv6Address, next_hdr: IpProtocol) -> Self {
        Self {
            src,
            dst,
            next_hdr,
            ext: Ipv6ExtHdrs::default(),
            traffic_class: IPV6_TRAFFIC_CLASS_DFLT,
            flow_label: IPV6_FLOW_LABEL_DFLT,
            hop_limit: IPV6_HOP_LIM_DFLT,
        }
    }
}

/// IPv6 transmit primitive.
///
/// On `Ok` the chain belongs to the IP layer, which frees it once sent.
/// On `Err` the caller still owns it.
pub trait Ipv6Tx: Send + Sync {
    fn tx(&self, pool: &mut BufPool, chain: BufHandle, params: &Ipv6TxParams) -> NetResult<()>;
}

/// Interface table queries.
pub trait NetIf: Send + Sync {
    /// Interfaces in selection order.
    fn if_list(&self) -> Vec<IfNbr>;

    fn is_link_up(&self, if_nbr: IfNbr) -> bool;

    /// Payload bytes an IP datagram of `proto` may carry on `if_nbr` before
    /// it must be fragmented.
    fn mtu_protocol(&self, if_nbr: IfNbr, proto: IpProtocol) -> NetResult<usize>;

    /// Link-layer header length placed before the IP header.
    fn link_hdr_len(&self, if_nbr: IfNbr) -> usize;

    fn hw_addr(&self, if_nbr: IfNbr) -> Option<EthernetAddress>;

    /// Source address to use when sending to `dst`.
    fn src_addr_sel(&self, if_nbr: IfNbr, dst: &Ipv6Address) -> Option<Ipv6Address>;
}

/// Solicited-node multicast group for `target` (RFC 4291 section 2.7.1).
pub fn solicited_node_mcast(target: &Ipv6Address) -> Ipv6Address {
    let t = target.octets();
    let mut o = [0u8; 16];
    o[0] = 0xff;
    o[1] = 0x02;
    o[11] = 0x01;
    o[12] = 0xff;
    o[13..].copy_from_slice(&t[13..]);
    Ipv6Address::from(o)
}
