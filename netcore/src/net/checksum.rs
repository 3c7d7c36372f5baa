//! Internet checksum (RFC 1071) over flat slices and buffer chains.

use smoltcp::wire::{IpProtocol, Ipv6Address};

use super::buf::{BufHandle, BufPool};
use crate::error::NetResult;

/// Running one's-complement sum. Tracks odd byte alignment so a message
/// split across several slices sums the same as if it were contiguous.
#[derive(Clone, Copy, Debug, Default)]
pub struct Accum {
    sum: u32,
    odd: bool,
}

impl Accum {
    pub const fn new() -> Self {
        Self { sum: 0, odd: false }
    }

    pub fn add(&mut self, data: &[u8]) {
        let mut data = data;
        if self.odd {
            if let Some((&b, rest)) = data.split_first() {
                self.sum += b as u32;
                self.odd = false;
                data = rest;
            }
        }
        let mut i = 0;
        while i + 1 < data.len() {
            self.sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
            i += 2;
        }
        if i < data.len() {
            self.sum += (data[i] as u32) << 8;
            self.odd = true;
        }
        self.fold();
    }

    pub fn add_u16(&mut self, v: u16) {
        self.add(&v.to_be_bytes());
    }

    pub fn add_u32(&mut self, v: u32) {
        self.add(&v.to_be_bytes());
    }

    fn fold(&mut self) {
        while self.sum > 0xFFFF {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
    }

    /// Complemented result ready to store in a header.
    pub fn finish(mut self) -> u16 {
        self.fold();
        !(self.sum as u16)
    }
}

/// Checksum of a flat slice.
pub fn checksum(data: &[u8]) -> u16 {
    let mut acc = Accum::new();
    acc.add(data);
    acc.finish()
}

/// Sum the IPv6 pseudo-header (RFC 8200 section 8.1).
pub fn pseudo_hdr_v6(acc: &mut Accum, src: &Ipv6Address, dst: &Ipv6Address, upper_len: u32, next_hdr: IpProtocol) {
    acc.add(&src.octets());
    acc.add(&dst.octets());
    acc.add_u32(upper_len);
    acc.add_u32(u8::from(next_hdr) as u32);
}

/// Sum region `[icmp_msg_ix, icmp_msg_ix + icmp_hdr_len + data_len)` of
/// every link in a chain.
pub fn chain_sum(pool: &BufPool, head: BufHandle, acc: &mut Accum) -> NetResult<()> {
    for h in pool.chain_iter(head) {
        let hdr = pool.hdr(h)?;
        let start = hdr.icmp_msg_ix;
        let end = start + hdr.icmp_hdr_len + hdr.data_len;
        let data = pool.data(h)?;
        let region = data.get(start..end).ok_or(crate::error::NetError::WouldOverflow)?;
        acc.add(region);
    }
    Ok(())
}
