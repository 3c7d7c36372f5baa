//! DNS query building and response parsing (RFC 1035, RFC 3596).

use alloc::vec::Vec;

use smoltcp::wire::{IpAddress, Ipv4Address, Ipv6Address};

/// DNS class for Internet
const DNS_CLASS_IN: u16 = 1;

/// DNS header flags
const DNS_FLAG_RD: u16 = 0x0100; // Recursion Desired
const DNS_FLAG_QR: u16 = 0x8000; // Query/Response (1 = response)

/// DNS response codes
const DNS_RCODE_MASK: u16 = 0x000F;
const DNS_RCODE_NXDOMAIN: u16 = 3;

pub const DNS_HDR_SIZE: usize = 12;
/// Largest response accepted over UDP
pub const DNS_MSG_SIZE_MAX: usize = 512;

/// Record type asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QType {
    A,
    Aaaa,
}

impl QType {
    fn code(self) -> u16 {
        match self {
            QType::A => 1,
            QType::Aaaa => 28,
        }
    }

    fn rdata_len(self) -> usize {
        match self {
            QType::A => 4,
            QType::Aaaa => 16,
        }
    }
}

/// Build a DNS query packet for `hostname`.
pub fn build_query(txid: u16, hostname: &[u8], qtype: QType) -> Vec<u8> {
    let mut packet = Vec::with_capacity(DNS_HDR_SIZE + hostname.len() + 2 + 4);

    // Header
    packet.extend_from_slice(&txid.to_be_bytes());
    packet.extend_from_slice(&DNS_FLAG_RD.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    // Question
    encode_domain_name(hostname, &mut packet);
    packet.extend_from_slice(&qtype.code().to_be_bytes());
    packet.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());

    packet
}

/// Longest label (RFC 1035 2.3.4)
pub const LABEL_LEN_MAX: usize = 63;
/// Longest name in dotted form, without a trailing dot
pub const NAME_LEN_MAX: usize = 253;

/// Check that `name` encodes as a query name unchanged: no empty labels
/// (one trailing dot is allowed) and no label longer than 63 bytes.
pub fn name_is_valid(name: &[u8]) -> bool {
    let name = name.strip_suffix(b".").unwrap_or(name);
    !name.is_empty()
        && name.len() <= NAME_LEN_MAX
        && name
            .split(|&b| b == b'.')
            .all(|l| !l.is_empty() && l.len() <= LABEL_LEN_MAX)
}

/// Encode a domain name in DNS format (label length prefix format)
/// e.g., "www.google.com" -> [3]www[6]google[3]com[0]
fn encode_domain_name(hostname: &[u8], packet: &mut Vec<u8>) {
    let mut label_start = 0;

    for i in 0..=hostname.len() {
        if i == hostname.len() || hostname[i] == b'.' {
            let label_len = i - label_start;
            if label_len > 0 && label_len <= 63 {
                packet.push(label_len as u8);
                packet.extend_from_slice(&hostname[label_start..i]);
            }
            label_start = i + 1;
        }
    }

    packet.push(0);
}

/// DNS response parsing result
#[derive(Debug, PartialEq, Eq)]
pub enum DnsResult {
    /// One or more addresses of the requested type
    Resolved(Vec<IpAddress>),
    /// Domain does not exist (NXDOMAIN)
    NotFound,
    /// Name exists but has no record of the requested type
    NoRecords,
    /// Server error or malformed response
    Error(&'static str),
    /// Response for another transaction
    WrongId,
}

/// Parse a DNS response packet
pub fn parse_response(packet: &[u8], expected_txid: u16, qtype: QType) -> DnsResult {
    if packet.len() < DNS_HDR_SIZE {
        return DnsResult::Error("Packet too short");
    }

    let txid = u16::from_be_bytes([packet[0], packet[1]]);
    if txid != expected_txid {
        return DnsResult::WrongId;
    }

    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & DNS_FLAG_QR == 0 {
        return DnsResult::Error("Not a response");
    }

    let rcode = flags & DNS_RCODE_MASK;
    if rcode == DNS_RCODE_NXDOMAIN {
        return DnsResult::NotFound;
    }
    if rcode != 0 {
        return DnsResult::Error("DNS server error");
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;
    if ancount == 0 {
        return DnsResult::NoRecords;
    }

    let mut pos = DNS_HDR_SIZE;

    for _ in 0..qdcount {
        pos = match skip_name(packet, pos) {
            Ok(p) => p,
            Err(e) => return e,
        };
        // QTYPE and QCLASS
        pos += 4;
        if pos > packet.len() {
            return DnsResult::Error("Truncated question");
        }
    }

    let mut addresses = Vec::new();

    for _ in 0..ancount {
        if pos >= packet.len() {
            break;
        }

        pos = match skip_name(packet, pos) {
            Ok(p) => p,
            Err(e) => return e,
        };

        // TYPE, CLASS, TTL, RDLENGTH
        if pos + 10 > packet.len() {
            return DnsResult::Error("Truncated answer");
        }

        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;

        if pos + rdlength > packet.len() {
            return DnsResult::Error("Truncated RDATA");
        }

        if rtype == qtype.code() && rclass == DNS_CLASS_IN && rdlength == qtype.rdata_len() {
            let rdata = &packet[pos..pos + rdlength];
            let addr = match qtype {
                QType::A => IpAddress::Ipv4(Ipv4Address::new(rdata[0], rdata[1], rdata[2], rdata[3])),
                QType::Aaaa => {
                    let mut o = [0u8; 16];
                    o.copy_from_slice(rdata);
                    IpAddress::Ipv6(Ipv6Address::from(o))
                }
            };
            addresses.push(addr);
        }

        pos += rdlength;
    }

    if addresses.is_empty() {
        DnsResult::NoRecords
    } else {
        DnsResult::Resolved(addresses)
    }
}

/// Skip a DNS name (handles compression pointers)
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, DnsResult> {
    loop {
        if pos >= packet.len() {
            return Err(DnsResult::Error("Name extends past packet"));
        }

        let len = packet[pos];

        if len == 0 {
            return Ok(pos + 1);
        }

        if len & 0xC0 == 0xC0 {
            // Compression pointer (2 bytes)
            return Ok(pos + 2);
        }

        pos += 1 + (len as usize);

        if pos > packet.len() {
            return Err(DnsResult::Error("Label extends past packet"));
        }
    }
}

/// Build a response to `query` carrying `addrs`. Used by test servers.
#[cfg(test)]
pub fn build_response(query: &[u8], rcode: u16, addrs: &[IpAddress]) -> Vec<u8> {
    let mut r = Vec::from(query);
    let flags = DNS_FLAG_QR | DNS_FLAG_RD | rcode;
    r[2..4].copy_from_slice(&flags.to_be_bytes());
    r[6..8].copy_from_slice(&(addrs.len() as u16).to_be_bytes());
    for a in addrs {
        r.extend_from_slice(&[0xC0, 0x0C]);
        let (t, data): (u16, Vec<u8>) = match a {
            IpAddress::Ipv4(v4) => (1, v4.octets().to_vec()),
            IpAddress::Ipv6(v6) => (28, v6.octets().to_vec()),
        };
        r.extend_from_slice(&t.to_be_bytes());
        r.extend_from_slice(&DNS_CLASS_IN.to_be_bytes());
        r.extend_from_slice(&300u32.to_be_bytes());
        r.extend_from_slice(&(data.len() as u16).to_be_bytes());
        r.extend_from_slice(&data);
    }
    r
}

/// Transaction id of a query or response.
pub fn txid_of(packet: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*packet.first()?, *packet.get(1)?]))
}

/// Record type asked for by a query built with `build_query`.
pub fn qtype_of(query: &[u8]) -> Option<QType> {
    let end = skip_name(query, DNS_HDR_SIZE).ok()?;
    let code = u16::from_be_bytes([*query.get(end)?, *query.get(end + 1)?]);
    match code {
        1 => Some(QType::A),
        28 => Some(QType::Aaaa),
        _ => None,
    }
}
