//! Network utility functions.
//!
//! Helpers for IP address literal parsing and formatting.

use core::str::FromStr;

use smoltcp::wire::{IpAddress, Ipv4Address, Ipv6Address};

/// Parse a dotted-quad IPv4 address from bytes
pub fn parse_ipv4(s: &[u8]) -> Option<Ipv4Address> {
    let mut octets = [0u8; 4];
    let mut octet_idx = 0;
    let mut current = 0u16;
    let mut has_digit = false;

    for &b in s {
        if b.is_ascii_digit() {
            current = current * 10 + (b - b'0') as u16;
            has_digit = true;
            if current > 255 {
                return None;
            }
        } else if b == b'.' {
            if !has_digit || octet_idx >= 3 {
                return None;
            }
            octets[octet_idx] = current as u8;
            octet_idx += 1;
            current = 0;
            has_digit = false;
        } else {
            return None;
        }
    }

    if !has_digit || octet_idx != 3 {
        return None;
    }
    octets[3] = current as u8;

    Some(Ipv4Address::new(octets[0], octets[1], octets[2], octets[3]))
}

/// Parse an IPv6 address literal (RFC 4291 text forms)
pub fn parse_ipv6(s: &str) -> Option<Ipv6Address> {
    if !s.contains(':') {
        return None;
    }
    Ipv6Address::from_str(s).ok()
}

/// Parse a host string that is already an IP literal.
pub fn parse_ip_literal(s: &str) -> Option<IpAddress> {
    if let Some(v4) = parse_ipv4(s.as_bytes()) {
        return Some(IpAddress::Ipv4(v4));
    }
    parse_ipv6(s).map(IpAddress::Ipv6)
}

/// Format an IPv4 address to a buffer. Returns bytes written.
pub fn format_ipv4(addr: Ipv4Address, buf: &mut [u8]) -> usize {
    let octets = addr.octets();
    let mut pos = 0;

    for (i, &octet) in octets.iter().enumerate() {
        if octet >= 100 {
            buf[pos] = b'0' + (octet / 100);
            pos += 1;
        }
        if octet >= 10 {
            buf[pos] = b'0' + ((octet / 10) % 10);
            pos += 1;
        }
        buf[pos] = b'0' + (octet % 10);
        pos += 1;

        if i < 3 {
            buf[pos] = b'.';
            pos += 1;
        }
    }

    pos
}
