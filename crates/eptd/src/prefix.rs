//! Address and prefix parsing for subnet checks
//!
//! Strings such as `10.0.0.5`, `10.0.0.1/24` or `2001:db8::1/64` are parsed
//! into an integer address and an integer mask. Without a `/n` suffix the
//! host mask is used (/32 or /128). Malformed input yields `None`, which
//! callers must treat fail-open.

use std::net::IpAddr;

/// Parsed address with its mask, both widened to 128 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub addr: u128,
    pub mask: u128,
    pub v6: bool,
}

impl Prefix {
    /// Parse a dotted or colon address with optional prefix length
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (ip_part, len_part) = match s.split_once('/') {
            Some((ip, len)) => (ip, Some(len)),
            None => (s, None),
        };
        let ip: IpAddr = ip_part.parse().ok()?;
        let (addr, width, v6) = match ip {
            IpAddr::V4(v4) => (u32::from(v4) as u128, 32u32, false),
            IpAddr::V6(v6) => (u128::from(v6), 128u32, true),
        };
        let len = match len_part {
            Some(len) => len.parse::<u32>().ok().filter(|l| *l <= width)?,
            None => width,
        };
        Some(Self {
            addr,
            mask: mask_for(len, width),
            v6,
        })
    }

    /// Network address (address bits under the mask)
    pub fn network(&self) -> u128 {
        self.addr & self.mask
    }

    /// True if `addr` falls inside this prefix
    pub fn contains(&self, addr: &Prefix) -> bool {
        self.v6 == addr.v6 && (addr.addr & self.mask) == self.network()
    }
}

fn mask_for(len: u32, width: u32) -> u128 {
    if len == 0 {
        return 0;
    }
    let full: u128 = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
    let host_bits = width - len;
    if host_bits == 0 {
        full
    } else {
        full & !((1u128 << host_bits) - 1)
    }
}
