//! Session identifiers
//!
//! The broker derives a 64-bit id for every accepted socket from public
//! connection metadata: `(port << 16) | (slot << 8) | last IPv4 octet`. The
//! client echoes it on every header it sends afterwards. It is a correlation
//! token for liveness bookkeeping, not a credential.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(ip: Ipv4Addr, port: u16, slot: u8) -> Self {
        let low_octet = u64::from(ip.octets()[3]);
        SessionId((u64::from(port) << 16) | (u64::from(slot) << 8) | low_octet)
    }

    pub fn from_peer(peer: SocketAddr, slot: u8) -> Self {
        let ip = match peer.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        Self::new(ip, peer.port(), slot)
    }

    pub fn slot(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    /// Weak ownership check: only the slot byte is compared.
    pub fn matches(&self, slot: u8) -> bool {
        self.slot() == slot
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
