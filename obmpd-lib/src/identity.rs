//! Router and peer identity, and the 16-byte hash ids derived from them.
//!
//! Hash ids are stable MD5 digests: the router hash keys every bus record
//! for that session (so brokers partitioning by key preserve per-router
//! order), the collector hash stamps every envelope, and the peer hash
//! binds a peer to its router inside the envelope.

use crate::frame::PerPeerHeader;
use std::net::IpAddr;

pub const HASH_LEN: usize = 16;

/// Identity of one connected router, fixed for the life of the session.
#[derive(Debug, Clone)]
pub struct RouterIdentity {
    pub addr: IpAddr,
    pub port: u16,
    /// Reverse-resolved name, or the IP literal when resolution failed.
    pub hostname: String,
    pub group: String,
    pub hash: [u8; HASH_LEN],
}

impl RouterIdentity {
    pub fn new(addr: IpAddr, port: u16, hostname: String, group: String) -> Self {
        RouterIdentity {
            addr,
            port,
            hostname,
            group,
            hash: router_hash(addr),
        }
    }
}

/// Identity of one peer as reported in per-peer headers, cached per worker
/// under `(peer_ip, peer_asn)`.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub addr: IpAddr,
    pub asn: u32,
    pub distinguisher: u64,
    /// Raw flags byte from the per-peer header.
    pub flags: u8,
    pub hash: [u8; HASH_LEN],
}

impl PeerIdentity {
    pub fn from_header(router_hash: &[u8; HASH_LEN], hdr: &PerPeerHeader) -> Self {
        PeerIdentity {
            addr: hdr.addr,
            asn: hdr.asn,
            distinguisher: hdr.distinguisher,
            flags: hdr.flags.bits(),
            hash: peer_hash(hdr.addr, hdr.distinguisher, router_hash),
        }
    }
}

/// The canonical router identity string is the source IP literal: stable
/// across reconnects and hostname changes.
pub fn router_hash(addr: IpAddr) -> [u8; HASH_LEN] {
    md5::compute(addr.to_string().as_bytes()).0
}

pub fn collector_hash(name: &str) -> [u8; HASH_LEN] {
    md5::compute(name.as_bytes()).0
}

/// Peer hash binds `(peer_ip, peer_rd)` to the owning router's hash.
pub fn peer_hash(addr: IpAddr, distinguisher: u64, router_hash: &[u8; HASH_LEN]) -> [u8; HASH_LEN] {
    let mut ctx = md5::Context::new();
    ctx.consume(addr.to_string().as_bytes());
    ctx.consume(b":");
    ctx.consume(distinguisher.to_be_bytes());
    ctx.consume(b":");
    ctx.consume(router_hash);
    ctx.compute().0
}

/// 16-byte wire form of an address: IPv6 verbatim, IPv4 right-justified in
/// the low 4 bytes.
pub fn ip_bytes(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => {
            let mut out = [0u8; 16];
            out[12..16].copy_from_slice(&v4.octets());
            out
        }
        IpAddr::V6(v6) => v6.octets(),
    }
}
