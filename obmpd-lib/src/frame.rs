//! BMP framing and classification.
//!
//! The framer looks at a contiguous byte window and answers one question:
//! where does the next BMP message end, and who is it about? It decodes the
//! common header, the per-peer header and the type discriminator, nothing
//! else. The message payload is opaque and forwarded verbatim.

pub mod legacy;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// BMP v3 common header: version, 4-byte length, type.
pub const COMMON_HDR_LEN: usize = 6;
/// RFC 7854 per-peer header, present for message types 0-3.
pub const PER_PEER_HDR_LEN: usize = 42;
/// Smallest valid length for a message carrying a per-peer header.
pub const PEERED_MSG_MIN_LEN: usize = COMMON_HDR_LEN + PER_PEER_HDR_LEN;

/// BMP message types, RFC 7854 section 4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BmpMsgType {
    RouteMonitoring = 0,
    StatisticsReport = 1,
    PeerDownNotification = 2,
    PeerUpNotification = 3,
    InitiationMessage = 4,
    TerminationMessage = 5,
    RouteMirroringMessage = 6,
}

impl BmpMsgType {
    /// Types that carry a per-peer header.
    pub fn has_peer_header(self) -> bool {
        matches!(
            self,
            BmpMsgType::RouteMonitoring
                | BmpMsgType::StatisticsReport
                | BmpMsgType::PeerDownNotification
                | BmpMsgType::PeerUpNotification
        )
    }
}

bitflags! {
    /// Per-peer header flags (RFC 7854 section 4.2, RFC 8671 section 4).
    ///
    /// ```text
    ///  0 1 2 3 4 5 6 7
    /// +-+-+-+-+-+-+-+-+
    /// |V|L|A|O| Resv  |
    /// +-+-+-+-+-+-+-+-+
    /// ```
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PeerFlags: u8 {
        const ADDRESS_FAMILY_IPV6 = 0b1000_0000;
        const IS_POST_POLICY = 0b0100_0000;
        const AS_SIZE_16BIT = 0b0010_0000;
        const IS_ADJ_RIB_OUT = 0b0001_0000;
    }
}

impl PeerFlags {
    pub const fn is_ipv6(&self) -> bool {
        self.contains(PeerFlags::ADDRESS_FAMILY_IPV6)
    }

    pub const fn is_post_policy(&self) -> bool {
        self.contains(PeerFlags::IS_POST_POLICY)
    }

    pub const fn is_adj_rib_out(&self) -> bool {
        self.contains(PeerFlags::IS_ADJ_RIB_OUT)
    }
}

/// Peer type byte of the per-peer header (RFC 7854, RFC 9069).
pub const PEER_TYPE_LOC_RIB: u8 = 3;

/// Decoded per-peer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerPeerHeader {
    pub peer_type: u8,
    pub flags: PeerFlags,
    pub distinguisher: u64,
    pub addr: IpAddr,
    pub asn: u32,
    pub bgp_id: Ipv4Addr,
    pub ts_sec: u32,
    pub ts_usec: u32,
}

/// One framed BMP message: its total length in the window plus the decoded
/// identity needed for topic routing and the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMeta {
    /// Total bytes of the message, headers included.
    pub len: usize,
    pub version: u8,
    /// Raw type byte; reserved/unknown v3 types are still framed.
    pub msg_type: u8,
    pub kind: Option<BmpMsgType>,
    pub peer: Option<PerPeerHeader>,
}

/// Framing failures. `skippable()` tells the worker whether the consumed
/// length is known (skip and continue) or unknown (stop the session).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameInvalid {
    #[error("unsupported BMP version {0}")]
    UnsupportedVersion(u8),
    #[error("declared length {declared} shorter than the common header")]
    ShortLength { declared: u32 },
    #[error("message type {msg_type} declares {declared} bytes, per-peer header needs {PEERED_MSG_MIN_LEN}")]
    TruncatedPeerHeader { msg_type: u8, declared: u32 },
    #[error("legacy message type {0} cannot be framed")]
    LegacyUnsupportedType(u8),
    #[error("legacy route monitoring with implausible BGP length {0}")]
    LegacyBadBgpLength(u16),
    #[error("legacy stats report with implausible counter count {0}")]
    LegacyBadStatsCount(u32),
    #[error("legacy peer down with unknown reason {0}")]
    LegacyBadReason(u8),
}

impl FrameInvalid {
    /// Bytes to discard to resynchronize, when the wire told us the length.
    pub fn skippable(&self) -> Option<usize> {
        match self {
            FrameInvalid::TruncatedPeerHeader { declared, .. } => Some(*declared as usize),
            _ => None,
        }
    }
}

/// Outcome of one framing attempt over the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Complete(FrameMeta),
    /// Not enough bytes yet; `need` is the total window length required to
    /// make progress (not necessarily the full message length for legacy
    /// messages framed in stages).
    Partial { need: usize },
    Invalid(FrameInvalid),
}

/// Frames the next BMP message at the start of `window`.
pub fn parse(window: &[u8]) -> Outcome {
    if window.is_empty() {
        return Outcome::Partial {
            need: COMMON_HDR_LEN,
        };
    }
    match window[0] {
        3 => parse_v3(window),
        1 | 2 => legacy::parse(window),
        v => Outcome::Invalid(FrameInvalid::UnsupportedVersion(v)),
    }
}

fn parse_v3(window: &[u8]) -> Outcome {
    if window.len() < COMMON_HDR_LEN {
        return Outcome::Partial {
            need: COMMON_HDR_LEN,
        };
    }
    let declared = u32::from_be_bytes(window[1..5].try_into().unwrap());
    if (declared as usize) < COMMON_HDR_LEN {
        return Outcome::Invalid(FrameInvalid::ShortLength { declared });
    }
    let msg_type = window[5];
    let kind = BmpMsgType::try_from(msg_type).ok();
    let peered = kind.is_some_and(BmpMsgType::has_peer_header);
    if peered && (declared as usize) < PEERED_MSG_MIN_LEN {
        return Outcome::Invalid(FrameInvalid::TruncatedPeerHeader { msg_type, declared });
    }
    let len = declared as usize;
    if window.len() < len {
        return Outcome::Partial { need: len };
    }
    let peer = peered.then(|| parse_per_peer_header(&window[COMMON_HDR_LEN..PEERED_MSG_MIN_LEN]));
    Outcome::Complete(FrameMeta {
        len,
        version: 3,
        msg_type,
        kind,
        peer,
    })
}

/// Decodes the 42-byte per-peer header. The caller guarantees the slice
/// length; every bit pattern decodes to something, so this cannot fail.
pub fn parse_per_peer_header(hdr: &[u8]) -> PerPeerHeader {
    debug_assert_eq!(hdr.len(), PER_PEER_HDR_LEN);
    let peer_type = hdr[0];
    let flags = PeerFlags::from_bits_retain(hdr[1]);
    let distinguisher = u64::from_be_bytes(hdr[2..10].try_into().unwrap());
    let addr = if peer_type == PEER_TYPE_LOC_RIB {
        // RFC 9069: zero-filled address, flags redefined
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        peer_addr_from_bytes(&hdr[10..26], flags.is_ipv6())
    };
    let asn = if peer_type != PEER_TYPE_LOC_RIB && flags.contains(PeerFlags::AS_SIZE_16BIT) {
        u16::from_be_bytes(hdr[28..30].try_into().unwrap()) as u32
    } else {
        u32::from_be_bytes(hdr[26..30].try_into().unwrap())
    };
    let bgp_id = Ipv4Addr::from(u32::from_be_bytes(hdr[30..34].try_into().unwrap()));
    let ts_sec = u32::from_be_bytes(hdr[34..38].try_into().unwrap());
    let ts_usec = u32::from_be_bytes(hdr[38..42].try_into().unwrap());
    PerPeerHeader {
        peer_type,
        flags,
        distinguisher,
        addr,
        asn,
        bgp_id,
        ts_sec,
        ts_usec,
    }
}

/// 16-byte peer address field: IPv6 in full, IPv4 right-justified.
pub(crate) fn peer_addr_from_bytes(raw: &[u8], is_v6: bool) -> IpAddr {
    debug_assert_eq!(raw.len(), 16);
    if is_v6 {
        let octets: [u8; 16] = raw.try_into().unwrap();
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let octets: [u8; 4] = raw[12..16].try_into().unwrap();
        IpAddr::V4(Ipv4Addr::from(octets))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Builds a 42-byte per-peer header for test vectors.
    pub fn peer_header_bytes(
        peer_type: u8,
        flags: u8,
        distinguisher: u64,
        addr: IpAddr,
        asn: u32,
        bgp_id: Ipv4Addr,
        ts_sec: u32,
        ts_usec: u32,
    ) -> Vec<u8> {
        let mut hdr = Vec::with_capacity(PER_PEER_HDR_LEN);
        hdr.push(peer_type);
        hdr.push(flags);
        hdr.extend_from_slice(&distinguisher.to_be_bytes());
        match addr {
            IpAddr::V4(v4) => {
                hdr.extend_from_slice(&[0u8; 12]);
                hdr.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => hdr.extend_from_slice(&v6.octets()),
        }
        hdr.extend_from_slice(&asn.to_be_bytes());
        hdr.extend_from_slice(&bgp_id.octets());
        hdr.extend_from_slice(&ts_sec.to_be_bytes());
        hdr.extend_from_slice(&ts_usec.to_be_bytes());
        hdr
    }

    /// Wraps a payload in a v3 common header of the given type.
    pub fn v3_message(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let total = (COMMON_HDR_LEN + body.len()) as u32;
        let mut msg = Vec::with_capacity(total as usize);
        msg.push(3);
        msg.extend_from_slice(&total.to_be_bytes());
        msg.push(msg_type);
        msg.extend_from_slice(body);
        msg
    }
}
