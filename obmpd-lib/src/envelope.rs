//! The binary envelope wrapped around every raw BMP message before it goes
//! on the bus.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                   Magic Number (0x4F424D50)                   |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |   Major Ver.  |   Minor Ver.  |         Header Length         |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                      BMP Message Length                       |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |     Flags     |   Msg. Type   |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                  Capture Timestamp (seconds)                  |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                Capture Timestamp (microseconds)               |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  Collector Hash (16), Collector Name (u16 len + bytes),      |
//!  ~  Router Hash (16), Router Group (u16 len + bytes),            ~
//!  |  Router IP (16, v4 right-justified)                           |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  if HAS_PEER_INFO: Peer Hash (16), Peer ASN (u32),            |
//!  ~  Peer IP (16), Peer RD (8), Peer Flags (u8)                   ~
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                     raw BMP message ...                       |
//! ```
//!
//! Header Length is authoritative: a reader needs only the magic and that
//! field to locate the payload. The constant prefix (everything except the
//! mutable middle and the peer block) is built once per session; `encode`
//! patches lengths, flags, type and timestamp per message.

use crate::identity::{ip_bytes, PeerIdentity, RouterIdentity, HASH_LEN};
use bitflags::bitflags;
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"OBMP";
pub const DEFAULT_MAJOR_VERSION: u8 = 1;
pub const DEFAULT_MINOR_VERSION: u8 = 7;

/// Envelope msg_type values for collector records; raw BMP messages carry
/// their BMP type byte (0..=6 plus reserved values), so these are disjoint.
pub const MSG_TYPE_COLLECTOR_HEARTBEAT: u8 = 0x80;
pub const MSG_TYPE_COLLECTOR_STOPPED: u8 = 0x81;

/// Longest name/group accepted into a length-prefixed field.
const MAX_STRING_LEN: usize = 255;

const OFF_HEADER_LEN: usize = 6;
const OFF_MSG_LEN: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_MSG_TYPE: usize = 13;
const OFF_TS_SEC: usize = 14;
const OFF_TS_USEC: usize = 18;

/// Fixed-position part of the header, up to the collector hash.
const FIXED_PREFIX_LEN: usize = 22;
/// Size of the optional peer block.
const PEER_BLOCK_LEN: usize = HASH_LEN + 4 + 16 + 8 + 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvelopeFlags: u8 {
        const ROUTER_IP_V6 = 0b0000_0001;
        const HAS_PEER_INFO = 0b0000_0010;
    }
}

/// Wall-clock capture time with microsecond resolution, taken once per
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTime {
    pub sec: u32,
    pub usec: u32,
}

impl CaptureTime {
    pub fn now() -> Self {
        let now = Utc::now();
        CaptureTime {
            sec: now.timestamp() as u32,
            usec: now.timestamp_subsec_micros(),
        }
    }

    /// Milliseconds since epoch, the unit the bus expects.
    pub fn as_millis(&self) -> i64 {
        self.sec as i64 * 1000 + self.usec as i64 / 1000
    }
}

pub struct EnvelopeEncoder {
    prefix: Vec<u8>,
    base_flags: EnvelopeFlags,
}

impl EnvelopeEncoder {
    /// Encoder for one router session. `collector_hash` is precomputed by
    /// the caller so every session shares the same bytes.
    pub fn new(
        collector_name: &str,
        collector_hash: &[u8; HASH_LEN],
        major: u8,
        minor: u8,
        router: &RouterIdentity,
    ) -> Self {
        let base_flags = if router.addr.is_ipv6() {
            EnvelopeFlags::ROUTER_IP_V6
        } else {
            EnvelopeFlags::empty()
        };
        let prefix = build_prefix(
            collector_name,
            collector_hash,
            major,
            minor,
            &router.hash,
            &router.group,
            router.addr,
        );
        EnvelopeEncoder { prefix, base_flags }
    }

    /// Encoder for collector records (heartbeat, stopped): zeroed router
    /// hash/IP and an empty group keep the layout self-describing.
    pub fn new_collector(
        collector_name: &str,
        collector_hash: &[u8; HASH_LEN],
        major: u8,
        minor: u8,
    ) -> Self {
        let prefix = build_prefix(
            collector_name,
            collector_hash,
            major,
            minor,
            &[0u8; HASH_LEN],
            "",
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        );
        EnvelopeEncoder {
            prefix,
            base_flags: EnvelopeFlags::empty(),
        }
    }

    /// Builds the envelope for one message. `bmp` may be empty (collector
    /// records carry no payload).
    pub fn encode(
        &self,
        msg_type: u8,
        peer: Option<&PeerIdentity>,
        bmp: &[u8],
        ts: CaptureTime,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + PEER_BLOCK_LEN + bmp.len());
        out.extend_from_slice(&self.prefix);

        let mut flags = self.base_flags;
        if let Some(peer) = peer {
            flags |= EnvelopeFlags::HAS_PEER_INFO;
            out.extend_from_slice(&peer.hash);
            out.extend_from_slice(&peer.asn.to_be_bytes());
            out.extend_from_slice(&ip_bytes(peer.addr));
            out.extend_from_slice(&peer.distinguisher.to_be_bytes());
            out.push(peer.flags);
        }

        let header_len = out.len() as u16;
        out[OFF_HEADER_LEN..OFF_HEADER_LEN + 2].copy_from_slice(&header_len.to_be_bytes());
        out[OFF_MSG_LEN..OFF_MSG_LEN + 4].copy_from_slice(&(bmp.len() as u32).to_be_bytes());
        out[OFF_FLAGS] = flags.bits();
        out[OFF_MSG_TYPE] = msg_type;
        out[OFF_TS_SEC..OFF_TS_SEC + 4].copy_from_slice(&ts.sec.to_be_bytes());
        out[OFF_TS_USEC..OFF_TS_USEC + 4].copy_from_slice(&ts.usec.to_be_bytes());

        out.extend_from_slice(bmp);
        out
    }
}

fn build_prefix(
    collector_name: &str,
    collector_hash: &[u8; HASH_LEN],
    major: u8,
    minor: u8,
    router_hash: &[u8; HASH_LEN],
    router_group: &str,
    router_ip: IpAddr,
) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(128);
    prefix.extend_from_slice(MAGIC);
    prefix.push(major);
    prefix.push(minor);
    // header_len, msg_len, flags, msg_type, timestamps: patched per message
    prefix.extend_from_slice(&[0u8; FIXED_PREFIX_LEN - 6]);
    prefix.extend_from_slice(collector_hash);
    put_string(&mut prefix, collector_name);
    prefix.extend_from_slice(router_hash);
    put_string(&mut prefix, router_group);
    prefix.extend_from_slice(&ip_bytes(router_ip));
    prefix
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(MAX_STRING_LEN)];
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope magic mismatch")]
    BadMagic,
    #[error("envelope truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

/// Decoded envelope header, produced by the reference decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub major: u8,
    pub minor: u8,
    pub header_len: u16,
    pub msg_len: u32,
    pub flags: EnvelopeFlags,
    pub msg_type: u8,
    pub ts: CaptureTime,
    pub collector_hash: [u8; HASH_LEN],
    pub collector_name: String,
    pub router_hash: [u8; HASH_LEN],
    pub router_group: String,
    pub router_ip: IpAddr,
    pub peer: Option<EnvelopePeer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopePeer {
    pub hash: [u8; HASH_LEN],
    pub asn: u32,
    pub addr: IpAddr,
    pub distinguisher: u64,
    pub flags: u8,
}

/// Locates the raw BMP payload using only the magic and the length fields.
pub fn payload(envelope: &[u8]) -> Result<&[u8], EnvelopeError> {
    if envelope.len() < FIXED_PREFIX_LEN {
        return Err(EnvelopeError::Truncated {
            need: FIXED_PREFIX_LEN,
            have: envelope.len(),
        });
    }
    if &envelope[..4] != MAGIC {
        return Err(EnvelopeError::BadMagic);
    }
    let header_len =
        u16::from_be_bytes(envelope[OFF_HEADER_LEN..OFF_HEADER_LEN + 2].try_into().unwrap())
            as usize;
    let msg_len =
        u32::from_be_bytes(envelope[OFF_MSG_LEN..OFF_MSG_LEN + 4].try_into().unwrap()) as usize;
    let need = header_len + msg_len;
    if envelope.len() < need {
        return Err(EnvelopeError::Truncated {
            need,
            have: envelope.len(),
        });
    }
    Ok(&envelope[header_len..need])
}

/// Full reference decode of the header fields.
pub fn decode_header(envelope: &[u8]) -> Result<EnvelopeHeader, EnvelopeError> {
    // payload() validates magic and both lengths up front
    payload(envelope)?;

    let mut cur = Cursor {
        buf: envelope,
        pos: 4,
    };
    let major = cur.u8()?;
    let minor = cur.u8()?;
    let header_len = cur.u16()?;
    let msg_len = cur.u32()?;
    let flags = EnvelopeFlags::from_bits_retain(cur.u8()?);
    let msg_type = cur.u8()?;
    let sec = cur.u32()?;
    let usec = cur.u32()?;
    let collector_hash = cur.hash()?;
    let collector_name = cur.string()?;
    let router_hash = cur.hash()?;
    let router_group = cur.string()?;
    let router_ip = cur.ip(flags.contains(EnvelopeFlags::ROUTER_IP_V6))?;

    let peer = if flags.contains(EnvelopeFlags::HAS_PEER_INFO) {
        let hash = cur.hash()?;
        let asn = cur.u32()?;
        let raw_ip = cur.take(16)?;
        let distinguisher = cur.u64()?;
        let peer_flags = cur.u8()?;
        // per-peer V flag picks the address family
        let is_v6 = peer_flags & 0x80 != 0;
        let addr = crate::frame::peer_addr_from_bytes(raw_ip, is_v6);
        Some(EnvelopePeer {
            hash,
            asn,
            addr,
            distinguisher,
            flags: peer_flags,
        })
    } else {
        None
    };

    Ok(EnvelopeHeader {
        major,
        minor,
        header_len,
        msg_len,
        flags,
        msg_type,
        ts: CaptureTime { sec, usec },
        collector_hash,
        collector_name,
        router_hash,
        router_group,
        router_ip,
        peer,
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        if self.buf.len() < self.pos + n {
            return Err(EnvelopeError::Truncated {
                need: self.pos + n,
                have: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EnvelopeError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, EnvelopeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, EnvelopeError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn hash(&mut self) -> Result<[u8; HASH_LEN], EnvelopeError> {
        Ok(self.take(HASH_LEN)?.try_into().unwrap())
    }

    fn string(&mut self) -> Result<String, EnvelopeError> {
        let len = self.u16()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    fn ip(&mut self, is_v6: bool) -> Result<IpAddr, EnvelopeError> {
        let raw = self.take(16)?;
        Ok(if is_v6 {
            let octets: [u8; 16] = raw.try_into().unwrap();
            IpAddr::V6(Ipv6Addr::from(octets))
        } else {
            let octets: [u8; 4] = raw[12..16].try_into().unwrap();
            IpAddr::V4(Ipv4Addr::from(octets))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{collector_hash, PeerIdentity};
    use std::str::FromStr;

    fn test_router() -> RouterIdentity {
        RouterIdentity::new(
            IpAddr::from_str("192.0.2.7").unwrap(),
            40179,
            "r7.example.net".to_string(),
            "lab".to_string(),
        )
    }

    fn test_encoder(router: &RouterIdentity) -> EnvelopeEncoder {
        let hash = collector_hash("collector-1");
        EnvelopeEncoder::new(
            "collector-1",
            &hash,
            DEFAULT_MAJOR_VERSION,
            DEFAULT_MINOR_VERSION,
            router,
        )
    }

    #[test]
    fn round_trip_recovers_exact_payload_and_timestamp() {
        let router = test_router();
        let enc = test_encoder(&router);
        let bmp = [3u8, 0, 0, 0, 0x0C, 4, 0, 2, 0, 2, b'r', b'1'];
        let ts = CaptureTime {
            sec: 1_750_000_000,
            usec: 123_456,
        };

        let envelope = enc.encode(4, None, &bmp, ts);
        assert_eq!(payload(&envelope).unwrap(), &bmp);

        let hdr = decode_header(&envelope).unwrap();
        assert_eq!(hdr.major, DEFAULT_MAJOR_VERSION);
        assert_eq!(hdr.minor, DEFAULT_MINOR_VERSION);
        assert_eq!(hdr.msg_type, 4);
        assert_eq!(hdr.msg_len as usize, bmp.len());
        assert_eq!(hdr.ts, ts);
        assert_eq!(hdr.collector_name, "collector-1");
        assert_eq!(hdr.router_group, "lab");
        assert_eq!(hdr.router_ip, router.addr);
        assert_eq!(hdr.router_hash, router.hash);
        assert!(hdr.peer.is_none());
    }

    #[test]
    fn peer_block_round_trips() {
        let router = test_router();
        let enc = test_encoder(&router);
        let peer = PeerIdentity {
            addr: IpAddr::from_str("10.0.0.1").unwrap(),
            asn: 65001,
            distinguisher: 0x0001_0002_0003_0004,
            flags: 0x40,
            hash: [9u8; HASH_LEN],
        };
        let bmp = vec![0xABu8; 64];
        let ts = CaptureTime { sec: 10, usec: 20 };

        let envelope = enc.encode(0, Some(&peer), &bmp, ts);
        let hdr = decode_header(&envelope).unwrap();
        let got = hdr.peer.expect("peer block");
        assert_eq!(got.addr, peer.addr);
        assert_eq!(got.asn, peer.asn);
        assert_eq!(got.distinguisher, peer.distinguisher);
        assert_eq!(got.flags, peer.flags);
        assert_eq!(got.hash, peer.hash);
        assert_eq!(payload(&envelope).unwrap(), &bmp[..]);
        // header_len moved past the peer block
        assert_eq!(
            hdr.header_len as usize,
            envelope.len() - bmp.len()
        );
    }

    #[test]
    fn v6_router_sets_the_flag_bit() {
        let router = RouterIdentity::new(
            IpAddr::from_str("2001:db8::42").unwrap(),
            5000,
            "2001:db8::42".to_string(),
            "default".to_string(),
        );
        let enc = test_encoder(&router);
        let envelope = enc.encode(5, None, &[3, 0, 0, 0, 6, 5], CaptureTime { sec: 1, usec: 0 });
        let hdr = decode_header(&envelope).unwrap();
        assert!(hdr.flags.contains(EnvelopeFlags::ROUTER_IP_V6));
        assert_eq!(hdr.router_ip, router.addr);
    }

    #[test]
    fn collector_record_has_no_payload() {
        let hash = collector_hash("collector-1");
        let enc = EnvelopeEncoder::new_collector(
            "collector-1",
            &hash,
            DEFAULT_MAJOR_VERSION,
            DEFAULT_MINOR_VERSION,
        );
        let ts = CaptureTime { sec: 77, usec: 0 };
        let envelope = enc.encode(MSG_TYPE_COLLECTOR_HEARTBEAT, None, &[], ts);

        let hdr = decode_header(&envelope).unwrap();
        assert_eq!(hdr.msg_type, MSG_TYPE_COLLECTOR_HEARTBEAT);
        assert_eq!(hdr.msg_len, 0);
        assert_eq!(hdr.router_group, "");
        assert!(payload(&envelope).unwrap().is_empty());
        assert_eq!(hdr.header_len as usize, envelope.len());
    }

    #[test]
    fn decoder_rejects_foreign_bytes() {
        assert_eq!(payload(b"NOPE"), Err(EnvelopeError::Truncated { need: FIXED_PREFIX_LEN, have: 4 }));
        let mut junk = vec![0u8; 64];
        junk[..4].copy_from_slice(b"JUNK");
        assert_eq!(payload(&junk), Err(EnvelopeError::BadMagic));
    }
}
