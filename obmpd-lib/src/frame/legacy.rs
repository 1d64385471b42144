//! Framing for the pre-standard BMP versions 1 and 2.
//!
//! Legacy messages carry a fixed header (version byte plus 43 bytes that
//! fold the per-peer fields into the common header) and no message length,
//! so the frame size has to be reconstructed per type: route monitoring from
//! the embedded BGP message length, statistics reports by walking the
//! counter TLVs, peer down from the reason code. Peer Up did not exist
//! before v3. v3 is the supported baseline; this module exists so routers
//! stuck on old firmware do not silently desynchronize the stream.

use super::{peer_addr_from_bytes, BmpMsgType, FrameInvalid, FrameMeta, Outcome, PeerFlags, PerPeerHeader};
use std::net::Ipv4Addr;

/// Version byte plus the 43-byte fixed header.
pub const LEGACY_HDR_LEN: usize = 44;

/// BGP message common header: 16-byte marker, 2-byte length, 1-byte type.
const BGP_HDR_LEN: usize = 19;
const BGP_MAX_LEN: u16 = 4096;

const TYPE_ROUTE_MONITORING: u8 = 0;
const TYPE_STATS_REPORT: u8 = 1;
const TYPE_PEER_DOWN: u8 = 2;

pub(super) fn parse(window: &[u8]) -> Outcome {
    if window.len() < LEGACY_HDR_LEN {
        return Outcome::Partial {
            need: LEGACY_HDR_LEN,
        };
    }
    let version = window[0];
    let msg_type = window[1];
    match msg_type {
        TYPE_ROUTE_MONITORING => {
            // exactly one BGP PDU follows the header
            match embedded_bgp_len(&window[LEGACY_HDR_LEN..], LEGACY_HDR_LEN) {
                Ok(bgp_len) => complete(window, version, msg_type, LEGACY_HDR_LEN + bgp_len),
                Err(out) => out,
            }
        }
        TYPE_STATS_REPORT => match stats_len(&window[LEGACY_HDR_LEN..]) {
            Ok(body_len) => complete(window, version, msg_type, LEGACY_HDR_LEN + body_len),
            Err(out) => out,
        },
        TYPE_PEER_DOWN => match peer_down_len(&window[LEGACY_HDR_LEN..]) {
            Ok(body_len) => complete(window, version, msg_type, LEGACY_HDR_LEN + body_len),
            Err(out) => out,
        },
        t => Outcome::Invalid(FrameInvalid::LegacyUnsupportedType(t)),
    }
}

fn complete(window: &[u8], version: u8, msg_type: u8, total: usize) -> Outcome {
    if window.len() < total {
        return Outcome::Partial { need: total };
    }
    Outcome::Complete(FrameMeta {
        len: total,
        version,
        msg_type,
        kind: BmpMsgType::try_from(msg_type).ok(),
        peer: Some(parse_legacy_peer(&window[2..LEGACY_HDR_LEN])),
    })
}

/// Length of the BGP PDU starting at `body`, validated against the BGP
/// bounds. `base` is only used to express Partial in window coordinates.
fn embedded_bgp_len(body: &[u8], base: usize) -> Result<usize, Outcome> {
    if body.len() < BGP_HDR_LEN {
        return Err(Outcome::Partial {
            need: base + BGP_HDR_LEN,
        });
    }
    let bgp_len = u16::from_be_bytes(body[16..18].try_into().unwrap());
    if bgp_len < BGP_HDR_LEN as u16 || bgp_len > BGP_MAX_LEN {
        return Err(Outcome::Invalid(FrameInvalid::LegacyBadBgpLength(bgp_len)));
    }
    Ok(bgp_len as usize)
}

/// Stats report body: u32 counter count, then (u16 type, u16 len, len bytes)
/// per counter.
fn stats_len(body: &[u8]) -> Result<usize, Outcome> {
    if body.len() < 4 {
        return Err(Outcome::Partial {
            need: LEGACY_HDR_LEN + 4,
        });
    }
    let count = u32::from_be_bytes(body[..4].try_into().unwrap());
    if count > 0xFFFF {
        return Err(Outcome::Invalid(FrameInvalid::LegacyBadStatsCount(count)));
    }
    let mut off = 4usize;
    for _ in 0..count {
        if body.len() < off + 4 {
            return Err(Outcome::Partial {
                need: LEGACY_HDR_LEN + off + 4,
            });
        }
        let data_len = u16::from_be_bytes(body[off + 2..off + 4].try_into().unwrap()) as usize;
        off += 4 + data_len;
    }
    Ok(off)
}

/// Peer down body: reason byte, then per reason either a BGP notification
/// PDU (1, 3), a 2-byte FSM event code (2), or nothing (4).
fn peer_down_len(body: &[u8]) -> Result<usize, Outcome> {
    if body.is_empty() {
        return Err(Outcome::Partial {
            need: LEGACY_HDR_LEN + 1,
        });
    }
    match body[0] {
        1 | 3 => embedded_bgp_len(&body[1..], LEGACY_HDR_LEN + 1).map(|bgp| 1 + bgp),
        2 => {
            if body.len() < 3 {
                Err(Outcome::Partial {
                    need: LEGACY_HDR_LEN + 3,
                })
            } else {
                Ok(3)
            }
        }
        4 => Ok(1),
        r => Err(Outcome::Invalid(FrameInvalid::LegacyBadReason(r))),
    }
}

/// The 42 bytes after version and type: same field order as the v3 per-peer
/// header.
fn parse_legacy_peer(hdr: &[u8]) -> PerPeerHeader {
    let peer_type = hdr[0];
    let flags = PeerFlags::from_bits_retain(hdr[1]);
    let distinguisher = u64::from_be_bytes(hdr[2..10].try_into().unwrap());
    let addr = peer_addr_from_bytes(&hdr[10..26], flags.is_ipv6());
    let asn = u32::from_be_bytes(hdr[26..30].try_into().unwrap());
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

#[cfg(test)]
mod tests {
    use super::super::{parse, BmpMsgType, FrameInvalid, Outcome};
    use super::*;
    use std::net::IpAddr;
    use std::str::FromStr;

    fn legacy_header(version: u8, msg_type: u8, peer_v4: [u8; 4], asn: u32) -> Vec<u8> {
        let mut hdr = vec![version, msg_type];
        hdr.push(0); // peer type
        hdr.push(0); // flags: v4
        hdr.extend_from_slice(&[0u8; 8]); // distinguisher
        hdr.extend_from_slice(&[0u8; 12]);
        hdr.extend_from_slice(&peer_v4);
        hdr.extend_from_slice(&asn.to_be_bytes());
        hdr.extend_from_slice(&[10, 0, 0, 1]); // bgp id
        hdr.extend_from_slice(&[0u8; 8]); // timestamps
        hdr
    }

    fn bgp_pdu(len: u16) -> Vec<u8> {
        let mut pdu = vec![0xFFu8; 16];
        pdu.extend_from_slice(&len.to_be_bytes());
        pdu.push(2); // UPDATE
        pdu.resize(len as usize, 0);
        pdu
    }

    #[test]
    fn frames_v1_route_monitoring_via_bgp_length() {
        let mut msg = legacy_header(1, TYPE_ROUTE_MONITORING, [10, 0, 0, 9], 65000);
        msg.extend_from_slice(&bgp_pdu(100));
        match parse(&msg) {
            Outcome::Complete(meta) => {
                assert_eq!(meta.version, 1);
                assert_eq!(meta.len, LEGACY_HDR_LEN + 100);
                assert_eq!(meta.kind, Some(BmpMsgType::RouteMonitoring));
                let peer = meta.peer.expect("legacy peer header");
                assert_eq!(peer.addr, IpAddr::from_str("10.0.0.9").unwrap());
                assert_eq!(peer.asn, 65000);
            }
            other => panic!("expected complete frame, got {:?}", other),
        }
    }

    #[test]
    fn partial_when_bgp_pdu_is_cut() {
        let mut msg = legacy_header(2, TYPE_ROUTE_MONITORING, [10, 0, 0, 9], 65000);
        msg.extend_from_slice(&bgp_pdu(100));
        assert_eq!(
            parse(&msg[..LEGACY_HDR_LEN + 10]),
            Outcome::Partial {
                need: LEGACY_HDR_LEN + BGP_HDR_LEN
            }
        );
        assert_eq!(
            parse(&msg[..msg.len() - 1]),
            Outcome::Partial {
                need: LEGACY_HDR_LEN + 100
            }
        );
    }

    #[test]
    fn frames_v1_stats_report_by_walking_tlvs() {
        let mut msg = legacy_header(1, TYPE_STATS_REPORT, [10, 0, 0, 9], 65000);
        msg.extend_from_slice(&2u32.to_be_bytes());
        msg.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 7]); // counter 0, 4 bytes
        msg.extend_from_slice(&[0, 1, 0, 2, 0, 9]); // counter 1, 2 bytes
        match parse(&msg) {
            Outcome::Complete(meta) => assert_eq!(meta.len, msg.len()),
            other => panic!("expected complete frame, got {:?}", other),
        }
    }

    #[test]
    fn frames_v1_peer_down_reasons() {
        // reason 4: nothing follows
        let mut msg = legacy_header(1, TYPE_PEER_DOWN, [10, 0, 0, 9], 65000);
        msg.push(4);
        match parse(&msg) {
            Outcome::Complete(meta) => assert_eq!(meta.len, msg.len()),
            other => panic!("expected complete frame, got {:?}", other),
        }

        // reason 1: notification PDU follows
        let mut msg = legacy_header(1, TYPE_PEER_DOWN, [10, 0, 0, 9], 65000);
        msg.push(1);
        msg.extend_from_slice(&bgp_pdu(21));
        match parse(&msg) {
            Outcome::Complete(meta) => assert_eq!(meta.len, msg.len()),
            other => panic!("expected complete frame, got {:?}", other),
        }
    }

    #[test]
    fn legacy_peer_up_is_rejected() {
        let msg = legacy_header(1, 3, [10, 0, 0, 9], 65000);
        assert_eq!(
            parse(&msg),
            Outcome::Invalid(FrameInvalid::LegacyUnsupportedType(3))
        );
    }
}
