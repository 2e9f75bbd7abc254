// src/decode.rs
//! L2/L3/L4 parsing and application-protocol tagging (§4.B).
//!
//! Decoding is a pure, side-effect-free function over raw frame bytes,
//! following the same shape as `liveshark-core`'s `analysis::udp::parse_udp_packet`
//! (built on `etherparse::SlicedPacket`), generalized here from UDP-only to
//! TCP/UDP/ICMP/Other and to a full application-tag inference.

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Per-frame metadata supplied by the capture layer, independent of protocol.
#[derive(Debug, Clone, Copy)]
pub struct CaptureMeta {
    /// Timestamp in seconds, float, microsecond precision (§3).
    pub ts: f64,
    /// Bytes actually captured (may be less than `original_length`).
    pub capture_length: u32,
    /// Original on-the-wire length.
    pub original_length: u32,
}

/// Link-layer framing of the raw bytes handed to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
    Icmp,
    Other,
}

/// Recognized application protocols (§4.F: "The recognized set").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppProtocol {
    Ftp,
    Ssh,
    Telnet,
    Smtp,
    Dns,
    Bootp,
    Http,
    Https,
    MySql,
    PostgreSql,
    Redis,
    Slurm,
    /// Generic TCP traffic with no more specific tag.
    Tcp,
    /// Generic UDP traffic with no more specific tag.
    Udp,
    Unknown,
}

impl AppProtocol {
    /// True for the two generic tags that a more specific tag may "promote" over (§4.D).
    pub fn is_generic(&self) -> bool {
        matches!(self, AppProtocol::Tcp | AppProtocol::Udp)
    }
}

/// A fully decoded packet. Construction is total: either a complete record
/// is produced, or `decode` returns `None` — no partial record exists (§4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    pub ts: f64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_mac: Option<[u8; 6]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_mac: Option<[u8; 6]>,
    pub src_port: u16,
    pub dst_port: u16,
    /// Length on the wire (original, pre-truncation).
    pub length: u32,
    pub transport: Transport,
    /// TCP flags byte, preserved verbatim when `transport == Tcp`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_flags: Option<u8>,
    pub app_protocol: AppProtocol,
    /// Truncated payload bytes after L4, capped per §4.B (at least 2000 bytes).
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub payload: Vec<u8>,
}

/// `20/21`→FTP, `22`→SSH, `23`→Telnet, `25/465/587`→SMTP, `53`→DNS,
/// `67/68`→BOOTP, `80/3000/8000/8080`→HTTP, `443/8443`→HTTPS, `3306`→MySQL,
/// `5432`→PostgreSQL, `6379`→Redis, `6817/6818`→Slurm (§4.B port table).
pub fn app_protocol_for_port(port: u16) -> Option<AppProtocol> {
    match port {
        20 | 21 => Some(AppProtocol::Ftp),
        22 => Some(AppProtocol::Ssh),
        23 => Some(AppProtocol::Telnet),
        25 | 465 | 587 => Some(AppProtocol::Smtp),
        53 => Some(AppProtocol::Dns),
        67 | 68 => Some(AppProtocol::Bootp),
        80 | 3000 | 8000 | 8080 => Some(AppProtocol::Http),
        443 | 8443 => Some(AppProtocol::Https),
        3306 => Some(AppProtocol::MySql),
        5432 => Some(AppProtocol::PostgreSql),
        6379 => Some(AppProtocol::Redis),
        6817 | 6818 => Some(AppProtocol::Slurm),
        _ => None,
    }
}

/// Payload-prefix recognition: HTTP method verbs, `SSH-` banners, SMTP verbs.
pub fn app_protocol_for_payload(payload: &[u8]) -> Option<AppProtocol> {
    const HTTP_METHODS: &[&[u8]] = &[
        b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
        b"TRACE ",
    ];
    if HTTP_METHODS.iter().any(|m| payload.starts_with(m)) {
        return Some(AppProtocol::Http);
    }
    if payload.starts_with(b"SSH-") {
        return Some(AppProtocol::Ssh);
    }
    const SMTP_VERBS: &[&[u8]] = &[b"HELO", b"EHLO", b"MAIL FROM:"];
    if SMTP_VERBS.iter().any(|v| payload.starts_with(v)) {
        return Some(AppProtocol::Smtp);
    }
    None
}

/// Decide the application tag for a packet: explicit port match first, then
/// payload-prefix recognition, then the generic transport tag (§4.B, §4.F).
fn infer_app_protocol(transport: Transport, src_port: u16, dst_port: u16, payload: &[u8]) -> AppProtocol {
    if let Some(tag) = app_protocol_for_port(dst_port).or_else(|| app_protocol_for_port(src_port)) {
        return tag;
    }
    if let Some(tag) = app_protocol_for_payload(payload) {
        return tag;
    }
    match transport {
        Transport::Tcp => AppProtocol::Tcp,
        Transport::Udp => AppProtocol::Udp,
        _ => AppProtocol::Unknown,
    }
}

/// Decode one raw frame into a `PacketRecord`, or `None` if the link/network
/// protocol is unsupported (non-Ethernet-or-IP). Best-effort and total.
pub fn decode(meta: CaptureMeta, link: LinkType, raw: &[u8], payload_cap: usize) -> Option<PacketRecord> {
    let sliced = match link {
        LinkType::Ethernet => SlicedPacket::from_ethernet(raw).ok()?,
        LinkType::Raw => SlicedPacket::from_ip(raw).ok()?,
    };

    let (src_mac, dst_mac) = match &sliced.link {
        Some(etherparse::LinkSlice::Ethernet2(eth)) => {
            (Some(eth.source()), Some(eth.destination()))
        }
        _ => (None, None),
    };

    let net = sliced.net?;
    let (src_ip, dst_ip) = match &net {
        NetSlice::Ipv4(ipv4) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        NetSlice::Ipv6(ipv6) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
    };

    let ip_payload = net.ip_payload_ref()?;

    let (transport_kind, src_port, dst_port, tcp_flags, payload): (Transport, u16, u16, Option<u8>, &[u8]) =
        match sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                let flags = tcp_flags_byte(&tcp);
                (Transport::Tcp, tcp.source_port(), tcp.destination_port(), Some(flags), tcp.payload())
            }
            Some(TransportSlice::Udp(udp)) => {
                let payload = if ip_payload.payload.len() >= 8 {
                    &ip_payload.payload[8..]
                } else {
                    &[]
                };
                (Transport::Udp, udp.source_port(), udp.destination_port(), None, payload)
            }
            Some(TransportSlice::Icmpv4(_)) | Some(TransportSlice::Icmpv6(_)) => {
                (Transport::Icmp, 0, 0, None, ip_payload.payload)
            }
            _ => (Transport::Other, 0, 0, None, ip_payload.payload),
        };

    let capped_len = payload.len().min(payload_cap);
    let payload_owned = payload[..capped_len].to_vec();

    let app_protocol = match transport_kind {
        Transport::Tcp | Transport::Udp => {
            infer_app_protocol(transport_kind, src_port, dst_port, &payload_owned)
        }
        _ => AppProtocol::Unknown,
    };

    Some(PacketRecord {
        ts: meta.ts,
        src_ip,
        dst_ip,
        src_mac,
        dst_mac,
        src_port,
        dst_port,
        length: meta.original_length,
        transport: transport_kind,
        tcp_flags,
        app_protocol,
        payload: payload_owned,
    })
}

/// Best-effort extraction of the sender `(ip, mac)` binding from an
/// IPv4-over-Ethernet ARP frame, for the ARP IP Change threat rule (§4.G).
/// Not handled by `decode`, which only recognizes frames with an IP network
/// layer; ARP has none, so it is parsed separately straight off the wire.
pub fn parse_arp_sender(raw: &[u8]) -> Option<(IpAddr, [u8; 6])> {
    const ETHERTYPE_ARP: u16 = 0x0806;
    const ETHERNET_HEADER_LEN: usize = 14;
    const ARP_IPV4_LEN: usize = 28;
    if raw.len() < ETHERNET_HEADER_LEN + ARP_IPV4_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([raw[12], raw[13]]);
    if ethertype != ETHERTYPE_ARP {
        return None;
    }
    let arp = &raw[ETHERNET_HEADER_LEN..];
    let hardware_len = arp[4];
    let protocol_len = arp[5];
    if hardware_len != 6 || protocol_len != 4 {
        return None;
    }
    let sender_mac: [u8; 6] = arp[8..14].try_into().ok()?;
    let sender_ip = IpAddr::V4(std::net::Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]));
    Some((sender_ip, sender_mac))
}

fn tcp_flags_byte(tcp: &etherparse::TcpHeaderSlice) -> u8 {
    let mut flags = 0u8;
    if tcp.fin() {
        flags |= 0b0000_0001;
    }
    if tcp.syn() {
        flags |= 0b0000_0010;
    }
    if tcp.rst() {
        flags |= 0b0000_0100;
    }
    if tcp.psh() {
        flags |= 0b0000_1000;
    }
    if tcp.ack() {
        flags |= 0b0001_0000;
    }
    if tcp.urg() {
        flags |= 0b0010_0000;
    }
    if tcp.ece() {
        flags |= 0b0100_0000;
    }
    if tcp.cwr() {
        flags |= 0b1000_0000;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn meta() -> CaptureMeta {
        CaptureMeta { ts: 1.0, capture_length: 0, original_length: 0 }
    }

    fn build_tcp_frame(src_port: u16, dst_port: u16, flags_syn: bool, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(src_port, dst_port, 1, 1024);
        let builder = if flags_syn { builder.syn() } else { builder };
        let mut out = Vec::new();
        builder.write(&mut out, payload).unwrap();
        out
    }

    #[test]
    fn decodes_http_by_port() {
        let frame = build_tcp_frame(55123, 80, false, b"hello");
        let rec = decode(meta(), LinkType::Ethernet, &frame, 2000).unwrap();
        assert_eq!(rec.app_protocol, AppProtocol::Http);
        assert_eq!(rec.transport, Transport::Tcp);
        assert_eq!(rec.payload, b"hello");
    }

    #[test]
    fn decodes_http_by_payload_prefix_on_unknown_port() {
        let frame = build_tcp_frame(54321, 59999, false, b"GET /x HTTP/1.1\r\n");
        let rec = decode(meta(), LinkType::Ethernet, &frame, 2000).unwrap();
        assert_eq!(rec.app_protocol, AppProtocol::Http);
    }

    #[test]
    fn falls_back_to_generic_tcp() {
        let frame = build_tcp_frame(55000, 59999, false, b"\x00\x01\x02");
        let rec = decode(meta(), LinkType::Ethernet, &frame, 2000).unwrap();
        assert_eq!(rec.app_protocol, AppProtocol::Tcp);
    }

    #[test]
    fn preserves_tcp_syn_flag() {
        let frame = build_tcp_frame(1234, 22, true, b"");
        let rec = decode(meta(), LinkType::Ethernet, &frame, 2000).unwrap();
        assert_eq!(rec.tcp_flags.unwrap() & 0b0000_0010, 0b0000_0010);
        assert_eq!(rec.app_protocol, AppProtocol::Ssh);
    }

    #[test]
    fn payload_is_capped() {
        let payload = vec![0xAAu8; 5000];
        let frame = build_tcp_frame(1111, 2222, false, &payload);
        let rec = decode(meta(), LinkType::Ethernet, &frame, 2000).unwrap();
        assert_eq!(rec.payload.len(), 2000);
    }

    #[test]
    fn non_ip_ethertype_is_dropped() {
        // ARP ethertype (0x0806) frame: decode() must return None, not panic.
        let mut frame = vec![6, 5, 4, 3, 2, 1, 1, 2, 3, 4, 5, 6];
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 28]);
        assert!(decode(meta(), LinkType::Ethernet, &frame, 2000).is_none());
    }

    fn build_arp_frame(sender_mac: [u8; 6], sender_ip: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![6, 5, 4, 3, 2, 1];
        frame.extend_from_slice(&sender_mac);
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(&0x0001u16.to_be_bytes()); // hardware type: Ethernet
        frame.extend_from_slice(&0x0800u16.to_be_bytes()); // protocol type: IPv4
        frame.push(6); // hardware address length
        frame.push(4); // protocol address length
        frame.extend_from_slice(&1u16.to_be_bytes()); // opcode: request
        frame.extend_from_slice(&sender_mac);
        frame.extend_from_slice(&sender_ip);
        frame.extend_from_slice(&[0u8; 6]); // target mac, unset in a request
        frame.extend_from_slice(&[0u8; 4]); // target ip
        frame
    }

    #[test]
    fn parses_arp_sender_binding() {
        let mac = [1, 2, 3, 4, 5, 6];
        let frame = build_arp_frame(mac, [10, 0, 0, 9]);
        let (ip, sender_mac) = parse_arp_sender(&frame).unwrap();
        assert_eq!(ip, IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(sender_mac, mac);
    }

    #[test]
    fn parse_arp_sender_ignores_non_arp_frames() {
        let frame = build_tcp_frame(1, 2, false, b"");
        assert!(parse_arp_sender(&frame).is_none());
    }
}
