// src/streams.rs
//! Stream Manager (§4.F): bidirectional TCP/UDP conversation reassembly.
//!
//! A single-writer actor (§5: "stream manager single-writer actor") backed
//! by one `hashbrown::HashMap` keyed by the direction-normalized stream
//! tuple plus a `VecDeque` of ids ordered by last-seen for O(1) LRU
//! eviction — the LRU-ring idiom generalized from the teacher's
//! `Level`/`Slab` FIFO linked list in `orderbook.rs` (there: per-price-level
//! order queues; here: one global least-recently-used queue over streams).

use crate::decode::{AppProtocol, PacketRecord, Transport};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;

/// Direction-normalized stream identity: `(transport, min(endpoint,port), max(endpoint,port))`
/// so A↔B and B↔A collapse onto one stream (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub transport: TransportKind,
    pub a: (IpAddr, u16),
    pub b: (IpAddr, u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl StreamKey {
    pub fn from_packet(p: &PacketRecord) -> Option<Self> {
        let transport = match p.transport {
            Transport::Tcp => TransportKind::Tcp,
            Transport::Udp => TransportKind::Udp,
            _ => return None,
        };
        let src = (p.src_ip, p.src_port);
        let dst = (p.dst_ip, p.dst_port);
        let (a, b) = if src <= dst { (src, dst) } else { (dst, src) };
        Some(Self { transport, a, b })
    }

    pub fn id(&self) -> String {
        format!(
            "{:?}:{}:{}:{}:{}",
            self.transport, self.a.0, self.a.1, self.b.0, self.b.1
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPacketRef {
    pub ts: f64,
    pub direction: &'static str,
    pub length: u32,
}

pub struct Stream {
    pub key: StreamKey,
    pub initial_src: IpAddr,
    pub initial_src_port: u16,
    pub app_protocol: AppProtocol,
    pub start_ts: f64,
    pub last_seen: f64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub request_buf: Vec<u8>,
    pub response_buf: Vec<u8>,
    pub packets: VecDeque<StreamPacketRef>,
    mail_from: Option<String>,
}

/// Metadata-only view returned by `list`/`list_by_protocol` (§4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub app_protocol: String,
    pub start_ts: f64,
    pub last_seen: f64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub summary: String,
}

/// Full detail view returned by `get(id)`, including both payload buffers
/// rendered as hex/ASCII or sanitized text depending on protocol (§4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDetail {
    pub info: StreamInfo,
    pub packets: Vec<StreamPacketRef>,
    pub request_dump: String,
    pub response_dump: String,
}

const MAX_PACKETS_PER_STREAM_DEFAULT: usize = 500;
const MAX_PAYLOAD_BYTES_DEFAULT: usize = 1024 * 1024;

struct Inner {
    streams: HashMap<String, Stream>,
    /// LRU order, oldest first; ids may appear stale (superseded by a later
    /// touch) and are filtered against `streams` on eviction.
    lru: VecDeque<String>,
    max_streams: usize,
    max_packets_per_stream: usize,
    max_payload_bytes: usize,
}

pub struct StreamManager {
    inner: Mutex<Inner>,
}

impl StreamManager {
    pub fn new(max_streams: usize, max_packets_per_stream: usize, max_payload_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                lru: VecDeque::new(),
                max_streams,
                max_packets_per_stream: if max_packets_per_stream == 0 {
                    MAX_PACKETS_PER_STREAM_DEFAULT
                } else {
                    max_packets_per_stream
                },
                max_payload_bytes: if max_payload_bytes == 0 {
                    MAX_PAYLOAD_BYTES_DEFAULT
                } else {
                    max_payload_bytes
                },
            }),
        }
    }

    /// Route a packet to its stream (creating if necessary), update
    /// counters, append the direction-tagged sub-record, and re-run tag
    /// inference + summary generation (§4.F).
    pub fn add_packet(&self, p: &PacketRecord) {
        let Some(key) = StreamKey::from_packet(p) else { return };
        let id = key.id();
        let mut g = self.inner.lock().unwrap();

        if !g.streams.contains_key(&id) {
            if g.streams.len() >= g.max_streams {
                evict_lru(&mut g);
            }
            g.streams.insert(
                id.clone(),
                Stream {
                    key: key.clone(),
                    initial_src: p.src_ip,
                    initial_src_port: p.src_port,
                    app_protocol: AppProtocol::Unknown,
                    start_ts: p.ts,
                    last_seen: p.ts,
                    packet_count: 0,
                    byte_count: 0,
                    request_buf: Vec::new(),
                    response_buf: Vec::new(),
                    packets: VecDeque::new(),
                    mail_from: None,
                },
            );
        }

        let max_packets = g.max_packets_per_stream;
        let max_payload = g.max_payload_bytes;
        let stream = g.streams.get_mut(&id).unwrap();

        let direction = if p.src_ip == stream.initial_src && p.src_port == stream.initial_src_port {
            Direction::Request
        } else {
            Direction::Response
        };

        stream.packet_count = stream.packet_count.saturating_add(1);
        stream.byte_count = stream.byte_count.saturating_add(p.length as u64);
        stream.last_seen = stream.last_seen.max(p.ts);

        let buf = match direction {
            Direction::Request => &mut stream.request_buf,
            Direction::Response => &mut stream.response_buf,
        };
        if buf.len() < max_payload {
            let room = max_payload - buf.len();
            let take = p.payload.len().min(room);
            buf.extend_from_slice(&p.payload[..take]);
        }

        if stream.packets.len() < max_packets {
            stream.packets.push_back(StreamPacketRef {
                ts: p.ts,
                direction: match direction {
                    Direction::Request => "request",
                    Direction::Response => "response",
                },
                length: p.length,
            });
        }

        if !p.app_protocol.is_generic() || matches!(stream.app_protocol, AppProtocol::Unknown) {
            stream.app_protocol = classify(p, &stream.request_buf);
        }

        if stream.mail_from.is_none() {
            if let Some(from) = extract_mail_from(&p.payload) {
                stream.mail_from = Some(from);
            }
        }

        touch_lru(&mut g.lru, &id);
    }

    pub fn list(&self) -> Vec<StreamInfo> {
        let g = self.inner.lock().unwrap();
        let mut out: Vec<StreamInfo> = g.streams.values().map(|s| info_of(s)).collect();
        out.sort_by(|a, b| b.last_seen.partial_cmp(&a.last_seen).unwrap());
        out
    }

    pub fn list_by_protocol(&self, protocol: &str) -> Vec<StreamInfo> {
        self.list().into_iter().filter(|s| s.app_protocol.eq_ignore_ascii_case(protocol)).collect()
    }

    pub fn get(&self, id: &str) -> Option<StreamDetail> {
        let g = self.inner.lock().unwrap();
        let stream = g.streams.get(id)?;
        Some(StreamDetail {
            info: info_of(stream),
            packets: stream.packets.iter().cloned().collect(),
            request_dump: dump(&stream.request_buf, stream.app_protocol),
            response_dump: dump(&stream.response_buf, stream.app_protocol),
        })
    }

    pub fn stats_by_protocol(&self) -> HashMap<String, usize> {
        let g = self.inner.lock().unwrap();
        let mut out: HashMap<String, usize> = HashMap::new();
        for s in g.streams.values() {
            *out.entry(protocol_label(s.app_protocol).to_string()).or_insert(0) += 1;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().streams.len()
    }

    pub fn clear(&self) {
        let mut g = self.inner.lock().unwrap();
        g.streams.clear();
        g.lru.clear();
    }
}

fn touch_lru(lru: &mut VecDeque<String>, id: &str) {
    if let Some(pos) = lru.iter().position(|x| x == id) {
        lru.remove(pos);
    }
    lru.push_back(id.to_string());
}

fn evict_lru(g: &mut Inner) {
    while let Some(candidate) = g.lru.pop_front() {
        if g.streams.remove(&candidate).is_some() {
            return;
        }
    }
}

fn classify(p: &PacketRecord, request_buf: &[u8]) -> AppProtocol {
    if !p.app_protocol.is_generic() {
        return p.app_protocol;
    }
    if let Some(tag) = crate::decode::app_protocol_for_port(p.dst_port)
        .or_else(|| crate::decode::app_protocol_for_port(p.src_port))
    {
        return tag;
    }
    if let Some(tag) = crate::decode::app_protocol_for_payload(request_buf) {
        return tag;
    }
    p.app_protocol
}

fn extract_mail_from(payload: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(payload);
    let idx = text.find("MAIL FROM:")?;
    let rest = &text[idx + "MAIL FROM:".len()..];
    let end = rest.find(|c: char| c == '\r' || c == '\n').unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

fn protocol_label(p: AppProtocol) -> &'static str {
    use AppProtocol::*;
    match p {
        Ftp => "FTP", Ssh => "SSH", Telnet => "Telnet", Smtp => "SMTP", Dns => "DNS",
        Bootp => "BOOTP", Http => "HTTP", Https => "HTTPS", MySql => "MySQL",
        PostgreSql => "PostgreSQL", Redis => "Redis", Slurm => "Slurm",
        Tcp => "TCP", Udp => "UDP", Unknown => "Unknown",
    }
}

/// A one-line human-readable hint, per §4.F's summary rules.
fn summarize(stream: &Stream) -> String {
    match stream.app_protocol {
        AppProtocol::Http => {
            let text = String::from_utf8_lossy(&stream.request_buf);
            let first_line = text.lines().next().unwrap_or("");
            let mut parts = first_line.splitn(3, ' ');
            let method = parts.next().unwrap_or("");
            let path = parts.next().unwrap_or("");
            let truncated: String = path.chars().take(50).collect();
            format!("{method} {truncated}")
        }
        AppProtocol::Smtp => match &stream.mail_from {
            Some(envelope) => format!("SMTP from {envelope}"),
            None => format!("TCP stream ({} packets)", stream.packet_count),
        },
        AppProtocol::Dns => format!("DNS Query ({} bytes)", stream.byte_count),
        _ => {
            let transport = match stream.key.transport {
                TransportKind::Tcp => "TCP",
                TransportKind::Udp => "UDP",
            };
            format!("{transport} stream ({} packets)", stream.packet_count)
        }
    }
}

fn info_of(stream: &Stream) -> StreamInfo {
    StreamInfo {
        id: stream.key.id(),
        app_protocol: protocol_label(stream.app_protocol).to_string(),
        start_ts: stream.start_ts,
        last_seen: stream.last_seen,
        packet_count: stream.packet_count,
        byte_count: stream.byte_count,
        summary: summarize(stream),
    }
}

/// Render a payload buffer as sanitized text for text-ish protocols, or a
/// hex/ASCII dump otherwise (§4.F: "rendered as a hex/ASCII or sanitized
/// text dump depending on protocol").
fn dump(buf: &[u8], protocol: AppProtocol) -> String {
    use AppProtocol::*;
    match protocol {
        Http | Smtp | Ftp | Ssh | Telnet => String::from_utf8_lossy(buf)
            .chars()
            .map(|c| if c.is_control() && c != '\n' && c != '\r' && c != '\t' { '.' } else { c })
            .collect(),
        _ => hex_ascii_dump(buf),
    }
}

fn hex_ascii_dump(buf: &[u8]) -> String {
    let mut out = String::new();
    for chunk in buf.chunks(16) {
        let hex: String = chunk.iter().map(|b| format!("{:02x} ", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '.' })
            .collect();
        out.push_str(&format!("{:<48}{}\n", hex, ascii));
    }
    out
}
