// src/replay.rs
//! Replay Engine (§4.J) and capture-controller state machine (§4.J/§6).
//!
//! The file is loaded fully into memory as an ordered array, exactly the
//! "ordered `(record, original_timestamp)` array" shape named in the spec
//! and grounded on `liveshark-core`'s `PcapFileSource` (§EXPANSION 4.J.1,
//! reused from `capture::pcap_file`), then driven through the same
//! Decoder/Aggregator/Stream Manager/Threat Detector interfaces a live run
//! uses — so replay and live share one code path below the Packet Source.

use crate::batcher::{Batcher, LifetimeStats, Snapshot};
use crate::capture::pcap_file::PcapFileSource;
use crate::capture::CaptureError;
use crate::decode::{self, CaptureMeta, LinkType, PacketRecord};
use crate::graph::Aggregator;
use crate::resolver::DnsResolver;
use crate::ring::PacketRing;
use crate::streams::StreamManager;
use crate::threats::ThreatDetector;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_PAYLOAD_CAP: usize = 2000;

struct RawRecord {
    ts: f64,
    link: LinkType,
    raw: Vec<u8>,
}

/// A capture file loaded fully into memory as an ordered array (§4.J).
pub struct ReplayEngine {
    records: Vec<RawRecord>,
    start_ts: f64,
}

impl ReplayEngine {
    pub fn load(path: &Path) -> Result<Self, CaptureError> {
        let source = PcapFileSource::open(path)?;
        let events = source.read_all()?;
        let start_ts = events.first().map(|e| e.ts).unwrap_or(0.0);
        let records = events.into_iter().map(|e| RawRecord { ts: e.ts, link: e.link, raw: e.data }).collect();
        Ok(Self { records, start_ts })
    }

    pub fn start_ts(&self) -> f64 {
        self.start_ts
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Index one past the last record with `ts <= start_ts + offset_seconds`,
    /// found via binary search over the capture-ordered timestamp array.
    /// Boundary behavior (§8): an offset at or beyond file end returns every
    /// record, with no error.
    fn cutoff_index(&self, offset_seconds: f64) -> usize {
        let target = self.start_ts + offset_seconds;
        match self.records.binary_search_by(|r| r.ts.partial_cmp(&target).unwrap()) {
            Ok(mut idx) => {
                while idx + 1 < self.records.len() && self.records[idx + 1].ts == target {
                    idx += 1;
                }
                idx + 1
            }
            Err(idx) => idx,
        }
    }

    fn decode_range(&self, end: usize) -> Vec<PacketRecord> {
        self.records[..end]
            .iter()
            .filter_map(|r| {
                let meta = CaptureMeta { ts: r.ts, capture_length: r.raw.len() as u32, original_length: r.raw.len() as u32 };
                decode::decode(meta, r.link, &r.raw, DEFAULT_PAYLOAD_CAP)
            })
            .collect()
    }

    /// Every record with `timestamp <= start_ts + offset_seconds` (§4.J).
    pub fn packets_up_to(&self, offset_seconds: f64) -> Vec<PacketRecord> {
        self.decode_range(self.cutoff_index(offset_seconds))
    }

    /// Every record in the file (§4.J).
    pub fn full_replay(&self) -> Vec<PacketRecord> {
        self.decode_range(self.records.len())
    }

    /// Drive D/E/F/G with every record up to `offset_seconds` past the
    /// file's start and build one Snapshot on demand (§4.J: "Batcher not
    /// started in replay-only mode; snapshots are produced on demand").
    pub fn drive_up_to(&self, offset_seconds: f64, pipeline: &mut ReplayPipeline) -> Snapshot {
        pipeline.reset();
        let end = self.cutoff_index(offset_seconds);
        let last_ts = self.records[..end].last().map(|r| r.ts).unwrap_or(self.start_ts);
        for record in &self.records[..end] {
            let meta = CaptureMeta { ts: record.ts, capture_length: record.raw.len() as u32, original_length: record.raw.len() as u32 };
            match decode::decode(meta, record.link, &record.raw, DEFAULT_PAYLOAD_CAP) {
                Some(packet) => pipeline.feed_packet(packet),
                // Mirrors the live capture loop: frames with no IP network
                // layer are checked against the ARP IP Change rule instead.
                None => {
                    if let Some((sender_ip, sender_mac)) = decode::parse_arp_sender(&record.raw) {
                        pipeline.threats.observe_arp(sender_ip, sender_mac, record.ts);
                    }
                }
            }
        }
        pipeline.snapshot(last_ts.max(self.start_ts + 0.001))
    }

    pub fn drive_full(&self, pipeline: &mut ReplayPipeline) -> Snapshot {
        self.drive_up_to(f64::MAX - self.start_ts, pipeline)
    }
}

/// The D/E/F/G quartet wired identically for live and replay, so one
/// `feed_packet` drives both (§4.J: "drives D, E, F, G through the same
/// interfaces as live capture").
pub struct ReplayPipeline {
    pub aggregator: Arc<Aggregator>,
    pub ring: Arc<PacketRing>,
    pub streams: Arc<StreamManager>,
    pub threats: Arc<ThreatDetector>,
    pub resolver: Arc<DnsResolver>,
    pub stats: Arc<LifetimeStats>,
    batcher: Batcher,
}

impl ReplayPipeline {
    pub fn new(
        aggregator: Arc<Aggregator>,
        ring: Arc<PacketRing>,
        streams: Arc<StreamManager>,
        threats: Arc<ThreatDetector>,
        resolver: Arc<DnsResolver>,
        stats: Arc<LifetimeStats>,
    ) -> Self {
        let batcher = Batcher::new(aggregator.clone(), ring.clone(), resolver.clone(), threats.clone(), stats.clone());
        Self { aggregator, ring, streams, threats, resolver, stats, batcher }
    }

    fn reset(&mut self) {
        self.ring.clear();
        self.streams.clear();
        self.stats.reset();
        self.batcher.reset_cache_cursor();
    }

    fn feed_packet(&self, packet: PacketRecord) {
        self.stats.record_packet(&packet);
        self.ring.append(packet.clone());
        self.streams.add_packet(&packet);
        self.threats.observe_packet(&packet);

        // DNS resolution uses the synchronous variant so snapshots built
        // from a capture file are stable (§4.C, §4.J).
        let src_host = self.resolver.resolve_sync(packet.src_ip);
        let dst_host = self.resolver.resolve_sync(packet.dst_ip);
        let src_hostname = (src_host != packet.src_ip.to_string()).then_some(src_host.as_str());
        let dst_hostname = (dst_host != packet.dst_ip.to_string()).then_some(dst_host.as_str());

        let src_id = self.aggregator.upsert_node(&packet.src_ip.to_string(), src_hostname, packet.length as u64, true, packet.ts);
        let dst_id = self.aggregator.upsert_node(&packet.dst_ip.to_string(), dst_hostname, packet.length as u64, false, packet.ts);
        self.aggregator.record_node_protocol(&src_id, &crate::graph::app_tag_label(packet.app_protocol));
        self.aggregator.upsert_edge(&src_id, &dst_id, packet.app_protocol, packet.length as u64, packet.ts);
    }

    fn snapshot(&mut self, now: f64) -> Snapshot {
        self.batcher.build_snapshot(100, now)
    }
}

/// Capture-controller state (§4.J): idle/starting/running/paused/stopping/
/// restarting/error, driving both live capture and replay sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Restarting,
    Error,
}

pub struct CaptureController {
    state: std::sync::Mutex<CaptureState>,
}

impl CaptureController {
    pub fn new() -> Self {
        Self { state: std::sync::Mutex::new(CaptureState::Idle) }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock().unwrap()
    }

    pub fn on_start_capture(&self) {
        let mut g = self.state.lock().unwrap();
        if *g == CaptureState::Idle {
            *g = CaptureState::Starting;
        }
    }

    pub fn on_interface_ready(&self) {
        let mut g = self.state.lock().unwrap();
        if *g == CaptureState::Starting {
            *g = CaptureState::Running;
        }
    }

    pub fn on_pause(&self) {
        let mut g = self.state.lock().unwrap();
        if *g == CaptureState::Running {
            *g = CaptureState::Paused;
        }
    }

    pub fn on_resume(&self) {
        let mut g = self.state.lock().unwrap();
        if *g == CaptureState::Paused {
            *g = CaptureState::Running;
        }
    }

    pub fn on_stop_capture(&self) {
        let mut g = self.state.lock().unwrap();
        if matches!(*g, CaptureState::Running | CaptureState::Paused) {
            *g = CaptureState::Stopping;
        }
    }

    pub fn on_save_and_restart_capture(&self) {
        let mut g = self.state.lock().unwrap();
        if matches!(*g, CaptureState::Running | CaptureState::Paused) {
            *g = CaptureState::Restarting;
        }
    }

    pub fn on_restart_complete(&self) {
        let mut g = self.state.lock().unwrap();
        if *g == CaptureState::Restarting {
            *g = CaptureState::Starting;
        }
    }

    /// Any state can transition to Error; aggregated state is left
    /// untouched, only the source halts (§4.J, §7).
    pub fn on_capture_error(&self) {
        *self.state.lock().unwrap() = CaptureState::Error;
    }

    pub fn on_stopped(&self) {
        let mut g = self.state.lock().unwrap();
        if *g == CaptureState::Stopping {
            *g = CaptureState::Idle;
        }
    }
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_legacy_pcap_http_exchange(path: &std::path::Path) {
        use etherparse::PacketBuilder;
        let mut f = std::fs::File::create(path).unwrap();
        let mut hdr = [0u8; 24];
        hdr[0..4].copy_from_slice(&0xA1B2C3D4u32.to_le_bytes());
        hdr[4..6].copy_from_slice(&2u16.to_le_bytes());
        hdr[6..8].copy_from_slice(&4u16.to_le_bytes());
        hdr[16..20].copy_from_slice(&65535u32.to_le_bytes());
        hdr[20..24].copy_from_slice(&1u32.to_le_bytes());
        f.write_all(&hdr).unwrap();

        let frames = [
            build_frame(12345, 80, b"GET /x HTTP/1.1\r\n"),
            build_frame(80, 12345, b"HTTP/1.1 200 OK\r\n"),
        ];
        for (i, frame) in frames.iter().enumerate() {
            let mut ph = [0u8; 16];
            ph[0..4].copy_from_slice(&(i as u32).to_le_bytes());
            ph[8..12].copy_from_slice(&(frame.len() as u32).to_le_bytes());
            ph[12..16].copy_from_slice(&(frame.len() as u32).to_le_bytes());
            f.write_all(&ph).unwrap();
            f.write_all(frame).unwrap();
        }

        fn build_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
            use etherparse::PacketBuilder;
            let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
                .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
                .tcp(src_port, dst_port, 1, 1024);
            let mut out = Vec::new();
            builder.write(&mut out, payload).unwrap();
            out
        }
        let _ = PacketBuilder::ethernet2;
    }

    #[test]
    fn packets_up_to_end_of_file_returns_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pcap");
        write_legacy_pcap_http_exchange(&path);
        let engine = ReplayEngine::load(&path).unwrap();
        let all = engine.full_replay();
        assert_eq!(all.len(), 2);
        let far_future = engine.packets_up_to(1_000_000.0);
        assert_eq!(far_future.len(), all.len());
    }

    fn append_arp_request(f: &mut std::fs::File, index: u32, sender_mac: [u8; 6], sender_ip: [u8; 4]) {
        let mut frame = vec![6, 5, 4, 3, 2, 1];
        frame.extend_from_slice(&sender_mac);
        frame.extend_from_slice(&0x0806u16.to_be_bytes());
        frame.extend_from_slice(&0x0001u16.to_be_bytes());
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.push(6);
        frame.push(4);
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.extend_from_slice(&sender_mac);
        frame.extend_from_slice(&sender_ip);
        frame.extend_from_slice(&[0u8; 6]);
        frame.extend_from_slice(&[0u8; 4]);

        let mut ph = [0u8; 16];
        ph[0..4].copy_from_slice(&index.to_le_bytes());
        ph[8..12].copy_from_slice(&(frame.len() as u32).to_le_bytes());
        ph[12..16].copy_from_slice(&(frame.len() as u32).to_le_bytes());
        f.write_all(&ph).unwrap();
        f.write_all(&frame).unwrap();
    }

    #[test]
    fn drive_up_to_detects_arp_ip_change_alongside_ip_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arp.pcap");
        let mut f = std::fs::File::create(&path).unwrap();
        let mut hdr = [0u8; 24];
        hdr[0..4].copy_from_slice(&0xA1B2C3D4u32.to_le_bytes());
        hdr[4..6].copy_from_slice(&2u16.to_le_bytes());
        hdr[6..8].copy_from_slice(&4u16.to_le_bytes());
        hdr[16..20].copy_from_slice(&65535u32.to_le_bytes());
        hdr[20..24].copy_from_slice(&1u32.to_le_bytes());
        f.write_all(&hdr).unwrap();

        let mac = [9, 9, 9, 9, 9, 9];
        append_arp_request(&mut f, 0, mac, [10, 0, 0, 1]);
        append_arp_request(&mut f, 1, mac, [10, 0, 0, 2]);
        drop(f);

        let engine = ReplayEngine::load(&path).unwrap();
        let shutdown = Arc::new(crate::util::BarrierFlag::default());
        let mut pipeline = ReplayPipeline::new(
            Arc::new(Aggregator::new()),
            Arc::new(PacketRing::new(100)),
            Arc::new(StreamManager::new(10, 500, 1024 * 1024)),
            Arc::new(ThreatDetector::new()),
            DnsResolver::new(1, 1, shutdown),
            Arc::new(LifetimeStats::default()),
        );
        engine.drive_full(&mut pipeline);
        let alerts = pipeline.threats.alerts();
        assert!(alerts.iter().any(|a| a.kind == "ARP IP Change"));
    }

    #[test]
    fn drive_full_reconstructs_one_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pcap");
        write_legacy_pcap_http_exchange(&path);
        let engine = ReplayEngine::load(&path).unwrap();

        let shutdown = Arc::new(crate::util::BarrierFlag::default());
        let mut pipeline = ReplayPipeline::new(
            Arc::new(Aggregator::new()),
            Arc::new(PacketRing::new(100)),
            Arc::new(StreamManager::new(10, 500, 1024 * 1024)),
            Arc::new(ThreatDetector::new()),
            DnsResolver::new(1, 1, shutdown),
            Arc::new(LifetimeStats::default()),
        );
        let snapshot = engine.drive_full(&mut pipeline);
        assert_eq!(snapshot.summary.total_packets, 2);
        assert_eq!(pipeline.streams.len(), 1);
    }

    #[test]
    fn state_machine_follows_the_documented_transitions() {
        let ctl = CaptureController::new();
        assert_eq!(ctl.state(), CaptureState::Idle);
        ctl.on_start_capture();
        assert_eq!(ctl.state(), CaptureState::Starting);
        ctl.on_interface_ready();
        assert_eq!(ctl.state(), CaptureState::Running);
        ctl.on_pause();
        assert_eq!(ctl.state(), CaptureState::Paused);
        ctl.on_resume();
        assert_eq!(ctl.state(), CaptureState::Running);
        ctl.on_save_and_restart_capture();
        assert_eq!(ctl.state(), CaptureState::Restarting);
        ctl.on_restart_complete();
        assert_eq!(ctl.state(), CaptureState::Starting);
    }

    #[test]
    fn capture_error_is_reachable_from_any_state() {
        let ctl = CaptureController::new();
        ctl.on_capture_error();
        assert_eq!(ctl.state(), CaptureState::Error);
    }

    #[test]
    fn stop_then_stopped_returns_to_idle() {
        let ctl = CaptureController::new();
        ctl.on_start_capture();
        ctl.on_interface_ready();
        ctl.on_stop_capture();
        assert_eq!(ctl.state(), CaptureState::Stopping);
        ctl.on_stopped();
        assert_eq!(ctl.state(), CaptureState::Idle);
    }
}
