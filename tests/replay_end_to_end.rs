// tests/replay_end_to_end.rs
//! Multi-component integration tests driving a capture file through the
//! full write -> load -> replay -> snapshot path, mirroring
//! `liveshark-core/tests/` in shape: each test exercises several modules
//! together rather than one unit in isolation.

use etherparse::PacketBuilder;
use observatory::batcher::LifetimeStats;
use observatory::capture::writer::{self, RawFrame};
use observatory::graph::Aggregator;
use observatory::replay::{ReplayEngine, ReplayPipeline};
use observatory::resolver::DnsResolver;
use observatory::ring::PacketRing;
use observatory::streams::StreamManager;
use observatory::threats::ThreatDetector;
use observatory::util::BarrierFlag;
use std::net::Ipv4Addr;
use std::sync::Arc;

fn tcp_frame(src_ip: [u8; 4], dst_ip: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    // SYN set: the port-scan rule (§4.G) only counts "TCP packets bearing
    // flags", so every synthesized frame here carries a non-zero flags byte.
    let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
        .ipv4(src_ip, dst_ip, 64)
        .tcp(src_port, dst_port, 1, 1024)
        .syn();
    let mut out = Vec::new();
    builder.write(&mut out, payload).unwrap();
    out
}

fn fresh_pipeline() -> ReplayPipeline {
    let shutdown = Arc::new(BarrierFlag::default());
    ReplayPipeline::new(
        Arc::new(Aggregator::new()),
        Arc::new(PacketRing::new(10_000)),
        Arc::new(StreamManager::new(1000, 500, 1024 * 1024)),
        Arc::new(ThreatDetector::new()),
        DnsResolver::new(2, 1, shutdown),
        Arc::new(LifetimeStats::default()),
    )
}

/// A capture session's raw-frame buffer, written atomically by the writer,
/// must come back out through the Replay Engine byte-for-byte equivalent
/// to what went in, and then fully drive the aggregator/stream pipeline —
/// exercising `capture::writer`, `capture::pcap_file`, `replay`, `graph`
/// and `streams` together.
#[test]
fn written_capture_file_replays_into_a_consistent_graph_and_stream() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.pcap");

    let frames = vec![
        RawFrame { ts: 1000.0, data: tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 51000, 80, b"GET /index.html HTTP/1.1\r\n") },
        RawFrame { ts: 1000.2, data: tcp_frame([10, 0, 0, 2], [10, 0, 0, 1], 80, 51000, b"HTTP/1.1 200 OK\r\n") },
    ];
    writer::write_atomic(&path, &frames).unwrap();

    let engine = ReplayEngine::load(&path).unwrap();
    assert_eq!(engine.len(), 2);

    let mut pipeline = fresh_pipeline();
    let snapshot = engine.drive_full(&mut pipeline);

    assert_eq!(snapshot.summary.total_packets, 2);
    assert_eq!(snapshot.nodes.len(), 2);
    // One directed edge per traffic direction: the request (A->B) and the
    // response (B->A) key to distinct edges (§4.D edges are directional).
    assert_eq!(snapshot.edges.len(), 2);
    assert_eq!(pipeline.streams.len(), 1);

    let info = pipeline.streams.list().into_iter().next().unwrap();
    assert_eq!(info.summary, "GET /index.html");
}

/// A port scan recorded to a capture file is detected identically whether
/// it is replayed in one shot (`drive_full`) or progressively up to an
/// offset that only covers part of the scan (`drive_up_to`), exercising
/// `writer`, `replay::ReplayEngine::cutoff_index` and `threats` together.
#[test]
fn port_scan_recorded_to_disk_is_detected_on_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scan.pcap");

    let attacker = [192, 168, 1, 50];
    let victim = [192, 168, 1, 60];
    let mut frames = Vec::new();
    for (i, port) in (9000..9015u16).enumerate() {
        frames.push(RawFrame { ts: 5000.0 + i as f64 * 0.01, data: tcp_frame(attacker, victim, 40000, port, b"") });
    }
    writer::write_atomic(&path, &frames).unwrap();

    let engine = ReplayEngine::load(&path).unwrap();

    // Only the first 5 connection attempts: below the port-scan threshold.
    let mut early_pipeline = fresh_pipeline();
    engine.drive_up_to(0.045, &mut early_pipeline);
    assert!(!early_pipeline
        .threats
        .alerts()
        .iter()
        .any(|a| a.kind == "Port Scan" && a.source == Ipv4Addr::from(attacker).to_string()));

    // The full capture crosses the threshold.
    let mut full_pipeline = fresh_pipeline();
    engine.drive_full(&mut full_pipeline);
    assert!(full_pipeline
        .threats
        .alerts()
        .iter()
        .any(|a| a.kind == "Port Scan" && a.source == Ipv4Addr::from(attacker).to_string()));
}

/// `save_and_restart_capture`'s on-disk artifact (§6.2) must itself be a
/// valid capture that a fresh Replay Engine can load and fully reconstruct,
/// independent of the live session that produced it — the flush path and
/// the replay path never diverge in file format.
#[test]
fn flushed_capture_file_is_independently_replayable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture-123.pcap");

    let frames: Vec<RawFrame> = (0..20)
        .map(|i| RawFrame {
            ts: 2000.0 + i as f64,
            data: tcp_frame([172, 16, 0, 1], [172, 16, 0, 2], 1200 + i as u16, 443, b"\x16\x03\x01"),
        })
        .collect();
    writer::write_atomic(&path, &frames).unwrap();
    assert!(path.exists());
    assert!(!dir.path().join("capture-123.pcap.partial").exists());

    let engine = ReplayEngine::load(&path).unwrap();
    assert_eq!(engine.len(), 20);
    let mut pipeline = fresh_pipeline();
    let snapshot = engine.drive_full(&mut pipeline);
    assert_eq!(snapshot.summary.total_packets, 20);
    // A single (src, dst) pair recurring across 20 packets merges into one
    // edge whose byte count sums every packet on the wire.
    assert_eq!(snapshot.edges.len(), 1);
}
