// src/session.rs
//! Wires one live-capture session: packet source → hashed decode/aggregate
//! workers → Stream Manager / Threat Detector / Graph Aggregator, plus the
//! batcher ticker and the raw-frame buffer backing `save_and_restart_capture`
//! (§4.J, §6.2).
//!
//! Thread-per-stage, generalized from the teacher's RX → merge → decode
//! wiring in `main.rs`: there, N per-channel RX workers feed one merge
//! thread feeding one decode thread; here, one capture thread feeds N
//! decode/aggregate workers, each bound to a dedicated channel chosen by
//! hashing the endpoint pair so per-pair order is preserved across workers
//! (§5).

use crate::batcher::{run_ticker, Batcher, LifetimeStats, Snapshot};
use crate::capture::live::LiveSource;
use crate::capture::writer::{self, RawFrame};
use crate::capture::{CaptureError, PacketSource};
use crate::config::AppConfig;
use crate::decode::{self, CaptureMeta, PacketRecord};
use crate::graph::Aggregator;
use crate::resolver::DnsResolver;
use crate::ring::PacketRing;
use crate::streams::StreamManager;
use crate::threats::ThreatDetector;
use crate::util::BarrierFlag;
use crossbeam_channel::{bounded, Sender};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const LIVE_SNAPLEN: i32 = 65_535;
const LIVE_TIMEOUT_MS: i32 = 200;

/// The shared stores a capture session feeds; owned by the caller (`main`)
/// so HTTP/WebSocket readers and the session itself see the same state.
pub struct SessionHandles {
    pub aggregator: Arc<Aggregator>,
    pub ring: Arc<PacketRing>,
    pub streams: Arc<StreamManager>,
    pub threats: Arc<ThreatDetector>,
    pub resolver: Arc<DnsResolver>,
    pub stats: Arc<LifetimeStats>,
}

/// A running live-capture session: the source thread, its hashed worker
/// pool, and the batcher ticker, plus the in-memory raw-frame buffer
/// `save_and_restart_capture` flushes to disk.
pub struct CaptureSession {
    local_shutdown: Arc<BarrierFlag>,
    source_handle: Option<thread::JoinHandle<()>>,
    worker_handles: Vec<thread::JoinHandle<()>>,
    batcher_handle: Option<thread::JoinHandle<()>>,
    raw_frames: Arc<Mutex<Vec<RawFrame>>>,
    packets_captured: Arc<AtomicU64>,
}

impl CaptureSession {
    /// Open `interface` and spin up its worker pool and batcher ticker.
    /// `on_snapshot` is called from the batcher thread for every
    /// non-coalesced tick (§4.H); it is expected to broadcast to the
    /// Fanout Hub.
    pub fn start(
        interface: &str,
        cfg: &AppConfig,
        handles: SessionHandles,
        on_snapshot: impl FnMut(Snapshot) + Send + 'static,
    ) -> Result<Self, CaptureError> {
        let mut source = LiveSource::open(interface, LIVE_SNAPLEN, LIVE_TIMEOUT_MS)?;

        let local_shutdown = Arc::new(BarrierFlag::default());
        let raw_frames: Arc<Mutex<Vec<RawFrame>>> = Arc::new(Mutex::new(Vec::new()));
        let packets_captured = Arc::new(AtomicU64::new(0));

        let worker_count = cfg.general.decoder_workers.max(1);
        let mut worker_txs = Vec::with_capacity(worker_count);
        let mut worker_handles = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let (tx, rx) = bounded::<PacketRecord>(cfg.general.channel_depth);
            worker_txs.push(tx);
            let aggregator = handles.aggregator.clone();
            let ring = handles.ring.clone();
            let streams = handles.streams.clone();
            let threats = handles.threats.clone();
            let resolver = handles.resolver.clone();
            let stats = handles.stats.clone();
            let shutdown = local_shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("decode-agg-{idx}"))
                .spawn(move || worker_loop(rx, aggregator, ring, streams, threats, resolver, stats, shutdown))
                .expect("spawn decode/aggregate worker");
            worker_handles.push(handle);
        }

        let payload_cap = cfg.capture.payload_cap_bytes;
        let source_shutdown = local_shutdown.clone();
        let source_raw_frames = raw_frames.clone();
        let source_packets_captured = packets_captured.clone();
        let source_threats = handles.threats.clone();
        let source_handle = thread::Builder::new()
            .name("capture-source".into())
            .spawn(move || {
                capture_loop(
                    &mut source,
                    &worker_txs,
                    payload_cap,
                    &source_raw_frames,
                    &source_packets_captured,
                    &source_threats,
                    &source_shutdown,
                )
            })
            .expect("spawn capture source");

        let batcher = Batcher::new(
            handles.aggregator.clone(),
            handles.ring.clone(),
            handles.resolver.clone(),
            handles.threats.clone(),
            handles.stats.clone(),
        );
        let batcher_shutdown = local_shutdown.clone();
        let interval = Duration::from_secs_f64(cfg.batcher.interval_secs.max(0.01));
        let max_packets = cfg.batcher.max_packets;
        let batcher_handle = thread::Builder::new()
            .name("batcher".into())
            .spawn(move || run_ticker(batcher, interval, max_packets, batcher_shutdown, crate::util::wall_timestamp_secs, on_snapshot))
            .expect("spawn batcher");

        Ok(Self {
            local_shutdown,
            source_handle: Some(source_handle),
            worker_handles,
            batcher_handle: Some(batcher_handle),
            raw_frames,
            packets_captured,
        })
    }

    pub fn packet_count(&self) -> u64 {
        self.packets_captured.load(Ordering::Relaxed)
    }

    /// Flush the buffered raw frames to `<capture>-<timestamp>.pcap`
    /// atomically without stopping the session's threads (§6.2): the
    /// session keeps running against now-empty shared stores, which the
    /// caller clears separately.
    pub fn flush_to_file(&self, capture_dir: &Path, timestamp_secs: f64) -> anyhow::Result<(String, u64)> {
        let filename = format!("capture-{}.pcap", timestamp_secs as u64);
        let path = capture_dir.join(&filename);
        let frames = std::mem::take(&mut *self.raw_frames.lock().unwrap());
        let count = frames.len() as u64;
        writer::write_atomic(&path, &frames)?;
        Ok((filename, count))
    }

    /// Signal every thread in the session to stop and join them.
    pub fn stop(mut self) {
        self.local_shutdown.raise();
        if let Some(h) = self.source_handle.take() {
            let _ = h.join();
        }
        for h in self.worker_handles.drain(..) {
            let _ = h.join();
        }
        if let Some(h) = self.batcher_handle.take() {
            let _ = h.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_loop(
    source: &mut LiveSource,
    worker_txs: &[Sender<PacketRecord>],
    payload_cap: usize,
    raw_frames: &Arc<Mutex<Vec<RawFrame>>>,
    packets_captured: &Arc<AtomicU64>,
    threats: &Arc<ThreatDetector>,
    shutdown: &Arc<BarrierFlag>,
) {
    let worker_count = worker_txs.len().max(1);
    while !shutdown.is_raised() {
        // Pausing stops draining the source entirely; the OS kernel ring
        // buffer absorbs backlog until resume (§5, capture::live::pause).
        if crate::util::is_paused() {
            thread::sleep(Duration::from_millis(100));
            continue;
        }
        match source.next_packet() {
            Ok(Some(event)) => {
                raw_frames.lock().unwrap().push(RawFrame { ts: event.ts, data: event.data.clone() });
                let meta = CaptureMeta { ts: event.ts, capture_length: event.data.len() as u32, original_length: event.data.len() as u32 };
                match decode::decode(meta, event.link, &event.data, payload_cap) {
                    Some(record) => {
                        packets_captured.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::inc_packets_processed();
                        let worker = endpoint_hash(&record) % worker_count;
                        let _ = worker_txs[worker].try_send(record);
                    }
                    // `decode` only recognizes frames with an IP network layer;
                    // ARP frames fall through here and feed the ARP IP Change
                    // rule directly instead of the decode/aggregate workers.
                    None => match decode::parse_arp_sender(&event.data) {
                        Some((sender_ip, sender_mac)) => threats.observe_arp(sender_ip, sender_mac, event.ts),
                        None => crate::metrics::inc_decode_failures(),
                    },
                }
            }
            Ok(None) => continue,
            Err(CaptureError::Transient(e)) => log::warn!("transient capture error: {e}"),
            Err(e) => {
                log::error!("capture source failed, halting session: {e}");
                break;
            }
        }
    }
}

/// Hash the direction-independent endpoint pair to a worker index, so a
/// single worker sees every packet of a given src/dst pair in source order
/// (§5 "per-endpoint-pair order is preserved by hashing src/dst").
fn endpoint_hash(p: &PacketRecord) -> usize {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let (a, b) = if p.src_ip <= p.dst_ip { (p.src_ip, p.dst_ip) } else { (p.dst_ip, p.src_ip) };
    let mut hasher = DefaultHasher::new();
    a.hash(&mut hasher);
    b.hash(&mut hasher);
    hasher.finish() as usize
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    rx: crossbeam_channel::Receiver<PacketRecord>,
    aggregator: Arc<Aggregator>,
    ring: Arc<PacketRing>,
    streams: Arc<StreamManager>,
    threats: Arc<ThreatDetector>,
    resolver: Arc<DnsResolver>,
    stats: Arc<LifetimeStats>,
    shutdown: Arc<BarrierFlag>,
) {
    while !shutdown.is_raised() {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(packet) => {
                stats.record_packet(&packet);
                streams.add_packet(&packet);
                threats.observe_packet(&packet);

                let src_host = resolver.resolve(packet.src_ip);
                let dst_host = resolver.resolve(packet.dst_ip);
                let src_hostname = (src_host != packet.src_ip.to_string()).then_some(src_host.as_str());
                let dst_hostname = (dst_host != packet.dst_ip.to_string()).then_some(dst_host.as_str());

                let src_id = aggregator.upsert_node(&packet.src_ip.to_string(), src_hostname, packet.length as u64, true, packet.ts);
                let dst_id = aggregator.upsert_node(&packet.dst_ip.to_string(), dst_hostname, packet.length as u64, false, packet.ts);
                aggregator.record_node_protocol(&src_id, &crate::graph::app_tag_label(packet.app_protocol));
                aggregator.upsert_edge(&src_id, &dst_id, packet.app_protocol, packet.length as u64, packet.ts);

                ring.append(packet);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}
