// src/bin/replay_cli.rs
//! Operator tool: drive the Replay Engine over a capture file up to a given
//! offset (or the whole file) and print the resulting snapshot as JSON.
//! Argv-based, matching the other single-purpose bins in this workspace.

use observatory::batcher::LifetimeStats;
use observatory::graph::Aggregator;
use observatory::replay::{ReplayEngine, ReplayPipeline};
use observatory::resolver::DnsResolver;
use observatory::ring::PacketRing;
use observatory::streams::StreamManager;
use observatory::threats::ThreatDetector;
use observatory::util::BarrierFlag;
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: replay_cli <capture.pcap> [offset_seconds]");
        std::process::exit(2);
    }
    let path = PathBuf::from(&args[1]);
    let offset: Option<f64> = args.get(2).and_then(|s| s.parse().ok());

    let engine = ReplayEngine::load(&path)?;
    eprintln!("loaded {} records starting at ts={}", engine.len(), engine.start_ts());

    let shutdown = Arc::new(BarrierFlag::default());
    let mut pipeline = ReplayPipeline::new(
        Arc::new(Aggregator::new()),
        Arc::new(PacketRing::new(10_000)),
        Arc::new(StreamManager::new(1000, 500, 1024 * 1024)),
        Arc::new(ThreatDetector::new()),
        DnsResolver::new(4, 1, shutdown.clone()),
        Arc::new(LifetimeStats::default()),
    );

    let snapshot = match offset {
        Some(offset) => engine.drive_up_to(offset, &mut pipeline),
        None => engine.drive_full(&mut pipeline),
    };

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    shutdown.raise();
    Ok(())
}
