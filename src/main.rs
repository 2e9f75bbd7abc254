// src/main.rs
//! Process entrypoint: load config, wire the shared stores, spawn the
//! HTTP/WebSocket front doors and (in live or replay-file mode) drive the
//! capture-controller command loop until shutdown.

use clap::Parser;
use log::{error, info};
use observatory::batcher::LifetimeStats;
use observatory::config::AppConfig;
use observatory::fanout::{Command, Event, FanoutHub};
use observatory::graph::Aggregator;
use observatory::http::{self, HttpContext};
use observatory::replay::CaptureController;
use observatory::resolver::DnsResolver;
use observatory::ring::PacketRing;
use observatory::session::{CaptureSession, SessionHandles};
use observatory::streams::StreamManager;
use observatory::threats::ThreatDetector;
use observatory::util::{self, BarrierFlag};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Real-time network traffic observatory.
#[derive(Parser, Debug)]
#[command(name = "observatory", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Override `general.interface` from the command line.
    #[arg(long)]
    interface: Option<String>,
    /// Override `general.replay_file` from the command line.
    #[arg(long)]
    replay_file: Option<PathBuf>,
    /// Override `observer.bind` from the command line.
    #[arg(long)]
    bind: Option<String>,
    /// Override `observer.port` from the command line.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = AppConfig::from_file(&cli.config)?;
    if let Some(interface) = cli.interface {
        cfg.general.interface = Some(interface);
        cfg.general.replay_file = None;
    }
    if let Some(replay_file) = cli.replay_file {
        cfg.general.replay_file = Some(replay_file);
        cfg.general.interface = None;
    }
    if let Some(bind) = cli.bind {
        cfg.observer.bind = bind.parse()?;
    }
    if let Some(port) = cli.port {
        cfg.observer.port = port;
    }
    cfg.validate()?;

    init_logging(cfg.general.json_logs);
    info!("loaded config: {:?}", cfg);

    let shutdown = Arc::new(BarrierFlag::default());
    {
        let s = shutdown.clone();
        ctrlc::set_handler(move || s.raise())?;
    }
    util::install_pause_resume_handlers();

    std::fs::create_dir_all(&cfg.general.capture_dir)?;

    let aggregator = Arc::new(Aggregator::new());
    let ring = Arc::new(PacketRing::new(cfg.ring.capacity));
    let streams = Arc::new(StreamManager::new(cfg.streams.max_streams, cfg.streams.max_packets_per_stream, cfg.streams.max_payload_bytes));
    let threats = Arc::new(ThreatDetector::new());
    let resolver = DnsResolver::new(cfg.resolver.workers, cfg.resolver.timeout_secs, shutdown.clone());
    let stats = Arc::new(LifetimeStats::default());

    let hub = FanoutHub::new(cfg.observer.session_queue_depth);
    let controller = Arc::new(CaptureController::new());

    spawn_decay_sweep(aggregator.clone(), cfg.graph.clone(), shutdown.clone());

    let http_ctx = HttpContext { aggregator: aggregator.clone(), streams: streams.clone(), capture_dir: cfg.general.capture_dir.clone() };
    let http_bind = format!("{}:{}", cfg.observer.bind, cfg.http_bind_port());
    {
        let http_shutdown = shutdown.clone();
        thread::Builder::new()
            .name("http".into())
            .spawn(move || http::run_server(http_bind, http_ctx, http_shutdown))?;
    }

    {
        let hub = hub.clone();
        let ws_bind = format!("{}:{}", cfg.observer.bind, cfg.observer.port);
        let ws_shutdown = shutdown.clone();
        thread::Builder::new().name("fanout-listener".into()).spawn(move || {
            if let Err(e) = observatory::fanout::run_listener(hub, &ws_bind, ws_shutdown) {
                error!("fanout listener failed: {e}");
            }
        })?;
    }

    if let Some(replay_file) = cfg.general.replay_file.clone() {
        run_replay_only(&replay_file, &shutdown)?;
    } else {
        let interface = cfg.general.interface.clone().expect("validated: interface or replay_file is set");
        run_live(&interface, &cfg, hub, controller, SessionHandles { aggregator, ring, streams, threats, resolver, stats }, shutdown)?;
    }

    info!("clean shutdown");
    Ok(())
}

fn init_logging(json_logs: bool) {
    if json_logs {
        let mut b = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        b.format(|buf, record| {
            use std::io::Write;
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            writeln!(
                buf,
                "{{\"ts\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"msg\":\"{}\"}}",
                ts,
                record.level(),
                record.target(),
                record.args().to_string().replace('"', "'")
            )
        })
        .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
}

/// Periodic graph decay sweep (§4.D): evicts idle nodes/edges on a fixed
/// cadence, independent of the Packet Ring and Stream Manager.
fn spawn_decay_sweep(aggregator: Arc<Aggregator>, cfg: observatory::config::GraphCfg, shutdown: Arc<BarrierFlag>) {
    thread::Builder::new()
        .name("graph-decay".into())
        .spawn(move || {
            let interval = Duration::from_secs(cfg.decay_interval_secs.max(1));
            while !shutdown.is_raised() {
                thread::sleep(interval);
                if shutdown.is_raised() {
                    break;
                }
                let now = util::wall_timestamp_secs();
                let (nodes, edges) = aggregator.decay(now, cfg.node_decay_secs as f64, cfg.edge_decay_secs as f64);
                if nodes > 0 || edges > 0 {
                    info!("graph decay swept {nodes} nodes, {edges} edges");
                }
            }
        })
        .expect("spawn graph decay sweep");
}

/// Replay-file mode (§4.J): no Batcher, no capture controller; only
/// `/api/replay` serves on-demand snapshots until shutdown.
fn run_replay_only(_replay_file: &std::path::Path, shutdown: &Arc<BarrierFlag>) -> anyhow::Result<()> {
    info!("replay-only mode: serving /api/replay until shutdown");
    while !shutdown.is_raised() {
        thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}

fn run_live(
    interface: &str,
    cfg: &AppConfig,
    hub: Arc<FanoutHub>,
    controller: Arc<CaptureController>,
    handles: SessionHandles,
    shutdown: Arc<BarrierFlag>,
) -> anyhow::Result<()> {
    let commands = hub.commands();
    let mut session: Option<CaptureSession> = start_session(interface, cfg, &handles, &hub, &controller);

    {
        let controller = controller.clone();
        let poll_shutdown = shutdown.clone();
        thread::Builder::new().name("pause-resume-poll".into()).spawn(move || pause_resume_poll(controller, poll_shutdown))?;
    }

    while !shutdown.is_raised() {
        match commands.recv_timeout(Duration::from_millis(200)) {
            Ok(Command::StartCapture) => {
                if session.is_none() {
                    controller.on_start_capture();
                    session = start_session(interface, cfg, &handles, &hub, &controller);
                }
            }
            Ok(Command::StopCapture) => {
                controller.on_stop_capture();
                if let Some(s) = session.take() {
                    s.stop();
                }
                hub.set_capture_running(false);
                hub.broadcast(&Event::CaptureStopped);
                controller.on_stopped();
            }
            Ok(Command::SaveAndRestartCapture) => {
                controller.on_save_and_restart_capture();
                if let Some(s) = &session {
                    match s.flush_to_file(&cfg.general.capture_dir, util::wall_timestamp_secs()) {
                        Ok((filename, packet_count)) => {
                            handles.aggregator.clear();
                            handles.streams.clear();
                            handles.threats.clear();
                            handles.ring.clear();
                            handles.resolver.clear();
                            handles.stats.reset();
                            hub.broadcast(&Event::PcapSaved { filename, packet_count });
                            controller.on_restart_complete();
                            controller.on_interface_ready();
                            hub.broadcast(&Event::CaptureRestarted);
                        }
                        Err(e) => {
                            error!("failed to flush capture to disk: {e}");
                            hub.broadcast(&Event::CaptureError { message: e.to_string() });
                            controller.on_capture_error();
                        }
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(s) = session.take() {
        s.stop();
    }
    Ok(())
}

fn start_session(
    interface: &str,
    cfg: &AppConfig,
    handles: &SessionHandles,
    hub: &Arc<FanoutHub>,
    controller: &Arc<CaptureController>,
) -> Option<CaptureSession> {
    let session_handles = SessionHandles {
        aggregator: handles.aggregator.clone(),
        ring: handles.ring.clone(),
        streams: handles.streams.clone(),
        threats: handles.threats.clone(),
        resolver: handles.resolver.clone(),
        stats: handles.stats.clone(),
    };
    let hub_for_snapshots = hub.clone();
    match CaptureSession::start(interface, cfg, session_handles, move |snapshot| {
        hub_for_snapshots.broadcast(&Event::from_snapshot(snapshot));
    }) {
        Ok(session) => {
            hub.set_capture_running(true);
            controller.on_interface_ready();
            hub.broadcast(&Event::CaptureStarted);
            Some(session)
        }
        Err(e) => {
            error!("failed to start capture on {interface}: {e}");
            hub.broadcast(&Event::CaptureError { message: e.to_string() });
            controller.on_capture_error();
            None
        }
    }
}

/// Translates the raw signal-driven pause/resume flag into capture-controller
/// state transitions (§6: "pause and resume are delivered as user-defined
/// signals to the running process").
fn pause_resume_poll(controller: Arc<CaptureController>, shutdown: Arc<BarrierFlag>) {
    let mut was_paused = false;
    while !shutdown.is_raised() {
        let now_paused = util::is_paused();
        if now_paused && !was_paused {
            controller.on_pause();
        } else if !now_paused && was_paused {
            controller.on_resume();
        }
        was_paused = now_paused;
        thread::sleep(Duration::from_millis(100));
    }
}
