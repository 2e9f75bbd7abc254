// src/http.rs
//! Synchronous HTTP endpoints (§6): graph/stream snapshots and capture-file
//! management, served alongside the WebSocket observer protocol.
//!
//! Built on `tiny_http`, the same one-thread, `server.recv()`-loop shape the
//! teacher uses for its `/metrics` exporter in `metrics.rs::spawn_http`,
//! generalized here from a single `/metrics` route to the full `/api/*`
//! surface plus `/metrics` itself.

use crate::capture::pcap_file::PcapFileSource;
use crate::graph::Aggregator;
use crate::replay::{ReplayEngine, ReplayPipeline};
use crate::resolver::DnsResolver;
use crate::ring::PacketRing;
use crate::streams::StreamManager;
use crate::threats::ThreatDetector;
use crate::util::BarrierFlag;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use url::Url;

const MAX_REPLAY_OFFSET_SECS: f64 = 86_400.0 * 365.0;
const MAX_STREAM_ID_LEN: usize = 200;
const FORBIDDEN_STREAM_ID_CHARS: [char; 5] = ['<', '>', '"', '\'', '&'];

/// Shared read-only handles the HTTP endpoints query; no endpoint mutates
/// pipeline state, so everything here is `Arc`-cloned and lock-free at the
/// route level (locking, where needed, happens inside the component).
#[derive(Clone)]
pub struct HttpContext {
    pub aggregator: Arc<Aggregator>,
    pub streams: Arc<StreamManager>,
    pub capture_dir: PathBuf,
}

pub fn run_server(bind_addr: String, ctx: HttpContext, shutdown: Arc<BarrierFlag>) {
    let server = match tiny_http::Server::http(&bind_addr) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to bind http observer endpoint on {bind_addr}: {e}");
            return;
        }
    };
    log::info!("http endpoints listening on http://{bind_addr}");

    loop {
        if shutdown.is_raised() {
            return;
        }
        let req = match server.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(Some(req)) => req,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("http accept error: {e}");
                continue;
            }
        };
        let ctx = ctx.clone();
        thread::Builder::new()
            .name("observer-http".into())
            .spawn(move || dispatch(req, &ctx))
            .ok();
    }
}

fn dispatch(req: tiny_http::Request, ctx: &HttpContext) {
    let full_url = format!("http://localhost{}", req.url());
    let parsed = Url::parse(&full_url);
    let path = parsed.as_ref().map(|u| u.path().to_string()).unwrap_or_else(|_| req.url().to_string());

    let response = match path.as_str() {
        "/api/graph" => handle_graph(ctx),
        "/api/pcaps" => handle_pcaps(ctx),
        "/api/replay" => handle_replay(ctx, parsed.ok()),
        "/api/download" => handle_download(ctx),
        "/api/streams" => handle_streams(ctx, parsed.ok()),
        "/api/stream" => handle_stream(ctx, parsed.ok()),
        "/api/streams/stats" => handle_stream_stats(ctx),
        "/metrics" => handle_metrics(),
        _ => HttpResponse::status(404),
    };
    respond(req, response);
}

/// A small in-memory response the route handlers build, decoupled from
/// `tiny_http::Response`'s generic-over-reader-type signature so every
/// handler can return the same concrete type.
struct HttpResponse {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl HttpResponse {
    fn status(status: u16) -> Self {
        Self { status, content_type: "text/plain; charset=utf-8", body: Vec::new() }
    }

    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self { status: 200, content_type: "application/json", body },
            Err(e) => {
                log::error!("failed to serialize http response: {e}");
                Self::status(500)
            }
        }
    }

    fn text(status: u16, body: impl Into<String>) -> Self {
        Self { status, content_type: "text/plain; charset=utf-8", body: body.into().into_bytes() }
    }
}

fn respond(req: tiny_http::Request, response: HttpResponse) {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], response.content_type.as_bytes())
        .expect("content-type header is always valid ASCII");
    let http_response = tiny_http::Response::from_data(response.body)
        .with_status_code(response.status)
        .with_header(header);
    let _ = req.respond(http_response);
}

fn query_param(url: &Option<Url>, key: &str) -> Option<String> {
    url.as_ref()?.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}

fn handle_graph(ctx: &HttpContext) -> HttpResponse {
    HttpResponse::json(&ctx.aggregator.snapshot())
}

#[derive(Serialize)]
struct PcapFileInfo {
    filename: String,
    path: String,
    size: u64,
    packet_count: u64,
    start_time: f64,
    end_time: f64,
    duration_sec: f64,
    mod_time: u64,
}

fn handle_pcaps(ctx: &HttpContext) -> HttpResponse {
    let mut entries = Vec::new();
    let dir = match fs::read_dir(&ctx.capture_dir) {
        Ok(dir) => dir,
        Err(e) => {
            log::warn!("could not list capture dir {:?}: {e}", ctx.capture_dir);
            return HttpResponse::json(&Vec::<PcapFileInfo>::new());
        }
    };
    for entry in dir.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pcap") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let mod_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let (packet_count, start_time, end_time) = match PcapFileSource::open(&path).and_then(|s| s.read_all()) {
            Ok(events) => {
                let start = events.first().map(|e| e.ts).unwrap_or(0.0);
                let end = events.last().map(|e| e.ts).unwrap_or(start);
                (events.len() as u64, start, end)
            }
            Err(e) => {
                log::warn!("could not read capture file {path:?} for metadata: {e}");
                (0, 0.0, 0.0)
            }
        };

        entries.push(PcapFileInfo {
            filename: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            path: path.to_string_lossy().into_owned(),
            size: meta.len(),
            packet_count,
            start_time,
            end_time,
            duration_sec: (end_time - start_time).max(0.0),
            mod_time,
        });
    }
    entries.sort_by(|a, b| b.mod_time.cmp(&a.mod_time));
    HttpResponse::json(&entries)
}

/// Resolve `filename` against the capture directory, rejecting anything
/// that doesn't match `^[A-Za-z0-9_.-]+\.pcap$` or that would land outside
/// the directory once canonicalized (§6).
fn resolve_capture_file(capture_dir: &Path, filename: &str) -> Result<PathBuf, u16> {
    let valid_chars = filename.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
    if filename.is_empty() || !valid_chars || !filename.ends_with(".pcap") || filename == ".pcap" {
        return Err(400);
    }
    let candidate = capture_dir.join(filename);
    let canonical_dir = capture_dir.canonicalize().map_err(|_| 400_u16)?;
    let canonical_file = candidate.canonicalize().map_err(|_| 400_u16)?;
    if !canonical_file.starts_with(&canonical_dir) {
        return Err(403);
    }
    Ok(canonical_file)
}

fn handle_replay(ctx: &HttpContext, url: Option<Url>) -> HttpResponse {
    let Some(filename) = query_param(&url, "filename") else {
        return HttpResponse::text(400, "missing filename");
    };
    let offset: f64 = match query_param(&url, "offset").and_then(|s| s.parse().ok()) {
        Some(o) if (0.0..=MAX_REPLAY_OFFSET_SECS).contains(&o) => o,
        Some(_) => return HttpResponse::text(400, "offset out of range"),
        None => 0.0,
    };

    let path = match resolve_capture_file(&ctx.capture_dir, &filename) {
        Ok(p) => p,
        Err(status) => return HttpResponse::text(status, "invalid filename"),
    };

    let engine = match ReplayEngine::load(&path) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("failed to load replay file {path:?}: {e}");
            return HttpResponse::text(400, "could not read capture file");
        }
    };

    // One-off pipeline scoped to this request: replay snapshots are
    // computed on demand and never shared with the live/replay-daemon
    // state (§4.J "the new session begins with no shared state").
    let shutdown = Arc::new(BarrierFlag::default());
    let mut pipeline = ReplayPipeline::new(
        Arc::new(Aggregator::new()),
        Arc::new(PacketRing::new(10_000)),
        Arc::new(StreamManager::new(1000, 500, 1024 * 1024)),
        Arc::new(ThreatDetector::new()),
        DnsResolver::new(0, 1, shutdown),
        Arc::new(crate::batcher::LifetimeStats::default()),
    );
    let snapshot = engine.drive_up_to(offset, &mut pipeline);
    HttpResponse::json(&snapshot)
}

fn handle_download(ctx: &HttpContext) -> HttpResponse {
    let dir = match fs::read_dir(&ctx.capture_dir) {
        Ok(dir) => dir,
        Err(_) => return HttpResponse::text(404, "no capture directory"),
    };
    let newest = dir
        .flatten()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("pcap"))
        .filter_map(|e| e.metadata().ok().and_then(|m| m.modified().ok()).map(|t| (t, e.path())))
        .max_by_key(|(t, _)| *t);

    let Some((_, path)) = newest else {
        return HttpResponse::text(404, "no capture files available");
    };
    match fs::read(&path) {
        Ok(body) => HttpResponse { status: 200, content_type: "application/vnd.tcpdump.pcap", body },
        Err(e) => {
            log::error!("failed to read capture file {path:?}: {e}");
            HttpResponse::status(500)
        }
    }
}

fn handle_streams(ctx: &HttpContext, url: Option<Url>) -> HttpResponse {
    match query_param(&url, "protocol") {
        Some(protocol) => HttpResponse::json(&ctx.streams.list_by_protocol(&protocol)),
        None => HttpResponse::json(&ctx.streams.list()),
    }
}

fn handle_stream(ctx: &HttpContext, url: Option<Url>) -> HttpResponse {
    let Some(id) = query_param(&url, "id") else {
        return HttpResponse::text(400, "missing id");
    };
    if id.len() > MAX_STREAM_ID_LEN || id.chars().any(|c| FORBIDDEN_STREAM_ID_CHARS.contains(&c)) {
        return HttpResponse::text(400, "invalid stream id");
    }
    match ctx.streams.get(&id) {
        Some(detail) => HttpResponse::json(&detail),
        None => HttpResponse::status(404),
    }
}

fn handle_stream_stats(ctx: &HttpContext) -> HttpResponse {
    HttpResponse::json(&ctx.streams.stats_by_protocol())
}

fn handle_metrics() -> HttpResponse {
    HttpResponse { status: 200, content_type: "text/plain; version=0.0.4", body: crate::metrics::gather_text() }
}
