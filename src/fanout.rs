// src/fanout.rs
//! Fanout Hub (§4.I): observer session registry and WebSocket dispatch.
//!
//! Built on `tungstenite::accept_hdr` + one OS thread per connection, the
//! same shape as the teacher's `ws_server.rs` (`run_ws_listener`/
//! `handle_client`), generalized from a fixed A/B channel pair to an
//! arbitrary, mutex-guarded observer set (§5: "the session registry is
//! mutex-guarded; per-session state is owned by the dispatcher"). Each
//! session gets its own bounded `crossbeam_channel` outbound queue; a full
//! queue during a publish drops the oldest entry rather than blocking the
//! hub (§4.I backpressure policy).

use crate::batcher::Snapshot;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tungstenite::{accept_hdr, Message, WebSocket};

const SESSION_QUEUE_DEPTH_DEFAULT: usize = 32;

/// Commands a session may send to the hub (§4.I, §6: client -> server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartCapture,
    StopCapture,
    SaveAndRestartCapture,
}

fn parse_command(text: &str) -> Option<Command> {
    let v: Value = serde_json::from_str(text).ok()?;
    match v.get("type")?.as_str()? {
        "start_capture" => Some(Command::StartCapture),
        "stop_capture" => Some(Command::StopCapture),
        "save_and_restart_capture" => Some(Command::SaveAndRestartCapture),
        _ => None,
    }
}

/// Events pushed to sessions (§4.I).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "interface_ready")]
    InterfaceReady,
    #[serde(rename = "capture_started")]
    CaptureStarted,
    #[serde(rename = "capture_stopped")]
    CaptureStopped,
    #[serde(rename = "capture_restarted")]
    CaptureRestarted,
    #[serde(rename = "pcap_saved")]
    PcapSaved { filename: String, packet_count: u64 },
    #[serde(rename = "packet_batch")]
    PacketBatch {
        packets: Vec<crate::decode::PacketRecord>,
        count: usize,
        nodes: Vec<crate::graph::Node>,
        edges: Vec<crate::graph::Edge>,
        #[serde(rename = "totalCaptured")]
        total_captured: u64,
        #[serde(rename = "dnsCache")]
        dns_cache: HashMap<String, String>,
        statistics: crate::batcher::SnapshotSummary,
    },
    #[serde(rename = "capture_error")]
    CaptureError { message: String },
}

impl Event {
    pub fn from_snapshot(s: Snapshot) -> Self {
        Event::PacketBatch {
            count: s.packets.len(),
            total_captured: s.summary.total_packets,
            packets: s.packets,
            nodes: s.nodes,
            edges: s.edges,
            dns_cache: s.hostname_cache_delta,
            statistics: s.summary,
        }
    }
}

struct Session {
    id: u64,
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

struct Registry {
    sessions: HashMap<u64, Session>,
    capture_running: bool,
}

/// The observer session registry plus command intake, shared between the
/// listener thread, dispatcher threads, and the capture controller.
pub struct FanoutHub {
    registry: Mutex<Registry>,
    next_session_id: AtomicU64,
    command_tx: Sender<Command>,
    command_rx: Receiver<Command>,
    queue_depth: usize,
}

impl FanoutHub {
    pub fn new(queue_depth: usize) -> Arc<Self> {
        let (command_tx, command_rx) = bounded(256);
        Arc::new(Self {
            registry: Mutex::new(Registry { sessions: HashMap::new(), capture_running: false }),
            next_session_id: AtomicU64::new(1),
            command_tx,
            command_rx,
            queue_depth: if queue_depth == 0 { SESSION_QUEUE_DEPTH_DEFAULT } else { queue_depth },
        })
    }

    /// Commands received from any session, drained by the capture controller.
    pub fn commands(&self) -> Receiver<Command> {
        self.command_rx.clone()
    }

    pub fn set_capture_running(&self, running: bool) {
        self.registry.lock().unwrap().capture_running = running;
    }

    /// Join event (§4.I): registers the session and, per the startup
    /// interlock, withholds `interface_ready` if a capture is already
    /// running — the new session synthesizes state from `packet_batch`.
    fn join(&self, tx: Sender<Message>, rx: Receiver<Message>) -> (u64, bool) {
        let mut g = self.registry.lock().unwrap();
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let capture_already_running = g.capture_running;
        g.sessions.insert(id, Session { id, tx, rx });
        (id, capture_already_running)
    }

    fn leave(&self, id: u64) {
        self.registry.lock().unwrap().sessions.remove(&id);
    }

    fn send_to(&self, id: u64, message: Message) {
        let g = self.registry.lock().unwrap();
        if let Some(session) = g.sessions.get(&id) {
            push_with_backpressure(&session.tx, &session.rx, message);
        }
    }

    /// Publish one event to every connected session (snapshot-delivered,
    /// or any lifecycle/control event); laggy sessions drop their oldest
    /// queued message rather than block this call (§4.I).
    pub fn broadcast(&self, event: &Event) {
        let payload = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to serialize fanout event: {e}");
                return;
            }
        };
        let g = self.registry.lock().unwrap();
        for session in g.sessions.values() {
            push_with_backpressure(&session.tx, &session.rx, Message::Text(payload.clone()));
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().unwrap().sessions.len()
    }
}

/// Try to enqueue; if the session's outbound queue is full, evict the
/// oldest queued message via the paired `Receiver` and retry, matching
/// §4.I's "drop the oldest queued snapshot for that session rather than
/// blocking the publish". The freshest state always wins.
fn push_with_backpressure(tx: &Sender<Message>, rx: &Receiver<Message>, message: Message) {
    match tx.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => {
            let _ = rx.try_recv();
            let _ = tx.try_send(message);
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Run the WebSocket listener loop: accept connections, spawn one
/// dispatcher thread per session (§EXPANSION 4.I.1).
pub fn run_listener(hub: Arc<FanoutHub>, bind_addr: &str, shutdown: Arc<crate::util::BarrierFlag>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr)?;
    listener.set_nonblocking(true)?;
    log::info!("fanout hub listening on {bind_addr}");

    while !shutdown.is_raised() {
        match listener.accept() {
            Ok((stream, addr)) => {
                let hub = hub.clone();
                let shutdown = shutdown.clone();
                thread::Builder::new()
                    .name(format!("observer-{addr}"))
                    .spawn(move || handle_session(hub, stream, shutdown))
                    .expect("spawn observer dispatcher");
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!("observer accept error: {e}");
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
    Ok(())
}

fn handle_session(hub: Arc<FanoutHub>, stream: TcpStream, shutdown: Arc<crate::util::BarrierFlag>) {
    stream.set_nonblocking(false).ok();
    let mut ws: WebSocket<TcpStream> = match accept_hdr(stream, |req: &tungstenite::handshake::server::Request, resp| {
        log::debug!("observer handshake {}", req.uri());
        Ok(resp)
    }) {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("observer handshake failed: {e}");
            return;
        }
    };
    ws.get_mut().set_read_timeout(Some(Duration::from_millis(200))).ok();

    let (tx, rx) = bounded::<Message>(hub.queue_depth);
    let (id, capture_already_running) = hub.join(tx, rx.clone());
    if !capture_already_running {
        hub.send_to(id, event_message(&Event::InterfaceReady));
    }

    loop {
        if shutdown.is_raised() {
            let _ = ws.send(event_message(&Event::CaptureStopped));
            break;
        }

        while let Ok(message) = rx.try_recv() {
            if ws.send(message).is_err() {
                hub.leave(id);
                return;
            }
        }

        match ws.read() {
            Ok(Message::Text(text)) => {
                if let Some(command) = parse_command(&text) {
                    let _ = hub.command_tx.try_send(command);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }
    }
    hub.leave(id);
}

fn event_message(event: &Event) -> Message {
    Message::Text(serde_json::to_string(event).expect("event always serializes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_withholds_interface_ready_when_capture_already_running() {
        let hub = FanoutHub::new(4);
        hub.set_capture_running(true);
        let (tx, rx) = bounded::<Message>(4);
        let (_id, already_running) = hub.join(tx, rx);
        assert!(already_running);
    }

    #[test]
    fn join_reports_not_running_for_first_session() {
        let hub = FanoutHub::new(4);
        let (tx, rx) = bounded::<Message>(4);
        let (_id, already_running) = hub.join(tx, rx);
        assert!(!already_running);
    }

    #[test]
    fn leave_removes_session_from_registry() {
        let hub = FanoutHub::new(4);
        let (tx, rx) = bounded::<Message>(4);
        let (id, _) = hub.join(tx, rx);
        assert_eq!(hub.session_count(), 1);
        hub.leave(id);
        assert_eq!(hub.session_count(), 0);
    }

    #[test]
    fn broadcast_drops_oldest_rather_than_blocking_when_queue_is_full() {
        let hub = FanoutHub::new(1);
        let (tx, rx) = bounded::<Message>(1);
        let (_id, _) = hub.join(tx, rx.clone());
        hub.broadcast(&Event::CaptureStarted);
        hub.broadcast(&Event::CaptureStopped);
        // queue depth 1: the full queue must evict the oldest entry
        // (CaptureStarted) so the newest (CaptureStopped) is retained.
        // The freshest state wins, never the stalest.
        let received = rx.try_recv();
        assert!(matches!(received, Ok(Message::Text(ref s)) if s.contains("capture_stopped")));
    }

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_command(r#"{"type":"start_capture"}"#), Some(Command::StartCapture));
        assert_eq!(parse_command(r#"{"type":"stop_capture"}"#), Some(Command::StopCapture));
        assert_eq!(
            parse_command(r#"{"type":"save_and_restart_capture"}"#),
            Some(Command::SaveAndRestartCapture)
        );
        assert_eq!(parse_command(r#"{"type":"bogus"}"#), None);
    }
}
