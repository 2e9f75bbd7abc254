// src/capture/live.rs
//! Live interface capture via the `pcap` crate (§4.A), grounded on the
//! sniffnet-derived `network_monitor` module's `Device::list`/
//! `Capture::open`/`cap.next_packet()` shape — generalized here to the
//! `PacketSource` trait so the Decoder and Replay Engine share one
//! interface (§EXPANSION 4.J.1).

use std::time::{SystemTime, UNIX_EPOCH};

use pcap::{Active, Capture, Device};

use super::{CaptureError, PacketEvent, PacketSource};
use crate::decode::LinkType;

pub struct LiveSource {
    capture: Capture<Active>,
}

impl LiveSource {
    /// Open `interface_name` for live capture; fatal-at-startup errors
    /// (interface not found, permission denied) are distinguished per §7.
    pub fn open(interface_name: &str, snaplen: i32, timeout_ms: i32) -> Result<Self, CaptureError> {
        let devices = Device::list().map_err(|e| CaptureError::Pcap(e.to_string()))?;
        let device = devices
            .into_iter()
            .find(|d| d.name == interface_name)
            .ok_or_else(|| CaptureError::InterfaceNotFound(interface_name.to_string()))?;

        let capture = Capture::from_device(device)
            .map_err(|e| CaptureError::Pcap(e.to_string()))?
            .promisc(true)
            .snaplen(snaplen)
            .timeout(timeout_ms)
            .open()
            .map_err(classify_open_error)?;

        Ok(Self { capture })
    }

    pub fn pause(&mut self) {
        // The `pcap` crate has no native pause primitive; the capture
        // controller (replay.rs) stops draining `next_packet` while paused,
        // relying on the OS kernel ring buffer to absorb backlog (§5).
    }
}

fn classify_open_error(e: pcap::Error) -> CaptureError {
    let msg = e.to_string();
    if msg.to_lowercase().contains("permission") || msg.to_lowercase().contains("denied") {
        CaptureError::PermissionDenied(msg)
    } else {
        CaptureError::Pcap(msg)
    }
}

impl PacketSource for LiveSource {
    fn next_packet(&mut self) -> Result<Option<PacketEvent>, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => {
                let ts = packet
                    .header
                    .ts
                    .tv_sec as f64
                    + (packet.header.ts.tv_usec as f64 * 1e-6);
                Ok(Some(PacketEvent { ts, link: LinkType::Ethernet, data: packet.data.to_vec() }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(e) => Err(CaptureError::Transient(e.to_string())),
        }
    }
}

/// Wall-clock seconds, used when a capture source cannot supply its own
/// per-packet timestamp (kept for symmetry with `util::wall_timestamp_secs`).
pub fn now_secs() -> f64 {
    let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    d.as_secs_f64()
}
