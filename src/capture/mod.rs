// src/capture/mod.rs
//! Packet Source (§4.A): abstracts live-interface and offline-file capture
//! behind one trait, following `liveshark-core::source`'s
//! `PacketSource`/`PacketEvent`/`SourceError` split (mod.rs declares the
//! trait and event type; `live.rs`/`pcap_file.rs` are the two
//! implementations; `writer.rs` is the matching output half, not present in
//! the teacher's trait but needed for `save_and_restart_capture`, §6.2).

pub mod error;
pub mod live;
pub mod pcap_file;
pub mod writer;

pub use error::CaptureError;

use crate::decode::LinkType;

/// One raw frame as handed up by a `PacketSource`, prior to decoding.
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub ts: f64,
    pub link: LinkType,
    pub data: Vec<u8>,
}

/// Abstract packet source for both live interfaces and offline pcap files.
pub trait PacketSource {
    fn next_packet(&mut self) -> Result<Option<PacketEvent>, CaptureError>;
}
