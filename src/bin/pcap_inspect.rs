// src/bin/pcap_inspect.rs
//! Operator tool: decode a capture file and print one JSON packet record per
//! line to stdout. Plain argv parsing in the teacher's `pcap_capture`/
//! `pcap_replay` style rather than `clap`, since this is a one-flag utility.

use observatory::capture::pcap_file::PcapFileSource;
use observatory::decode::{self, CaptureMeta};
use std::path::PathBuf;

const DEFAULT_PAYLOAD_CAP: usize = 2000;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: pcap_inspect <capture.pcap> [payload_cap_bytes]");
        std::process::exit(2);
    }
    let path = PathBuf::from(&args[1]);
    let payload_cap: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PAYLOAD_CAP);

    let source = PcapFileSource::open(&path)?;
    let events = source.read_all()?;

    let mut decoded = 0u64;
    let mut dropped = 0u64;
    for event in events {
        let meta = CaptureMeta { ts: event.ts, capture_length: event.data.len() as u32, original_length: event.data.len() as u32 };
        match decode::decode(meta, event.link, &event.data, payload_cap) {
            Some(record) => {
                println!("{}", serde_json::to_string(&record)?);
                decoded += 1;
            }
            None => dropped += 1,
        }
    }
    eprintln!("decoded {decoded} packets, dropped {dropped} unrecognized frames");
    Ok(())
}
