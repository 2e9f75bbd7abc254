// src/capture/writer.rs
//! Pcap file writer for `save_and_restart_capture` (§6.2): standard pcap
//! header/record layout, little-endian, Ethernet linktype, snaplen 65535.
//!
//! Byte layout follows the teacher's `src/bin/pcap_capture.rs`
//! (`write_pcap_global_header`/`write_pcap_packet`), generalized from a
//! fixed RAW/IPv4 linktype to real Ethernet frames and real capture
//! lengths. Final persistence is write-temp-then-rename, the same atomic
//! pattern as the teacher's `snapshot::write_atomic`.

use anyhow::Context;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const LINKTYPE_ETHERNET: u32 = 1;
const SNAPLEN: u32 = 65_535;

/// One raw frame plus its capture timestamp, buffered in memory for the
/// duration of a capture session and flushed on `save_and_restart_capture`.
pub struct RawFrame {
    pub ts: f64,
    pub data: Vec<u8>,
}

/// Serialize `frames` as a standard pcap file and persist it atomically at
/// `path` (write to a `.partial` sibling, then rename).
pub fn write_atomic(path: &Path, frames: &[RawFrame]) -> anyhow::Result<()> {
    let mut payload = Vec::with_capacity(24 + frames.len() * 32);
    write_global_header(&mut payload);
    for frame in frames {
        write_packet(&mut payload, frame.ts, &frame.data);
    }

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).ok();
    }
    let tmp = tmp_path(path);
    {
        let mut f = File::create(&tmp).with_context(|| format!("create tmp pcap {tmp:?}"))?;
        f.write_all(&payload)?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path).with_context(|| format!("rename {tmp:?} -> {path:?}"))?;
    Ok(())
}

fn write_global_header(out: &mut Vec<u8>) {
    out.extend_from_slice(&0xA1B2C3D4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&SNAPLEN.to_le_bytes());
    out.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
}

fn write_packet(out: &mut Vec<u8>, ts: f64, data: &[u8]) {
    let ts_sec = ts.trunc() as u32;
    let ts_usec = ((ts.fract()) * 1_000_000.0) as u32;
    let len = data.len().min(SNAPLEN as usize) as u32;
    out.extend_from_slice(&ts_sec.to_le_bytes());
    out.extend_from_slice(&ts_usec.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data[..len as usize]);
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("pcap");
    p.set_extension(format!("{ext}.partial"));
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_parseable_legacy_pcap_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcap");
        let frames = vec![
            RawFrame { ts: 1.5, data: vec![1, 2, 3, 4] },
            RawFrame { ts: 2.25, data: vec![5, 6] },
        ];
        write_atomic(&path, &frames).unwrap();

        let source = crate::capture::pcap_file::PcapFileSource::open(&path).unwrap();
        let events = source.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, vec![1, 2, 3, 4]);
        assert_eq!(events[1].data, vec![5, 6]);
    }

    #[test]
    fn no_partial_file_survives_a_successful_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcap");
        write_atomic(&path, &[]).unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());
    }
}
