// src/capture/pcap_file.rs
//! Offline pcap/pcapng file reading (§4.A, §4.J), grounded directly on
//! `liveshark-core::source::pcap::PcapFileSource`: sniff the magic bytes to
//! pick `LegacyPcapReader` vs `PcapNGReader`, track the per-interface
//! linktype, and loop on `PcapError::Incomplete` by refilling the reader's
//! internal buffer.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use pcap_parser::{traits::PcapReaderIterator, Block, LegacyPcapReader, Linktype, PcapBlockOwned, PcapNGReader};

use super::{CaptureError, PacketEvent, PacketSource};
use crate::decode::LinkType;

enum Reader {
    Legacy { reader: LegacyPcapReader<File>, linktype: Option<Linktype> },
    Ng { reader: PcapNGReader<File>, linktypes: Vec<Linktype> },
}

pub struct PcapFileSource {
    inner: Reader,
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        file.seek(SeekFrom::Start(0))?;

        let inner = if magic == [0x0a, 0x0d, 0x0d, 0x0a] {
            let reader = PcapNGReader::new(64 * 1024, file).map_err(|e| CaptureError::Pcap(e.to_string()))?;
            Reader::Ng { reader, linktypes: Vec::new() }
        } else {
            let reader = LegacyPcapReader::new(64 * 1024, file).map_err(|e| CaptureError::Pcap(e.to_string()))?;
            Reader::Legacy { reader, linktype: None }
        };

        Ok(Self { inner })
    }

    /// Read every remaining record into memory, used by the Replay Engine
    /// (§4.J) which keeps the whole file as an ordered in-memory array.
    pub fn read_all(mut self) -> Result<Vec<PacketEvent>, CaptureError> {
        let mut out = Vec::new();
        while let Some(event) = self.next_packet()? {
            out.push(event);
        }
        Ok(out)
    }
}

impl PacketSource for PcapFileSource {
    fn next_packet(&mut self) -> Result<Option<PacketEvent>, CaptureError> {
        loop {
            match &mut self.inner {
                Reader::Legacy { reader, linktype } => match reader.next() {
                    Ok((offset, block)) => {
                        let event = match block {
                            PcapBlockOwned::LegacyHeader(header) => {
                                *linktype = Some(header.network);
                                None
                            }
                            PcapBlockOwned::Legacy(packet) => {
                                let ts = packet.ts_sec as f64 + (packet.ts_usec as f64 * 1e-6);
                                let link = link_type_of(linktype.unwrap_or(Linktype::ETHERNET));
                                Some(PacketEvent { ts, link, data: packet.data.to_vec() })
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        if event.is_some() {
                            return Ok(event);
                        }
                    }
                    Err(pcap_parser::PcapError::Eof) => return Ok(None),
                    Err(pcap_parser::PcapError::Incomplete(_)) => {
                        reader.refill().map_err(|e| CaptureError::Pcap(e.to_string()))?;
                    }
                    Err(e) => return Err(CaptureError::Pcap(e.to_string())),
                },
                Reader::Ng { reader, linktypes } => match reader.next() {
                    Ok((offset, block)) => {
                        let event = match block {
                            PcapBlockOwned::NG(Block::InterfaceDescription(intf)) => {
                                linktypes.push(intf.linktype);
                                None
                            }
                            PcapBlockOwned::NG(Block::EnhancedPacket(packet)) => {
                                let ts = pcapng_ts_to_seconds(packet.ts_high, packet.ts_low);
                                let lt = linktypes.get(packet.if_id as usize).copied().unwrap_or(Linktype::ETHERNET);
                                Some(PacketEvent { ts, link: link_type_of(lt), data: packet.data.to_vec() })
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        if event.is_some() {
                            return Ok(event);
                        }
                    }
                    Err(pcap_parser::PcapError::Eof) => return Ok(None),
                    Err(pcap_parser::PcapError::Incomplete(_)) => {
                        reader.refill().map_err(|e| CaptureError::Pcap(e.to_string()))?;
                    }
                    Err(e) => return Err(CaptureError::Pcap(e.to_string())),
                },
            }
        }
    }
}

fn link_type_of(lt: Linktype) -> LinkType {
    if lt == Linktype::ETHERNET {
        LinkType::Ethernet
    } else {
        LinkType::Raw
    }
}

fn pcapng_ts_to_seconds(ts_high: u32, ts_low: u32) -> f64 {
    let ts = ((ts_high as u64) << 32) | (ts_low as u64);
    ts as f64 * 1e-6
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_legacy_pcap(path: &Path, frames: &[Vec<u8>]) {
        let mut f = File::create(path).unwrap();
        let mut hdr = [0u8; 24];
        hdr[0..4].copy_from_slice(&0xA1B2C3D4u32.to_le_bytes());
        hdr[4..6].copy_from_slice(&2u16.to_le_bytes());
        hdr[6..8].copy_from_slice(&4u16.to_le_bytes());
        hdr[16..20].copy_from_slice(&65535u32.to_le_bytes());
        hdr[20..24].copy_from_slice(&1u32.to_le_bytes()); // LINKTYPE_ETHERNET
        f.write_all(&hdr).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            let mut ph = [0u8; 16];
            ph[0..4].copy_from_slice(&(i as u32).to_le_bytes());
            ph[8..12].copy_from_slice(&(frame.len() as u32).to_le_bytes());
            ph[12..16].copy_from_slice(&(frame.len() as u32).to_le_bytes());
            f.write_all(&ph).unwrap();
            f.write_all(frame).unwrap();
        }
    }

    #[test]
    fn reads_every_frame_in_capture_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.pcap");
        write_legacy_pcap(&path, &[vec![1, 2, 3], vec![4, 5, 6, 7]]);

        let source = PcapFileSource::open(&path).unwrap();
        let events = source.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, vec![1, 2, 3]);
        assert_eq!(events[1].data, vec![4, 5, 6, 7]);
        assert!(events[0].ts <= events[1].ts);
    }
}
