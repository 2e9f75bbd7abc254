// src/ring.rs
//! Packet Ring (§4.E): fixed-capacity FIFO of recent packet records.
//!
//! A `VecDeque` guarded by its own mutex, capacity N = 10000 by default —
//! the same default independently chosen by the sniffnet-style
//! `PacketRingBuffer` in the retrieved corpus (`max_packets: 10000`), which
//! confirms this is the idiomatic default for this shape of tool.

use crate::decode::PacketRecord;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Fraction of the ring discarded in one bulk-eviction when the pipeline
/// overruns (§4.E: "a bulk discard of the oldest ≈10% is permitted").
const BULK_DISCARD_FRACTION: usize = 10;

pub struct PacketRing {
    capacity: usize,
    buf: Mutex<VecDeque<PacketRecord>>,
}

impl PacketRing {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, buf: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Append one record, discarding the oldest if at capacity.
    pub fn append(&self, record: PacketRecord) {
        let mut buf = self.buf.lock().unwrap();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(record);
    }

    /// Discard the oldest ~10% in one pass, amortizing eviction under burst
    /// load rather than popping one-at-a-time per incoming packet.
    pub fn bulk_discard_oldest(&self) {
        let mut buf = self.buf.lock().unwrap();
        let n = (buf.len() / BULK_DISCARD_FRACTION).max(1).min(buf.len());
        for _ in 0..n {
            buf.pop_front();
        }
    }

    /// Return up to `n` most-recent records as value copies, newest last.
    pub fn recent(&self, n: usize) -> Vec<PacketRecord> {
        let buf = self.buf.lock().unwrap();
        let take = n.min(buf.len());
        buf.iter().rev().take(take).rev().cloned().collect()
    }

    pub fn clear(&self) {
        self.buf.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{AppProtocol, Transport};
    use std::net::{IpAddr, Ipv4Addr};

    fn record(ts: f64) -> PacketRecord {
        PacketRecord {
            ts,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_mac: None,
            dst_mac: None,
            src_port: 1234,
            dst_port: 80,
            length: 64,
            transport: Transport::Tcp,
            tcp_flags: None,
            app_protocol: AppProtocol::Http,
            payload: Vec::new(),
        }
    }

    #[test]
    fn never_exceeds_capacity_and_retains_newest() {
        let ring = PacketRing::new(4);
        for i in 0..5 {
            ring.append(record(i as f64));
        }
        assert_eq!(ring.len(), 4);
        let recent = ring.recent(10);
        assert_eq!(recent.len(), 4);
        // oldest (ts=0.0) was evicted; newest (ts=4.0) is last.
        assert_eq!(recent.last().unwrap().ts, 4.0);
        assert!(recent.iter().all(|r| r.ts > 0.0));
    }

    #[test]
    fn recent_returns_newest_last() {
        let ring = PacketRing::new(10);
        for i in 0..5 {
            ring.append(record(i as f64));
        }
        let recent = ring.recent(3);
        let tss: Vec<f64> = recent.iter().map(|r| r.ts).collect();
        assert_eq!(tss, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn bulk_discard_removes_about_ten_percent() {
        let ring = PacketRing::new(1000);
        for i in 0..1000 {
            ring.append(record(i as f64));
        }
        ring.bulk_discard_oldest();
        assert_eq!(ring.len(), 900);
    }
}
