// src/threats.rs
//! Threat Detector (§4.G): a fixed set of stateful heuristics run over the
//! decoded packet stream, each deduplicated per `(kind, source, source_mac)`.
//!
//! Each rule keeps its own small sliding-window state behind one mutex,
//! mirroring the teacher's one-mutex-per-shared-store idiom (`graph::Inner`,
//! `ring::PacketRing`) rather than a single god-lock over all rules.

use crate::decode::{PacketRecord, Transport};
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreatKind {
    PortScan,
    ArpIpChange,
    MultiIpHost,
    BackdoorPort,
    IcmpFlood,
    ConnectionFailures,
}

impl ThreatKind {
    fn label(self) -> &'static str {
        match self {
            ThreatKind::PortScan => "Port Scan",
            ThreatKind::ArpIpChange => "ARP IP Change",
            ThreatKind::MultiIpHost => "Multi-IP Host",
            ThreatKind::BackdoorPort => "Backdoor Port",
            ThreatKind::IcmpFlood => "ICMP Flood",
            ThreatKind::ConnectionFailures => "Connection Failures",
        }
    }

    /// Fixed per-rule severity (§3, §4.G).
    fn severity(self) -> &'static str {
        match self {
            ThreatKind::PortScan => "high",
            ThreatKind::ArpIpChange => "high",
            ThreatKind::MultiIpHost => "medium",
            ThreatKind::BackdoorPort => "high",
            ThreatKind::IcmpFlood => "high",
            ThreatKind::ConnectionFailures => "medium",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: &'static str,
    pub severity: &'static str,
    pub source: String,
    pub source_mac: Option<String>,
    pub detail: String,
    pub first_seen: f64,
    pub last_seen: f64,
    pub occurrences: u64,
}

const BACKDOOR_PORTS: &[u16] = &[4444, 5555, 6666, 7777, 12345, 31337];
const PORT_SCAN_THRESHOLD: usize = 10;
const MULTI_IP_THRESHOLD: usize = 2;
const ICMP_FLOOD_THRESHOLD: usize = 50;
const ICMP_FLOOD_WINDOW_SECS: f64 = 1.0;
const CONN_FAILURE_THRESHOLD: u64 = 20;
const EXEMPT_PORTS: &[u16] = &[443, 53];

fn mac_to_string(mac: Option<[u8; 6]>) -> Option<String> {
    mac.map(|m| {
        m.iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    })
}

struct DedupKey {
    kind: ThreatKind,
    source: String,
    source_mac: Option<String>,
}

impl DedupKey {
    fn tuple(&self) -> (ThreatKind, String, Option<String>) {
        (self.kind, self.source.clone(), self.source_mac.clone())
    }
}

struct PortScanState {
    // src_ip -> (dst_ip -> set of distinct dst ports seen)
    by_src: HashMap<IpAddr, HashMap<IpAddr, HashSet<u16>>>,
}

struct ArpState {
    // mac -> last ip observed as source
    last_ip_for_mac: HashMap<[u8; 6], IpAddr>,
}

struct MultiIpState {
    // mac -> set of distinct source ips
    ips_for_mac: HashMap<[u8; 6], HashSet<IpAddr>>,
}

struct IcmpFloodState {
    // src_ip -> timestamps of recent non-echo ICMP packets
    windows: HashMap<IpAddr, VecDeque<f64>>,
}

struct ConnFailureState {
    // (ip_a, ip_b) ordered pair -> rst count
    rst_counts: HashMap<(IpAddr, IpAddr), u64>,
}

struct Inner {
    port_scan: PortScanState,
    arp: ArpState,
    multi_ip: MultiIpState,
    icmp_flood: IcmpFloodState,
    conn_failures: ConnFailureState,
    seen: HashSet<(ThreatKind, String, Option<String>)>,
    alerts: Vec<Alert>,
}

/// Runs the six fixed detection rules over each observed packet and ARP
/// event, deduplicating repeat alerts by `(kind, source, source_mac)` (§4.G).
pub struct ThreatDetector {
    inner: Mutex<Inner>,
}

impl ThreatDetector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                port_scan: PortScanState { by_src: HashMap::new() },
                arp: ArpState { last_ip_for_mac: HashMap::new() },
                multi_ip: MultiIpState { ips_for_mac: HashMap::new() },
                icmp_flood: IcmpFloodState { windows: HashMap::new() },
                conn_failures: ConnFailureState { rst_counts: HashMap::new() },
                seen: HashSet::new(),
                alerts: Vec::new(),
            }),
        }
    }

    /// Feed one decoded packet through every applicable rule.
    pub fn observe_packet(&self, p: &PacketRecord) {
        let mut g = self.inner.lock().unwrap();
        self.check_port_scan(&mut g, p);
        self.check_multi_ip_host(&mut g, p);
        self.check_backdoor_port(&mut g, p);
        self.check_icmp_flood(&mut g, p);
        self.check_connection_failures(&mut g, p);
    }

    /// Feed an ARP `sender ip -> sender mac` binding observed on the wire.
    pub fn observe_arp(&self, sender_ip: IpAddr, sender_mac: [u8; 6], ts: f64) {
        let mut g = self.inner.lock().unwrap();
        let prior = g.arp.last_ip_for_mac.insert(sender_mac, sender_ip);
        if let Some(prior_ip) = prior {
            if prior_ip != sender_ip {
                let detail = format!("MAC changed IP from {prior_ip} to {sender_ip}");
                self.raise(&mut g, ThreatKind::ArpIpChange, mac_label(sender_mac), Some(mac_to_string(Some(sender_mac)).unwrap()), detail, ts);
            }
        }
    }

    fn check_port_scan(&self, g: &mut Inner, p: &PacketRecord) {
        // §4.G rule 1: "TCP packets bearing flags" only. UDP and flag-less
        // TCP (e.g. malformed or truncated headers) never count.
        if p.transport != Transport::Tcp {
            return;
        }
        if !p.tcp_flags.map_or(false, |f| f != 0) {
            return;
        }
        if is_exempt(p.dst_port) {
            return;
        }
        let per_dst = g.port_scan.by_src.entry(p.src_ip).or_default();
        let ports = per_dst.entry(p.dst_ip).or_default();
        ports.insert(p.dst_port);
        if ports.len() >= PORT_SCAN_THRESHOLD {
            let detail = format!("{} distinct ports probed on {}", ports.len(), p.dst_ip);
            self.raise(g, ThreatKind::PortScan, p.src_ip.to_string(), mac_to_string(p.src_mac), detail, p.ts);
        }
    }

    fn check_multi_ip_host(&self, g: &mut Inner, p: &PacketRecord) {
        let Some(mac) = p.src_mac else { return };
        let ips = g.multi_ip.ips_for_mac.entry(mac).or_default();
        ips.insert(p.src_ip);
        if ips.len() > MULTI_IP_THRESHOLD {
            let detail = format!("{} distinct source IPs seen from one MAC", ips.len());
            self.raise(g, ThreatKind::MultiIpHost, mac_label(mac), Some(mac_to_string(Some(mac)).unwrap()), detail, p.ts);
        }
    }

    fn check_backdoor_port(&self, g: &mut Inner, p: &PacketRecord) {
        if !matches!(p.transport, Transport::Tcp | Transport::Udp) {
            return;
        }
        if BACKDOOR_PORTS.contains(&p.dst_port) || BACKDOOR_PORTS.contains(&p.src_port) {
            let port = if BACKDOOR_PORTS.contains(&p.dst_port) { p.dst_port } else { p.src_port };
            let detail = format!("traffic on known backdoor port {port}");
            self.raise(g, ThreatKind::BackdoorPort, p.src_ip.to_string(), mac_to_string(p.src_mac), detail, p.ts);
        }
    }

    fn check_icmp_flood(&self, g: &mut Inner, p: &PacketRecord) {
        if p.transport != Transport::Icmp {
            return;
        }
        // Echo requests/replies are excluded by the decoder classifying them
        // as `Icmp` with no further distinction available here; the ring's
        // payload carries the raw ICMP type as its first byte when present.
        let is_echo = p.payload.first().map(|&t| t == 8 || t == 0).unwrap_or(false);
        if is_echo {
            return;
        }
        let window = g.icmp_flood.windows.entry(p.src_ip).or_default();
        window.push_back(p.ts);
        while let Some(&front) = window.front() {
            if p.ts - front > ICMP_FLOOD_WINDOW_SECS {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= ICMP_FLOOD_THRESHOLD {
            let detail = format!("{} non-echo ICMP packets within {:.0}s", window.len(), ICMP_FLOOD_WINDOW_SECS);
            self.raise(g, ThreatKind::IcmpFlood, p.src_ip.to_string(), mac_to_string(p.src_mac), detail, p.ts);
        }
    }

    fn check_connection_failures(&self, g: &mut Inner, p: &PacketRecord) {
        if p.transport != Transport::Tcp {
            return;
        }
        let is_rst = p.tcp_flags.map(|f| f & 0b0000_0100 != 0).unwrap_or(false);
        if !is_rst {
            return;
        }
        if is_exempt(p.dst_port) || is_exempt(p.src_port) {
            return;
        }
        let pair = (p.src_ip, p.dst_ip);
        let count = g.conn_failures.rst_counts.entry(pair).or_insert(0);
        *count += 1;
        if *count > CONN_FAILURE_THRESHOLD {
            let detail = format!("{} RSTs between {} and {}", count, p.src_ip, p.dst_ip);
            self.raise(g, ThreatKind::ConnectionFailures, p.src_ip.to_string(), mac_to_string(p.src_mac), detail, p.ts);
        }
    }

    fn raise(&self, g: &mut Inner, kind: ThreatKind, source: String, source_mac: Option<String>, detail: String, ts: f64) {
        let key = DedupKey { kind, source, source_mac };
        let tuple = key.tuple();
        if g.seen.contains(&tuple) {
            if let Some(alert) = g.alerts.iter_mut().find(|a| {
                a.kind == kind.label() && a.source == tuple.1 && a.source_mac == tuple.2
            }) {
                alert.last_seen = alert.last_seen.max(ts);
                alert.occurrences += 1;
            }
            return;
        }
        g.seen.insert(tuple.clone());
        g.alerts.push(Alert {
            kind: kind.label(),
            severity: kind.severity(),
            source: tuple.1,
            source_mac: tuple.2,
            detail,
            first_seen: ts,
            last_seen: ts,
            occurrences: 1,
        });
        crate::metrics::inc_alert(kind.label());
    }

    /// All alerts raised so far, newest first.
    pub fn alerts(&self) -> Vec<Alert> {
        let g = self.inner.lock().unwrap();
        let mut out = g.alerts.clone();
        out.sort_by(|a, b| b.last_seen.partial_cmp(&a.last_seen).unwrap());
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().alerts.len()
    }

    /// Drop all rule state and alerts, e.g. on `save_and_restart_capture`
    /// where the new session "begins with no shared state" (§4.J).
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = Inner {
            port_scan: PortScanState { by_src: HashMap::new() },
            arp: ArpState { last_ip_for_mac: HashMap::new() },
            multi_ip: MultiIpState { ips_for_mac: HashMap::new() },
            icmp_flood: IcmpFloodState { windows: HashMap::new() },
            conn_failures: ConnFailureState { rst_counts: HashMap::new() },
            seen: HashSet::new(),
            alerts: Vec::new(),
        };
    }
}

impl Default for ThreatDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn is_exempt(port: u16) -> bool {
    EXEMPT_PORTS.contains(&port)
}

fn mac_label(mac: [u8; 6]) -> String {
    mac_to_string(Some(mac)).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::AppProtocol;
    use std::net::{IpAddr, Ipv4Addr};

    fn base(ts: f64, dst_port: u16, transport: Transport) -> PacketRecord {
        PacketRecord {
            ts,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_mac: Some([1, 2, 3, 4, 5, 6]),
            dst_mac: None,
            src_port: 40000,
            dst_port,
            length: 64,
            transport,
            tcp_flags: Some(0x02), // SYN: non-zero so port-scan's flags check passes by default
            app_protocol: AppProtocol::Tcp,
            payload: Vec::new(),
        }
    }

    #[test]
    fn port_scan_fires_at_ten_distinct_ports() {
        // Scenario 1 (§8).
        let det = ThreatDetector::new();
        for port in 1000..1010u16 {
            det.observe_packet(&base(port as f64, port, Transport::Tcp));
        }
        let alerts = det.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "Port Scan");
        assert_eq!(alerts[0].source, "10.0.0.1");
    }

    #[test]
    fn port_scan_does_not_fire_below_threshold() {
        let det = ThreatDetector::new();
        for port in 1000..1005u16 {
            det.observe_packet(&base(port as f64, port, Transport::Tcp));
        }
        assert_eq!(det.alerts().len(), 0);
    }

    #[test]
    fn port_scan_ignores_flagless_tcp_and_udp() {
        // §4.G rule 1 is scoped to "TCP packets bearing flags" only.
        let det = ThreatDetector::new();
        for port in 1000..1010u16 {
            let mut tcp_no_flags = base(port as f64, port, Transport::Tcp);
            tcp_no_flags.tcp_flags = None;
            det.observe_packet(&tcp_no_flags);

            let mut udp = base(port as f64, port, Transport::Udp);
            udp.tcp_flags = None;
            det.observe_packet(&udp);
        }
        assert_eq!(det.alerts().len(), 0);
    }

    #[test]
    fn icmp_flood_fires_within_one_second_window() {
        // Scenario 2 (§8).
        let det = ThreatDetector::new();
        for i in 0..60 {
            let mut p = base(i as f64 * 0.01, 0, Transport::Icmp);
            p.payload = vec![3]; // destination unreachable, not echo
            det.observe_packet(&p);
        }
        let alerts = det.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "ICMP Flood");
    }

    #[test]
    fn icmp_echo_is_excluded_from_flood_count() {
        let det = ThreatDetector::new();
        for i in 0..60 {
            let mut p = base(i as f64 * 0.01, 0, Transport::Icmp);
            p.payload = vec![8]; // echo request
            det.observe_packet(&p);
        }
        assert_eq!(det.alerts().len(), 0);
    }

    #[test]
    fn backdoor_port_fires_immediately() {
        let det = ThreatDetector::new();
        det.observe_packet(&base(1.0, 4444, Transport::Tcp));
        let alerts = det.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "Backdoor Port");
    }

    #[test]
    fn alert_is_deduplicated_per_kind_source_mac() {
        let det = ThreatDetector::new();
        det.observe_packet(&base(1.0, 4444, Transport::Tcp));
        det.observe_packet(&base(2.0, 4444, Transport::Tcp));
        det.observe_packet(&base(3.0, 5555, Transport::Tcp));
        let alerts = det.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].occurrences, 3);
        assert_eq!(alerts[0].last_seen, 3.0);
    }

    #[test]
    fn https_and_dns_exempt_from_port_scan() {
        let det = ThreatDetector::new();
        for i in 0..20 {
            let mut p = base(i as f64, 443, Transport::Tcp);
            p.dst_port = if i % 2 == 0 { 443 } else { 53 };
            det.observe_packet(&p);
        }
        assert_eq!(det.alerts().len(), 0);
    }

    #[test]
    fn multi_ip_host_fires_after_threshold_distinct_ips() {
        let det = ThreatDetector::new();
        let mac = [9, 9, 9, 9, 9, 9];
        for i in 0..3u8 {
            let mut p = base(i as f64, 9000, Transport::Tcp);
            p.src_mac = Some(mac);
            p.src_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10 + i));
            det.observe_packet(&p);
        }
        let alerts = det.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "Multi-IP Host");
    }

    #[test]
    fn connection_failures_fire_past_twenty_rsts() {
        let det = ThreatDetector::new();
        for i in 0..25 {
            let mut p = base(i as f64, 8080, Transport::Tcp);
            p.tcp_flags = Some(0b0000_0100);
            det.observe_packet(&p);
        }
        let alerts = det.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "Connection Failures");
    }

    #[test]
    fn arp_ip_change_is_detected() {
        let det = ThreatDetector::new();
        let mac = [1, 1, 1, 1, 1, 1];
        let ip1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let ip2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6));
        det.observe_arp(ip1, mac, 1.0);
        det.observe_arp(ip2, mac, 2.0);
        let alerts = det.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "ARP IP Change");
    }
}
