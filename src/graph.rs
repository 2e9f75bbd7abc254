// src/graph.rs
//! Graph Aggregator (§4.D): host/connection graph with ip/hostname merge.
//!
//! Structured as two side-by-side `hashbrown::HashMap`s (nodes, edges) keyed
//! by opaque string ids, per the Design Note in §9 — this removes cycles
//! (edges hold ids, not references) and makes a snapshot a deep value copy.
//! The shape mirrors the teacher's `InstrumentBook` (hashbrown maps guarded
//! by one mutex, generalized here from a single-instrument order book to a
//! multi-entity host/edge graph), and the single-mutex discipline matches
//! §5's "single mutex guards node/edge maps; merge operations hold the lock
//! for the full rewrite".

use crate::decode::AppProtocol;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub ips: Vec<String>,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocols: Vec<String>,
    pub connection_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub last_seen: f64,
}

impl Node {
    fn new(id: &str, ip: &str, last_seen: f64) -> Self {
        Self {
            id: id.to_string(),
            label: id.to_string(),
            ips: vec![ip.to_string()],
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            protocols: Vec::new(),
            connection_count: 0,
            mac: None,
            last_seen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub src: String,
    pub dst: String,
    pub app_protocol: String,
    pub packets: u64,
    pub bytes: u64,
    pub first_seen: f64,
    pub last_seen: f64,
}

fn edge_key(src: &str, dst: &str) -> String {
    format!("{src}\u{0}{dst}")
}

/// Deep value-copy of current aggregator state, handed to the Batcher (§4.H)
/// and safe to share across threads — observers never alias aggregator memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

struct Inner {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    ip_to_id: HashMap<String, String>,
    hostname_to_id: HashMap<String, String>,
    /// distinct peers seen per node id, used to maintain `connection_count`.
    peers: HashMap<String, HashSet<String>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            ip_to_id: HashMap::new(),
            hostname_to_id: HashMap::new(),
            peers: HashMap::new(),
        }
    }
}

pub struct Aggregator {
    inner: Mutex<Inner>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve (creating if necessary) the canonical node id an ip is bound
    /// to, merging a prior id into `hostname` if one is supplied and differs.
    /// Returns the target node id. Mirrors §4.D's four-step merge algorithm.
    pub fn upsert_node(&self, ip: &str, hostname: Option<&str>, bytes_delta: u64, is_sender: bool, last_seen: f64) -> String {
        let mut g = self.inner.lock().unwrap();

        // Step 1: resolve the target id.
        let target_id: String = if let Some(h) = hostname.filter(|h| !h.is_empty() && *h != ip) {
            if let Some(existing) = g.hostname_to_id.get(h) {
                existing.clone()
            } else {
                g.hostname_to_id.insert(h.to_string(), h.to_string());
                h.to_string()
            }
        } else {
            g.ip_to_id.get(ip).cloned().unwrap_or_else(|| ip.to_string())
        };

        // Step 2/3: if the ip was previously bound to a different id, merge.
        if let Some(old_id) = g.ip_to_id.get(ip).cloned() {
            if old_id != target_id {
                merge_nodes(&mut g, &old_id, &target_id);
            }
        }

        // Ensure the target node exists.
        if !g.nodes.contains_key(&target_id) {
            g.nodes.insert(target_id.clone(), Node::new(&target_id, ip, last_seen));
        }

        // Step 4: bind ip -> target and bump counters.
        g.ip_to_id.insert(ip.to_string(), target_id.clone());
        {
            let node = g.nodes.get_mut(&target_id).unwrap();
            if !node.ips.iter().any(|i| i == ip) {
                node.ips.push(ip.to_string());
            }
            if is_sender {
                node.packets_sent = node.packets_sent.saturating_add(1);
                node.bytes_sent = node.bytes_sent.saturating_add(bytes_delta);
            } else {
                node.packets_received = node.packets_received.saturating_add(1);
                node.bytes_received = node.bytes_received.saturating_add(bytes_delta);
            }
            node.last_seen = node.last_seen.max(last_seen);
        }

        target_id
    }

    /// Record an observed protocol tag on a node's protocol set.
    pub fn record_node_protocol(&self, node_id: &str, protocol: &str) {
        let mut g = self.inner.lock().unwrap();
        if let Some(node) = g.nodes.get_mut(node_id) {
            if !node.protocols.iter().any(|p| p == protocol) {
                node.protocols.push(protocol.to_string());
            }
        }
    }

    /// Create or bump the edge keyed by the *current* node ids of src/dst,
    /// promoting the app tag when a more specific one is observed (§4.D).
    pub fn upsert_edge(&self, src_id: &str, dst_id: &str, app_tag: AppProtocol, bytes_delta: u64, ts: f64) {
        let mut g = self.inner.lock().unwrap();
        let key = edge_key(src_id, dst_id);
        let tag_str = app_tag_label(app_tag);

        let is_new = !g.edges.contains_key(&key);
        {
            let edge = g.edges.entry(key).or_insert_with(|| Edge {
                src: src_id.to_string(),
                dst: dst_id.to_string(),
                app_protocol: tag_str.clone(),
                packets: 0,
                bytes: 0,
                first_seen: ts,
                last_seen: ts,
            });
            if !app_tag.is_generic() {
                edge.app_protocol = tag_str;
            }
            edge.packets = edge.packets.saturating_add(1);
            edge.bytes = edge.bytes.saturating_add(bytes_delta);
            edge.last_seen = edge.last_seen.max(ts);
        }

        if is_new {
            let peers = g.peers.entry(src_id.to_string()).or_default();
            let new_peer = peers.insert(dst_id.to_string());
            if new_peer {
                if let Some(node) = g.nodes.get_mut(src_id) {
                    node.connection_count = g.peers.get(src_id).map(|p| p.len() as u32).unwrap_or(node.connection_count);
                }
            }
        }
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let g = self.inner.lock().unwrap();
        GraphSnapshot {
            nodes: g.nodes.values().cloned().collect(),
            edges: g.edges.values().cloned().collect(),
        }
    }

    /// Evict nodes/edges whose last-seen predates `now - threshold_seconds`.
    /// Returns `(nodes_removed, edges_removed)`. Never touches the Packet
    /// Ring or Stream Manager (§4.D).
    pub fn decay(&self, now: f64, node_threshold_secs: f64, edge_threshold_secs: f64) -> (usize, usize) {
        let mut g = self.inner.lock().unwrap();

        let dead_edges: Vec<String> = g
            .edges
            .iter()
            .filter(|(_, e)| now - e.last_seen > edge_threshold_secs)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &dead_edges {
            g.edges.remove(k);
        }

        let dead_nodes: Vec<String> = g
            .nodes
            .iter()
            .filter(|(_, n)| now - n.last_seen > node_threshold_secs)
            .map(|(k, _)| k.clone())
            .collect();
        for id in &dead_nodes {
            g.nodes.remove(id);
            g.ip_to_id.retain(|_, v| v != id);
            g.hostname_to_id.retain(|_, v| v != id);
            g.peers.remove(id);
        }

        (dead_nodes.len(), dead_edges.len())
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    /// Drop every node/edge, e.g. on `save_and_restart_capture` where the new
    /// session "begins with no shared state" (§4.J).
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = Inner::default();
    }
}

/// Rename or merge `old_id` into `target_id`, preserving the counter-sum
/// invariant (§3/§8) and rewriting every edge that referenced the old id.
/// If `target_id` has no existing node, this is a pure rename (id-change);
/// otherwise sum counters/IPs into the target and delete the old node.
/// Edges that collide after the key rewrite are summed, resolving the Open
/// Question in §9 (see DESIGN.md).
fn merge_nodes(g: &mut Inner, old_id: &str, target_id: &str) {
    if old_id == target_id {
        return;
    }

    if let Some(old_node) = g.nodes.remove(old_id) {
        if let Some(target_node) = g.nodes.get_mut(target_id) {
            target_node.packets_sent = target_node.packets_sent.saturating_add(old_node.packets_sent);
            target_node.packets_received = target_node.packets_received.saturating_add(old_node.packets_received);
            target_node.bytes_sent = target_node.bytes_sent.saturating_add(old_node.bytes_sent);
            target_node.bytes_received = target_node.bytes_received.saturating_add(old_node.bytes_received);
            target_node.last_seen = target_node.last_seen.max(old_node.last_seen);
            for ip in old_node.ips {
                if !target_node.ips.iter().any(|i| *i == ip) {
                    target_node.ips.push(ip);
                }
            }
            for proto in old_node.protocols {
                if !target_node.protocols.iter().any(|p| *p == proto) {
                    target_node.protocols.push(proto);
                }
            }
            if target_node.mac.is_none() {
                target_node.mac = old_node.mac;
            }
        } else {
            // Target didn't exist yet: rename (id-change), preserving all fields.
            let mut renamed = old_node;
            renamed.id = target_id.to_string();
            g.nodes.insert(target_id.to_string(), renamed);
        }
    }

    // Rewrite ip -> id bindings that pointed at the old id.
    for v in g.ip_to_id.values_mut() {
        if v == old_id {
            *v = target_id.to_string();
        }
    }
    for v in g.hostname_to_id.values_mut() {
        if v == old_id {
            *v = target_id.to_string();
        }
    }

    // Rewrite every edge referencing old_id; sum on key collision (resolves
    // the §9 Open Question explicitly rather than leaving it ambiguous).
    let affected: Vec<String> = g
        .edges
        .iter()
        .filter(|(_, e)| e.src == old_id || e.dst == old_id)
        .map(|(k, _)| k.clone())
        .collect();

    for old_key in affected {
        if let Some(mut edge) = g.edges.remove(&old_key) {
            if edge.src == old_id {
                edge.src = target_id.to_string();
            }
            if edge.dst == old_id {
                edge.dst = target_id.to_string();
            }
            let new_key = edge_key(&edge.src, &edge.dst);
            match g.edges.remove(&new_key) {
                Some(mut existing) => {
                    existing.packets = existing.packets.saturating_add(edge.packets);
                    existing.bytes = existing.bytes.saturating_add(edge.bytes);
                    existing.first_seen = existing.first_seen.min(edge.first_seen);
                    existing.last_seen = existing.last_seen.max(edge.last_seen);
                    g.edges.insert(new_key, existing);
                }
                None => {
                    g.edges.insert(new_key, edge);
                }
            }
        }
    }

    // Merge peer sets for connection-count bookkeeping.
    if let Some(old_peers) = g.peers.remove(old_id) {
        g.peers.entry(target_id.to_string()).or_default().extend(old_peers);
    }
    if let Some(node) = g.nodes.get_mut(target_id) {
        node.connection_count = g.peers.get(target_id).map(|p| p.len() as u32).unwrap_or(0);
    }
}

pub fn app_tag_label(tag: AppProtocol) -> String {
    use AppProtocol::*;
    match tag {
        Ftp => "FTP", Ssh => "SSH", Telnet => "Telnet", Smtp => "SMTP", Dns => "DNS",
        Bootp => "BOOTP", Http => "HTTP", Https => "HTTPS", MySql => "MySQL",
        PostgreSql => "PostgreSQL", Redis => "Redis", Slurm => "Slurm", Tcp => "TCP",
        Udp => "UDP", Unknown => "Unknown",
    }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_node_is_idempotent_in_structure() {
        let agg = Aggregator::new();
        let id1 = agg.upsert_node("10.0.0.1", None, 100, true, 1.0);
        let id2 = agg.upsert_node("10.0.0.1", None, 50, true, 2.0);
        assert_eq!(id1, id2);
        let snap = agg.snapshot();
        assert_eq!(snap.nodes.len(), 1);
        assert_eq!(snap.nodes[0].bytes_sent, 150);
    }

    #[test]
    fn every_edge_names_live_nodes() {
        let agg = Aggregator::new();
        let src = agg.upsert_node("10.0.0.1", None, 10, true, 1.0);
        let dst = agg.upsert_node("10.0.0.2", None, 10, false, 1.0);
        agg.upsert_edge(&src, &dst, AppProtocol::Http, 10, 1.0);
        let snap = agg.snapshot();
        let node_ids: HashSet<&str> = snap.nodes.iter().map(|n| n.id.as_str()).collect();
        for edge in &snap.edges {
            assert!(node_ids.contains(edge.src.as_str()));
            assert!(node_ids.contains(edge.dst.as_str()));
        }
    }

    #[test]
    fn host_merge_via_late_dns_preserves_counter_sum() {
        // Scenario 3 (§8): 100 packets of 200 bytes with no hostname, then a
        // late resolution, then one more 100-byte packet.
        let agg = Aggregator::new();
        for _ in 0..100 {
            agg.upsert_node("10.0.0.9", None, 200, true, 1.0);
        }
        let id = agg.upsert_node("10.0.0.9", Some("scanner.example"), 0, true, 1.0);
        assert_eq!(id, "scanner.example");
        let id2 = agg.upsert_node("10.0.0.9", Some("scanner.example"), 100, true, 2.0);
        assert_eq!(id2, "scanner.example");

        let snap = agg.snapshot();
        assert_eq!(snap.nodes.len(), 1);
        let node = &snap.nodes[0];
        assert_eq!(node.id, "scanner.example");
        assert_eq!(node.bytes_sent, 100 * 200 + 100);
        assert!(node.ips.iter().any(|ip| ip == "10.0.0.9"));
    }

    #[test]
    fn edge_protocol_promotion_keeps_more_specific_tag() {
        let agg = Aggregator::new();
        let src = agg.upsert_node("10.0.0.1", None, 10, true, 1.0);
        let dst = agg.upsert_node("10.0.0.2", None, 10, false, 1.0);
        agg.upsert_edge(&src, &dst, AppProtocol::Tcp, 10, 1.0);
        agg.upsert_edge(&src, &dst, AppProtocol::Http, 10, 2.0);
        agg.upsert_edge(&src, &dst, AppProtocol::Tcp, 10, 3.0);
        let snap = agg.snapshot();
        let edge = snap.edges.iter().find(|e| e.src == src && e.dst == dst).unwrap();
        assert_eq!(edge.app_protocol, "HTTP");
        assert_eq!(edge.packets, 3);
    }

    #[test]
    fn decay_evicts_stale_entries_only() {
        let agg = Aggregator::new();
        agg.upsert_node("10.0.0.1", None, 10, true, 1.0);
        agg.upsert_node("10.0.0.2", None, 10, true, 100.0);
        let (removed, _) = agg.decay(101.0, 50.0, 50.0);
        assert_eq!(removed, 1);
        assert_eq!(agg.node_count(), 1);
    }

    #[test]
    fn merge_sums_colliding_edges_after_key_rewrite() {
        // Two pre-merge edges that alias to the same post-merge key must sum,
        // per §9's Open Question resolution (see DESIGN.md).
        let agg = Aggregator::new();
        let a = agg.upsert_node("10.0.0.1", None, 0, true, 1.0);
        let b = agg.upsert_node("10.0.0.2", None, 0, true, 1.0);
        agg.upsert_edge(&a, &b, AppProtocol::Http, 100, 1.0);
        // Force b to later be renamed to "host.example", aliasing with any
        // edge already keyed "10.0.0.1 -> host.example".
        let c_id = agg.upsert_node("10.0.0.3", Some("host.example"), 0, true, 1.0);
        agg.upsert_edge(&a, &c_id, AppProtocol::Http, 50, 1.0);
        // Now resolve 10.0.0.2 to the same hostname, merging b into host.example.
        let merged_id = agg.upsert_node("10.0.0.2", Some("host.example"), 0, true, 2.0);
        assert_eq!(merged_id, "host.example");
        let snap = agg.snapshot();
        let edge = snap.edges.iter().find(|e| e.src == a && e.dst == "host.example").unwrap();
        assert_eq!(edge.bytes, 150);
    }
}
