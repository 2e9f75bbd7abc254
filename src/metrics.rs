// src/metrics.rs
//! Prometheus counters/gauges for the observatory pipeline.
//!
//! Same `once_cell::sync::Lazy` + process-wide `Registry` idiom the teacher
//! uses for its market-data metrics, re-pointed at this pipeline's own
//! stages (capture/decode/resolve/stream/threat/fanout) rather than
//! order-book internals. The HTTP exposition itself lives in `http.rs`
//! alongside the other synchronous endpoints (§EXPANSION 6.1), so this
//! module only owns metric objects and the text-encode helper.

use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static PACKETS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("packets_processed_total", "Packets successfully decoded").expect("packets_processed_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static DECODE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("decode_failures_total", "Raw frames dropped during decode").expect("decode_failures_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static DNS_CACHE_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("dns_cache_entries", "Entries currently held in the resolver cache").expect("dns_cache_entries");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static STREAMS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("streams_active", "Streams currently tracked by the stream manager").expect("streams_active");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static ALERTS_FIRED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(Opts::new("alerts_fired_total", "Threat alerts raised, by kind"), &["kind"]).expect("alerts_fired_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static SNAPSHOT_PUBLISH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0];
    let h = Histogram::with_opts(HistogramOpts::new("snapshot_publish_seconds", "Time to build and hand off one snapshot").buckets(buckets))
        .expect("snapshot_publish_seconds");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

static FANOUT_QUEUE_DEPTH: Lazy<prometheus::IntGaugeVec> = Lazy::new(|| {
    let g = prometheus::IntGaugeVec::new(Opts::new("fanout_queue_depth", "Outbound queue depth per observer session"), &["session"]).expect("fanout_queue_depth");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static FANOUT_DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(Opts::new("fanout_drops_total", "Messages dropped due to a full session queue"), &["session"]).expect("fanout_drops_total");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn inc_packets_processed() {
    PACKETS_PROCESSED.inc();
}

pub fn inc_decode_failures() {
    DECODE_FAILURES.inc();
}

pub fn set_dns_cache_size(n: usize) {
    DNS_CACHE_SIZE.set(n as i64);
}

pub fn set_streams_active(n: usize) {
    STREAMS_ACTIVE.set(n as i64);
}

pub fn inc_alert(kind: &str) {
    ALERTS_FIRED.with_label_values(&[kind]).inc();
}

pub fn observe_snapshot_publish_secs(secs: f64) {
    SNAPSHOT_PUBLISH_LATENCY.observe(secs);
}

pub fn set_fanout_queue_depth(session: &str, depth: usize) {
    FANOUT_QUEUE_DEPTH.with_label_values(&[session]).set(depth as i64);
}

pub fn inc_fanout_drop(session: &str) {
    FANOUT_DROPS.with_label_values(&[session]).inc();
}

/// Render the current registry in Prometheus text exposition format, served
/// by the `/metrics` HTTP endpoint (§EXPANSION 1.1, §EXPANSION 6.1).
pub fn gather_text() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::with_capacity(8 * 1024);
    encoder.encode(&metric_families, &mut buf).ok();
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_text_includes_registered_metric_names() {
        inc_packets_processed();
        inc_alert("Port Scan");
        let text = String::from_utf8(gather_text()).unwrap();
        assert!(text.contains("packets_processed_total"));
        assert!(text.contains("alerts_fired_total"));
    }
}
