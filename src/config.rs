// src/config.rs
use serde::Deserialize;
use std::{fs, net::IpAddr, path::Path, path::PathBuf};

/// Top-level configuration, loaded once at startup from a TOML file and
/// overridden in place by CLI flags (§6). Mirrors the teacher's single
/// `AppConfig::from_file` + `validate` pair.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub general: General,
    pub observer: Observer,
    pub graph: GraphCfg,
    pub ring: RingCfg,
    pub streams: StreamsCfg,
    pub resolver: ResolverCfg,
    pub batcher: BatcherCfg,
    #[serde(default)]
    pub capture: CaptureCfg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Named live interface to sniff. Mutually exclusive with `replay_file`.
    #[serde(default)]
    pub interface: Option<String>,
    /// Offline capture file to replay instead of a live interface.
    #[serde(default)]
    pub replay_file: Option<PathBuf>,
    /// Directory holding rolling capture files (§6 "Persisted state layout").
    pub capture_dir: PathBuf,
    /// Bounded channel depth between capture and decoder workers (§5).
    #[serde(default = "default_channel_depth")]
    pub channel_depth: usize,
    /// Number of decoder/aggregator worker threads (§5).
    #[serde(default = "default_decoder_workers")]
    pub decoder_workers: usize,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_channel_depth() -> usize {
    1000
}
fn default_decoder_workers() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observer {
    pub bind: IpAddr,
    pub port: u16,
    /// HTTP endpoint bind address (§6.1); defaults to `bind`:`port + 1`.
    #[serde(default)]
    pub http_port: Option<u16>,
    /// Bounded outbound queue depth per observer session (§4.I backpressure).
    #[serde(default = "default_session_queue_depth")]
    pub session_queue_depth: usize,
    /// Idle read/write timeout for an observer socket, seconds (§5 Timeouts).
    #[serde(default = "default_observer_idle_secs")]
    pub idle_timeout_secs: u64,
}

fn default_session_queue_depth() -> usize {
    32
}
fn default_observer_idle_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphCfg {
    /// Decay threshold for edges, seconds (§4.D default 60s).
    #[serde(default = "default_edge_decay_secs")]
    pub edge_decay_secs: u64,
    /// Decay threshold for nodes, seconds; longer than edges per the UI's fade tiers.
    #[serde(default = "default_node_decay_secs")]
    pub node_decay_secs: u64,
    /// Cadence of the decay sweep, seconds (§4.D default every minute).
    #[serde(default = "default_decay_interval_secs")]
    pub decay_interval_secs: u64,
}

fn default_edge_decay_secs() -> u64 {
    60
}
fn default_node_decay_secs() -> u64 {
    300
}
fn default_decay_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RingCfg {
    /// Packet Ring capacity N (§3 default 10000).
    #[serde(default = "default_ring_capacity")]
    pub capacity: usize,
}

fn default_ring_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamsCfg {
    /// Max concurrent streams S (§3 default 1000).
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
    /// Max retained packets per stream (§3 fixed at 500).
    #[serde(default = "default_max_stream_packets")]
    pub max_packets_per_stream: usize,
    /// Max bytes per payload buffer (§3 fixed at 1 MiB).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_max_streams() -> usize {
    1000
}
fn default_max_stream_packets() -> usize {
    500
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverCfg {
    /// Bounded DNS worker pool size (§4.C default 10).
    #[serde(default = "default_dns_workers")]
    pub workers: usize,
    /// Per-lookup timeout, seconds (§4.C default 2s).
    #[serde(default = "default_dns_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_dns_workers() -> usize {
    10
}
fn default_dns_timeout_secs() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatcherCfg {
    /// Snapshot cadence T, seconds (§4.H default 2s).
    #[serde(default = "default_batch_interval_secs")]
    pub interval_secs: f64,
    /// Max recent packets per snapshot P (§3 default 100).
    #[serde(default = "default_snapshot_packets")]
    pub max_packets: usize,
}

fn default_batch_interval_secs() -> f64 {
    2.0
}
fn default_snapshot_packets() -> usize {
    100
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureCfg {
    /// Payload bytes retained per packet for search (§4.B minimum 2000).
    #[serde(default = "default_payload_cap")]
    pub payload_cap_bytes: usize,
}

fn default_payload_cap() -> usize {
    2000
}

impl AppConfig {
    pub fn from_file(p: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(p)
            .map_err(|e| anyhow::anyhow!("reading config {:?}: {}", p, e))?;
        let cfg: AppConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.interface.is_some() && self.general.replay_file.is_some() {
            anyhow::bail!("general.interface and general.replay_file are mutually exclusive");
        }
        if self.general.interface.is_none() && self.general.replay_file.is_none() {
            anyhow::bail!("one of general.interface or general.replay_file is required");
        }
        if self.general.decoder_workers == 0 {
            anyhow::bail!("general.decoder_workers must be > 0");
        }
        if self.general.channel_depth == 0 {
            anyhow::bail!("general.channel_depth must be > 0");
        }
        if self.ring.capacity == 0 {
            anyhow::bail!("ring.capacity must be > 0");
        }
        if self.streams.max_streams == 0 {
            anyhow::bail!("streams.max_streams must be > 0");
        }
        if self.streams.max_packets_per_stream == 0 {
            anyhow::bail!("streams.max_packets_per_stream must be > 0");
        }
        if self.resolver.workers == 0 {
            anyhow::bail!("resolver.workers must be > 0");
        }
        if self.batcher.interval_secs <= 0.0 {
            anyhow::bail!("batcher.interval_secs must be > 0");
        }
        Ok(())
    }

    pub fn http_bind_port(&self) -> u16 {
        self.observer.http_port.unwrap_or(self.observer.port + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        [general]
        interface = "eth0"
        capture_dir = "/tmp/captures"

        [observer]
        bind = "127.0.0.1"
        port = 7700

        [graph]
        [ring]
        [streams]
        [resolver]
        [batcher]
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg: AppConfig = toml::from_str(sample_toml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.ring.capacity, 10_000);
        assert_eq!(cfg.streams.max_streams, 1000);
        assert_eq!(cfg.streams.max_packets_per_stream, 500);
        assert_eq!(cfg.resolver.workers, 10);
        assert_eq!(cfg.batcher.interval_secs, 2.0);
        assert_eq!(cfg.http_bind_port(), 7701);
    }

    #[test]
    fn rejects_interface_and_replay_together() {
        let mut cfg: AppConfig = toml::from_str(sample_toml()).unwrap();
        cfg.general.replay_file = Some(PathBuf::from("capture.pcap"));
        assert!(cfg.validate().is_err());
    }
}
