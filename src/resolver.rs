// src/resolver.rs
//! DNS Resolver (§4.C): non-blocking reverse-lookup with a bounded worker
//! pool and a process-scoped cache.
//!
//! Workers are OS threads drained by a `crossbeam_channel` request queue —
//! the same thread-based concurrency idiom the teacher uses throughout
//! (`rx_loop`, `merge_loop`, recovery's `spawn_logger`), rather than async
//! tasks, since the rest of the pipeline is thread-based too (§5). The
//! cache is owned by the `DnsResolver` instance (scoped to the aggregator's
//! lifetime, per the Design Note "no ambient globals beyond the logger"),
//! not a true process-wide `static`.

use crossbeam_channel::{bounded, Sender};
use hashbrown::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use crate::util::strip_trailing_dot;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CacheState {
    Pending,
    Resolved(String),
}

struct Shared {
    cache: RwLock<HashMap<IpAddr, CacheState>>,
    request_tx: Sender<IpAddr>,
}

/// Non-blocking reverse-DNS resolver. `resolve` never blocks the caller: the
/// first call for an ip returns the ip literal and enqueues a background
/// lookup; later calls return the cached hostname once resolved.
pub struct DnsResolver {
    shared: Arc<Shared>,
    timeout: Duration,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl DnsResolver {
    pub fn new(worker_count: usize, timeout_secs: u64, shutdown: Arc<crate::util::BarrierFlag>) -> Arc<Self> {
        let (tx, rx) = bounded::<IpAddr>(4096);
        let shared = Arc::new(Shared { cache: RwLock::new(HashMap::new()), request_tx: tx });
        let timeout = Duration::from_secs(timeout_secs);

        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let rx = rx.clone();
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("dns-worker-{idx}"))
                .spawn(move || worker_loop(rx, shared, timeout, shutdown))
                .expect("spawn dns worker");
            workers.push(handle);
        }

        Arc::new(Self { shared, timeout, _workers: workers })
    }

    /// Returns the ip literal immediately on first call and enqueues a
    /// lookup; returns the resolved hostname (dot-stripped) once available.
    pub fn resolve(&self, ip: IpAddr) -> String {
        let already_pending_or_resolved = {
            let cache = self.shared.cache.read().unwrap();
            match cache.get(&ip) {
                Some(CacheState::Resolved(h)) => return h.clone(),
                Some(CacheState::Pending) => true,
                None => false,
            }
        };
        if !already_pending_or_resolved {
            let mut cache = self.shared.cache.write().unwrap();
            // Re-check under the write lock to avoid a duplicate enqueue race.
            if cache.get(&ip).is_none() {
                cache.insert(ip, CacheState::Pending);
                let _ = self.shared.request_tx.try_send(ip);
            }
        }
        ip.to_string()
    }

    /// Blocking variant with identical semantics, used by the Replay Engine
    /// so snapshots built from a capture file are stable (§4.C, §4.J).
    pub fn resolve_sync(&self, ip: IpAddr) -> String {
        if let Some(CacheState::Resolved(h)) = self.shared.cache.read().unwrap().get(&ip) {
            return h.clone();
        }
        let resolved = lookup_with_timeout(ip, self.timeout).unwrap_or_else(|| ip.to_string());
        self.shared.cache.write().unwrap().insert(ip, CacheState::Resolved(resolved.clone()));
        resolved
    }

    /// New entries resolved since `generation` was last read; used by the
    /// Batcher to build the snapshot's hostname-cache delta (§4.H).
    pub fn snapshot_cache(&self) -> HashMap<String, String> {
        self.shared
            .cache
            .read()
            .unwrap()
            .iter()
            .filter_map(|(ip, state)| match state {
                CacheState::Resolved(h) => Some((ip.to_string(), h.clone())),
                CacheState::Pending => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.shared.cache.write().unwrap().clear();
    }
}

fn worker_loop(rx: crossbeam_channel::Receiver<IpAddr>, shared: Arc<Shared>, timeout: Duration, shutdown: Arc<crate::util::BarrierFlag>) {
    while !shutdown.is_raised() {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(ip) => {
                let resolved = lookup_with_timeout(ip, timeout).unwrap_or_else(|| ip.to_string());
                shared.cache.write().unwrap().insert(ip, CacheState::Resolved(resolved));
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Reverse-lookup an ip with a hard timeout. A timeout or NXDOMAIN is cached
/// as `ip -> ip` (§7 "Resolution" error kind), never surfaced as an alert.
fn lookup_with_timeout(ip: IpAddr, timeout: Duration) -> Option<String> {
    let (tx, rx) = bounded::<Option<String>>(1);
    let handle = thread::spawn(move || {
        let result = reverse_lookup(ip);
        let _ = tx.send(result);
    });
    let result = rx.recv_timeout(timeout).ok().flatten();
    // Detach: a slow/hung resolver call must not block the caller past the
    // timeout; the thread is left to finish and drop its result.
    drop(handle);
    result
}

/// Platform reverse-DNS call via `dns_lookup::lookup_addr` (a thin, portable
/// binding over the system resolver's PTR lookup); any failure (NXDOMAIN,
/// network error) yields `None` and is cached as `ip -> ip` by the caller.
fn reverse_lookup(ip: IpAddr) -> Option<String> {
    dns_lookup::lookup_addr(&ip).ok().map(|h| strip_trailing_dot(&h).to_string())
}
