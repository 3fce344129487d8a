//! Log Stream Scanner Module
//!
//! Turns the unstructured output of the node into discoveries.
//!
//! ## Pipeline
//!
//! 1. Each line is searched for IPv4 literals (ports stripped, loopback dropped)
//! 2. Every address joins the discovered-peer set persisted across restarts
//! 3. Addresses seen within the dedup window are ignored
//! 4. Survivors are queued to a per-stream discovery worker, so enrichment
//!    throttling never stalls line reading
//! 5. The worker skips recently rediscovered nodes, enriches the rest,
//!    stores them and probes them right away
//!
//! A separate sweep purges expired recency entries and snapshots the
//! discovered-peer set.

mod extract;
mod lines;

pub use extract::extract_addresses;
pub use lines::LineReader;

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::Metrics;
use crate::enrichment::{EnrichmentError, GeoLookup};
use crate::liveness::LivenessProbe;
use crate::registry::NodeRegistry;
use crate::shutdown::Shutdown;

/// Stream-level scan failures
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// DISCOVERED PEERS
// =============================================================================

/// Every address ever extracted, shared by all scanners
#[derive(Default)]
pub struct DiscoveredPeers {
    peers: Mutex<HashSet<String>>,
}

impl DiscoveredPeers {
    /// Start from the persisted set of a previous run
    pub fn seeded(peers: impl IntoIterator<Item = String>) -> Self {
        Self {
            peers: Mutex::new(peers.into_iter().collect()),
        }
    }

    /// Returns true if the address was not known yet
    pub fn insert(&self, ip: &str) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains(ip) {
            return false;
        }
        peers.insert(ip.to_string())
    }

    #[cfg(test)]
    pub fn contains(&self, ip: &str) -> bool {
        self.peers.lock().contains(ip)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Sorted copy for persistence
    pub fn snapshot(&self) -> Vec<String> {
        let mut peers: Vec<_> = self.peers.lock().iter().cloned().collect();
        peers.sort();
        peers
    }
}

// =============================================================================
// DISCOVERY
// =============================================================================

/// Result of one discovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Node rediscovered recently, nothing to do
    Fresh,
    /// Lookup service has no data for the address
    NoData,
    /// Lookup quota exhausted; caller should cool down
    RateLimited,
    /// Lookup or store failure, dropped until the next rediscovery
    Failed,
    /// Node stored and probed
    Stored { created: bool },
}

/// Collaborators shared by every scanner: enrichment, storage, probing
pub struct Discovery {
    registry: Arc<NodeRegistry>,
    lookup: Arc<dyn GeoLookup>,
    liveness: Arc<LivenessProbe>,
    metrics: Arc<Metrics>,
    rediscovery_window: Duration,
}

impl Discovery {
    pub fn new(
        registry: Arc<NodeRegistry>,
        lookup: Arc<dyn GeoLookup>,
        liveness: Arc<LivenessProbe>,
        metrics: Arc<Metrics>,
        rediscovery_window: Duration,
    ) -> Self {
        Self {
            registry,
            lookup,
            liveness,
            metrics,
            rediscovery_window,
        }
    }

    /// Enrich, store and probe one address
    pub async fn discover(&self, ip: &str) -> DiscoveryOutcome {
        if let Some(node) = self.registry.get(ip) {
            let window = chrono::Duration::from_std(self.rediscovery_window)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if !node.is_stale(window, Utc::now()) {
                debug!(ip = %ip, last_seen = %node.last_seen, "Skipping recently updated node");
                return DiscoveryOutcome::Fresh;
            }
        }

        info!(ip = %ip, "Getting address info");
        self.metrics.inc_lookups();

        let geo = match self.lookup.lookup(ip).await {
            Ok(Some(geo)) => geo,
            Ok(None) => return DiscoveryOutcome::NoData,
            Err(EnrichmentError::RateLimitExceeded) => {
                self.metrics.inc_lookups_rate_limited();
                return DiscoveryOutcome::RateLimited;
            }
            Err(e) => {
                self.metrics.inc_lookup_failures();
                warn!(ip = %ip, "Address lookup failed: {}", e);
                return DiscoveryOutcome::Failed;
            }
        };

        let created = match self.registry.upsert_discovered(ip, geo) {
            Ok((_, created)) => created,
            Err(e) => {
                error!(ip = %ip, "Failed to store node: {}", e);
                return DiscoveryOutcome::Failed;
            }
        };

        if created {
            self.metrics.inc_nodes_created();
        }

        self.liveness.check_and_publish(ip, created).await;
        DiscoveryOutcome::Stored { created }
    }
}

// =============================================================================
// SCANNER
// =============================================================================

/// Scans one output stream. Owns its recency map.
pub struct LogStreamScanner {
    /// Stream label for logs (e.g. "stdout")
    name: String,

    discovery: Arc<Discovery>,
    discovered: Arc<DiscoveredPeers>,
    metrics: Arc<Metrics>,

    /// Address -> time it last passed the dedup check
    recent: Mutex<HashMap<String, Instant>>,

    dedup_window: Duration,
    cooldown: Duration,
    max_line_bytes: usize,
    queue_size: usize,
}

/// Tunables for a scanner
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub dedup_window: Duration,
    pub cooldown: Duration,
    pub max_line_bytes: usize,
    pub queue_size: usize,
}

impl LogStreamScanner {
    pub fn new(
        name: &str,
        discovery: Arc<Discovery>,
        discovered: Arc<DiscoveredPeers>,
        metrics: Arc<Metrics>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            name: name.to_string(),
            discovery,
            discovered,
            metrics,
            recent: Mutex::new(HashMap::new()),
            dedup_window: settings.dedup_window,
            cooldown: settings.cooldown,
            max_line_bytes: settings.max_line_bytes,
            queue_size: settings.queue_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read `reader` until end of stream or shutdown
    pub async fn run<R>(self: Arc<Self>, reader: R, mut shutdown: Shutdown) -> Result<(), ScanError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let worker = tokio::spawn(self.clone().run_discovery(rx, shutdown.clone()));
        let mut lines = LineReader::new(BufReader::new(reader), self.max_line_bytes);

        info!(stream = %self.name, "📜 Scanning node output");

        let result = loop {
            if shutdown.is_triggered() {
                break Ok(());
            }

            let next = tokio::select! {
                _ = shutdown.triggered() => break Ok(()),
                next = lines.next_line() => next,
            };

            match next {
                Ok(Some(line)) => self.handle_line(&line, &tx),
                Ok(None) => {
                    info!(stream = %self.name, "Node output stream closed");
                    break Ok(());
                }
                Err(ScanError::LineTooLong(max)) => {
                    self.metrics.inc_oversized_lines();
                    warn!(stream = %self.name, "Skipping line longer than {} bytes", max);
                }
                Err(e) => {
                    error!(stream = %self.name, "Error reading output: {}", e);
                    break Err(e);
                }
            }
        };

        drop(tx);
        if let Err(e) = worker.await {
            error!(stream = %self.name, "Discovery worker panicked: {}", e);
        }
        result
    }

    fn handle_line(&self, line: &str, queue: &mpsc::Sender<String>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        self.metrics.inc_lines_scanned();
        debug!(stream = %self.name, line = %line, "Node output");

        for ip in self.admit(line, Instant::now()) {
            match queue.try_send(ip) {
                Ok(()) => {}
                Err(TrySendError::Full(ip)) => {
                    warn!(stream = %self.name, ip = %ip, "Discovery queue full, dropping address");
                    self.forget(&ip);
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Record every address of `line` and return the ones that pass the
    /// dedup window
    pub fn admit(&self, line: &str, now: Instant) -> Vec<String> {
        let addresses = extract_addresses(line);
        self.metrics.add_addresses_extracted(addresses.len() as u64);

        addresses
            .into_iter()
            .filter(|ip| {
                self.discovered.insert(ip);
                self.mark_recent(ip, now)
            })
            .collect()
    }

    /// False if `ip` passed the check within the dedup window
    fn mark_recent(&self, ip: &str, now: Instant) -> bool {
        let mut recent = self.recent.lock();
        if let Some(seen) = recent.get(ip) {
            if now.saturating_duration_since(*seen) < self.dedup_window {
                return false;
            }
        }
        recent.insert(ip.to_string(), now);
        true
    }

    fn forget(&self, ip: &str) {
        self.recent.lock().remove(ip);
    }

    /// Drop recency entries older than the dedup window
    pub fn purge_recent(&self, now: Instant) -> usize {
        let mut recent = self.recent.lock();
        let before = recent.len();
        recent.retain(|_, seen| now.saturating_duration_since(*seen) <= self.dedup_window);
        before - recent.len()
    }

    #[cfg(test)]
    pub fn recent_len(&self) -> usize {
        self.recent.lock().len()
    }

    async fn run_discovery(self: Arc<Self>, mut queue: mpsc::Receiver<String>, mut shutdown: Shutdown) {
        loop {
            let ip = tokio::select! {
                _ = shutdown.triggered() => break,
                ip = queue.recv() => match ip {
                    Some(ip) => ip,
                    None => break,
                },
            };

            info!(stream = %self.name, ip = %ip, "Found new address");

            if self.discovery.discover(&ip).await == DiscoveryOutcome::RateLimited {
                warn!(
                    stream = %self.name,
                    "Lookup rate limit exceeded, pausing for {:?}",
                    self.cooldown
                );
                tokio::select! {
                    _ = shutdown.triggered() => break,
                    _ = tokio::time::sleep(self.cooldown) => {}
                }
            }
        }
        debug!(stream = %self.name, "Discovery worker stopped");
    }
}

// =============================================================================
// SWEEP
// =============================================================================

/// Periodically purge recency maps and snapshot the discovered-peer set
pub async fn run_sweep(
    scanners: Vec<Arc<LogStreamScanner>>,
    discovered: Arc<DiscoveredPeers>,
    registry: Arc<NodeRegistry>,
    interval: Duration,
    mut shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = ticker.tick() => {}
        }
        sweep_once(&scanners, &discovered, &registry);
    }

    // Keep what this run learned
    sweep_once(&scanners, &discovered, &registry);
    debug!("Discovery sweep stopped");
}

fn sweep_once(
    scanners: &[Arc<LogStreamScanner>],
    discovered: &DiscoveredPeers,
    registry: &NodeRegistry,
) {
    let now = Instant::now();
    for scanner in scanners {
        let purged = scanner.purge_recent(now);
        if purged > 0 {
            debug!(stream = %scanner.name(), "Purged {} recency entries", purged);
        }
    }

    match registry.save_peer_set(&discovered.snapshot()) {
        Ok(count) => debug!("Saved {} known peers", count),
        Err(e) => error!("Error saving known peers: {}", e),
    }
}
