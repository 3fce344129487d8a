//! Liveness Probe Module
//!
//! Keeps every tracked node's online state current.
//!
//! ## Schedule
//!
//! - One pass over all nodes at startup, then one per probe interval
//! - Nodes probed within the minimum recheck interval are skipped
//! - Probes within a pass run concurrently, bounded by the worker count
//! - Each result is folded into the registry and broadcast to observers

mod probe;

pub use probe::{Reachability, TcpEchoProbe};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::Metrics;
use crate::broadcast::UpdateBroadcaster;
use crate::registry::NodeRegistry;
use crate::shutdown::Shutdown;
use crate::types::PeerNode;

/// Counts from one pass over the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub online: usize,
    pub offline: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct LivenessProbe {
    reachability: Arc<dyn Reachability>,
    registry: Arc<NodeRegistry>,
    broadcaster: Arc<UpdateBroadcaster>,
    metrics: Arc<Metrics>,
    min_recheck: Duration,
    workers: usize,
}

impl LivenessProbe {
    pub fn new(
        reachability: Arc<dyn Reachability>,
        registry: Arc<NodeRegistry>,
        broadcaster: Arc<UpdateBroadcaster>,
        metrics: Arc<Metrics>,
        min_recheck: Duration,
        workers: usize,
    ) -> Self {
        Self {
            reachability,
            registry,
            broadcaster,
            metrics,
            min_recheck,
            workers: workers.max(1),
        }
    }

    /// Probe one address without recording anything
    pub async fn check_once(&self, ip: &str) -> bool {
        let online = self.reachability.is_reachable(ip).await;
        if online {
            self.metrics.inc_probes_online();
        } else {
            self.metrics.inc_probes_offline();
        }
        online
    }

    /// Probe one node now, record the result and broadcast it.
    ///
    /// `is_new` marks the update emitted right after a first discovery.
    pub async fn check_and_publish(&self, ip: &str, is_new: bool) -> Option<PeerNode> {
        let online = self.check_once(ip).await;
        self.record_and_publish(ip, online, is_new)
    }

    /// Record an externally observed status and broadcast it
    pub fn record_and_publish(&self, ip: &str, online: bool, is_new: bool) -> Option<PeerNode> {
        match self.registry.record_liveness(ip, online) {
            Ok(node) => {
                let delivered = self.broadcaster.publish(node.to_record(is_new));
                debug!(ip = %ip, online, delivered, "Published node status");
                Some(node)
            }
            Err(e) => {
                warn!(ip = %ip, "Error updating node status: {}", e);
                None
            }
        }
    }

    /// Probe every node not checked within the minimum recheck interval
    pub async fn sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let recheck = chrono::Duration::from_std(self.min_recheck)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();

        let due: Vec<String> = self
            .registry
            .get_all()
            .into_iter()
            .filter(|node| match node.last_ping {
                Some(last_ping) if now - last_ping < recheck => {
                    summary.skipped += 1;
                    false
                }
                _ => true,
            })
            .map(|node| node.ip)
            .collect();

        let results: Vec<Option<PeerNode>> = stream::iter(due)
            .map(|ip| async move { self.check_and_publish(&ip, false).await })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for result in results {
            match result {
                Some(node) if node.is_online => summary.online += 1,
                Some(_) => summary.offline += 1,
                None => summary.failed += 1,
            }
        }
        summary
    }

    /// Initial pass, then one pass per `interval` until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: Shutdown) {
        info!("📡 Starting liveness probe every {:?}", interval);

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }

            let summary = tokio::select! {
                _ = shutdown.triggered() => break,
                summary = self.sweep() => summary,
            };

            info!(
                online = summary.online,
                offline = summary.offline,
                skipped = summary.skipped,
                failed = summary.failed,
                "Liveness pass complete"
            );
        }
        debug!("Liveness probe stopped");
    }
}
