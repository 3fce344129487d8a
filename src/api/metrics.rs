//! Metrics Collection
//!
//! Counters for the discovery pipeline plus gauges refreshed from the
//! registry when scraped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::registry::RegistryStats;

/// Metrics collector for the peer finder
#[derive(Default)]
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Option<Instant>,

    /// Non-empty lines read from the node output
    pub lines_scanned: AtomicU64,

    /// Lines discarded for exceeding the length limit
    pub oversized_lines: AtomicU64,

    /// Addresses extracted, duplicates included
    pub addresses_extracted: AtomicU64,

    /// Enrichment requests issued
    pub lookups: AtomicU64,

    /// Enrichment requests that failed outright
    pub lookup_failures: AtomicU64,

    /// Enrichment requests refused by the service quota
    pub lookups_rate_limited: AtomicU64,

    /// Nodes created on first discovery
    pub nodes_created: AtomicU64,

    pub probes_online: AtomicU64,
    pub probes_offline: AtomicU64,

    /// Updates delivered to observers
    pub broadcasts_sent: AtomicU64,

    /// Observers removed for a full or closed queue
    pub subscribers_dropped: AtomicU64,

    // Gauges
    pub nodes_total: AtomicU64,
    pub nodes_online: AtomicU64,
    pub nodes_staking: AtomicU64,
    pub known_peers: AtomicU64,
    pub subscribers: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn inc_lines_scanned(&self) {
        self.lines_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_oversized_lines(&self) {
        self.oversized_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_addresses_extracted(&self, count: u64) {
        self.addresses_extracted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_lookups(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lookup_failures(&self) {
        self.lookup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lookups_rate_limited(&self) {
        self.lookups_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_nodes_created(&self) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_probes_online(&self) {
        self.probes_online.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_probes_offline(&self) {
        self.probes_offline.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_broadcasts_sent(&self, count: u64) {
        self.broadcasts_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_subscribers_dropped(&self, count: u64) {
        self.subscribers_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_subscribers(&self, count: u64) {
        self.subscribers.store(count, Ordering::Relaxed);
    }

    pub fn set_known_peers(&self, count: u64) {
        self.known_peers.store(count, Ordering::Relaxed);
    }

    /// Refresh the node gauges from registry counts
    pub fn set_registry_stats(&self, stats: &RegistryStats) {
        self.nodes_total.store(stats.total_nodes as u64, Ordering::Relaxed);
        self.nodes_online.store(stats.online_nodes as u64, Ordering::Relaxed);
        self.nodes_staking.store(stats.staking_nodes as u64, Ordering::Relaxed);
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        push_metric(
            &mut output,
            "uptime_seconds",
            "gauge",
            "Peer finder uptime in seconds",
            self.uptime_secs(),
        );

        let counters = [
            ("lines_scanned_total", "Node output lines scanned", &self.lines_scanned),
            ("oversized_lines_total", "Lines skipped for length", &self.oversized_lines),
            ("addresses_extracted_total", "Addresses extracted from output", &self.addresses_extracted),
            ("lookups_total", "Enrichment lookups issued", &self.lookups),
            ("lookup_failures_total", "Failed enrichment lookups", &self.lookup_failures),
            ("lookups_rate_limited_total", "Lookups refused by quota", &self.lookups_rate_limited),
            ("nodes_created_total", "Nodes created on first discovery", &self.nodes_created),
            ("probes_online_total", "Probes that found the node online", &self.probes_online),
            ("probes_offline_total", "Probes that found the node offline", &self.probes_offline),
            ("broadcasts_sent_total", "Updates delivered to observers", &self.broadcasts_sent),
            ("subscribers_dropped_total", "Observers dropped on failed delivery", &self.subscribers_dropped),
        ];
        for (name, help, value) in counters {
            push_metric(&mut output, name, "counter", help, value.load(Ordering::Relaxed));
        }

        let gauges = [
            ("nodes", "Tracked nodes", &self.nodes_total),
            ("nodes_online", "Nodes online at last check", &self.nodes_online),
            ("nodes_staking", "Nodes considered staking", &self.nodes_staking),
            ("known_peers", "Addresses ever discovered", &self.known_peers),
            ("subscribers", "Connected observers", &self.subscribers),
        ];
        for (name, help, value) in gauges {
            push_metric(&mut output, name, "gauge", help, value.load(Ordering::Relaxed));
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_secs": self.uptime_secs(),
            "scanner": {
                "lines_scanned": self.lines_scanned.load(Ordering::Relaxed),
                "oversized_lines": self.oversized_lines.load(Ordering::Relaxed),
                "addresses_extracted": self.addresses_extracted.load(Ordering::Relaxed),
            },
            "enrichment": {
                "lookups": self.lookups.load(Ordering::Relaxed),
                "failures": self.lookup_failures.load(Ordering::Relaxed),
                "rate_limited": self.lookups_rate_limited.load(Ordering::Relaxed),
            },
            "probes": {
                "online": self.probes_online.load(Ordering::Relaxed),
                "offline": self.probes_offline.load(Ordering::Relaxed),
            },
            "nodes": {
                "created": self.nodes_created.load(Ordering::Relaxed),
                "total": self.nodes_total.load(Ordering::Relaxed),
                "online": self.nodes_online.load(Ordering::Relaxed),
                "staking": self.nodes_staking.load(Ordering::Relaxed),
                "known_peers": self.known_peers.load(Ordering::Relaxed),
            },
            "observers": {
                "connected": self.subscribers.load(Ordering::Relaxed),
                "updates_sent": self.broadcasts_sent.load(Ordering::Relaxed),
                "dropped": self.subscribers_dropped.load(Ordering::Relaxed),
            },
        })
    }
}

fn push_metric(output: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    output.push_str(&format!(
        "# HELP peer_finder_{name} {help}\n\
         # TYPE peer_finder_{name} {kind}\n\
         peer_finder_{name} {value}\n\n"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.inc_lookups();
        metrics.inc_lookups();
        metrics.inc_lookups_rate_limited();
        metrics.add_addresses_extracted(3);

        assert_eq!(metrics.lookups.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.lookups_rate_limited.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.addresses_extracted.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.set_registry_stats(&RegistryStats {
            total_nodes: 100,
            online_nodes: 40,
            staking_nodes: 7,
        });
        metrics.inc_probes_online();

        let output = metrics.to_prometheus();

        assert!(output.contains("peer_finder_nodes 100"));
        assert!(output.contains("peer_finder_nodes_staking 7"));
        assert!(output.contains("# TYPE peer_finder_probes_online_total counter"));
        assert!(output.contains("peer_finder_probes_online_total 1"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.set_subscribers(3);
        metrics.set_known_peers(250);

        let json = metrics.to_json();

        assert_eq!(json["observers"]["connected"], 3);
        assert_eq!(json["nodes"]["known_peers"], 250);
    }
}
