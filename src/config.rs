//! Peer Finder Configuration
//!
//! Tunables for discovery, enrichment, liveness probing and the live API.
//! Defaults mirror the limits of the free ip-api.com tier and a 2 minute
//! probe cadence.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the peer finder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerFinderConfig {
    // === Enrichment ===

    /// Base URL of the geolocation lookup service (address is appended)
    pub enrichment_url: String,

    /// Token bucket refill rate (lookups per second)
    pub enrichment_rate_per_sec: f64,

    /// Token bucket capacity
    pub enrichment_burst: f64,

    /// Per-lookup timeout (seconds)
    pub enrichment_timeout_secs: u64,

    /// Pause after the lookup service reports quota exhaustion (seconds)
    pub rate_limit_cooldown_secs: u64,

    // === Discovery ===

    /// Window during which a re-extracted address is ignored (seconds)
    pub dedup_window_secs: u64,

    /// Skip enrichment for registry rows rediscovered within this window (seconds)
    pub rediscovery_window_secs: u64,

    /// Interval of the recency purge + peer set snapshot (seconds)
    pub sweep_interval_secs: u64,

    /// Longest line accepted from a node output stream (bytes)
    pub max_line_bytes: usize,

    /// Pending discoveries buffered per stream before new ones are dropped
    pub discovery_queue: usize,

    // === Liveness ===

    /// Service port dialled by the liveness probe
    pub probe_port: u16,

    /// Timeout for each probe attempt (seconds)
    pub probe_timeout_secs: u64,

    /// Interval of the full registry probe sweep (seconds)
    pub probe_interval_secs: u64,

    /// Nodes pinged more recently than this are skipped by the sweep (seconds)
    pub probe_min_recheck_secs: u64,

    /// Concurrent probes during a sweep
    pub probe_workers: usize,

    // === API ===

    /// Port for the HTTP API and live subscriptions
    pub api_port: u16,

    /// Outbound queue per live subscriber; a full queue drops the subscriber
    pub subscriber_queue: usize,

    // === Node process ===

    /// Command line of the node whose output is scanned (program first)
    pub node_command: Vec<String>,
}

impl Default for PeerFinderConfig {
    fn default() -> Self {
        Self {
            // 45 lookups per minute
            enrichment_url: "http://ip-api.com/json".to_string(),
            enrichment_rate_per_sec: 0.75,
            enrichment_burst: 45.0,
            enrichment_timeout_secs: 10,
            rate_limit_cooldown_secs: 60,

            dedup_window_secs: 300,
            rediscovery_window_secs: 300,
            sweep_interval_secs: 60,
            max_line_bytes: 1024 * 1024,
            discovery_queue: 1024,

            probe_port: 11211,
            probe_timeout_secs: 5,
            probe_interval_secs: 120,
            probe_min_recheck_secs: 60,
            probe_workers: 8,

            api_port: 8080,
            subscriber_queue: 64,

            node_command: vec![],
        }
    }
}

impl PeerFinderConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    // Builder-style methods for CLI overrides

    pub fn with_api_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.api_port = port;
        }
        self
    }

    pub fn with_probe_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.probe_port = port;
        }
        self
    }

    pub fn with_enrichment_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.enrichment_url = url;
        }
        self
    }

    pub fn with_node_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.node_command = command;
        }
        self
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn rediscovery_window(&self) -> Duration {
        Duration::from_secs(self.rediscovery_window_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_min_recheck(&self) -> Duration {
        Duration::from_secs(self.probe_min_recheck_secs)
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.enrichment_rate_per_sec > 0.0) {
            anyhow::bail!(
                "enrichment_rate_per_sec ({}) must be positive",
                self.enrichment_rate_per_sec
            );
        }

        if self.enrichment_burst < 1.0 {
            anyhow::bail!(
                "enrichment_burst ({}) must allow at least one lookup",
                self.enrichment_burst
            );
        }

        if self.probe_interval_secs == 0 || self.sweep_interval_secs == 0 {
            anyhow::bail!("probe_interval_secs and sweep_interval_secs must be non-zero");
        }

        if self.probe_min_recheck_secs >= self.probe_interval_secs {
            anyhow::bail!(
                "probe_min_recheck_secs ({}) must be less than probe_interval_secs ({})",
                self.probe_min_recheck_secs,
                self.probe_interval_secs
            );
        }

        if self.max_line_bytes == 0 || self.discovery_queue == 0 || self.subscriber_queue == 0 {
            anyhow::bail!("max_line_bytes, discovery_queue and subscriber_queue must be non-zero");
        }

        if self.probe_workers == 0 {
            anyhow::bail!("probe_workers must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PeerFinderConfig::default();
        assert_eq!(config.probe_interval_secs, 120);
        assert_eq!(config.dedup_window(), Duration::from_secs(300));
        assert_eq!(config.max_line_bytes, 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = PeerFinderConfig::default();

        // Invalid: recheck interval >= sweep interval
        config.probe_min_recheck_secs = 120;
        assert!(config.validate().is_err());

        let mut config = PeerFinderConfig::default();
        config.enrichment_rate_per_sec = 0.0;
        assert!(config.validate().is_err());

        let mut config = PeerFinderConfig::default();
        config.enrichment_burst = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = PeerFinderConfig::default()
            .with_api_port(Some(9090))
            .with_probe_port(None)
            .with_node_command(vec!["zanod".to_string(), "--no-console".to_string()]);

        assert_eq!(config.api_port, 9090);
        assert_eq!(config.probe_port, 11211);
        assert_eq!(config.node_command.len(), 2);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PeerFinderConfig = toml::from_str(
            "api_port = 3000\nprobe_workers = 2\n",
        )
        .unwrap();

        assert_eq!(config.api_port, 3000);
        assert_eq!(config.probe_workers, 2);
        assert_eq!(config.enrichment_burst, 45.0);
    }
}
