//! Node Registry Module
//!
//! Owns every tracked node: geolocation, discovery times and rolling
//! liveness statistics. Rows live in RocksDB with an in-memory cache in
//! front; reads never touch the disk.
//!
//! ## Concurrency
//!
//! Each address has its own lock in a lock table. A read-modify-write on
//! one address (a sweep probe racing a post-discovery probe, say) is
//! serialized, while updates to different addresses proceed in parallel.

mod staking;
mod storage;

pub use staking::is_staking;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{GeoInfo, PeerNode};
use storage::NodeStore;

/// Registry failures
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("Encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Unknown node {0}")]
    UnknownNode(String),
}

/// Summary counts over the registry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryStats {
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub staking_nodes: usize,
}

/// Durable store of per-address node state
pub struct NodeRegistry {
    store: NodeStore,

    /// Mirror of the node rows, written after each successful persist
    cache: RwLock<HashMap<String, PeerNode>>,

    /// Per-address update locks
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NodeRegistry {
    /// Open or create the registry. Fails if the store is unavailable.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let store = NodeStore::open(path)?;
        let cache: HashMap<String, PeerNode> = store
            .load_nodes()?
            .into_iter()
            .map(|node| (node.ip.clone(), node))
            .collect();

        Ok(Self {
            store,
            cache: RwLock::new(cache),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Create the node if absent, otherwise refresh its geolocation and
    /// discovery time. Counters are never reset.
    ///
    /// Returns the stored node and whether it was created.
    pub fn upsert_discovered(
        &self,
        ip: &str,
        geo: GeoInfo,
    ) -> Result<(PeerNode, bool), RegistryError> {
        let lock = self.address_lock(ip);
        let _guard = lock.lock();
        let now = Utc::now();

        let existing = self.cache.read().get(ip).cloned();
        let created = existing.is_none();
        let node = match existing {
            Some(mut node) => {
                node.geo = geo;
                node.last_seen = now;
                node
            }
            None => PeerNode::discovered(ip, geo, now),
        };

        self.store.put_node(&node)?;
        self.cache.write().insert(ip.to_string(), node.clone());

        if created {
            info!(
                ip = %ip,
                country = %node.geo.country,
                city = %node.geo.city,
                isp = %node.geo.isp,
                "Saved new node"
            );
        } else {
            debug!(ip = %ip, "Refreshed node geolocation");
        }

        Ok((node, created))
    }

    /// Apply one liveness result to a known node and return the new state
    pub fn record_liveness(&self, ip: &str, is_online: bool) -> Result<PeerNode, RegistryError> {
        let lock = self.address_lock(ip);
        let _guard = lock.lock();
        self.record_liveness_locked(ip, is_online, Utc::now())
    }

    /// `record_liveness` with an explicit clock
    #[cfg(test)]
    pub fn record_liveness_at(
        &self,
        ip: &str,
        is_online: bool,
        now: DateTime<Utc>,
    ) -> Result<PeerNode, RegistryError> {
        let lock = self.address_lock(ip);
        let _guard = lock.lock();
        self.record_liveness_locked(ip, is_online, now)
    }

    fn record_liveness_locked(
        &self,
        ip: &str,
        is_online: bool,
        now: DateTime<Utc>,
    ) -> Result<PeerNode, RegistryError> {
        let mut node = self
            .cache
            .read()
            .get(ip)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownNode(ip.to_string()))?;

        apply_liveness(&mut node, is_online, now);

        self.store.put_node(&node)?;
        self.cache.write().insert(ip.to_string(), node.clone());

        debug!(
            ip = %ip,
            is_online,
            uptime = node.uptime_seconds,
            total_pings = node.total_pings,
            online_pings = node.online_pings,
            online_ratio = node.online_ratio(),
            is_staking = node.is_staking,
            "Updated node status"
        );

        Ok(node)
    }

    /// Get a node by address
    pub fn get(&self, ip: &str) -> Option<PeerNode> {
        self.cache.read().get(ip).cloned()
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.cache.read().contains_key(ip)
    }

    /// All nodes, most recently discovered first
    pub fn get_all(&self) -> Vec<PeerNode> {
        let mut nodes: Vec<_> = self.cache.read().values().cloned().collect();
        nodes.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.ip.cmp(&b.ip)));
        nodes
    }

    /// Addresses not rediscovered within `threshold`
    pub fn get_stale(&self, threshold: Duration) -> Vec<String> {
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let now = Utc::now();

        self.cache
            .read()
            .values()
            .filter(|node| node.is_stale(threshold, now))
            .map(|node| node.ip.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn stats(&self) -> RegistryStats {
        let cache = self.cache.read();
        RegistryStats {
            total_nodes: cache.len(),
            online_nodes: cache.values().filter(|n| n.is_online).count(),
            staking_nodes: cache.values().filter(|n| n.is_staking).count(),
        }
    }

    /// Replace the persisted cross-restart peer set
    pub fn save_peer_set<'a, I>(&self, peers: I) -> Result<usize, RegistryError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.store.save_peer_set(peers)
    }

    pub fn load_peer_set(&self) -> Result<Vec<String>, RegistryError> {
        self.store.load_peer_set()
    }

    /// Flush all changes to disk
    pub fn flush(&self) -> Result<(), RegistryError> {
        self.store.flush()
    }

    fn address_lock(&self, ip: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(ip.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Fold one liveness result into the node's statistics
pub fn apply_liveness(node: &mut PeerNode, is_online: bool, now: DateTime<Utc>) {
    if node.first_seen.is_none() {
        node.first_seen = Some(now);
    }

    node.total_pings += 1;

    if is_online {
        node.online_pings += 1;
        // Gap since the previous ping, not cumulative session time
        if let Some(last_ping) = node.last_ping {
            node.uptime_seconds = (now - last_ping).num_seconds().max(0);
        }
    } else {
        node.uptime_seconds = 0;
    }

    node.is_online = is_online;
    node.is_staking = is_staking(node.total_pings, node.online_pings, node.first_seen, now);
    node.last_ping = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn geo(country: &str) -> GeoInfo {
        GeoInfo {
            country: country.to_string(),
            ..Default::default()
        }
    }

    fn open_registry() -> (tempfile::TempDir, NodeRegistry) {
        let dir = tempdir().unwrap();
        let registry = NodeRegistry::open(dir.path()).unwrap();
        (dir, registry)
    }

    /// Run `total` probes five minutes apart, the first `offline` of them failing
    fn run_pings(registry: &NodeRegistry, ip: &str, total: u64, offline: u64) -> PeerNode {
        let start = Utc::now() - chrono::Duration::minutes(5 * total as i64);
        let mut last = None;
        for i in 0..total {
            let at = start + chrono::Duration::minutes(5 * i as i64);
            last = Some(registry.record_liveness_at(ip, i >= offline, at).unwrap());
        }
        last.unwrap()
    }

    #[test]
    fn test_upsert_creates_once() {
        let (_dir, registry) = open_registry();

        let (node, created) = registry.upsert_discovered("93.184.216.34", geo("US")).unwrap();
        assert!(created);
        assert_eq!(node.total_pings, 0);
        assert!(node.first_seen.is_none());

        let (node, created) = registry.upsert_discovered("93.184.216.34", geo("CA")).unwrap();
        assert!(!created);
        assert_eq!(node.geo.country, "CA");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_upsert_keeps_counters() {
        let (_dir, registry) = open_registry();
        registry.upsert_discovered("8.8.4.4", geo("US")).unwrap();
        registry.record_liveness("8.8.4.4", true).unwrap();
        registry.record_liveness("8.8.4.4", false).unwrap();

        let (node, _) = registry.upsert_discovered("8.8.4.4", geo("US")).unwrap();
        assert_eq!(node.total_pings, 2);
        assert_eq!(node.online_pings, 1);
        assert!(node.first_seen.is_some());
    }

    #[test]
    fn test_liveness_unknown_node() {
        let (_dir, registry) = open_registry();
        let result = registry.record_liveness("1.2.3.4", true);
        assert!(matches!(result, Err(RegistryError::UnknownNode(_))));
    }

    #[test]
    fn test_first_seen_set_once() {
        let (_dir, registry) = open_registry();
        registry.upsert_discovered("5.5.5.5", geo("FR")).unwrap();

        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let first = registry.record_liveness_at("5.5.5.5", false, t0).unwrap();
        let second = registry
            .record_liveness_at("5.5.5.5", true, t0 + chrono::Duration::minutes(2))
            .unwrap();

        assert_eq!(first.first_seen, Some(t0));
        assert_eq!(second.first_seen, Some(t0));
        assert!(second.online_pings <= second.total_pings);
    }

    #[test]
    fn test_uptime_is_gap_since_previous_ping() {
        let (_dir, registry) = open_registry();
        registry.upsert_discovered("6.6.6.6", geo("DE")).unwrap();

        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let node = registry.record_liveness_at("6.6.6.6", true, t0).unwrap();
        assert_eq!(node.uptime_seconds, 0);

        let node = registry
            .record_liveness_at("6.6.6.6", true, t0 + chrono::Duration::seconds(120))
            .unwrap();
        assert_eq!(node.uptime_seconds, 120);

        let node = registry
            .record_liveness_at("6.6.6.6", true, t0 + chrono::Duration::seconds(300))
            .unwrap();
        assert_eq!(node.uptime_seconds, 180);
    }

    #[test]
    fn test_offline_resets_uptime() {
        let (_dir, registry) = open_registry();
        registry.upsert_discovered("7.7.7.7", geo("NL")).unwrap();

        let t0 = Utc::now() - chrono::Duration::minutes(10);
        registry.record_liveness_at("7.7.7.7", true, t0).unwrap();
        let node = registry
            .record_liveness_at("7.7.7.7", true, t0 + chrono::Duration::seconds(240))
            .unwrap();
        assert_eq!(node.uptime_seconds, 240);

        let node = registry
            .record_liveness_at("7.7.7.7", false, t0 + chrono::Duration::seconds(360))
            .unwrap();
        assert_eq!(node.uptime_seconds, 0);
        assert!(!node.is_online);
    }

    #[test]
    fn test_staking_boundaries() {
        let (_dir, registry) = open_registry();

        // 12 pings spanning 55 minutes: all online but observed < 1h
        registry.upsert_discovered("10.1.0.1", geo("US")).unwrap();
        let node = run_pings(&registry, "10.1.0.1", 12, 0);
        assert!(!node.is_staking);

        // 11/12 online over an hour
        registry.upsert_discovered("10.1.0.2", geo("US")).unwrap();
        let start = Utc::now() - chrono::Duration::minutes(70);
        for i in 0..12 {
            registry
                .record_liveness_at("10.1.0.2", i != 0, start + chrono::Duration::minutes(6 * i))
                .unwrap();
        }
        let node = registry.get("10.1.0.2").unwrap();
        assert_eq!((node.total_pings, node.online_pings), (12, 11));
        assert!(!node.is_staking);

        // 12/12 online over an hour
        registry.upsert_discovered("10.1.0.3", geo("US")).unwrap();
        for i in 0..12 {
            registry
                .record_liveness_at("10.1.0.3", true, start + chrono::Duration::minutes(6 * i))
                .unwrap();
        }
        assert!(registry.get("10.1.0.3").unwrap().is_staking);
    }

    #[test]
    fn test_staking_flips_back() {
        let (_dir, registry) = open_registry();
        registry.upsert_discovered("10.2.0.1", geo("US")).unwrap();

        let start = Utc::now() - chrono::Duration::minutes(120);
        for i in 0..12 {
            registry
                .record_liveness_at("10.2.0.1", true, start + chrono::Duration::minutes(6 * i))
                .unwrap();
        }
        assert!(registry.get("10.2.0.1").unwrap().is_staking);

        // 12/13 = 92%
        let node = registry
            .record_liveness_at("10.2.0.1", false, start + chrono::Duration::minutes(80))
            .unwrap();
        assert!(!node.is_staking);
    }

    #[test]
    fn test_get_all_orders_by_last_seen() {
        let (_dir, registry) = open_registry();
        registry.upsert_discovered("1.0.0.1", geo("A")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.upsert_discovered("1.0.0.2", geo("B")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.upsert_discovered("1.0.0.3", geo("C")).unwrap();

        let ips: Vec<_> = registry.get_all().into_iter().map(|n| n.ip).collect();
        assert_eq!(ips, vec!["1.0.0.3", "1.0.0.2", "1.0.0.1"]);
    }

    #[test]
    fn test_get_stale() {
        let (_dir, registry) = open_registry();
        registry.upsert_discovered("2.0.0.1", geo("A")).unwrap();

        assert!(registry.get_stale(Duration::from_secs(60)).is_empty());
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(registry.get_stale(Duration::from_millis(10)), vec!["2.0.0.1"]);
    }

    #[test]
    fn test_concurrent_same_address_updates() {
        let (_dir, registry) = open_registry();
        let registry = Arc::new(registry);
        registry.upsert_discovered("3.0.0.1", geo("A")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        registry.record_liveness("3.0.0.1", i % 2 == 0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let node = registry.get("3.0.0.1").unwrap();
        assert_eq!(node.total_pings, 200);
        assert_eq!(node.online_pings, 100);
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();

        {
            let registry = NodeRegistry::open(dir.path()).unwrap();
            registry.upsert_discovered("4.0.0.1", geo("JP")).unwrap();
            registry.record_liveness("4.0.0.1", true).unwrap();
            registry.save_peer_set(&vec!["4.0.0.1".to_string(), "4.0.0.2".to_string()]).unwrap();
            registry.flush().unwrap();
        }

        let registry = NodeRegistry::open(dir.path()).unwrap();
        let node = registry.get("4.0.0.1").unwrap();
        assert_eq!(node.geo.country, "JP");
        assert_eq!(node.total_pings, 1);
        assert_eq!(registry.load_peer_set().unwrap().len(), 2);
    }
}
