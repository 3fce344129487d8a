//! Core types for peer tracking and the live subscription protocol
//!
//! `PeerNode` is the stored shape of a tracked address (bincode in RocksDB).
//! `NodeRecord` is the camelCase JSON shape sent to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// GEOLOCATION
// =============================================================================

/// Lookup status of a usable response. Only such responses create nodes.
pub const STATUS_SUCCESS: &str = "success";

/// Geolocation and network ownership attributes of an address.
///
/// Field names match the lookup service payload so the same struct is
/// decoded from the service and re-emitted to observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeoInfo {
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub region_name: String,
    pub city: String,
    pub district: String,
    pub zip: String,
    pub lat: f64,
    pub lon: f64,
    pub timezone: String,
    pub currency: String,
    pub isp: String,
    pub org: String,
    #[serde(rename = "as")]
    pub as_number: String,
    pub continent: String,
    pub query: String,
    pub mobile: bool,
    pub proxy: bool,
    pub hosting: bool,
}

// =============================================================================
// PEER NODE
// =============================================================================

/// Everything known about one network address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerNode {
    /// IPv4 literal, unique key
    pub ip: String,

    /// Attributes from the most recent successful enrichment
    pub geo: GeoInfo,

    /// Most recent discovery in the node output
    pub last_seen: DateTime<Utc>,

    /// First liveness update, set once
    pub first_seen: Option<DateTime<Utc>>,

    /// Result of the most recent liveness update
    pub is_online: bool,

    /// Time of the most recent liveness update
    pub last_ping: Option<DateTime<Utc>>,

    pub total_pings: u64,
    pub online_pings: u64,

    /// Gap between the two most recent pings when online, 0 when offline
    pub uptime_seconds: i64,

    /// Derived from the ping counters on every liveness update
    pub is_staking: bool,
}

impl PeerNode {
    /// Fresh row for a newly enriched address
    pub fn discovered(ip: &str, geo: GeoInfo, now: DateTime<Utc>) -> Self {
        Self {
            ip: ip.to_string(),
            geo,
            last_seen: now,
            first_seen: None,
            is_online: false,
            last_ping: None,
            total_pings: 0,
            online_pings: 0,
            uptime_seconds: 0,
            is_staking: false,
        }
    }

    /// Share of liveness checks that found the node online
    pub fn online_ratio(&self) -> f64 {
        if self.total_pings == 0 {
            return 0.0;
        }
        self.online_pings as f64 / self.total_pings as f64
    }

    /// Whether the last discovery is older than `threshold`
    pub fn is_stale(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.last_seen < now - threshold
    }

    pub fn to_record(&self, is_new: bool) -> NodeRecord {
        NodeRecord {
            ip: self.ip.clone(),
            status: STATUS_SUCCESS.to_string(),
            geo: self.geo.clone(),
            last_seen: self.last_seen,
            is_new,
            is_online: self.is_online,
            last_ping: self.last_ping,
            first_seen: self.first_seen,
            total_pings: self.total_pings,
            online_pings: self.online_pings,
            uptime: self.uptime_seconds,
            is_staking: self.is_staking,
        }
    }
}

// =============================================================================
// LIVE SUBSCRIPTION PROTOCOL
// =============================================================================

/// Node state as sent to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub ip: String,
    /// Lookup status the node was stored with
    pub status: String,
    #[serde(flatten)]
    pub geo: GeoInfo,
    pub last_seen: DateTime<Utc>,
    /// Set only on the update emitted right after a first discovery
    pub is_new: bool,
    pub is_online: bool,
    pub last_ping: Option<DateTime<Utc>>,
    pub first_seen: Option<DateTime<Utc>>,
    pub total_pings: u64,
    pub online_pings: u64,
    /// Uptime estimate in seconds
    pub uptime: i64,
    pub is_staking: bool,
}

/// Server to observer messages.
///
/// Untagged on the wire: a snapshot is a JSON array, an update a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Every known node, most recently discovered first
    Snapshot(Vec<NodeRecord>),

    /// One node whose state changed
    Update(NodeRecord),
}

/// Observer to server messages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Liveness observed by the client itself
    StatusUpdate(StatusReport),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(alias = "address")]
    pub ip: String,
    pub is_online: bool,
    #[serde(default)]
    pub last_ping: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latency: Option<i64>,
}
