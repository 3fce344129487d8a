//! Staking Classification
//!
//! A node counts as a staking candidate once it has been observed long
//! enough and answered nearly every liveness check.

use chrono::{DateTime, Duration, Utc};

/// Minimum liveness checks before a node can qualify
pub const MIN_TOTAL_PINGS: u64 = 12;

/// Minimum time since the first liveness check (seconds)
pub const MIN_OBSERVED_SECS: i64 = 3600;

/// Minimum share of checks that found the node online
pub const MIN_ONLINE_RATIO: f64 = 0.95;

/// Evaluate the staking heuristic from the ping counters
pub fn is_staking(
    total_pings: u64,
    online_pings: u64,
    first_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let Some(first_seen) = first_seen else {
        return false;
    };

    if total_pings < MIN_TOTAL_PINGS {
        return false;
    }

    if now - first_seen < Duration::seconds(MIN_OBSERVED_SECS) {
        return false;
    }

    online_pings as f64 / total_pings as f64 >= MIN_ONLINE_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes_ago(now: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
        Some(now - Duration::minutes(minutes))
    }

    #[test]
    fn test_ratio_boundary() {
        let now = Utc::now();

        // 11/12 = 91.6%
        assert!(!is_staking(12, 11, minutes_ago(now, 60), now));
        assert!(is_staking(12, 12, minutes_ago(now, 60), now));
        // 19/20 = 95% exactly
        assert!(is_staking(20, 19, minutes_ago(now, 90), now));
    }

    #[test]
    fn test_requires_observation_time() {
        let now = Utc::now();
        assert!(!is_staking(12, 12, minutes_ago(now, 59), now));
        assert!(!is_staking(12, 12, None, now));
    }

    #[test]
    fn test_requires_ping_count() {
        let now = Utc::now();
        assert!(!is_staking(11, 11, minutes_ago(now, 600), now));
    }
}
