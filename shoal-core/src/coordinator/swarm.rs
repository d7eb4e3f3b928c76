//! Swarm sizing from measured bandwidth.

use crate::config::SwarmConfig;

/// Converts bytes per second to kilobits per second.
pub fn bytes_per_sec_to_kbps(bytes_per_sec: f64) -> u64 {
    (bytes_per_sec * 8.0 / 1000.0) as u64
}

/// Worker ceiling for a download.
///
/// `best_bytes_per_sec` is the best aggregate rate seen so far; without one
/// the configured default bandwidth applies. A user bandwidth cap lowers the
/// tier, and a fixed capacity overrides the tiers entirely.
pub fn swarm_capacity(config: &SwarmConfig, best_bytes_per_sec: Option<f64>) -> usize {
    if let Some(fixed) = config.fixed_capacity {
        return fixed.max(1);
    }

    let mut kbps = best_bytes_per_sec
        .map(bytes_per_sec_to_kbps)
        .unwrap_or(config.default_bandwidth_kbps);
    if let Some(cap) = config.max_download_kbps {
        kbps = kbps.min(cap);
    }

    if kbps <= config.modem_tier_kbps {
        config.modem_capacity
    } else if kbps <= config.broadband_tier_kbps {
        config.broadband_capacity
    } else {
        config.fast_capacity
    }
}
