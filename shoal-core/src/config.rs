//! Centralized configuration for Shoal.
//!
//! All tunable parameters of the download engine live here. Defaults carry
//! the values the swarm logic was tuned with; every section can be adjusted
//! per download and the most useful knobs via environment variables.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must lie in (0, 1], got {value}")]
    Fraction { field: &'static str, value: f64 },

    #[error("Invalid configuration: {reason}")]
    Inconsistent { reason: String },
}

/// Central configuration for a download engine instance.
#[derive(Debug, Clone, Default)]
pub struct ShoalConfig {
    pub swarm: SwarmConfig,
    pub verification: VerificationConfig,
    pub selection: SelectionConfig,
    pub worker: WorkerConfig,
    pub ranker: RankerConfig,
    pub disk: DiskConfig,
    pub simulation: SimulationConfig,
}

/// Swarm sizing and coordinator pacing.
///
/// Capacity tiers map the best measured aggregate bandwidth (kilobits per
/// second) to a worker ceiling.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// How long the coordinator waits for a worker notification before iterating
    pub worker_interval: Duration,
    /// Bound on a single wait for pending disk writes
    pub pending_wait: Duration,
    /// Bandwidth assumed before any measurement exists
    pub default_bandwidth_kbps: u64,
    /// User cap on download bandwidth (None = unlimited)
    pub max_download_kbps: Option<u64>,
    /// Upper bound of the modem tier
    pub modem_tier_kbps: u64,
    /// Upper bound of the DSL/cable/T1 tier
    pub broadband_tier_kbps: u64,
    pub modem_capacity: usize,
    pub broadband_capacity: usize,
    pub fast_capacity: usize,
    /// Fixed capacity overriding the bandwidth tiers
    pub fixed_capacity: Option<usize>,
    /// Workers below this speed (bytes per second) may be stolen from
    pub min_acceptable_speed: u64,
    /// Time a worker must stream before its speed counts as measured
    pub bandwidth_warmup: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            worker_interval: Duration::from_secs(2),
            pending_wait: Duration::from_secs(1),
            default_bandwidth_kbps: 1000, // cable
            max_download_kbps: None,
            modem_tier_kbps: 56,
            broadband_tier_kbps: 1500,
            modem_capacity: 3,
            broadband_capacity: 8,
            fast_capacity: 14,
            fixed_capacity: None,
            min_acceptable_speed: 10 * 1024,
            bandwidth_warmup: Duration::from_secs(1),
        }
    }
}

/// Chunk verification and corruption budget.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Chunk size used when no hash tree is known
    pub default_chunk_size: u64,
    /// Fraction of the file that may be lost before the download is hopeless
    pub max_corruption: f64,
    /// Fraction lost under one tree before that tree is abandoned
    pub max_corruption_for_tree: f64,
    /// Verified chunks beyond which a replacement tree is refused
    pub tree_swap_limit_chunks: u64,
    /// Forget corrupt chunks instead of keeping them in the corrupt set
    pub discard_corrupt: bool,
    /// Rename a corrupt incomplete file instead of deleting it
    pub quarantine_corrupt: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 131_072, // 128 KiB
            max_corruption: 0.9,
            max_corruption_for_tree: 0.1,
            tree_swap_limit_chunks: 2,
            discard_corrupt: true,
            quarantine_corrupt: false,
        }
    }
}

/// Which selection policy leases white ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionKind {
    Random,
    BiasedRandom,
}

/// Range selection tuning.
///
/// The preview thresholds were tuned for a specific network; treat them as
/// product decisions rather than invariants.
#[derive(Debug, Clone)]
pub struct SelectionConfig {
    pub strategy: SelectionKind,
    /// Previewable prefix always fetched first
    pub preview_min_bytes: u64,
    /// Below this fraction of the file the first candidate is always taken
    pub full_bias_fraction: f64,
    /// Below this fraction the first candidate is taken half the time
    pub half_bias_fraction: f64,
    /// Idle users get fully random selection
    pub idle_threshold: Duration,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionKind::BiasedRandom,
            preview_min_bytes: 1024 * 1024, // 1 MiB
            full_bias_fraction: 0.10,
            half_bias_fraction: 0.50,
            idle_threshold: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Per-source worker timeouts and retry policy.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Smallest lease produced when splitting the file tail between workers
    pub min_split_size: u64,
    pub direct_connect_timeout: Duration,
    pub push_connect_timeout: Duration,
    /// Push wait when the source came from an alternate-location hint
    pub hinted_push_connect_timeout: Duration,
    /// Socket inactivity allowed while streaming
    pub read_timeout: Duration,
    /// Backoff for partial sources that have nothing we need
    pub no_ranges_retry_after: Duration,
    /// Backoff after a transport failure
    pub failed_retry_after: Duration,
    /// Busy backoff when no other worker is downloading
    pub busy_retry_none_active: Duration,
    /// Busy backoff when other workers are downloading
    pub busy_retry_some_active: Duration,
    /// Failures tolerated before a source is reported bad
    pub max_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_split_size: 16 * 1024, // 16 KiB
            direct_connect_timeout: Duration::from_secs(10),
            push_connect_timeout: Duration::from_secs(20),
            hinted_push_connect_timeout: Duration::from_secs(6),
            read_timeout: Duration::from_secs(60),
            no_ranges_retry_after: Duration::from_secs(300),
            failed_retry_after: Duration::from_secs(60),
            busy_retry_none_active: Duration::from_secs(60),
            busy_retry_some_active: Duration::from_secs(600),
            max_failures: 2,
        }
    }
}

/// Source ranking and liveness probing.
#[derive(Debug, Clone)]
pub struct RankerConfig {
    /// New hosts probed per round
    pub probe_batch: usize,
    /// Probing stops once this many hosts are verified
    pub max_verified_hosts: usize,
    /// Minimum spacing between probe rounds
    pub probe_interval: Duration,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            probe_batch: 10,
            max_verified_hosts: 5,
            probe_interval: Duration::from_secs(2),
        }
    }
}

/// Disk write queue sizing.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Number of pooled write buffers
    pub write_buffers: usize,
    /// Capacity of each pooled buffer
    pub write_buffer_size: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            write_buffers: 8,
            write_buffer_size: 65_536, // 64 KiB
        }
    }
}

/// Deterministic execution settings.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    /// Seed for selection randomness; None draws from the OS
    pub deterministic_seed: Option<u64>,
}

impl ShoalConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(capacity) = std::env::var("SHOAL_SWARM_CAPACITY")
            && let Ok(count) = capacity.parse::<usize>()
        {
            config.swarm.fixed_capacity = Some(count);
        }

        if let Ok(interval) = std::env::var("SHOAL_WORKER_INTERVAL_MS")
            && let Ok(millis) = interval.parse::<u64>()
        {
            config.swarm.worker_interval = Duration::from_millis(millis);
            config.ranker.probe_interval = Duration::from_millis(millis);
        }

        if let Ok(speed) = std::env::var("SHOAL_MIN_ACCEPTABLE_SPEED")
            && let Ok(bytes) = speed.parse::<u64>()
        {
            config.swarm.min_acceptable_speed = bytes;
        }

        if let Ok(discard) = std::env::var("SHOAL_DISCARD_CORRUPT") {
            config.verification.discard_corrupt = discard.parse().unwrap_or(true);
        }

        if let Ok(strategy) = std::env::var("SHOAL_SELECTION") {
            match strategy.to_lowercase().as_str() {
                "random" => config.selection.strategy = SelectionKind::Random,
                "biased" | "biased-random" => {
                    config.selection.strategy = SelectionKind::BiasedRandom
                }
                other => tracing::warn!("Ignoring unknown SHOAL_SELECTION value: {other}"),
            }
        }

        if let Ok(buffers) = std::env::var("SHOAL_WRITE_BUFFERS")
            && let Ok(count) = buffers.parse::<usize>()
        {
            config.disk.write_buffers = count.max(1);
        }

        if let Ok(seed) = std::env::var("SHOAL_SEED")
            && let Ok(seed_value) = seed.parse::<u64>()
        {
            config.simulation.deterministic_seed = Some(seed_value);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short pacing intervals and a fixed seed keep runs fast and repeatable.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.swarm.worker_interval = Duration::from_millis(20);
        config.swarm.pending_wait = Duration::from_millis(50);
        config.swarm.bandwidth_warmup = Duration::from_millis(100);
        config.ranker.probe_interval = Duration::from_millis(20);
        config.worker.direct_connect_timeout = Duration::from_millis(500);
        config.worker.push_connect_timeout = Duration::from_millis(500);
        config.worker.hinted_push_connect_timeout = Duration::from_millis(300);
        config.worker.read_timeout = Duration::from_secs(2);
        config.simulation.deterministic_seed = Some(42);
        config
    }

    /// Checks values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Zero` - If a size or count that must be positive is zero
    /// - `ConfigError::Fraction` - If a ratio lies outside (0, 1]
    /// - `ConfigError::Inconsistent` - If related settings contradict each other
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("verification.default_chunk_size", self.verification.default_chunk_size),
            ("worker.min_split_size", self.worker.min_split_size),
            ("disk.write_buffers", self.disk.write_buffers as u64),
            ("disk.write_buffer_size", self.disk.write_buffer_size as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        let fractions = [
            ("verification.max_corruption", self.verification.max_corruption),
            (
                "verification.max_corruption_for_tree",
                self.verification.max_corruption_for_tree,
            ),
            ("selection.full_bias_fraction", self.selection.full_bias_fraction),
            ("selection.half_bias_fraction", self.selection.half_bias_fraction),
        ];
        for (field, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Fraction { field, value });
            }
        }

        if self.selection.full_bias_fraction > self.selection.half_bias_fraction {
            return Err(ConfigError::Inconsistent {
                reason: format!(
                    "full bias fraction {} exceeds half bias fraction {}",
                    self.selection.full_bias_fraction, self.selection.half_bias_fraction
                ),
            });
        }
        if self.swarm.modem_tier_kbps >= self.swarm.broadband_tier_kbps {
            return Err(ConfigError::Inconsistent {
                reason: "modem tier must be below broadband tier".to_string(),
            });
        }
        Ok(())
    }

    /// Random source for one download's selection strategy.
    pub fn selection_rng(&self) -> Box<dyn RngCore + Send> {
        match self.simulation.deterministic_seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(StdRng::from_os_rng()),
        }
    }
}
