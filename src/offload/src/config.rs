use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Idle backoff tuning for worker loops. The delay doubles after each empty
/// poll, is multiplied by a random jitter factor, and is capped; any
/// successful dequeue resets it to the floor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_delay_us: u64,
    pub cap_us: u64,
    pub jitter_frac: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay_us: 1,
            cap_us: 1000,
            jitter_frac: 0.25,
        }
    }
}

impl BackoffConfig {
    #[inline]
    pub fn floor(&self) -> Duration {
        Duration::from_micros(self.initial_delay_us)
    }

    #[inline]
    pub fn cap(&self) -> Duration {
        Duration::from_micros(self.cap_us)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of worker cores. 0 means one per available CPU.
    pub worker_count: usize,
    /// Spawn all workers together and barrier them before any starts polling.
    pub gang_schedule: bool,
    /// Capacity of the shared job ring. Rounded up to a power of two.
    pub queue_depth: usize,
    /// Capacity of the host-side job descriptor pool.
    pub pool_size: usize,
    /// Per-worker scratch arena for inbound (GET) argument windows, in bytes.
    pub scratch_size: usize,
    /// Size of each of the two per-worker outbound (PUT) buffers, in bytes.
    pub put_buffer_size: usize,
    pub log_level: String,
    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: 0,
            gang_schedule: false,
            queue_depth: 256,
            pool_size: 256,
            scratch_size: 64 * 1024,
            put_buffer_size: 64 * 1024,
            log_level: "info".to_string(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.queue_depth, config.queue_depth);
        assert_eq!(back.scratch_size, config.scratch_size);
        assert_eq!(back.backoff.cap_us, config.backoff.cap_us);
    }

    #[test]
    fn unknown_fields_rejected() {
        let text = "worker_count = 2\nfrobnicate = true\n";
        assert!(toml::from_str::<Config>(text).is_err());
    }
}
