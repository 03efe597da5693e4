//! Configuration for quillmq.
//!
//! Loads a structured TOML file into strongly-typed structs using
//! `serde` + `toml`.
//!
//! # Example `quillmq.toml`
//! ```toml
//! [memory]
//! rate_interval_ms  = 5000
//! duration_target_s = 10.0   # omit for unbounded RAM
//!
//! [index]
//! segment_size = 16384
//!
//! [file_cache]
//! limit          = 0     # 0 = discover from the process ulimit
//! reserved       = 2
//! reevaluate_ms  = 2000
//!
//! [queue]
//! unsent_message_limit = 100
//! sync_timeout_ms      = 25
//!
//! [plugins]
//! dir          = "plugins"
//! enabled_file = "enabled_plugins"
//! ```

use std::{fs, path::Path};

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Interval between rate remeasurements, in milliseconds.
    pub rate_interval_ms: u64,
    /// Target number of seconds of messages to keep in RAM. Omitted = unbounded.
    pub duration_target_s: Option<f64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            rate_interval_ms: 5_000,
            duration_target_s: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    /// Entries per on-disk index segment.
    pub segment_size: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            segment_size: 16_384,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FileCacheConfig {
    /// Soft cap on open handles. 0 = discover from the process limit.
    pub limit: usize,
    /// Slots kept free below the discovered limit.
    pub reserved: usize,
    /// How often the cache server re-evaluates while over cap, in milliseconds.
    pub reevaluate_ms: u64,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        FileCacheConfig {
            limit: 0,
            reserved: 2,
            reevaluate_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueTuning {
    /// Deliveries in flight to one channel before its consumers are blocked.
    pub unsent_message_limit: u32,
    /// Idle window before a pending index sync is forced, in milliseconds.
    pub sync_timeout_ms: u64,
}

impl Default for QueueTuning {
    fn default() -> Self {
        QueueTuning {
            unsent_message_limit: 100,
            sync_timeout_ms: 25,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PluginsConfig {
    pub dir: String,
    pub enabled_file: String,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        PluginsConfig {
            dir: "plugins".to_string(),
            enabled_file: "enabled_plugins".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub memory: MemoryConfig,
    pub index: IndexConfig,
    pub file_cache: FileCacheConfig,
    pub queue: QueueTuning,
    pub plugins: PluginsConfig,
}

/// Load configuration from a TOML file into `Config`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(&path)?;
    let cfg: Config = toml::from_str(&raw)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_sections() {
        let cfg: Config = toml::from_str("[memory]\nrate_interval_ms = 100\n").unwrap();
        assert_eq!(cfg.memory.rate_interval_ms, 100);
        assert_eq!(cfg.index.segment_size, 16_384);
        assert_eq!(cfg.queue.unsent_message_limit, 100);
    }
}
