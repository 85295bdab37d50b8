//! Engine configuration.
//!
//! Defaults are usable as-is. Overrides come from `FRIENDING_*` environment
//! variables ([`EngineConfig::from_env`]) or a TOML file
//! ([`EngineConfig::load`]).
//!
//! | Key                    | Env var                           | Default           |
//! |------------------------|-----------------------------------|-------------------|
//! | `warning_secs`         | `FRIENDING_WARNING_SECS`          | 30                |
//! | `signal_hop_delay_ms`  | `FRIENDING_SIGNAL_HOP_DELAY_MS`   | 400               |
//! | `min_duration_minutes` | `FRIENDING_MIN_DURATION_MINUTES`  | 1                 |
//! | `max_duration_minutes` | `FRIENDING_MAX_DURATION_MINUTES`  | 120               |
//! | `sit_out_policy`       | `FRIENDING_SIT_OUT_POLICY`        | `requester_first` |
//! | `weighting`            | `FRIENDING_WEIGHTING`             | `recency`         |
//! | `channel_name_prefix`  | `FRIENDING_CHANNEL_PREFIX`        | `Session`         |
//! | `category_name`        | `FRIENDING_CATEGORY`              | `Speed-friending` |
//! | `history_limit`        | `FRIENDING_HISTORY_LIMIT`         | 10                |

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use matchmaking::WeightingStrategy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Who sits out when the eligible pool is odd.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SitOutPolicy {
    /// The requester sits out if eligible, else the last eligible member.
    #[default]
    RequesterFirst,
    /// Always the last eligible member in pool order.
    LastInPool,
}

impl fmt::Display for SitOutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequesterFirst => write!(f, "requester_first"),
            Self::LastInPool => write!(f, "last_in_pool"),
        }
    }
}

impl FromStr for SitOutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requester_first" | "requester" => Ok(Self::RequesterFirst),
            "last_in_pool" | "last" => Ok(Self::LastInPool),
            other => Err(format!("unknown sit-out policy '{other}'")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid duration bounds: min {min} > max {max}")]
    InvalidBounds { min: u32, max: u32 },
}

/// Tunables for the round engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Length of the trailing warning span, in seconds.
    pub warning_secs: u64,
    /// Pause per channel during the audible signalling run.
    pub signal_hop_delay_ms: u64,
    pub min_duration_minutes: u32,
    pub max_duration_minutes: u32,
    pub sit_out_policy: SitOutPolicy,
    pub weighting: WeightingStrategy,
    pub channel_name_prefix: String,
    pub category_name: String,
    /// Default number of entries for personal history lookups.
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            warning_secs: 30,
            signal_hop_delay_ms: 400,
            min_duration_minutes: 1,
            max_duration_minutes: 120,
            sit_out_policy: SitOutPolicy::default(),
            weighting: WeightingStrategy::default(),
            channel_name_prefix: "Session".into(),
            category_name: "Speed-friending".into(),
            history_limit: 10,
        }
    }
}

impl EngineConfig {
    pub fn warning_span(&self) -> Duration {
        Duration::from_secs(self.warning_secs)
    }

    pub fn signal_hop_delay(&self) -> Duration {
        Duration::from_millis(self.signal_hop_delay_ms)
    }

    /// Whether `minutes` lies within the configured bounds.
    pub fn accepts_duration(&self, minutes: u32) -> bool {
        minutes > 0 && (self.min_duration_minutes..=self.max_duration_minutes).contains(&minutes)
    }

    /// Defaults overridden by `FRIENDING_*` environment variables.
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        override_parsed(&lookup, "FRIENDING_WARNING_SECS", &mut config.warning_secs);
        override_parsed(
            &lookup,
            "FRIENDING_SIGNAL_HOP_DELAY_MS",
            &mut config.signal_hop_delay_ms,
        );
        override_parsed(
            &lookup,
            "FRIENDING_MIN_DURATION_MINUTES",
            &mut config.min_duration_minutes,
        );
        override_parsed(
            &lookup,
            "FRIENDING_MAX_DURATION_MINUTES",
            &mut config.max_duration_minutes,
        );
        override_parsed(&lookup, "FRIENDING_SIT_OUT_POLICY", &mut config.sit_out_policy);
        override_parsed(&lookup, "FRIENDING_HISTORY_LIMIT", &mut config.history_limit);

        if let Some(raw) = lookup("FRIENDING_WEIGHTING") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "recency" => config.weighting = WeightingStrategy::Recency,
                "ever_met" | "evermet" => config.weighting = WeightingStrategy::EverMet,
                other => warn!(value = other, "Ignoring unknown FRIENDING_WEIGHTING"),
            }
        }
        if let Some(prefix) = lookup("FRIENDING_CHANNEL_PREFIX").filter(|s| !s.trim().is_empty()) {
            config.channel_name_prefix = prefix;
        }
        if let Some(category) = lookup("FRIENDING_CATEGORY").filter(|s| !s.trim().is_empty()) {
            config.category_name = category;
        }
        config
    }

    /// Parse a TOML document. Missing keys take defaults; unknown keys fail.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_duration_minutes > self.max_duration_minutes {
            return Err(ConfigError::InvalidBounds {
                min: self.min_duration_minutes,
                max: self.max_duration_minutes,
            });
        }
        Ok(())
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "Ignoring malformed config override"),
    }
}
