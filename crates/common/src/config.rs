//! Configuration types for a consensus node.
//!
//! Configuration is loaded from a TOML file and covers the node identity and
//! quorum set, consensus timing, and logging.
//!
//! # Example Configuration (TOML)
//!
//! ```toml
//! [node]
//! node_id = "0101010101010101010101010101010101010101010101010101010101010101"
//! is_validator = true
//!
//! [node.quorum_set]
//! threshold_percent = 67
//! validators = [
//!     "0101010101010101010101010101010101010101010101010101010101010101",
//!     "0202020202020202020202020202020202020202020202020202020202020202",
//!     "0303030303030303030303030303030303030303030303030303030303030303",
//! ]
//!
//! [scp]
//! max_slots = 12
//!
//! [logging]
//! level = "debug"
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

/// Log levels for filtering log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The directive string understood by `tracing` filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// A threshold percentage value constrained to 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThresholdPercent(u32);

impl ThresholdPercent {
    /// Create a new threshold percentage, clamping to 0-100.
    pub fn new(value: u32) -> Self {
        Self(value.min(100))
    }

    /// Get the percentage value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Default for ThresholdPercent {
    fn default() -> Self {
        Self(67)
    }
}

impl From<ThresholdPercent> for u32 {
    fn from(value: ThresholdPercent) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for ThresholdPercent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u32::deserialize(deserializer)?;
        if value > 100 {
            return Err(serde::de::Error::custom(
                "threshold_percent must be between 0 and 100",
            ));
        }
        Ok(Self(value))
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and quorum set.
    #[serde(default)]
    pub node: NodeConfig,

    /// Consensus engine tuning.
    #[serde(default)]
    pub scp: ScpConfig,

    /// Logging configuration (level and format).
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity and consensus membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hex-encoded 32-byte public key of this node.
    ///
    /// Required for validators.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Whether this node votes, or only observes consensus.
    #[serde(default)]
    pub is_validator: bool,

    /// The quorum set this node trusts.
    #[serde(default)]
    pub quorum_set: QuorumSetConfig,
}

/// Quorum set configuration.
///
/// Thresholds are given as a percentage of the entries (validators plus
/// inner sets) at each level; nested sets express hierarchical trust.
///
/// ```toml
/// [node.quorum_set]
/// threshold_percent = 67
/// validators = ["<hex>", "<hex>", "<hex>"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuorumSetConfig {
    /// Threshold percentage (0-100) of entries that must agree. Default: 67
    #[serde(default)]
    pub threshold_percent: ThresholdPercent,

    /// Hex-encoded public keys of validators in this set.
    #[serde(default)]
    pub validators: Vec<String>,

    /// Nested quorum sets, each counted as a single entry.
    #[serde(default)]
    pub inner_sets: Vec<QuorumSetConfig>,
}

/// Consensus engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScpConfig {
    /// Number of recent slots kept in memory when purging.
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,

    /// Nomination timeout per round, in milliseconds.
    #[serde(default = "default_timeout_base_ms")]
    pub nomination_timeout_base_ms: u64,

    /// Ballot timeout per counter, in milliseconds.
    #[serde(default = "default_timeout_base_ms")]
    pub ballot_timeout_base_ms: u64,

    /// Upper bound on any single timeout, in milliseconds.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            max_slots: default_max_slots(),
            nomination_timeout_base_ms: default_timeout_base_ms(),
            ballot_timeout_base_ms: default_timeout_base_ms(),
            max_timeout_ms: default_max_timeout_ms(),
        }
    }
}

impl ScpConfig {
    /// Timeout for a nomination round or ballot counter.
    ///
    /// Grows linearly with `round` and saturates at `max_timeout_ms`.
    pub fn timeout_for(&self, round: u32, is_nomination: bool) -> Duration {
        let base = if is_nomination {
            self.nomination_timeout_base_ms
        } else {
            self.ballot_timeout_base_ms
        };
        let millis = base
            .saturating_mul(u64::from(round.max(1)))
            .min(self.max_timeout_ms);
        Duration::from_millis(millis)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter. Default: `Info`
    #[serde(default)]
    pub level: LogLevel,

    /// Log output format. Default: `Text`
    #[serde(default)]
    pub format: LogFormat,
}

fn default_max_slots() -> usize {
    12
}

fn default_timeout_base_ms() -> u64 {
    1000
}

fn default_max_timeout_ms() -> u64 {
    30 * 60 * 1000
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, contains invalid TOML,
    /// or fails [`Config::validate`].
    pub fn from_file(path: &Path) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, crate::Error> {
        let config: Config =
            toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render this configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Check cross-field requirements that serde cannot express.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.node.is_validator && self.node.node_id.is_none() {
            return Err(crate::Error::Config(
                "validators must set node.node_id".to_string(),
            ));
        }
        if self.node.is_validator && self.node.quorum_set.validators.is_empty()
            && self.node.quorum_set.inner_sets.is_empty()
        {
            return Err(crate::Error::Config(
                "validators must configure a non-empty node.quorum_set".to_string(),
            ));
        }
        if self.scp.max_slots == 0 {
            return Err(crate::Error::Config(
                "scp.max_slots must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
