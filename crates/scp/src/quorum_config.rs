//! Conversion between configured quorum sets and engine quorum sets.
//!
//! Configuration expresses thresholds as a percentage of the entries at each
//! level and validators as 64-character hex node ids:
//!
//! ```toml
//! [node.quorum_set]
//! threshold_percent = 67
//! validators = ["<hex>", "<hex>", "<hex>"]
//!
//! [[node.quorum_set.inner_sets]]
//! threshold_percent = 51
//! validators = ["<hex>", "<hex>"]
//! ```

use fba_common::config::{QuorumSetConfig, ThresholdPercent};
use thiserror::Error;
use tracing::warn;

use crate::quorum::{get_all_nodes, is_quorum_set_sane};
use crate::types::{NodeId, QuorumSet};

/// Below this percentage quorums of the configured set need not intersect.
pub const MINIMUM_SAFE_THRESHOLD_PERCENT: u32 = 51;

/// Errors converting or validating a configured quorum set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuorumConfigError {
    /// A validator key is not 64 hex characters.
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    /// The computed threshold does not fit the number of entries.
    #[error("threshold {threshold} exceeds entry count {entry_count}")]
    InvalidThreshold { threshold: u32, entry_count: usize },

    /// The resulting quorum set fails the structural checks.
    #[error("invalid quorum set: {0}")]
    InvalidStructure(String),
}

/// Threshold for `percent` of `total` entries, rounded up, at least 1.
pub fn threshold_from_percent(percent: u32, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let needed = (percent as usize * total).div_ceil(100);
    needed.clamp(1, total) as u32
}

/// Build a [`QuorumSet`] from its configured form.
///
/// Levels are converted recursively and the result must pass
/// [`is_quorum_set_sane`] without extra checks.
pub fn config_to_quorum_set(config: &QuorumSetConfig) -> Result<QuorumSet, QuorumConfigError> {
    let qset = convert(config)?;
    is_quorum_set_sane(&qset, false).map_err(QuorumConfigError::InvalidStructure)?;
    Ok(qset)
}

fn convert(config: &QuorumSetConfig) -> Result<QuorumSet, QuorumConfigError> {
    let validators = config
        .validators
        .iter()
        .map(|key| parse_node_id(key))
        .collect::<Result<Vec<_>, _>>()?;
    let inner_sets = config
        .inner_sets
        .iter()
        .map(convert)
        .collect::<Result<Vec<_>, _>>()?;

    let total = validators.len() + inner_sets.len();
    let threshold = threshold_from_percent(config.threshold_percent.value(), total);
    if threshold as usize > total {
        return Err(QuorumConfigError::InvalidThreshold {
            threshold,
            entry_count: total,
        });
    }

    Ok(QuorumSet::new(threshold, validators, inner_sets))
}

/// Parse a node id from 64 hex characters (surrounding whitespace allowed).
pub fn parse_node_id(key: &str) -> Result<NodeId, QuorumConfigError> {
    let key = key.trim();
    if key.len() != 64 {
        return Err(QuorumConfigError::InvalidNodeId(key.to_string()));
    }
    NodeId::from_hex(key).map_err(|_| QuorumConfigError::InvalidNodeId(key.to_string()))
}

/// Render a quorum set back to configuration form.
///
/// Thresholds are expressed as the smallest percentage that converts back
/// to the same threshold.
pub fn quorum_set_to_config(qset: &QuorumSet) -> QuorumSetConfig {
    let total = qset.entry_count();
    let percent = if total == 0 {
        0
    } else {
        (0..=100u32)
            .find(|p| threshold_from_percent(*p, total) == qset.threshold)
            .unwrap_or(100)
    };
    QuorumSetConfig {
        threshold_percent: ThresholdPercent::new(percent),
        validators: qset.validators.iter().map(NodeId::to_hex).collect(),
        inner_sets: qset.inner_sets.iter().map(quorum_set_to_config).collect(),
    }
}

/// Check that a configured quorum set can be used for consensus.
///
/// Hard failures are returned as errors. Settings that are legal but
/// weaken safety or liveness are logged.
pub fn validate_quorum_config(config: &QuorumSetConfig) -> Result<(), QuorumConfigError> {
    let qset = config_to_quorum_set(config)?;

    if get_all_nodes(&qset).is_empty() {
        warn!("Quorum set has no validators; the node cannot reach consensus");
    }

    let percent = config.threshold_percent.value();
    if percent < MINIMUM_SAFE_THRESHOLD_PERCENT {
        warn!(
            threshold_percent = percent,
            "Quorum threshold is below {}%; quorums may not intersect", MINIMUM_SAFE_THRESHOLD_PERCENT
        );
    }
    if percent == 100 && !config.validators.is_empty() {
        warn!("Quorum threshold is 100%; any validator failure blocks consensus");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_id(seed: u8) -> String {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        hex::encode(bytes)
    }

    fn config(percent: u32, validators: &[u8]) -> QuorumSetConfig {
        QuorumSetConfig {
            threshold_percent: ThresholdPercent::new(percent),
            validators: validators.iter().map(|s| hex_id(*s)).collect(),
            inner_sets: Vec::new(),
        }
    }

    #[test]
    fn test_threshold_from_percent() {
        assert_eq!(threshold_from_percent(67, 3), 3);
        assert_eq!(threshold_from_percent(67, 4), 3);
        assert_eq!(threshold_from_percent(67, 5), 4);
        assert_eq!(threshold_from_percent(51, 2), 2);
        assert_eq!(threshold_from_percent(0, 4), 1);
        assert_eq!(threshold_from_percent(100, 7), 7);
        assert_eq!(threshold_from_percent(50, 0), 0);
    }

    #[test]
    fn test_parse_node_id() {
        let id = parse_node_id(&format!("  {}  ", hex_id(7))).unwrap();
        assert_eq!(id.as_bytes()[0], 7);

        assert!(matches!(
            parse_node_id("abcd"),
            Err(QuorumConfigError::InvalidNodeId(_))
        ));
        let bad = "zz".repeat(32);
        assert!(parse_node_id(&bad).is_err());
    }

    #[test]
    fn test_config_to_quorum_set_nested() {
        let mut cfg = config(67, &[1, 2]);
        cfg.inner_sets.push(config(51, &[3, 4, 5]));

        let qset = config_to_quorum_set(&cfg).unwrap();
        // 67% of 3 entries rounds up to all of them
        assert_eq!(qset.threshold, 3);
        assert_eq!(qset.validators.len(), 2);
        assert_eq!(qset.inner_sets[0].threshold, 2);
        assert_eq!(get_all_nodes(&qset).len(), 5);
    }

    #[test]
    fn test_config_rejects_duplicates_and_empty() {
        let dup = config(67, &[1, 1]);
        assert!(matches!(
            config_to_quorum_set(&dup),
            Err(QuorumConfigError::InvalidStructure(_))
        ));

        let empty = config(67, &[]);
        assert!(config_to_quorum_set(&empty).is_err());
    }

    #[test]
    fn test_quorum_set_to_config_preserves_threshold() {
        let mut cfg = config(67, &[1, 2, 3, 4]);
        cfg.inner_sets.push(config(100, &[5, 6]));
        let qset = config_to_quorum_set(&cfg).unwrap();

        let back = quorum_set_to_config(&qset);
        assert_eq!(config_to_quorum_set(&back).unwrap(), qset);
    }

    #[test]
    fn test_validate_quorum_config() {
        assert!(validate_quorum_config(&config(67, &[1, 2, 3])).is_ok());
        // low thresholds are legal, only warned about
        assert!(validate_quorum_config(&config(20, &[1, 2, 3])).is_ok());
        assert!(validate_quorum_config(&config(67, &[])).is_err());
    }
}
