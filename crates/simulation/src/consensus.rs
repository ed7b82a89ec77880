//! Consensus checks across the nodes of a simulation.
//!
//! Two questions matter after a run: did every node get far enough, and did
//! every node decide the same thing. [`have_all_externalized`] answers the
//! first from each node's highest externalized slot; [`check_agreement`]
//! answers the second from each node's value for one slot.
//!
//! # Example
//!
//! ```
//! use fba_simulation::consensus::{have_all_externalized, ConsensusCheckResult};
//!
//! let highest = vec![10, 10, 9, 10];
//! assert!(have_all_externalized(&highest, 9, 5).is_externalized());
//! assert_eq!(
//!     have_all_externalized(&highest, 10, 5),
//!     ConsensusCheckResult::NotYetExternalized { min: 9, target: 10 }
//! );
//! ```

use std::collections::BTreeSet;
use std::fmt;

use fba_scp::{value_to_str, Value};

// =============================================================================
// Constants
// =============================================================================

/// Default maximum gap, in slots, between the slowest and fastest node.
pub const DEFAULT_MAX_SPREAD: u64 = 5;

// =============================================================================
// ConsensusCheckResult
// =============================================================================

/// Progress of a set of nodes towards a target slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusCheckResult {
    /// Every node has externalized the target slot.
    AllExternalized,

    /// At least one node is behind the target.
    NotYetExternalized {
        /// Lowest highest-externalized slot across nodes.
        min: u64,
        /// Slot being waited for.
        target: u64,
    },

    /// Nodes are too far apart.
    SpreadTooWide {
        min: u64,
        max: u64,
        max_spread: u64,
    },
}

impl ConsensusCheckResult {
    pub fn is_externalized(&self) -> bool {
        matches!(self, ConsensusCheckResult::AllExternalized)
    }

    pub fn is_spread_too_wide(&self) -> bool {
        matches!(self, ConsensusCheckResult::SpreadTooWide { .. })
    }
}

impl fmt::Display for ConsensusCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusCheckResult::AllExternalized => write!(f, "all nodes externalized"),
            ConsensusCheckResult::NotYetExternalized { min, target } => {
                write!(f, "not yet externalized: min slot {} < target {}", min, target)
            }
            ConsensusCheckResult::SpreadTooWide {
                min,
                max,
                max_spread,
            } => write!(
                f,
                "spread too wide: {}-{} = {} > max_spread {}",
                max,
                min,
                max - min,
                max_spread
            ),
        }
    }
}

/// Check whether every node has externalized at least `target`.
///
/// `highest_slots` holds each node's highest externalized slot, with 0 for a
/// node that has externalized nothing. The spread check runs first, so a
/// network with a node stuck far behind reports
/// [`ConsensusCheckResult::SpreadTooWide`] even if the target is low.
///
/// ```
/// use fba_simulation::consensus::have_all_externalized;
///
/// assert!(have_all_externalized(&[3, 3, 3], 3, 5).is_externalized());
/// assert!(have_all_externalized(&[1, 9, 4], 1, 5).is_spread_too_wide());
/// assert!(have_all_externalized(&[], 7, 5).is_externalized());
/// ```
pub fn have_all_externalized(
    highest_slots: &[u64],
    target: u64,
    max_spread: u64,
) -> ConsensusCheckResult {
    let (Some(&min), Some(&max)) = (highest_slots.iter().min(), highest_slots.iter().max()) else {
        return ConsensusCheckResult::AllExternalized;
    };

    if max - min > max_spread {
        return ConsensusCheckResult::SpreadTooWide {
            min,
            max,
            max_spread,
        };
    }

    if min >= target {
        ConsensusCheckResult::AllExternalized
    } else {
        ConsensusCheckResult::NotYetExternalized { min, target }
    }
}

// =============================================================================
// Agreement
// =============================================================================

/// What the nodes decided for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgreementResult {
    /// Every node externalized this value.
    Agreed(Value),

    /// Some nodes have not decided yet; those that did agree.
    Incomplete {
        decided: usize,
        total: usize,
    },

    /// Two nodes externalized different values.
    Diverged(Vec<Value>),
}

impl AgreementResult {
    pub fn is_agreed(&self) -> bool {
        matches!(self, AgreementResult::Agreed(_))
    }

    pub fn is_diverged(&self) -> bool {
        matches!(self, AgreementResult::Diverged(_))
    }
}

impl fmt::Display for AgreementResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgreementResult::Agreed(value) => write!(f, "agreed on {}", value_to_str(value)),
            AgreementResult::Incomplete { decided, total } => {
                write!(f, "{} of {} nodes decided", decided, total)
            }
            AgreementResult::Diverged(values) => {
                let values: Vec<String> = values.iter().map(value_to_str).collect();
                write!(f, "diverged: [{}]", values.join(", "))
            }
        }
    }
}

/// Compare the values each node externalized for a slot.
///
/// Divergence wins over incompleteness: two conflicting decisions are a
/// safety failure no matter how many nodes are still undecided.
pub fn check_agreement(values: &[Option<Value>]) -> AgreementResult {
    let decided: BTreeSet<&Value> = values.iter().flatten().collect();

    if decided.len() > 1 {
        return AgreementResult::Diverged(decided.into_iter().cloned().collect());
    }

    let count = values.iter().filter(|v| v.is_some()).count();
    match decided.into_iter().next() {
        Some(value) if count == values.len() => AgreementResult::Agreed(value.clone()),
        _ => AgreementResult::Incomplete {
            decided: count,
            total: values.len(),
        },
    }
}
