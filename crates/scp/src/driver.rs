//! Driver trait connecting the consensus engine to its embedding application.
//!
//! The engine knows nothing about what a value means, how to sign bytes, how
//! to reach peers, or how to wait for time to pass. All of that is supplied
//! through [`SCPDriver`]. Implementations must be deterministic where the
//! network depends on it: value validation, candidate combination and the
//! leader-selection hashes must produce the same answer on every node.
//!
//! # Example
//!
//! ```ignore
//! struct Node { /* application state */ }
//!
//! impl SCPDriver for Node {
//!     fn validate_value(&self, slot: u64, value: &Value, nomination: bool) -> ValidationLevel {
//!         ValidationLevel::FullyValidated
//!     }
//!     // ... other methods
//! }
//! ```

use std::time::Duration;

use fba_common::Hash256;

use crate::scp::SCP;
use crate::types::{Ballot, Envelope, NodeId, QuorumSet, Value};

/// Which of a slot's two timers a request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SCPTimerType {
    /// Fires to start the next nomination round.
    Nomination,
    /// Fires to abandon the current ballot and move to a higher counter.
    Ballot,
}

/// How much the driver trusts a value.
///
/// Ordered from least to most trusted, so the minimum over several values
/// gives the level of the statement carrying them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationLevel {
    /// The value must be rejected.
    Invalid,
    /// The value cannot be fully checked yet (for example it depends on
    /// state the node has not caught up to). Statements carrying it are
    /// processed, but the node stops broadcasting its own statements for
    /// the slot.
    MaybeValid,
    /// The value is known to be valid.
    FullyValidated,
}

/// Single-shot timer callback.
///
/// The embedder invokes it at most once, passing the engine that armed it.
pub type TimerCallback<D> = Box<dyn FnOnce(&SCP<D>) + Send + 'static>;

/// Callback interface implemented by the embedding application.
///
/// Methods fall into a few groups:
///
/// - **Validation**: [`validate_value`](Self::validate_value),
///   [`extract_valid_value`](Self::extract_valid_value)
/// - **Composition**: [`combine_candidates`](Self::combine_candidates)
/// - **Quorum set lookup**: [`get_quorum_set`](Self::get_quorum_set),
///   [`get_quorum_set_by_hash`](Self::get_quorum_set_by_hash)
/// - **Cryptography**: [`sign_envelope`](Self::sign_envelope),
///   [`verify_envelope`](Self::verify_envelope)
/// - **Leader selection**: [`compute_hash_node`](Self::compute_hash_node),
///   [`compute_value_hash`](Self::compute_value_hash),
///   [`get_node_weight`](Self::get_node_weight)
/// - **Network**: [`emit_envelope`](Self::emit_envelope)
/// - **Timing**: [`compute_timeout`](Self::compute_timeout),
///   [`setup_timer`](Self::setup_timer)
/// - **Notifications**: [`value_externalized`](Self::value_externalized) and
///   the telemetry hooks, which default to no-ops.
pub trait SCPDriver: Send + Sync + 'static {
    /// Validate a value for a slot.
    ///
    /// `nomination` is true when the value comes from a nomination
    /// statement rather than a ballot.
    fn validate_value(&self, slot_index: u64, value: &Value, nomination: bool) -> ValidationLevel;

    /// Fold the candidate set into a single composite value.
    ///
    /// Must be a pure function of `candidates`; every node combining the
    /// same set has to arrive at the same value.
    fn combine_candidates(&self, slot_index: u64, candidates: &[Value]) -> Option<Value>;

    /// Best-effort extraction of a valid value from a `MaybeValid` one.
    fn extract_valid_value(&self, slot_index: u64, value: &Value) -> Option<Value>;

    /// Hand a locally produced, fully validated envelope to the network.
    fn emit_envelope(&self, envelope: &Envelope);

    /// Quorum set of a node, if known.
    fn get_quorum_set(&self, node_id: &NodeId) -> Option<QuorumSet>;

    /// Quorum set by content hash.
    ///
    /// A `None` answer makes the referencing statement unsane.
    fn get_quorum_set_by_hash(&self, _hash: &Hash256) -> Option<QuorumSet> {
        None
    }

    /// The node started nominating `value` for a slot.
    fn nominating_value(&self, slot_index: u64, value: &Value);

    /// The slot has been externalized. Called at most once per slot.
    fn value_externalized(&self, slot_index: u64, value: &Value);

    /// The node accepted `ballot` as prepared.
    fn ballot_did_prepare(&self, slot_index: u64, ballot: &Ballot);

    /// The node confirmed `ballot` as committed.
    fn ballot_did_confirm(&self, slot_index: u64, ballot: &Ballot);

    fn accepted_ballot_prepared(&self, _slot_index: u64, _ballot: &Ballot) {}

    fn confirmed_ballot_prepared(&self, _slot_index: u64, _ballot: &Ballot) {}

    fn accepted_commit(&self, _slot_index: u64, _ballot: &Ballot) {}

    fn ballot_did_hear_from_quorum(&self, _slot_index: u64, _ballot: &Ballot) {}

    /// Nomination produced a composite and the ballot protocol started on it.
    fn started_ballot_protocol(&self, _slot_index: u64, _value: &Value) {}

    /// The composite candidate changed.
    fn updated_candidate_value(&self, _slot_index: u64, _value: &Value) {}

    /// Keyed hash used for round-leader selection.
    ///
    /// With `is_priority == false` the result is compared against the
    /// node's weight to decide whether it is eligible; with `true` it is the
    /// priority of an eligible node.
    fn compute_hash_node(
        &self,
        slot_index: u64,
        prev_value: &Value,
        is_priority: bool,
        round: u32,
        node_id: &NodeId,
    ) -> u64;

    /// Keyed hash used to pick among a leader's values.
    fn compute_value_hash(
        &self,
        slot_index: u64,
        prev_value: &Value,
        round: u32,
        value: &Value,
    ) -> u64;

    /// Timeout for a nomination round or ballot counter.
    fn compute_timeout(&self, round: u32, is_nomination: bool) -> Duration;

    /// Attach a signature to an outgoing envelope.
    fn sign_envelope(&self, envelope: &mut Envelope);

    /// Check the signature of an incoming envelope.
    fn verify_envelope(&self, envelope: &Envelope) -> bool;

    /// Arm or cancel a slot timer.
    ///
    /// A `Some` callback replaces any pending timer of the same type for the
    /// slot and must be invoked once after `timeout`. `None` cancels the
    /// pending timer; there is no separate cancel call.
    ///
    /// The engine holds its slot lock while calling this, so the callback
    /// must not be run from inside `setup_timer`.
    fn setup_timer(
        &self,
        _slot_index: u64,
        _timer_type: SCPTimerType,
        _timeout: Duration,
        _callback: Option<TimerCallback<Self>>,
    ) where
        Self: Sized,
    {
    }

    fn hash_quorum_set(&self, quorum_set: &QuorumSet) -> Hash256 {
        crate::quorum::hash_quorum_set(quorum_set)
    }

    /// Weight of `node_id` within `quorum_set`, between 0 and `u64::MAX`.
    fn get_node_weight(&self, node_id: &NodeId, quorum_set: &QuorumSet, is_local_node: bool) -> u64 {
        base_get_node_weight(node_id, quorum_set, is_local_node)
    }

    /// Short printable form of a value for logs.
    fn get_value_string(&self, value: &Value) -> String {
        crate::format::value_to_str(value)
    }

    fn get_hash_of(&self, data: &[u8]) -> Hash256 {
        Hash256::hash(data)
    }
}

/// `ceil(m * threshold / total)` computed in 128 bits.
pub fn compute_weight(m: u64, total: u64, threshold: u64) -> u64 {
    if threshold == 0 || total == 0 {
        return 0;
    }
    debug_assert!(threshold <= total);
    let numerator = u128::from(m) * u128::from(threshold);
    numerator.div_ceil(u128::from(total)) as u64
}

/// Default node weight.
///
/// The local node weighs `u64::MAX`. A validator listed at some level weighs
/// `threshold / total` of its parent's weight, starting from `u64::MAX` at
/// the top; nodes that do not appear weigh 0.
pub fn base_get_node_weight(node_id: &NodeId, quorum_set: &QuorumSet, is_local_node: bool) -> u64 {
    if is_local_node {
        return u64::MAX;
    }

    let total = quorum_set.entry_count() as u64;
    let threshold = u64::from(quorum_set.threshold);
    if threshold == 0 || total == 0 {
        return 0;
    }

    if quorum_set.validators.contains(node_id) {
        return compute_weight(u64::MAX, total, threshold);
    }

    quorum_set
        .inner_sets
        .iter()
        .map(|inner| base_get_node_weight(node_id, inner, false))
        .find(|w| *w > 0)
        .map(|leaf| compute_weight(leaf, total, threshold))
        .unwrap_or(0)
}
