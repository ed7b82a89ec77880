//! Federated Byzantine Agreement consensus engine.
//!
//! Nodes agree on one value per slot without a closed membership. Each node
//! picks the peers it trusts through a [`QuorumSet`]; agreement is reached
//! when those choices intersect.
//!
//! ## Key Concepts
//!
//! - **Quorum slice**: a subset of a node's quorum set sufficient to convince it
//! - **Quorum**: a set of nodes containing a slice of each member
//! - **V-blocking set**: a set intersecting every slice of a node
//! - **Federated voting**: a statement is *accepted* when a v-blocking set
//!   accepted it or a quorum voted for or accepted it, and *confirmed* when a
//!   quorum accepted it
//!
//! ## Protocol Phases
//!
//! 1. **Nomination**: nodes vote on candidate values and combine the
//!    confirmed candidates into a composite value
//! 2. **Ballot protocol**: nodes commit to a ballot `(counter, value)`
//!    - PREPARE: abort every incompatible lower ballot
//!    - CONFIRM: a commit has been accepted
//!    - EXTERNALIZE: the value is final for the slot
//!
//! The engine does no I/O. Networking, signing, value semantics and timers
//! are supplied through [`SCPDriver`].
//!
//! ```ignore
//! use fba_scp::{EnvelopeState, SCP};
//!
//! let scp = SCP::new(node_id, true, quorum_set, Arc::new(driver));
//! scp.nominate(slot_index, value, &prev_value);
//! if scp.receive_envelope(&envelope) == EnvelopeState::Invalid {
//!     // drop the peer's message
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

mod ballot;
mod compare;
mod driver;
mod error;
mod format;
mod info;
mod nomination;
mod quorum;
pub mod quorum_config;
mod scp;
mod slot;
pub mod types;

pub use ballot::{BallotPhase, BallotProtocol, MAX_PROTOCOL_TRANSITIONS};
pub use compare::{
    are_ballots_compatible, are_ballots_less_and_compatible, are_ballots_less_and_incompatible,
    is_newer_statement,
};
pub use driver::{
    base_get_node_weight, compute_weight, SCPDriver, SCPTimerType, TimerCallback, ValidationLevel,
};
pub use error::ScpError;
pub use format::{
    ballot_to_str, envelope_to_str, node_id_to_short_string, node_id_to_string, value_to_str,
};
pub use info::{
    BallotInfo, BallotValue, CommitBounds, NodeInfo, NominationInfo, QuorumInfo, SlotInfo,
};
pub use nomination::NominationProtocol;
pub use quorum::{
    find_closest_v_blocking, get_all_nodes, hash_quorum_set, is_blocking_set, is_quorum,
    is_quorum_set_sane, is_quorum_slice, is_quorum_with, is_v_blocking, is_v_blocking_with,
    nodes_matching, normalize_quorum_set, normalize_quorum_set_with_remove, simple_quorum_set,
    singleton_quorum_set, MAXIMUM_QUORUM_NESTING_LEVEL, MAXIMUM_QUORUM_NODES,
};
pub use quorum_config::{
    config_to_quorum_set, parse_node_id, quorum_set_to_config, validate_quorum_config,
    QuorumConfigError,
};
pub use scp::SCP;
pub use slot::Slot;
pub use types::{
    Ballot, Confirm, Envelope, Externalize, NodeId, Nomination, Pledges, Prepare, QuorumSet,
    Signature, Statement, Value,
};

pub use fba_common::Hash256;

/// Result type for local API calls.
pub type Result<T> = std::result::Result<T, ScpError>;

/// A slot index.
pub type SlotIndex = u64;

/// Per-call context shared by the nomination and ballot protocols.
pub(crate) struct SlotContext<'a, D: SCPDriver> {
    pub local_node_id: &'a NodeId,
    pub local_quorum_set: &'a QuorumSet,
    pub driver: &'a Arc<D>,
    pub slot_index: u64,
}

impl<'a, D: SCPDriver> SlotContext<'a, D> {
    pub fn local_quorum_set_hash(&self) -> Hash256 {
        self.driver.hash_quorum_set(self.local_quorum_set)
    }

    /// Quorum set a statement was made under.
    ///
    /// EXTERNALIZE statements stand on their own and resolve to a singleton
    /// set of the sender. Other statements resolve by declared hash: the
    /// local set for our own statements, then the driver's hash lookup, then
    /// the sender's known set if its hash matches.
    pub fn statement_quorum_set(&self, statement: &Statement) -> Option<QuorumSet> {
        if let Pledges::Externalize(_) = statement.pledges {
            return Some(quorum::singleton_quorum_set(statement.node_id));
        }

        let hash = statement.pledges.quorum_set_hash();
        if statement.node_id == *self.local_node_id && hash == self.local_quorum_set_hash() {
            return Some(self.local_quorum_set.clone());
        }
        if let Some(qset) = self.driver.get_quorum_set_by_hash(&hash) {
            return Some(qset);
        }
        self.driver
            .get_quorum_set(&statement.node_id)
            .filter(|qset| self.driver.hash_quorum_set(qset) == hash)
    }

    /// Build and sign an envelope for a local statement.
    pub fn sign_statement(&self, pledges: Pledges) -> Envelope {
        let mut envelope = Envelope::unsigned(Statement {
            node_id: *self.local_node_id,
            slot_index: self.slot_index,
            pledges,
        });
        self.driver.sign_envelope(&mut envelope);
        envelope
    }
}

/// Visit `envelopes` in node order, stopping when `f` returns false.
///
/// The local node's envelope is skipped while the slot is not fully
/// validated, unless `force_self` is set.
pub(crate) fn process_envelopes_current_state<F>(
    envelopes: &HashMap<NodeId, Envelope>,
    mut f: F,
    local_node_id: &NodeId,
    fully_validated: bool,
    force_self: bool,
) -> bool
where
    F: FnMut(&Envelope) -> bool,
{
    let mut nodes: Vec<_> = envelopes.keys().collect();
    nodes.sort();

    for node_id in nodes {
        if !force_self && node_id == local_node_id && !fully_validated {
            continue;
        }
        if let Some(envelope) = envelopes.get(node_id) {
            if !f(envelope) {
                return false;
            }
        }
    }
    true
}

/// Outcome of processing an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Rejected: bad signature, insane, stale or carrying an invalid value.
    Invalid,
    /// Accepted without changing local state.
    Valid,
    /// Accepted and local state moved.
    ValidNew,
}

impl EnvelopeState {
    pub fn is_valid(&self) -> bool {
        matches!(self, EnvelopeState::Valid | EnvelopeState::ValidNew)
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnvelopeState::ValidNew)
    }
}

/// What the local node last heard from a peer for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumInfoNodeState {
    Missing,
    Nominating,
    Preparing,
    Confirming,
    Externalized,
}

impl QuorumInfoNodeState {
    pub fn from_pledges(pledges: &Pledges) -> Self {
        match pledges {
            Pledges::Nominate(_) => QuorumInfoNodeState::Nominating,
            Pledges::Prepare(_) => QuorumInfoNodeState::Preparing,
            Pledges::Confirm(_) => QuorumInfoNodeState::Confirming,
            Pledges::Externalize(_) => QuorumInfoNodeState::Externalized,
        }
    }

    /// Whether the peer has moved on to the ballot protocol.
    pub fn is_in_ballot(&self) -> bool {
        matches!(
            self,
            QuorumInfoNodeState::Preparing
                | QuorumInfoNodeState::Confirming
                | QuorumInfoNodeState::Externalized
        )
    }

    pub fn is_externalized(&self) -> bool {
        matches!(self, QuorumInfoNodeState::Externalized)
    }

    /// Upper-case label used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuorumInfoNodeState::Missing => "MISSING",
            QuorumInfoNodeState::Nominating => "NOMINATING",
            QuorumInfoNodeState::Preparing => "PREPARING",
            QuorumInfoNodeState::Confirming => "CONFIRMING",
            QuorumInfoNodeState::Externalized => "EXTERNALIZED",
        }
    }
}

/// An envelope as recorded in a slot's statement history.
#[derive(Debug, Clone)]
pub struct HistoricalStatement {
    pub envelope: Envelope,
    /// Sequence number of the statement within the slot.
    pub received_at: u64,
    /// Whether processing accepted the envelope.
    pub valid: bool,
}

/// Quorum set with node ids rendered as hex, for JSON dumps.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct QuorumSetJson {
    pub threshold: u32,
    pub validators: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inner_sets: Vec<QuorumSetJson>,
}

impl QuorumSetJson {
    pub fn from_quorum_set(qs: &QuorumSet) -> Self {
        Self {
            threshold: qs.threshold,
            validators: qs.validators.iter().map(NodeId::to_hex).collect(),
            inner_sets: qs.inner_sets.iter().map(Self::from_quorum_set).collect(),
        }
    }

    /// `None` if any validator is not a valid hex node id.
    pub fn to_quorum_set(&self) -> Option<QuorumSet> {
        let validators = self
            .validators
            .iter()
            .map(|s| parse_node_id(s).ok())
            .collect::<Option<Vec<_>>>()?;
        let inner_sets = self
            .inner_sets
            .iter()
            .map(Self::to_quorum_set)
            .collect::<Option<Vec<_>>>()?;
        Some(QuorumSet::new(self.threshold, validators, inner_sets))
    }
}
