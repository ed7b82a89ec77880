//! Serializable snapshots of slot state for diagnostics.
//!
//! These structures are debug output only; nothing in the engine reads them
//! back. Values are rendered with [`value_to_str`](crate::format::value_to_str)
//! and node ids with the short hex form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Snapshot of one slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot_index: u64,
    /// `NOMINATION`, `PREPARE`, `CONFIRM` or `EXTERNALIZE`.
    pub phase: String,
    pub fully_validated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nomination: Option<NominationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ballot: Option<BallotInfo>,
}

/// Nomination sub-protocol state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NominationInfo {
    pub running: bool,
    pub round: u32,
    pub votes: Vec<String>,
    pub accepted: Vec<String>,
    pub candidates: Vec<String>,
    /// Number of nodes with a recorded nomination.
    pub node_count: usize,
}

/// Ballot sub-protocol state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotInfo {
    pub phase: String,
    pub ballot_counter: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ballot_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared: Option<BallotValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared_prime: Option<BallotValue>,
    /// `[c, h]` when a commit is in progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitBounds>,
    /// Counter of `h`, 0 when unset.
    pub high: u32,
    pub node_count: usize,
    pub heard_from_quorum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotValue {
    pub counter: u32,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitBounds {
    pub low: u32,
    pub high: u32,
}

/// Which nodes of the local quorum set the slot has heard from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumInfo {
    pub slot_index: u64,
    pub local_node: String,
    pub quorum_set_hash: String,
    /// Keyed by short node id; ordered for stable output.
    pub nodes: BTreeMap<String, NodeInfo>,
    /// Whether the ballot senders form a quorum for the local node.
    pub quorum_reached: bool,
    /// Whether the senders are v-blocking for the local node.
    pub v_blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// `MISSING`, `NOMINATING`, `PREPARING`, `CONFIRMING` or `EXTERNALIZED`.
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ballot_counter: Option<u32>,
}
