//! Consensus data model.
//!
//! Node identities, opaque values, ballots, quorum sets and the signed
//! statements exchanged between nodes. Every type here is plain data with a
//! canonical `bincode` encoding, which is what signatures and quorum set
//! hashes are computed over.

use std::fmt;

use fba_common::Hash256;
use serde::{Deserialize, Serialize};

/// Public key identifying a node. Ordered by byte value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a node id from 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Hash256::from_hex(s).map(|h| Self(h.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// An opaque value being agreed upon.
///
/// The engine never interprets the bytes; ordering is byte-lexicographic and
/// only used to break ties and keep value sets canonical.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Value(pub Vec<u8>);

impl Value {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", hex::encode(&self.0[..self.0.len().min(8)]))
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Signature bytes attached to an envelope by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// A `(counter, value)` pair.
///
/// The derived ordering compares the counter first, then the value bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub counter: u32,
    pub value: Value,
}

impl Ballot {
    pub fn new(counter: u32, value: Value) -> Self {
        Self { counter, value }
    }
}

/// A node's trust configuration: a threshold over validators and nested sets.
///
/// Each inner set counts as a single entry towards the threshold of its
/// parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuorumSet {
    pub threshold: u32,
    pub validators: Vec<NodeId>,
    pub inner_sets: Vec<QuorumSet>,
}

impl QuorumSet {
    pub fn new(threshold: u32, validators: Vec<NodeId>, inner_sets: Vec<QuorumSet>) -> Self {
        Self {
            threshold,
            validators,
            inner_sets,
        }
    }

    /// Number of entries (validators plus inner sets) at the top level.
    pub fn entry_count(&self) -> usize {
        self.validators.len() + self.inner_sets.len()
    }
}

/// Nomination pledge: values voted for and values accepted.
///
/// Both lists are strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nomination {
    pub quorum_set_hash: Hash256,
    pub votes: Vec<Value>,
    pub accepted: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Prepare {
    pub quorum_set_hash: Hash256,
    pub ballot: Ballot,
    pub prepared: Option<Ballot>,
    pub prepared_prime: Option<Ballot>,
    pub n_c: u32,
    pub n_h: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Confirm {
    pub ballot: Ballot,
    pub n_prepared: u32,
    pub n_commit: u32,
    pub n_h: u32,
    pub quorum_set_hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Externalize {
    pub commit: Ballot,
    pub n_h: u32,
    pub commit_quorum_set_hash: Hash256,
}

/// The phase-specific body of a statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pledges {
    Nominate(Nomination),
    Prepare(Prepare),
    Confirm(Confirm),
    Externalize(Externalize),
}

impl Pledges {
    /// Hash of the quorum set the sender declared with this pledge.
    pub fn quorum_set_hash(&self) -> Hash256 {
        match self {
            Pledges::Nominate(nom) => nom.quorum_set_hash,
            Pledges::Prepare(prep) => prep.quorum_set_hash,
            Pledges::Confirm(conf) => conf.quorum_set_hash,
            Pledges::Externalize(ext) => ext.commit_quorum_set_hash,
        }
    }

    pub fn is_nomination(&self) -> bool {
        matches!(self, Pledges::Nominate(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Pledges::Nominate(_) => "NOMINATE",
            Pledges::Prepare(_) => "PREPARE",
            Pledges::Confirm(_) => "CONFIRM",
            Pledges::Externalize(_) => "EXTERNALIZE",
        }
    }
}

/// A pledge made by one node about one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement {
    pub node_id: NodeId,
    pub slot_index: u64,
    pub pledges: Pledges,
}

impl Statement {
    /// Canonical bytes covered by the envelope signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

/// A signed statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Envelope {
    pub statement: Statement,
    pub signature: Signature,
}

impl Envelope {
    /// Wrap a statement with an empty signature, to be filled by the driver.
    pub fn unsigned(statement: Statement) -> Self {
        Self {
            statement,
            signature: Signature::default(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.statement.node_id
    }

    pub fn slot_index(&self) -> u64 {
        self.statement.slot_index
    }

    pub fn pledges(&self) -> &Pledges {
        &self.statement.pledges
    }
}
