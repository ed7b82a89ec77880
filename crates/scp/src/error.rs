//! Error types for consensus API calls.
//!
//! Statements received from the network are never reported through these
//! errors: a malformed or stale statement simply yields
//! [`EnvelopeState::Invalid`](crate::EnvelopeState::Invalid). `ScpError` is
//! reserved for misuse of the local API (restoring state into the wrong
//! slot, configuring an unusable quorum set, and similar).

use thiserror::Error;

use crate::quorum_config::QuorumConfigError;

/// Errors returned by the engine's local API.
#[derive(Debug, Error)]
pub enum ScpError {
    /// The envelope is malformed or addressed to the wrong slot or node.
    #[error("invalid SCP message: {0}")]
    InvalidMessage(String),

    /// The quorum set does not pass the sanity checks.
    #[error("invalid quorum set: {0}")]
    InvalidQuorumSet(String),

    /// The envelope signature failed verification.
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// The driver rejected a value.
    #[error("value validation failed: {0}")]
    ValueValidationFailed(String),

    /// The requested slot is not in memory.
    #[error("slot not found: {0}")]
    SlotNotFound(u64),

    /// The operation is not allowed in the current protocol state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The node configuration does not describe a usable identity or
    /// quorum set.
    #[error("configuration error: {0}")]
    Config(#[from] QuorumConfigError),

    /// Canonical encoding of a statement or quorum set failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// An internal state error occurred.
    #[error("internal state error: {0}")]
    InternalError(String),
}
