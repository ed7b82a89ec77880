//! Common types and utilities shared across the fba workspace.
//!
//! This crate provides the [`Hash256`] digest type used to reference quorum
//! sets by content, the TOML [`Config`] schema for a consensus node, and the
//! shared [`Error`] type.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    Config, LogFormat, LogLevel, LoggingConfig, NodeConfig, QuorumSetConfig, ScpConfig,
    ThresholdPercent,
};
pub use error::{Error, Result};
pub use types::Hash256;
