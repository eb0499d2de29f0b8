//! The traffic generator: expands protocol/modifier/length
//! specifications into deterministic packet sequences and transforms
//! driver buffers into complete packets at a configured rate.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod api;
mod server;
mod source;
pub mod traffic;

pub use server::Server;
pub use source::{Source, SourceConfig, SourceLoad, SourceResult, TrafficDuration, TxCounter};

/// Errors produced while building traffic configurations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported field for this protocol: {0}")]
    UnsupportedField(String),
    #[error("modifier value type does not match the field")]
    ModifierTypeMismatch,
    #[error("inconsistent sequence parameters: {0}")]
    BadSequence(String),
    #[error("a traffic definition needs at least one header")]
    EmptyDefinition,
}
