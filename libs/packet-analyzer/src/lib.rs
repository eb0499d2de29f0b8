//! The analyzer: a per-worker receive sink that keeps protocol counters
//! and per-flow statistics over everything it is fed.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod api;
mod server;
mod sink;

pub use server::Server;
pub use sink::{AnalyzerConfig, Sink, SinkResult};
