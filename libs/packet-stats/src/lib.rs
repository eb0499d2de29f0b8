//! Receive-side statistics: protocol counters, per-flow counters and
//! digests, and the single-writer/multi-reader flow map that holds them.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod digest;
mod flat_cache;
pub mod flow;
mod protocol;
mod seqlock;

pub use digest::TDigest;
pub use flat_cache::FlatCache;
pub use flow::map::{FlowMap, FlowNode, ReadGuard, ReaderId};
pub use flow::{FlowCounterFlags, FlowCounters, FlowDigestFlags, FlowKey};
pub use protocol::{ProtocolCounters, ProtocolFlags};
pub use seqlock::SeqLock;
