//! Control-API types for the analyzer subsystem.
//!
//! The request set mirrors what the message bus carries; transport
//! framing lives elsewhere. Flow ids pack the fields needed to find a
//! flow back into a stable 128-bit id, so `GET /rx-flows/{id}` needs no
//! side table.

use packet_stats::{FlowCounters, FlowKey, ProtocolCounters};
use uuid::Uuid;

use crate::sink::AnalyzerConfig;

#[derive(Debug)]
pub enum Request {
    ListAnalyzers { source: Option<String> },
    CreateAnalyzer(AnalyzerConfig),
    DeleteAnalyzers,
    GetAnalyzer { id: String },
    DeleteAnalyzer { id: String },
    StartAnalyzer { id: String },
    StopAnalyzer { id: String },
    ListAnalyzerResults,
    DeleteAnalyzerResults,
    GetAnalyzerResult { id: Uuid },
    DeleteAnalyzerResult { id: Uuid },
    ListRxFlows,
    GetRxFlow { id: Uuid },
}

#[derive(Debug, Clone)]
pub struct AnalyzerView {
    pub id: String,
    pub source: String,
    pub active: bool,
}

pub struct AnalyzerResultView {
    pub id: Uuid,
    pub analyzer_id: String,
    pub active: bool,
    pub protocol_counters: ProtocolCounters,
    pub flows: Vec<Uuid>,
}

pub struct RxFlowView {
    pub id: Uuid,
    pub result_id: Uuid,
    pub counters: FlowCounters,
}

pub enum Reply {
    Analyzers(Vec<AnalyzerView>),
    AnalyzerResults(Vec<AnalyzerResultView>),
    RxFlows(Vec<RxFlowView>),
    Started(Uuid),
    Ok,
}

const STREAM_ID_PRESENT: u16 = 0x8000;

/// Packs a flow's identity into a stable id: six bytes of the result
/// id, the shard index (top bit flags a stream id), the RSS hash and
/// the stream id.
pub fn rx_flow_id(result_id: &Uuid, shard_idx: u16, key: &FlowKey) -> Uuid {
    debug_assert!(shard_idx < STREAM_ID_PRESENT);

    let mut bytes = [0u8; 16];
    bytes[..6].copy_from_slice(&result_id.as_bytes()[..6]);

    let mut shard = shard_idx;
    if key.stream_id.is_some() {
        shard |= STREAM_ID_PRESENT;
    }
    bytes[6..8].copy_from_slice(&shard.to_be_bytes());
    bytes[8..12].copy_from_slice(&key.rss_hash.to_be_bytes());
    bytes[12..16].copy_from_slice(&key.stream_id.unwrap_or(0).to_be_bytes());

    Uuid::from_bytes(bytes)
}

/// Recovers `(result-id prefix, shard index, flow key)` from an rx-flow
/// id. The returned uuid has only its first six bytes populated; match
/// it against known result ids by prefix.
pub fn rx_flow_tuple(id: &Uuid) -> (Uuid, u16, FlowKey) {
    let bytes = id.as_bytes();

    let mut prefix = [0u8; 16];
    prefix[..6].copy_from_slice(&bytes[..6]);

    let shard = u16::from_be_bytes([bytes[6], bytes[7]]);
    let rss_hash = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let stream_id = (shard & STREAM_ID_PRESENT != 0)
        .then(|| u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]));

    (
        Uuid::from_bytes(prefix),
        shard & !STREAM_ID_PRESENT,
        FlowKey { rss_hash, stream_id },
    )
}

/// Prefix comparison for ids packed by [`rx_flow_id`].
pub fn result_id_matches(prefix: &Uuid, result_id: &Uuid) -> bool {
    prefix.as_bytes()[..6] == result_id.as_bytes()[..6]
}
