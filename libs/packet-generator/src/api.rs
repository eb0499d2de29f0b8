//! Control-API types for the generator subsystem.

use uuid::Uuid;

use crate::source::SourceConfig;

#[derive(Debug)]
pub enum Request {
    ListGenerators { target: Option<String> },
    CreateGenerator(SourceConfig),
    DeleteGenerators,
    GetGenerator { id: String },
    DeleteGenerator { id: String },
    StartGenerator { id: String },
    StopGenerator { id: String },
    ListGeneratorResults,
    DeleteGeneratorResults,
    GetGeneratorResult { id: Uuid },
    DeleteGeneratorResult { id: Uuid },
    ListTxFlows,
    GetTxFlow { id: Uuid },
}

#[derive(Debug, Clone)]
pub struct GeneratorView {
    pub id: String,
    pub target: String,
    pub active: bool,
}

/// Aggregated transmit counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowCountersView {
    pub packets_actual: u64,
    pub octets_actual: u64,
    /// Expected counts derived from the recorded duration and the
    /// configured rate; absent until traffic has flowed.
    pub packets_intended: Option<u64>,
    pub octets_intended: Option<u64>,
    pub first: Option<u64>,
    pub last: Option<u64>,
}

pub struct GeneratorResultView {
    pub id: Uuid,
    pub generator_id: String,
    pub active: bool,
    pub counters: FlowCountersView,
    pub flows: Vec<Uuid>,
}

pub struct TxFlowView {
    pub id: Uuid,
    pub result_id: Uuid,
    pub counters: FlowCountersView,
}

pub enum Reply {
    Generators(Vec<GeneratorView>),
    GeneratorResults(Vec<GeneratorResultView>),
    TxFlows(Vec<TxFlowView>),
    Started(Uuid),
    Ok,
}

/// Packs a tx-flow id: the first eight bytes of the result id followed
/// by the flow index, big endian.
pub fn tx_flow_id(result_id: &Uuid, flow_idx: u64) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&result_id.as_bytes()[..8]);
    bytes[8..].copy_from_slice(&flow_idx.to_be_bytes());
    Uuid::from_bytes(bytes)
}

/// Recovers `(result-id prefix, flow index)` from a tx-flow id. The
/// returned uuid has only its first eight bytes populated.
pub fn tx_flow_tuple(id: &Uuid) -> (Uuid, u64) {
    let bytes = id.as_bytes();

    let mut prefix = [0u8; 16];
    prefix[..8].copy_from_slice(&bytes[..8]);

    let flow_idx = u64::from_be_bytes(bytes[8..].try_into().expect("uuid length"));

    (Uuid::from_bytes(prefix), flow_idx)
}

/// Prefix comparison for ids packed by [`tx_flow_id`].
pub fn result_id_matches(prefix: &Uuid, result_id: &Uuid) -> bool {
    prefix.as_bytes()[..8] == result_id.as_bytes()[..8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_flow_id_round_trips() {
        let result_id = Uuid::new_v4();

        let id = tx_flow_id(&result_id, 0x0102_0304_0506_0708);
        let (prefix, flow_idx) = tx_flow_tuple(&id);

        assert!(result_id_matches(&prefix, &result_id));
        assert_eq!(flow_idx, 0x0102_0304_0506_0708);
    }
}
