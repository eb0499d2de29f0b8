//! Request evaluation against the generator registries.

use std::collections::HashMap;
use std::sync::Arc;

use packet_types::ApiError;
use uuid::Uuid;

use crate::api::{
    FlowCountersView, GeneratorResultView, GeneratorView, Reply, Request, TxFlowView,
    result_id_matches, tx_flow_id, tx_flow_tuple,
};
use crate::source::{Source, SourceConfig, SourceResult, TxCounter};

pub struct Server {
    sources: HashMap<String, Source>,
    results: HashMap<Uuid, Arc<SourceResult>>,
    result_owner: HashMap<Uuid, String>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            results: HashMap::new(),
            result_owner: HashMap::new(),
        }
    }

    pub fn source(&self, id: &str) -> Option<&Source> {
        self.sources.get(id)
    }

    pub fn handle(&mut self, request: Request) -> Result<Reply, ApiError> {
        match request {
            Request::ListGenerators { target } => {
                let mut views: Vec<GeneratorView> = self
                    .sources
                    .values()
                    .filter(|source| {
                        target
                            .as_deref()
                            .is_none_or(|target| source.target() == target)
                    })
                    .map(view)
                    .collect();
                views.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(Reply::Generators(views))
            }
            Request::CreateGenerator(config) => {
                if self.sources.contains_key(&config.id) {
                    return Err(ApiError::AlreadyExists);
                }
                let source = Source::new(config);
                let created = view(&source);
                self.sources.insert(created.id.clone(), source);
                Ok(Reply::Generators(vec![created]))
            }
            Request::DeleteGenerators => {
                self.sources.retain(|_, source| source.active());
                Ok(Reply::Ok)
            }
            Request::GetGenerator { id } => {
                let source = self.sources.get(&id).ok_or(ApiError::NotFound)?;
                Ok(Reply::Generators(vec![view(source)]))
            }
            Request::DeleteGenerator { id } => {
                let source = self.sources.get(&id).ok_or(ApiError::NotFound)?;
                if source.active() {
                    return Err(ApiError::FailedPrecondition(
                        "generator is running".to_string(),
                    ));
                }
                self.sources.remove(&id);
                Ok(Reply::Ok)
            }
            Request::StartGenerator { id } => {
                let source = self.sources.get(&id).ok_or(ApiError::NotFound)?;
                if source.active() {
                    return Err(ApiError::FailedPrecondition(
                        "generator is already running".to_string(),
                    ));
                }

                let result = Arc::new(SourceResult::new(source));
                let result_id = Uuid::new_v4();
                source.start(result.clone());

                self.results.insert(result_id, result);
                self.result_owner.insert(result_id, id.clone());
                Ok(Reply::Started(result_id))
            }
            Request::StopGenerator { id } => {
                let source = self.sources.get(&id).ok_or(ApiError::NotFound)?;
                source.stop();
                Ok(Reply::Ok)
            }
            Request::ListGeneratorResults => {
                let views = self
                    .results
                    .keys()
                    .filter_map(|id| self.result_view(id))
                    .collect();
                Ok(Reply::GeneratorResults(views))
            }
            Request::DeleteGeneratorResults => {
                let active: Vec<Uuid> = self
                    .results
                    .keys()
                    .filter(|id| self.result_active(id))
                    .copied()
                    .collect();
                self.results.retain(|id, _| active.contains(id));
                self.result_owner.retain(|id, _| active.contains(id));
                Ok(Reply::Ok)
            }
            Request::GetGeneratorResult { id } => {
                let result = self.result_view(&id).ok_or(ApiError::NotFound)?;
                Ok(Reply::GeneratorResults(vec![result]))
            }
            Request::DeleteGeneratorResult { id } => {
                if !self.results.contains_key(&id) {
                    return Err(ApiError::NotFound);
                }
                if self.result_active(&id) {
                    return Err(ApiError::FailedPrecondition(
                        "generator result is in use".to_string(),
                    ));
                }
                self.results.remove(&id);
                self.result_owner.remove(&id);
                Ok(Reply::Ok)
            }
            Request::ListTxFlows => {
                let mut flows = Vec::new();
                for (result_id, result) in &self.results {
                    for (flow_idx, counter) in result.counters().iter().enumerate() {
                        flows.push(TxFlowView {
                            id: tx_flow_id(result_id, flow_idx as u64),
                            result_id: *result_id,
                            counters: flow_counters(counter),
                        });
                    }
                }
                Ok(Reply::TxFlows(flows))
            }
            Request::GetTxFlow { id } => {
                let (prefix, flow_idx) = tx_flow_tuple(&id);
                let (result_id, result) = self
                    .results
                    .iter()
                    .find(|(result_id, _)| result_id_matches(&prefix, result_id))
                    .ok_or(ApiError::NotFound)?;

                let counter = result
                    .counters()
                    .get(flow_idx as usize)
                    .ok_or(ApiError::NotFound)?;

                Ok(Reply::TxFlows(vec![TxFlowView {
                    id,
                    result_id: *result_id,
                    counters: flow_counters(counter),
                }]))
            }
        }
    }

    fn result_active(&self, id: &Uuid) -> bool {
        self.result_owner
            .get(id)
            .and_then(|owner| self.sources.get(owner))
            .is_some_and(Source::active)
    }

    fn result_view(&self, id: &Uuid) -> Option<GeneratorResultView> {
        let result = self.results.get(id)?;
        let generator_id = self.result_owner.get(id)?;
        let source = self.sources.get(generator_id);

        let (packets, octets) = result.total();
        let first = result.counters().iter().filter_map(TxCounter::first).min();
        let last = result.counters().iter().filter_map(TxCounter::last).max();

        // Intended counts follow from the recorded duration at the
        // configured rate.
        let intended = match (source, first, last) {
            (Some(source), Some(first), Some(last)) => {
                let packets = source.load().rate.count(last.saturating_sub(first));
                let octets = source.sequence().sum_packet_lengths_to(packets);
                Some((packets, octets))
            }
            _ => None,
        };

        let flows = (0..result.counters().len())
            .map(|flow_idx| tx_flow_id(id, flow_idx as u64))
            .collect();

        Some(GeneratorResultView {
            id: *id,
            generator_id: generator_id.clone(),
            active: self.result_active(id),
            counters: FlowCountersView {
                packets_actual: packets,
                octets_actual: octets,
                packets_intended: intended.map(|(packets, _)| packets),
                octets_intended: intended.map(|(_, octets)| octets),
                first,
                last,
            },
            flows,
        })
    }
}

fn view(source: &Source) -> GeneratorView {
    GeneratorView {
        id: source.id().to_string(),
        target: source.target().to_string(),
        active: source.active(),
    }
}

fn flow_counters(counter: &TxCounter) -> FlowCountersView {
    FlowCountersView {
        packets_actual: counter.packets(),
        octets_actual: counter.octets(),
        packets_intended: None,
        octets_intended: None,
        first: counter.first(),
        last: counter.last(),
    }
}
