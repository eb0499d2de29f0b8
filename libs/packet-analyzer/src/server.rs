//! Request evaluation against the analyzer registries.

use std::collections::HashMap;
use std::sync::Arc;

use packet_types::ApiError;
use uuid::Uuid;

use crate::api::{
    AnalyzerResultView, AnalyzerView, Reply, Request, RxFlowView, result_id_matches, rx_flow_id,
    rx_flow_tuple,
};
use crate::sink::{AnalyzerConfig, Sink, SinkResult};

/// Owns every analyzer and analyzer result; runs on the control
/// thread.
pub struct Server {
    worker_ids: Vec<usize>,
    sinks: HashMap<String, Sink>,
    results: HashMap<Uuid, Arc<SinkResult>>,
    result_owner: HashMap<Uuid, String>,
}

impl Server {
    pub fn new(worker_ids: Vec<usize>) -> Self {
        assert!(!worker_ids.is_empty());
        Self {
            worker_ids,
            sinks: HashMap::new(),
            results: HashMap::new(),
            result_owner: HashMap::new(),
        }
    }

    pub fn sink(&self, id: &str) -> Option<&Sink> {
        self.sinks.get(id)
    }

    pub fn handle(&mut self, request: Request) -> Result<Reply, ApiError> {
        match request {
            Request::ListAnalyzers { source } => {
                let mut views: Vec<AnalyzerView> = self
                    .sinks
                    .values()
                    .filter(|sink| {
                        source
                            .as_deref()
                            .is_none_or(|source| sink.source() == source)
                    })
                    .map(|sink| self.view(sink))
                    .collect();
                views.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(Reply::Analyzers(views))
            }
            Request::CreateAnalyzer(config) => self.create(config).map(|view| {
                Reply::Analyzers(vec![view])
            }),
            Request::DeleteAnalyzers => {
                self.sinks.retain(|_, sink| sink.active());
                Ok(Reply::Ok)
            }
            Request::GetAnalyzer { id } => {
                let sink = self.sinks.get(&id).ok_or(ApiError::NotFound)?;
                Ok(Reply::Analyzers(vec![self.view(sink)]))
            }
            Request::DeleteAnalyzer { id } => {
                let sink = self.sinks.get(&id).ok_or(ApiError::NotFound)?;
                if sink.active() {
                    return Err(ApiError::FailedPrecondition(
                        "analyzer is running".to_string(),
                    ));
                }
                self.sinks.remove(&id);
                Ok(Reply::Ok)
            }
            Request::StartAnalyzer { id } => self.start(&id).map(Reply::Started),
            Request::StopAnalyzer { id } => {
                let sink = self.sinks.get(&id).ok_or(ApiError::NotFound)?;
                if !sink.active() {
                    return Err(ApiError::FailedPrecondition(
                        "analyzer is not running".to_string(),
                    ));
                }
                sink.stop();
                Ok(Reply::Ok)
            }
            Request::ListAnalyzerResults => {
                let views = self
                    .results
                    .keys()
                    .map(|id| self.result_view(id))
                    .collect::<Option<Vec<_>>>()
                    .unwrap_or_default();
                Ok(Reply::AnalyzerResults(views))
            }
            Request::DeleteAnalyzerResults => {
                let active: Vec<Uuid> = self
                    .results
                    .iter()
                    .filter(|(_, result)| result.active())
                    .map(|(id, _)| *id)
                    .collect();
                self.results.retain(|id, _| active.contains(id));
                self.result_owner.retain(|id, _| active.contains(id));
                Ok(Reply::Ok)
            }
            Request::GetAnalyzerResult { id } => {
                let view = self.result_view(&id).ok_or(ApiError::NotFound)?;
                Ok(Reply::AnalyzerResults(vec![view]))
            }
            Request::DeleteAnalyzerResult { id } => {
                let result = self.results.get(&id).ok_or(ApiError::NotFound)?;
                if result.active() {
                    return Err(ApiError::FailedPrecondition(
                        "analyzer result is in use".to_string(),
                    ));
                }
                self.results.remove(&id);
                self.result_owner.remove(&id);
                Ok(Reply::Ok)
            }
            Request::ListRxFlows => {
                let mut flows = Vec::new();
                for (result_id, result) in &self.results {
                    for shard in 0..result.shard_count() {
                        for (key, counters) in result.flows(shard) {
                            flows.push(RxFlowView {
                                id: rx_flow_id(result_id, shard as u16, &key),
                                result_id: *result_id,
                                counters,
                            });
                        }
                    }
                }
                Ok(Reply::RxFlows(flows))
            }
            Request::GetRxFlow { id } => {
                let (prefix, shard, key) = rx_flow_tuple(&id);
                let (result_id, result) = self
                    .results
                    .iter()
                    .find(|(result_id, _)| result_id_matches(&prefix, result_id))
                    .ok_or(ApiError::NotFound)?;

                let counters = result
                    .flow(shard as usize, &key)
                    .ok_or(ApiError::NotFound)?;

                Ok(Reply::RxFlows(vec![RxFlowView {
                    id,
                    result_id: *result_id,
                    counters,
                }]))
            }
        }
    }

    fn view(&self, sink: &Sink) -> AnalyzerView {
        AnalyzerView {
            id: sink.id().to_string(),
            source: sink.source().to_string(),
            active: sink.active(),
        }
    }

    fn create(&mut self, config: AnalyzerConfig) -> Result<AnalyzerView, ApiError> {
        if self.sinks.contains_key(&config.id) {
            return Err(ApiError::AlreadyExists);
        }

        let sink = Sink::new(config, &self.worker_ids)
            .map_err(|error| ApiError::InvalidArgument(error.to_string()))?;
        let view = self.view(&sink);
        self.sinks.insert(sink.id().to_string(), sink);
        Ok(view)
    }

    fn start(&mut self, id: &str) -> Result<Uuid, ApiError> {
        let sink = self.sinks.get(id).ok_or(ApiError::NotFound)?;
        if sink.active() {
            return Err(ApiError::FailedPrecondition(
                "analyzer is already running".to_string(),
            ));
        }

        let result = Arc::new(SinkResult::new(sink));
        let result_id = Uuid::new_v4();
        sink.start(result.clone());

        self.results.insert(result_id, result);
        self.result_owner.insert(result_id, id.to_string());
        Ok(result_id)
    }

    fn result_view(&self, id: &Uuid) -> Option<AnalyzerResultView> {
        let result = self.results.get(id)?;
        let analyzer_id = self.result_owner.get(id)?;

        let flows = (0..result.shard_count())
            .flat_map(|shard| {
                result
                    .flows(shard)
                    .into_iter()
                    .map(move |(key, _)| (shard, key))
            })
            .map(|(shard, key)| rx_flow_id(id, shard as u16, &key))
            .collect();

        Some(AnalyzerResultView {
            id: *id,
            analyzer_id: analyzer_id.clone(),
            active: result.active(),
            protocol_counters: result.protocols_total(),
            flows,
        })
    }
}
