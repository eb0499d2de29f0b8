//! Request evaluation against the capture registries.

use std::collections::HashMap;
use std::sync::Arc;

use packet_types::ApiError;
use uuid::Uuid;

use crate::api::{CaptureResultView, CaptureView, Reply, Request};
use crate::sink::{CaptureConfig, CaptureState, Sink, SinkResult};

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
            Request::ListCaptures { source } => {
                let mut views: Vec<CaptureView> = self
                    .sinks
                    .values()
                    .filter(|sink| {
                        source
                            .as_deref()
                            .is_none_or(|source| sink.source() == source)
                    })
                    .map(view)
                    .collect();
                views.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(Reply::Captures(views))
            }
            Request::CreateCapture(config) => {
                let created = self.create(config)?;
                Ok(Reply::Captures(vec![created]))
            }
            Request::DeleteCaptures => {
                self.sinks.retain(|_, sink| sink.active());
                Ok(Reply::Ok)
            }
            Request::GetCapture { id } => {
                let sink = self.sinks.get(&id).ok_or(ApiError::NotFound)?;
                Ok(Reply::Captures(vec![view(sink)]))
            }
            Request::DeleteCapture { id } => {
                let sink = self.sinks.get(&id).ok_or(ApiError::NotFound)?;
                if sink.active() {
                    return Err(ApiError::FailedPrecondition(
                        "capture is running".to_string(),
                    ));
                }
                self.sinks.remove(&id);
                Ok(Reply::Ok)
            }
            Request::StartCapture { id } => self.start(&id).map(Reply::Started),
            Request::StopCapture { id } => {
                let sink = self.sinks.get(&id).ok_or(ApiError::NotFound)?;
                if !sink.active() {
                    return Err(ApiError::FailedPrecondition(
                        "capture is not running".to_string(),
                    ));
                }
                sink.stop();
                Ok(Reply::Ok)
            }
            Request::ListCaptureResults => {
                let views = self
                    .results
                    .keys()
                    .filter_map(|id| self.result_view(id))
                    .collect();
                Ok(Reply::CaptureResults(views))
            }
            Request::DeleteCaptureResults => {
                let active: Vec<Uuid> = self
                    .results
                    .iter()
                    .filter(|(_, result)| result.state() != CaptureState::Stopped)
                    .map(|(id, _)| *id)
                    .collect();
                self.results.retain(|id, _| active.contains(id));
                self.result_owner.retain(|id, _| active.contains(id));
                Ok(Reply::Ok)
            }
            Request::GetCaptureResult { id } => {
                let result = self.result_view(&id).ok_or(ApiError::NotFound)?;
                Ok(Reply::CaptureResults(vec![result]))
            }
            Request::DeleteCaptureResult { id } => {
                let result = self.results.get(&id).ok_or(ApiError::NotFound)?;
                if result.state() != CaptureState::Stopped {
                    return Err(ApiError::FailedPrecondition(
                        "capture result is in use".to_string(),
                    ));
                }
                self.results.remove(&id);
                self.result_owner.remove(&id);
                Ok(Reply::Ok)
            }
            Request::StreamCaptureFile { id } => {
                let result = self.results.get(&id).ok_or(ApiError::NotFound)?;

                let packets = result
                    .with_reader(|reader| {
                        let mut packets = Vec::new();
                        loop {
                            let read = reader.read_packets(&mut packets, 64);
                            if read == 0 && reader.is_done() {
                                break;
                            }
                        }
                        packets
                    })
                    .map_err(|error| ApiError::Io(error.to_string()))?;

                Ok(Reply::Packets(packets))
            }
        }
    }

    fn create(&mut self, config: CaptureConfig) -> Result<CaptureView, ApiError> {
        if self.sinks.contains_key(&config.id) {
            return Err(ApiError::AlreadyExists);
        }
        if config.buffer_size == 0 && config.mode != crate::sink::CaptureMode::File {
            return Err(ApiError::InvalidArgument(
                "capture buffer size may not be zero".to_string(),
            ));
        }

        let sink = Sink::new(config, &self.worker_ids)
            .map_err(|error| ApiError::InvalidArgument(error.to_string()))?;
        let created = view(&sink);
        self.sinks.insert(created.id.clone(), sink);
        Ok(created)
    }

    fn start(&mut self, id: &str) -> Result<Uuid, ApiError> {
        let sink = self.sinks.get(id).ok_or(ApiError::NotFound)?;
        if sink.active() {
            return Err(ApiError::FailedPrecondition(
                "capture is already running".to_string(),
            ));
        }

        let result = Arc::new(
            SinkResult::new(sink)
                .map_err(|error| ApiError::ResourceExhausted(error.to_string()))?,
        );
        let result_id = Uuid::new_v4();
        sink.start(result.clone());

        self.results.insert(result_id, result);
        self.result_owner.insert(result_id, id.to_string());
        Ok(result_id)
    }

    fn result_view(&self, id: &Uuid) -> Option<CaptureResultView> {
        let result = self.results.get(id)?;
        let capture_id = self.result_owner.get(id)?;

        Some(CaptureResultView {
            id: *id,
            capture_id: capture_id.clone(),
            state: result.state(),
            stats: result.stats(),
            start_time: result.start_time(),
            stop_time: result.stop_time(),
        })
    }
}

fn view(sink: &Sink) -> CaptureView {
    CaptureView {
        id: sink.id().to_string(),
        source: sink.source().to_string(),
        active: sink.active(),
    }
}
