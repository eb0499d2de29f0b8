//! Control-API types for the capture subsystem.

use uuid::Uuid;

use crate::buffer::{CaptureBufferStats, CapturePacket};
use crate::sink::{CaptureConfig, CaptureState};

#[derive(Debug)]
pub enum Request {
    ListCaptures { source: Option<String> },
    CreateCapture(CaptureConfig),
    DeleteCaptures,
    GetCapture { id: String },
    DeleteCapture { id: String },
    StartCapture { id: String },
    StopCapture { id: String },
    ListCaptureResults,
    DeleteCaptureResults,
    GetCaptureResult { id: Uuid },
    DeleteCaptureResult { id: Uuid },
    /// Reads a result's packets out as a PCAPNG stream.
    StreamCaptureFile { id: Uuid },
}

#[derive(Debug, Clone)]
pub struct CaptureView {
    pub id: String,
    pub source: String,
    pub active: bool,
}

pub struct CaptureResultView {
    pub id: Uuid,
    pub capture_id: String,
    pub state: CaptureState,
    pub stats: CaptureBufferStats,
    pub start_time: Option<u64>,
    pub stop_time: Option<u64>,
}

pub enum Reply {
    Captures(Vec<CaptureView>),
    CaptureResults(Vec<CaptureResultView>),
    Started(Uuid),
    /// Merged, timestamp-ordered capture contents.
    Packets(Vec<CapturePacket>),
    Ok,
}
