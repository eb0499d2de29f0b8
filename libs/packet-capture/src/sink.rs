//! The capture sink: trigger state machine and burst commit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use packet_bpf::Bpf;
use packet_types::{PacketBuffer, SinkFeatures, worker};

use crate::buffer::{CaptureBuffer, CaptureBufferStats};
use crate::file::FileBuffer;
use crate::mem::{MemBuffer, WrapBuffer};
use crate::multi::MultiReader;

const MAX_BURST_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Buffer,
    Live,
    File,
}

impl CaptureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMode::Buffer => "buffer",
            CaptureMode::Live => "live",
            CaptureMode::File => "file",
        }
    }

    pub fn from_str(text: &str) -> Self {
        match text {
            "live" => CaptureMode::Live,
            "file" => CaptureMode::File,
            _ => CaptureMode::Buffer,
        }
    }
}

/// `Armed` exists only when a start trigger is configured: the sink
/// waits for a matching packet before recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Stopped = 0,
    Armed = 1,
    Started = 2,
}

impl CaptureState {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureState::Stopped => "stopped",
            CaptureState::Armed => "armed",
            CaptureState::Started => "started",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureState::Armed,
            2 => CaptureState::Started,
            _ => CaptureState::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub id: String,
    pub source: String,
    pub mode: CaptureMode,
    pub buffer_wrap: bool,
    pub buffer_size: u64,
    pub max_packet_size: u32,
    /// Capture duration in milliseconds, measured from the start
    /// transition.
    pub duration_ms: Option<u64>,
    pub filter: Option<String>,
    pub start_trigger: Option<String>,
    pub stop_trigger: Option<String>,
    /// Destination for file-mode captures.
    pub file_path: Option<PathBuf>,
    pub keep_file: bool,
}

type StateChangedCallback = Box<dyn Fn(&SinkResult, CaptureState) + Send + Sync>;

/// Per-run capture state: one buffer per worker plus the shared state
/// machine.
pub struct SinkResult {
    state: AtomicU8,
    buffers: Vec<Mutex<CaptureBuffer>>,
    start_time: AtomicU64,
    stop_time: AtomicU64,
    /// Deadline for duration-limited captures; `u64::MAX` while
    /// unlimited.
    deadline: AtomicU64,
    state_changed: Option<StateChangedCallback>,
}

impl SinkResult {
    pub fn new(sink: &Sink) -> anyhow::Result<Self> {
        Self::with_callback_opt(sink, None)
    }

    pub fn with_callback(sink: &Sink, callback: StateChangedCallback) -> anyhow::Result<Self> {
        Self::with_callback_opt(sink, Some(callback))
    }

    fn with_callback_opt(
        sink: &Sink,
        state_changed: Option<StateChangedCallback>,
    ) -> anyhow::Result<Self> {
        let config = sink.config();
        let buffers = (0..sink.worker_count())
            .map(|worker| {
                let buffer = match (config.mode, config.buffer_wrap) {
                    (CaptureMode::File, _) => {
                        let path = config
                            .file_path
                            .clone()
                            .unwrap_or_else(|| PathBuf::from(format!("{}.pcapng", config.id)));
                        let path = if sink.worker_count() > 1 {
                            path.with_extension(format!("{worker}.pcapng"))
                        } else {
                            path
                        };
                        CaptureBuffer::File(FileBuffer::new(
                            &path,
                            config.keep_file,
                            config.max_packet_size,
                        )?)
                    }
                    (_, true) => CaptureBuffer::Wrap(WrapBuffer::new(
                        config.buffer_size / sink.worker_count() as u64,
                        config.max_packet_size,
                    )?),
                    (_, false) => CaptureBuffer::Linear(MemBuffer::new(
                        config.buffer_size / sink.worker_count() as u64,
                        config.max_packet_size,
                    )?),
                };
                Ok(Mutex::new(buffer))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            state: AtomicU8::new(CaptureState::Stopped as u8),
            buffers,
            start_time: AtomicU64::new(0),
            stop_time: AtomicU64::new(0),
            deadline: AtomicU64::new(u64::MAX),
            state_changed,
        })
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn start_time(&self) -> Option<u64> {
        match self.start_time.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(nanos),
        }
    }

    pub fn stop_time(&self) -> Option<u64> {
        match self.stop_time.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(nanos),
        }
    }

    pub fn stats(&self) -> CaptureBufferStats {
        self.buffers.iter().fold(
            CaptureBufferStats::default(),
            |mut total, buffer| {
                let stats = buffer.lock().expect("buffer lock").stats();
                total.packets += stats.packets;
                total.octets += stats.octets;
                total
            },
        )
    }

    /// Runs `f` over a timestamp-ordered reader merging every worker's
    /// shard.
    pub fn with_reader<R>(
        &self,
        f: impl FnOnce(&mut MultiReader) -> R,
    ) -> anyhow::Result<R> {
        let mut guards: Vec<MutexGuard<CaptureBuffer>> = self
            .buffers
            .iter()
            .map(|buffer| buffer.lock().expect("buffer lock"))
            .collect();

        let mut readers = Vec::with_capacity(guards.len());
        for guard in guards.iter_mut() {
            readers.push((**guard).reader()?);
        }

        let mut multi = MultiReader::new(readers);
        Ok(f(&mut multi))
    }
}

/// The capture sink.
pub struct Sink {
    config: CaptureConfig,
    indexes: Vec<u8>,
    filter: Option<Bpf>,
    start_trigger: Option<Bpf>,
    stop_trigger: Option<Bpf>,
    results: ArcSwapOption<SinkResult>,
}

impl Sink {
    pub fn new(config: CaptureConfig, rx_ids: &[usize]) -> Result<Self, packet_bpf::Error> {
        let filter = config.filter.as_deref().map(Bpf::parse).transpose()?;
        let start_trigger = config.start_trigger.as_deref().map(Bpf::parse).transpose()?;
        let stop_trigger = config.stop_trigger.as_deref().map(Bpf::parse).transpose()?;

        Ok(Self {
            indexes: Self::make_indexes(rx_ids),
            filter,
            start_trigger,
            stop_trigger,
            results: ArcSwapOption::empty(),
            config,
        })
    }

    fn make_indexes(rx_ids: &[usize]) -> Vec<u8> {
        let max = rx_ids.iter().copied().max().unwrap_or(0);
        assert!(rx_ids.len() < u8::MAX as usize);

        let mut indexes = vec![0u8; max + 1];
        for (idx, &id) in rx_ids.iter().enumerate() {
            indexes[id] = idx as u8;
        }
        indexes
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn source(&self) -> &str {
        &self.config.source
    }

    pub fn worker_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn start(&self, results: Arc<SinkResult>) {
        let state = if self.start_trigger.is_some() {
            CaptureState::Armed
        } else {
            CaptureState::Started
        };
        self.set_state(&results, state);
        self.results.store(Some(results));
    }

    pub fn stop(&self) {
        if let Some(results) = self.results.swap(None) {
            self.set_state(&results, CaptureState::Stopped);
        }
    }

    pub fn active(&self) -> bool {
        self.results
            .load()
            .as_ref()
            .is_some_and(|results| results.state() != CaptureState::Stopped)
    }

    pub fn uses_feature(&self, flags: SinkFeatures) -> bool {
        // Timestamps are always consumed.
        let mut needed = SinkFeatures::RX_TIMESTAMP;

        for bpf in [&self.filter, &self.start_trigger, &self.stop_trigger]
            .into_iter()
            .flatten()
        {
            needed |= bpf.sink_features();
        }

        needed.intersects(flags)
    }

    fn now_nanos() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn set_state(&self, results: &SinkResult, state: CaptureState) {
        let current = results.state.load(Ordering::Relaxed);
        if current == state as u8 {
            return;
        }
        if results
            .state
            .compare_exchange(current, state as u8, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        match state {
            CaptureState::Started => {
                let start = Self::now_nanos();
                results.start_time.store(start, Ordering::Release);
                let deadline = self
                    .config
                    .duration_ms
                    .map(|ms| start + ms * 1_000_000)
                    .unwrap_or(u64::MAX);
                results.deadline.store(deadline, Ordering::Release);
            }
            CaptureState::Stopped => {
                results.stop_time.store(Self::now_nanos(), Ordering::Release);
            }
            CaptureState::Armed => {}
        }

        tracing::debug!(id = %self.config.id, state = state.as_str(), "capture state");
        if let Some(callback) = &results.state_changed {
            callback(results, state);
        }
    }

    /// Feeds a burst of received packets; always consumes the burst.
    pub fn push(&self, packets: &[&PacketBuffer]) -> usize {
        if packets.is_empty() {
            return 0;
        }

        let results = self.results.load();
        let Some(results) = results.as_ref() else {
            return packets.len();
        };

        let mut state = results.state();
        let mut start = 0;
        let mut length = packets.len();
        let mut stopping = false;

        if state != CaptureState::Started {
            let CaptureState::Armed = state else {
                return packets.len();
            };

            let trigger = self
                .start_trigger
                .as_ref()
                .expect("armed implies start trigger");
            let offset = trigger.find_next(packets, 0);
            if offset >= packets.len() {
                // Start not triggered yet.
                return packets.len();
            }
            start = offset;
            length -= offset;
            state = CaptureState::Started;
            self.set_state(results, state);
        }

        if let Some(trigger) = &self.stop_trigger {
            let offset = trigger.find_next(&packets[..start + length], start);
            if offset < start + length {
                // Include the triggering packet, then stop.
                length = offset - start + 1;
                stopping = true;
            }
        }

        let deadline = results.deadline.load(Ordering::Acquire);
        if deadline != u64::MAX {
            if let Some(offset) = packets[start..start + length]
                .iter()
                .position(|packet| packet.rx_timestamp() > deadline)
            {
                length = offset + 1;
                stopping = true;
            }
        }

        let index = self.indexes[worker::get_id()] as usize;
        let mut buffer = results.buffers[index].lock().expect("buffer lock");

        if let Some(filter) = &self.filter {
            let mut exec = [0u64; MAX_BURST_SIZE];
            let mut filtered: [&PacketBuffer; MAX_BURST_SIZE] = [packets[0]; MAX_BURST_SIZE];

            for burst in packets[start..start + length].chunks(MAX_BURST_SIZE) {
                filter.exec_burst(burst, &mut exec);
                let mut kept = 0;
                for (idx, &packet) in burst.iter().enumerate() {
                    if exec[idx] != 0 {
                        filtered[kept] = packet;
                        kept += 1;
                    }
                }
                if kept > 0 {
                    buffer.write_packets(&filtered[..kept]);
                }
            }
        } else {
            buffer.write_packets(&packets[start..start + length]);
        }

        let full = buffer.is_full();
        drop(buffer);

        if stopping || full {
            self.set_state(results, CaptureState::Stopped);
        }

        packets.len()
    }
}
