//! Packet capture: per-worker capture buffers (memory, wrapping memory
//! or PCAPNG file), a timestamp-ordered reader that merges the
//! per-worker shards, and the trigger-driven capture sink.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod api;
mod buffer;
mod file;
mod mem;
mod multi;
pub mod pcapng;
mod server;
mod sink;

pub use buffer::{
    CaptureBuffer, CaptureBufferStats, CapturePacket, CapturePacketHeader, CaptureReader,
    pad_capture_data_len,
};
pub use file::{FileBuffer, FileReader};
pub use mem::{MemBuffer, WrapBuffer};
pub use multi::MultiReader;
pub use server::Server;
pub use sink::{CaptureConfig, CaptureMode, CaptureState, Sink, SinkResult};
