//! Capture record layout and the buffer/reader interfaces.

use packet_types::PacketBuffer;

/// Largest capture slice a buffer will retain for one packet.
pub const MAX_PACKET_SIZE: u32 = 16384;

/// Pads a capture data length to a 4 byte boundary.
pub const fn pad_capture_data_len(length: u32) -> u32 {
    (length + 3) & !0x03
}

/// On-buffer record header preceding each captured packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CapturePacketHeader {
    /// Receive timestamp, nanoseconds since the epoch.
    pub timestamp: u64,
    /// Bytes actually captured.
    pub captured_len: u32,
    /// Original wire length.
    pub packet_len: u32,
    pub flags: u16,
    /// Direction: 1 = rx, 2 = tx.
    pub dir: u8,
}

impl CapturePacketHeader {
    /// Encoded size, including the trailing pad byte.
    pub const LEN: usize = 24;

    pub fn for_packet(packet: &PacketBuffer, max_packet_size: u32) -> Self {
        let packet_len = packet.length() as u32;
        Self {
            timestamp: packet.rx_timestamp(),
            captured_len: packet_len.min(max_packet_size),
            packet_len,
            flags: 0,
            dir: 1 << packet.tx_sink() as u8,
        }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..12].copy_from_slice(&self.captured_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.packet_len.to_le_bytes());
        out[16..18].copy_from_slice(&self.flags.to_le_bytes());
        out[18] = self.dir;
        out[19..24].fill(0);
    }

    pub fn read_from(bytes: &[u8]) -> Self {
        Self {
            timestamp: u64::from_le_bytes(bytes[0..8].try_into().expect("header length")),
            captured_len: u32::from_le_bytes(bytes[8..12].try_into().expect("header length")),
            packet_len: u32::from_le_bytes(bytes[12..16].try_into().expect("header length")),
            flags: u16::from_le_bytes(bytes[16..18].try_into().expect("header length")),
            dir: bytes[18],
        }
    }

    /// Total on-buffer footprint of the record, data pad included.
    pub fn record_len(&self) -> usize {
        Self::LEN + pad_capture_data_len(self.captured_len) as usize
    }
}

/// A packet read back out of a capture buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePacket {
    pub header: CapturePacketHeader,
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureBufferStats {
    pub packets: u64,
    pub octets: u64,
}

/// Reads packets back out of one capture buffer.
///
/// Readers iterate a snapshot of the buffer taken at creation; rewind
/// restarts from that snapshot.
pub trait CaptureReader {
    fn is_done(&self) -> bool;

    /// Appends up to `max` packets to `out`; returns how many were
    /// read.
    fn read_packets(&mut self, out: &mut Vec<CapturePacket>, max: usize) -> usize;

    fn stats(&self) -> CaptureBufferStats;

    fn rewind(&mut self);
}

/// The capture-buffer variants a sink can be configured with.
pub enum CaptureBuffer {
    Linear(crate::mem::MemBuffer),
    Wrap(crate::mem::WrapBuffer),
    File(crate::file::FileBuffer),
}

impl CaptureBuffer {
    /// Commits a burst; returns the number of packets written.
    pub fn write_packets(&mut self, packets: &[&PacketBuffer]) -> usize {
        match self {
            CaptureBuffer::Linear(buffer) => buffer.write_packets(packets),
            CaptureBuffer::Wrap(buffer) => buffer.write_packets(packets),
            CaptureBuffer::File(buffer) => buffer.write_packets(packets),
        }
    }

    pub fn is_full(&self) -> bool {
        match self {
            CaptureBuffer::Linear(buffer) => buffer.is_full(),
            CaptureBuffer::Wrap(_) => false,
            CaptureBuffer::File(buffer) => buffer.is_full(),
        }
    }

    pub fn stats(&self) -> CaptureBufferStats {
        match self {
            CaptureBuffer::Linear(buffer) => buffer.stats(),
            CaptureBuffer::Wrap(buffer) => buffer.stats(),
            CaptureBuffer::File(buffer) => buffer.stats(),
        }
    }

    /// Creates a reader over the current contents.
    pub fn reader(&mut self) -> anyhow::Result<Box<dyn CaptureReader + '_>> {
        match self {
            CaptureBuffer::Linear(buffer) => Ok(Box::new(buffer.reader())),
            CaptureBuffer::Wrap(buffer) => Ok(Box::new(buffer.reader())),
            CaptureBuffer::File(buffer) => Ok(Box::new(buffer.reader()?)),
        }
    }
}
