//! Memory-backed capture buffers.
//!
//! Both variants map an anonymous region rounded up to page size and
//! lay packets out as a record header followed by padded capture data.
//! The linear variant stops when full; the wrapping variant reclaims
//! the oldest packets in whole-packet units to make room.

#[cfg(not(feature = "mlock"))]
use memmap2::Advice;
use memmap2::MmapMut;
use packet_types::PacketBuffer;

use crate::buffer::{
    CaptureBufferStats, CapturePacket, CapturePacketHeader, CaptureReader, pad_capture_data_len,
};

fn page_size() -> usize {
    // Safety: plain sysconf query.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

fn map_capture_region(size: u64) -> anyhow::Result<MmapMut> {
    let len = round_up(size as usize, page_size());
    let map = MmapMut::map_anon(len).inspect_err(|error| {
        tracing::error!(size = len, %error, "failed to map capture buffer memory");
    })?;

    // With the mlock feature the region is pinned; otherwise tell the
    // kernel capture writes walk it front to back.
    #[cfg(feature = "mlock")]
    if let Err(error) = map.lock() {
        tracing::warn!(%error, "unable to mlock capture memory");
    }
    #[cfg(not(feature = "mlock"))]
    {
        if let Err(error) = map.advise(Advice::Sequential) {
            tracing::warn!(%error, "unable to madvise capture memory");
        }
        if let Err(error) = map.advise(Advice::WillNeed) {
            tracing::warn!(%error, "unable to madvise capture memory");
        }
    }

    tracing::debug!(size = len, "allocated capture buffer memory");
    Ok(map)
}

fn write_record(map: &mut MmapMut, offset: usize, header: &CapturePacketHeader, data: &[u8]) {
    header.write_to(&mut map[offset..offset + CapturePacketHeader::LEN]);

    let data_start = offset + CapturePacketHeader::LEN;
    let captured = header.captured_len as usize;
    map[data_start..data_start + captured].copy_from_slice(&data[..captured]);

    let padded = pad_capture_data_len(header.captured_len) as usize;
    map[data_start + captured..data_start + padded].fill(0);
}

fn read_record(map: &MmapMut, offset: usize) -> (CapturePacketHeader, CapturePacket) {
    let header = CapturePacketHeader::read_from(&map[offset..offset + CapturePacketHeader::LEN]);
    let data_start = offset + CapturePacketHeader::LEN;
    let data = map[data_start..data_start + header.captured_len as usize].to_vec();
    (header, CapturePacket { header, data })
}

/// Linear capture buffer; write fails once the region is exhausted.
pub struct MemBuffer {
    map: MmapMut,
    size: usize,
    write: usize,
    stats: CaptureBufferStats,
    max_packet_size: u32,
    full: bool,
}

impl MemBuffer {
    pub fn new(size: u64, max_packet_size: u32) -> anyhow::Result<Self> {
        let map = map_capture_region(size)?;
        let size = map.len();
        Ok(Self {
            map,
            size,
            write: 0,
            stats: CaptureBufferStats::default(),
            max_packet_size,
            full: false,
        })
    }

    pub fn write_packets(&mut self, packets: &[&PacketBuffer]) -> usize {
        if self.full {
            return 0;
        }

        for (idx, packet) in packets.iter().enumerate() {
            let header = CapturePacketHeader::for_packet(packet, self.max_packet_size);
            if self.write + header.record_len() > self.size {
                self.full = true;
                return idx;
            }

            write_record(&mut self.map, self.write, &header, packet.data());
            self.write += header.record_len();
            self.stats.packets += 1;
            self.stats.octets += header.captured_len as u64;
        }

        packets.len()
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn stats(&self) -> CaptureBufferStats {
        self.stats
    }

    pub fn write_offset(&self) -> usize {
        self.write
    }

    pub fn reader(&self) -> MemReader<'_> {
        MemReader {
            buffer: self,
            offset: 0,
            eof: false,
        }
    }
}

/// Reader walking a linear buffer front to back.
pub struct MemReader<'a> {
    buffer: &'a MemBuffer,
    offset: usize,
    eof: bool,
}

impl CaptureReader for MemReader<'_> {
    fn is_done(&self) -> bool {
        self.eof || self.offset >= self.buffer.write
    }

    fn read_packets(&mut self, out: &mut Vec<CapturePacket>, max: usize) -> usize {
        let mut count = 0;
        while count < max {
            if self.offset + CapturePacketHeader::LEN > self.buffer.write {
                self.eof = true;
                break;
            }
            let (header, packet) = read_record(&self.buffer.map, self.offset);
            self.offset += header.record_len();
            out.push(packet);
            count += 1;
        }
        count
    }

    fn stats(&self) -> CaptureBufferStats {
        self.buffer.stats()
    }

    fn rewind(&mut self) {
        self.offset = 0;
        self.eof = false;
    }
}

/// Wrapping capture buffer; oldest packets are reclaimed in whole
/// units once the region wraps.
pub struct WrapBuffer {
    map: MmapMut,
    size: usize,
    write: usize,
    /// First resident packet once wrapped.
    wrap_start: Option<usize>,
    /// End of the last packet before the wrap point.
    wrap_end: usize,
    stats: CaptureBufferStats,
    max_packet_size: u32,
}

impl WrapBuffer {
    pub fn new(size: u64, max_packet_size: u32) -> anyhow::Result<Self> {
        let map = map_capture_region(size)?;
        let size = map.len();
        Ok(Self {
            map,
            size,
            write: 0,
            wrap_start: None,
            wrap_end: 0,
            stats: CaptureBufferStats::default(),
            max_packet_size,
        })
    }

    pub fn write_packets(&mut self, packets: &[&PacketBuffer]) -> usize {
        for packet in packets {
            let header = CapturePacketHeader::for_packet(packet, self.max_packet_size);
            let record_len = header.record_len();

            if record_len > self.size {
                // Can never fit; residency is not guaranteed.
                tracing::warn!(
                    captured_len = header.captured_len,
                    "capture packet larger than wrap buffer"
                );
                continue;
            }

            self.ensure_space(record_len);

            write_record(&mut self.map, self.write, &header, packet.data());
            self.write += record_len;
            self.stats.packets += 1;
            self.stats.octets += header.captured_len as u64;
        }

        packets.len()
    }

    /// Makes `record_len` contiguous bytes available at the write
    /// cursor, wrapping and reclaiming old packets as required.
    fn ensure_space(&mut self, record_len: usize) {
        loop {
            // Records are always contiguous; wrap before writing one
            // that would cross the end.
            if self.write + record_len > self.size {
                if let Some(reclaim) = self.wrap_start {
                    // Old packets still ahead of the reclaim point are
                    // discarded by the wrap.
                    let (packets, octets) = self.count_packets(reclaim, self.wrap_end);
                    self.stats.packets -= packets;
                    self.stats.octets -= octets;
                }
                self.wrap_end = self.write;
                self.wrap_start = Some(0);
                self.write = 0;
            }

            match self.wrap_start {
                Some(reclaim) if self.write + record_len > reclaim => self.reclaim(record_len),
                _ => return,
            }
        }
    }

    /// Advances the reclaim point, whole packets at a time, until the
    /// record fits between the write cursor and the oldest resident
    /// packet. Clears the wrap state once the old segment is fully
    /// consumed.
    fn reclaim(&mut self, record_len: usize) {
        let Some(mut reclaim) = self.wrap_start else {
            return;
        };

        while self.write + record_len > reclaim {
            if reclaim + CapturePacketHeader::LEN > self.wrap_end {
                // Old segment fully consumed; occupancy is linear
                // again.
                self.wrap_start = None;
                return;
            }
            let header = CapturePacketHeader::read_from(
                &self.map[reclaim..reclaim + CapturePacketHeader::LEN],
            );
            reclaim += header.record_len();
            self.stats.packets -= 1;
            self.stats.octets -= header.captured_len as u64;
        }

        self.wrap_start = Some(reclaim);
    }

    fn count_packets(&self, start: usize, end: usize) -> (u64, u64) {
        let mut packets = 0;
        let mut octets = 0;
        let mut offset = start;
        while offset + CapturePacketHeader::LEN <= end {
            let header =
                CapturePacketHeader::read_from(&self.map[offset..offset + CapturePacketHeader::LEN]);
            packets += 1;
            octets += header.captured_len as u64;
            offset += header.record_len();
        }
        (packets, octets)
    }

    pub fn stats(&self) -> CaptureBufferStats {
        self.stats
    }

    pub fn reader(&self) -> WrapReader<'_> {
        let (offset, segment_end, wrapped) = match self.wrap_start {
            Some(wrap_start) => (wrap_start, self.wrap_end, true),
            None => (0, self.write, false),
        };
        WrapReader {
            buffer: self,
            offset,
            segment_end,
            wrapped,
            eof: false,
        }
    }
}

/// Reader over a wrapping buffer: the old segment
/// `[wrap_start, wrap_end)` first, then `[0, write)`.
pub struct WrapReader<'a> {
    buffer: &'a WrapBuffer,
    offset: usize,
    segment_end: usize,
    /// Whether the old segment remains to be read.
    wrapped: bool,
    eof: bool,
}

impl CaptureReader for WrapReader<'_> {
    fn is_done(&self) -> bool {
        self.eof
    }

    fn read_packets(&mut self, out: &mut Vec<CapturePacket>, max: usize) -> usize {
        let mut count = 0;
        while count < max && !self.eof {
            if self.offset + CapturePacketHeader::LEN > self.segment_end {
                if self.wrapped {
                    // Fall through to the young segment.
                    self.wrapped = false;
                    self.offset = 0;
                    self.segment_end = self.buffer.write;
                    continue;
                }
                self.eof = true;
                break;
            }
            let (header, packet) = read_record(&self.buffer.map, self.offset);
            self.offset += header.record_len();
            out.push(packet);
            count += 1;
        }

        count
    }

    fn stats(&self) -> CaptureBufferStats {
        self.buffer.stats()
    }

    fn rewind(&mut self) {
        let fresh = self.buffer.reader();
        self.offset = fresh.offset;
        self.segment_end = fresh.segment_end;
        self.wrapped = fresh.wrapped;
        self.eof = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(len: usize, timestamp: u64) -> PacketBuffer {
        let mut packet = PacketBuffer::from_data(&vec![0xabu8; len]);
        packet.set_rx_timestamp(timestamp);
        packet
    }

    fn drain(reader: &mut dyn CaptureReader) -> Vec<CapturePacket> {
        let mut out = Vec::new();
        while !reader.is_done() {
            if reader.read_packets(&mut out, 8) == 0 {
                break;
            }
        }
        out
    }

    #[test]
    fn linear_write_offset_accounts_records() {
        let mut buffer = MemBuffer::new(1 << 16, 1500).unwrap();
        let packets: Vec<PacketBuffer> = (0..10).map(|i| packet(61, i)).collect();
        let refs: Vec<&PacketBuffer> = packets.iter().collect();

        assert_eq!(buffer.write_packets(&refs), 10);

        let per_record = CapturePacketHeader::LEN + pad_capture_data_len(61) as usize;
        assert_eq!(buffer.write_offset(), 10 * per_record);
        assert_eq!(buffer.stats().packets, 10);
        assert_eq!(buffer.stats().octets, 610);
    }

    #[test]
    fn linear_stops_when_full() {
        let mut buffer = MemBuffer::new(4096, 1500).unwrap();
        let packets: Vec<PacketBuffer> = (0..100).map(|i| packet(256, i)).collect();
        let refs: Vec<&PacketBuffer> = packets.iter().collect();

        let record = CapturePacketHeader::LEN + pad_capture_data_len(256) as usize;
        let expected = 4096 / record;

        assert_eq!(buffer.write_packets(&refs), expected);
        assert!(buffer.is_full());
        assert_eq!(buffer.write_packets(&refs), 0);
        assert_eq!(buffer.stats().packets, expected as u64);
    }

    #[test]
    fn linear_reader_round_trips() {
        let mut buffer = MemBuffer::new(1 << 16, 1500).unwrap();
        let packets: Vec<PacketBuffer> = (0..32).map(|i| packet(100 + i, i as u64)).collect();
        let refs: Vec<&PacketBuffer> = packets.iter().collect();
        buffer.write_packets(&refs);

        let mut reader = buffer.reader();
        let read = drain(&mut reader);

        assert_eq!(read.len(), 32);
        for (idx, capture) in read.iter().enumerate() {
            assert_eq!(capture.header.timestamp, idx as u64);
            assert_eq!(capture.header.captured_len as usize, 100 + idx);
            assert_eq!(capture.data.len(), 100 + idx);
        }

        reader.rewind();
        assert_eq!(drain(&mut reader).len(), 32);
    }

    #[test]
    fn truncation_applies_max_packet_size() {
        let mut buffer = MemBuffer::new(1 << 16, 128).unwrap();
        let big = packet(1000, 1);
        buffer.write_packets(&[&big]);

        let mut reader = buffer.reader();
        let read = drain(&mut reader);

        assert_eq!(read[0].header.captured_len, 128);
        assert_eq!(read[0].header.packet_len, 1000);
        assert_eq!(read[0].data.len(), 128);
    }

    #[test]
    fn wrap_reclaims_oldest_whole_packets() {
        let mut buffer = WrapBuffer::new(1 << 16, 1500).unwrap();
        let record = CapturePacketHeader::LEN + pad_capture_data_len(256) as usize;

        let packets: Vec<PacketBuffer> = (0..1000).map(|i| packet(256, i as u64)).collect();
        for chunk in packets.iter().collect::<Vec<_>>().chunks(32) {
            buffer.write_packets(chunk);
        }

        let resident = buffer.stats().packets as usize;
        assert!(resident <= buffer.size / record);
        assert!(resident >= buffer.size / record - 1);
        assert_eq!(buffer.stats().octets, resident as u64 * 256);

        let mut reader = buffer.reader();
        let read = drain(&mut reader);
        assert_eq!(read.len(), resident);

        // Oldest packets reclaimed whole: timestamps are the trailing
        // run, in write order.
        let first = read[0].header.timestamp;
        for (idx, capture) in read.iter().enumerate() {
            assert_eq!(capture.header.timestamp, first + idx as u64);
        }
        assert_eq!(read.last().unwrap().header.timestamp, 999);
    }

    #[test]
    fn wrap_reader_before_wrap_is_linear() {
        let mut buffer = WrapBuffer::new(1 << 16, 1500).unwrap();
        let packets: Vec<PacketBuffer> = (0..10).map(|i| packet(64, i as u64)).collect();
        let refs: Vec<&PacketBuffer> = packets.iter().collect();
        buffer.write_packets(&refs);

        let mut reader = buffer.reader();
        let read = drain(&mut reader);
        assert_eq!(read.len(), 10);
        assert_eq!(buffer.stats().packets, 10);
    }
}
