//! Timestamp-ordered merge across per-worker capture readers.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use crate::buffer::{CaptureBufferStats, CapturePacket, CaptureReader};

const BURST_SIZE: usize = 8;

/// One underlying reader plus the burst fetched from it.
struct BurstReader<'a> {
    inner: Box<dyn CaptureReader + 'a>,
    burst: VecDeque<CapturePacket>,
}

impl BurstReader<'_> {
    fn refill(&mut self) {
        if self.burst.is_empty() && !self.inner.is_done() {
            let mut packets = Vec::with_capacity(BURST_SIZE);
            self.inner.read_packets(&mut packets, BURST_SIZE);
            self.burst.extend(packets);
        }
    }

    fn head_timestamp(&self) -> Option<u64> {
        self.burst.front().map(|packet| packet.header.timestamp)
    }

    fn is_done(&self) -> bool {
        self.burst.is_empty() && self.inner.is_done()
    }
}

/// Merges multiple capture readers into one stream ordered by receive
/// timestamp.
///
/// A drained reader's refill is deferred to the next call so packets
/// already handed to the caller stay untouched; each pop allows a short
/// run of packets from the winning reader bounded by the runner-up's
/// head timestamp.
pub struct MultiReader<'a> {
    readers: Vec<BurstReader<'a>>,
    heap: BinaryHeap<Reverse<(u64, usize)>>,
    pending: Vec<usize>,
}

impl<'a> MultiReader<'a> {
    pub fn new(readers: Vec<Box<dyn CaptureReader + 'a>>) -> Self {
        let readers = readers
            .into_iter()
            .map(|inner| BurstReader {
                inner,
                burst: VecDeque::new(),
            })
            .collect::<Vec<_>>();

        let mut multi = Self {
            readers,
            heap: BinaryHeap::new(),
            pending: Vec::new(),
        };
        multi.populate();
        multi
    }

    fn populate(&mut self) {
        self.heap.clear();
        for (idx, reader) in self.readers.iter_mut().enumerate() {
            reader.refill();
            if let Some(timestamp) = reader.head_timestamp() {
                self.heap.push(Reverse((timestamp, idx)));
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.heap.is_empty()
            && self
                .pending
                .iter()
                .all(|&idx| self.readers[idx].is_done())
    }

    /// Appends up to `max` packets in global timestamp order; returns
    /// how many were read.
    pub fn read_packets(&mut self, out: &mut Vec<CapturePacket>, max: usize) -> usize {
        // Refills deferred from the previous call.
        for idx in std::mem::take(&mut self.pending) {
            let reader = &mut self.readers[idx];
            reader.refill();
            if let Some(timestamp) = reader.head_timestamp() {
                self.heap.push(Reverse((timestamp, idx)));
            }
        }

        let Some(Reverse((_, idx))) = self.heap.pop() else {
            return 0;
        };

        let limit = self
            .heap
            .peek()
            .map(|Reverse((timestamp, _))| *timestamp)
            .unwrap_or(u64::MAX);

        let reader = &mut self.readers[idx];
        let mut count = 0;
        while count < max {
            match reader.head_timestamp() {
                Some(timestamp) if timestamp <= limit => {
                    out.push(reader.burst.pop_front().expect("head exists"));
                    count += 1;
                }
                _ => break,
            }
        }

        match reader.head_timestamp() {
            Some(timestamp) => self.heap.push(Reverse((timestamp, idx))),
            // Refilling now would be premature: the caller still holds
            // this call's packets.
            None => self.pending.push(idx),
        }

        count
    }

    pub fn stats(&self) -> CaptureBufferStats {
        self.readers.iter().fold(
            CaptureBufferStats::default(),
            |mut total, reader| {
                let stats = reader.inner.stats();
                total.packets += stats.packets;
                total.octets += stats.octets;
                total
            },
        )
    }

    pub fn rewind(&mut self) {
        self.pending.clear();
        for reader in &mut self.readers {
            reader.burst.clear();
            reader.inner.rewind();
        }
        self.populate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CapturePacketHeader;

    /// Canned reader for merge tests.
    struct VecReader {
        packets: Vec<CapturePacket>,
        offset: usize,
    }

    impl VecReader {
        fn new(timestamps: &[u64]) -> Self {
            let packets = timestamps
                .iter()
                .map(|&timestamp| CapturePacket {
                    header: CapturePacketHeader {
                        timestamp,
                        captured_len: 4,
                        packet_len: 4,
                        flags: 0,
                        dir: 1,
                    },
                    data: timestamp.to_le_bytes()[..4].to_vec(),
                })
                .collect();
            Self {
                packets,
                offset: 0,
            }
        }
    }

    impl CaptureReader for VecReader {
        fn is_done(&self) -> bool {
            self.offset >= self.packets.len()
        }

        fn read_packets(&mut self, out: &mut Vec<CapturePacket>, max: usize) -> usize {
            let end = (self.offset + max).min(self.packets.len());
            let count = end - self.offset;
            out.extend(self.packets[self.offset..end].iter().cloned());
            self.offset = end;
            count
        }

        fn stats(&self) -> CaptureBufferStats {
            CaptureBufferStats {
                packets: self.packets.len() as u64,
                octets: self.packets.len() as u64 * 4,
            }
        }

        fn rewind(&mut self) {
            self.offset = 0;
        }
    }

    fn drain(reader: &mut MultiReader) -> Vec<u64> {
        let mut out = Vec::new();
        while !reader.is_done() {
            if reader.read_packets(&mut out, 16) == 0 && reader.is_done() {
                break;
            }
        }
        out.iter().map(|packet| packet.header.timestamp).collect()
    }

    #[test]
    fn merges_in_timestamp_order() {
        let readers: Vec<Box<dyn CaptureReader>> = vec![
            Box::new(VecReader::new(&[1, 4, 7, 10])),
            Box::new(VecReader::new(&[2, 5, 8])),
            Box::new(VecReader::new(&[3, 6, 9])),
        ];

        let mut multi = MultiReader::new(readers);
        let timestamps = drain(&mut multi);

        assert_eq!(timestamps, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn batches_runs_from_one_reader() {
        let readers: Vec<Box<dyn CaptureReader>> = vec![
            Box::new(VecReader::new(&[1, 2, 3, 100])),
            Box::new(VecReader::new(&[50])),
        ];

        let mut multi = MultiReader::new(readers);
        let mut out = Vec::new();

        // First call returns the whole leading run from reader 0.
        let count = multi.read_packets(&mut out, 16);
        assert_eq!(count, 3);
        assert_eq!(
            out.iter().map(|p| p.header.timestamp).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn output_is_non_decreasing_with_duplicate_timestamps() {
        let readers: Vec<Box<dyn CaptureReader>> = vec![
            Box::new(VecReader::new(&[1, 1, 2, 2])),
            Box::new(VecReader::new(&[1, 2, 3])),
        ];

        let mut multi = MultiReader::new(readers);
        let timestamps = drain(&mut multi);

        assert_eq!(timestamps.len(), 7);
        assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn rewind_restarts_the_merge() {
        let readers: Vec<Box<dyn CaptureReader>> = vec![
            Box::new(VecReader::new(&[1, 3])),
            Box::new(VecReader::new(&[2])),
        ];

        let mut multi = MultiReader::new(readers);
        assert_eq!(drain(&mut multi), vec![1, 2, 3]);

        multi.rewind();
        assert_eq!(drain(&mut multi), vec![1, 2, 3]);
        assert_eq!(multi.stats().packets, 3);
    }
}
