//! The transmit source: turns driver buffers into complete packets.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use packet_types::{PacketBuffer, PacketsPerHour, SourceFeatures};

use crate::traffic::{Sequence, Unpacked, update_packet_header_lengths};

const CHUNK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDuration {
    Continuous,
    /// Stop after exactly this many packets.
    Frames(u64),
    /// Stop after this many nanoseconds worth of packets at the
    /// configured rate.
    TimeNanos(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct SourceLoad {
    pub burst_size: u16,
    pub rate: PacketsPerHour,
}

#[derive(Debug)]
pub struct SourceConfig {
    pub id: String,
    pub target: String,
    pub sequence: Sequence,
    pub load: SourceLoad,
    pub duration: TrafficDuration,
}

/// Per-flow transmit counters, updated on the worker and read from the
/// API thread.
#[derive(Debug, Default)]
pub struct TxCounter {
    packets: AtomicU64,
    octets: AtomicU64,
    first: AtomicU64,
    last: AtomicU64,
}

impl TxCounter {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn octets(&self) -> u64 {
        self.octets.load(Ordering::Relaxed)
    }

    pub fn first(&self) -> Option<u64> {
        match self.first.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(nanos),
        }
    }

    pub fn last(&self) -> Option<u64> {
        match self.last.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(nanos),
        }
    }

    fn update(&self, octets: u64, now: u64) {
        if self.packets.fetch_add(1, Ordering::Relaxed) == 0 {
            self.first.store(now, Ordering::Relaxed);
        }
        self.octets.fetch_add(octets, Ordering::Relaxed);
        self.last.store(now, Ordering::Relaxed);
    }
}

/// Per-run transmit state.
pub struct SourceResult {
    counters: Vec<TxCounter>,
}

impl SourceResult {
    pub fn new(source: &Source) -> Self {
        Self {
            counters: (0..source.sequence().flow_count())
                .map(|_| TxCounter::default())
                .collect(),
        }
    }

    pub fn counters(&self) -> &[TxCounter] {
        &self.counters
    }

    /// `(packets, octets)` summed over every flow.
    pub fn total(&self) -> (u64, u64) {
        self.counters.iter().fold((0, 0), |(packets, octets), counter| {
            (packets + counter.packets(), octets + counter.octets())
        })
    }
}

/// The packet generator source.
///
/// The I/O worker calls [`Source::transform`] with a burst of empty
/// buffers; the source expands the next stretch of the sequence into
/// them.
pub struct Source {
    config: SourceConfig,
    tx_limit: Option<u64>,
    tx_idx: AtomicU64,
    results: ArcSwapOption<SourceResult>,
}

impl Source {
    pub fn new(config: SourceConfig) -> Self {
        let tx_limit = match config.duration {
            TrafficDuration::Continuous => None,
            TrafficDuration::Frames(frames) => Some(frames),
            TrafficDuration::TimeNanos(nanos) => Some(config.load.rate.count(nanos)),
        };

        tracing::debug!(
            id = %config.id,
            flows = config.sequence.flow_count(),
            tx_limit,
            "generator source created"
        );

        Self {
            config,
            tx_limit,
            tx_idx: AtomicU64::new(0),
            results: ArcSwapOption::empty(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn target(&self) -> &str {
        &self.config.target
    }

    pub fn sequence(&self) -> &Sequence {
        &self.config.sequence
    }

    pub fn load(&self) -> SourceLoad {
        self.config.load
    }

    pub fn tx_limit(&self) -> Option<u64> {
        self.tx_limit
    }

    pub fn max_packet_length(&self) -> u16 {
        self.config.sequence.max_packet_length()
    }

    pub fn active(&self) -> bool {
        if self
            .tx_limit
            .is_some_and(|limit| self.tx_idx.load(Ordering::Relaxed) >= limit)
        {
            return false;
        }
        self.results.load().is_some()
    }

    pub fn uses_feature(&self, flags: SourceFeatures) -> bool {
        let mut needed = SourceFeatures::empty();
        if self.config.sequence.has_signature_config() {
            needed |= SourceFeatures::SIGNATURE_ENCODE;
        }
        needed.intersects(flags)
    }

    pub fn start(&self, results: Arc<SourceResult>) {
        self.tx_idx.store(0, Ordering::Relaxed);
        self.results.store(Some(results));
    }

    pub fn stop(&self) {
        self.results.store(None);
    }

    fn now_nanos() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Expands the next stretch of the sequence into `buffers`; returns
    /// the number of packets produced.
    pub fn transform(&self, buffers: &mut [PacketBuffer]) -> usize {
        let results = self.results.load();
        let Some(results) = results.as_ref() else {
            return 0;
        };

        let now = Self::now_nanos();
        let tx_idx = self.tx_idx.load(Ordering::Relaxed);
        let to_send = match self.tx_limit {
            Some(limit) => (limit.saturating_sub(tx_idx) as usize).min(buffers.len()),
            None => buffers.len(),
        };

        let mut scratch: [Option<Unpacked>; CHUNK_SIZE] = [None; CHUNK_SIZE];
        let mut start = 0usize;

        while start < to_send {
            let chunk = (to_send - start).min(CHUNK_SIZE);
            self.config
                .sequence
                .unpack(tx_idx as usize + start, &mut scratch[..chunk]);

            for (buffer, slot) in buffers[start..start + chunk].iter_mut().zip(&scratch) {
                let unpacked = slot.as_ref().expect("unpacked chunk slot");
                let header_len = unpacked.header_lengths.header_length() as usize;

                simd_copy::copy(
                    &mut buffer.data_mut()[..header_len],
                    unpacked.header,
                );

                // The wire length excludes the FCS.
                let frame_len = unpacked.pkt_len - 4;
                buffer.set_length(frame_len);
                update_packet_header_lengths(
                    unpacked.header,
                    unpacked.header_lengths,
                    unpacked.flags,
                    frame_len,
                    buffer.data_mut(),
                );

                buffer.tx_offload(unpacked.header_lengths, unpacked.flags);

                let counter = &results.counters[unpacked.flow_idx];
                if let Some(stream_id) = unpacked.stream_id {
                    // The flow's packet count doubles as the signature
                    // sequence number.
                    buffer.set_signature(stream_id, counter.packets() as u32, 0);
                }

                counter.update(unpacked.pkt_len as u64, now);
            }

            start += chunk;
        }

        self.tx_idx.store(tx_idx + to_send as u64, Ordering::Relaxed);
        to_send
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::header::HeaderConfig;
    use crate::traffic::protocol::Header;
    use crate::traffic::{Definition, Mux, PacketTemplate, SignatureConfig};
    use etherparse::{Ethernet2Header, Ipv4Header, UdpHeader};

    fn sequence() -> Sequence {
        let template = PacketTemplate::new(
            vec![
                HeaderConfig::plain(Header::Ethernet(Ethernet2Header::default())),
                HeaderConfig::plain(Header::Ipv4(Ipv4Header {
                    source: [10, 0, 0, 1],
                    destination: [10, 0, 0, 2],
                    time_to_live: 64,
                    ..Default::default()
                })),
                HeaderConfig::plain(Header::Udp(UdpHeader {
                    source_port: 1000,
                    destination_port: 2000,
                    ..Default::default()
                })),
            ],
            Mux::Zip,
            vec![128],
        )
        .unwrap();

        Sequence::round_robin(vec![Definition {
            template,
            weight: 1,
            signature: Some(SignatureConfig { first_stream_id: 7 }),
        }])
        .unwrap()
    }

    fn source(duration: TrafficDuration) -> Source {
        Source::new(SourceConfig {
            id: "gen-0".to_string(),
            target: "port-0".to_string(),
            sequence: sequence(),
            load: SourceLoad {
                burst_size: 32,
                rate: PacketsPerHour::from_packets_per_second(1_000_000),
            },
            duration,
        })
    }

    fn buffers(count: usize) -> Vec<PacketBuffer> {
        (0..count).map(|_| PacketBuffer::new(2048)).collect()
    }

    #[test]
    fn transform_without_result_produces_nothing() {
        let source = source(TrafficDuration::Continuous);
        let mut batch = buffers(8);

        assert_eq!(source.transform(&mut batch), 0);
    }

    #[test]
    fn frames_limit_caps_production() {
        let source = source(TrafficDuration::Frames(100));
        let results = Arc::new(SourceResult::new(&source));
        source.start(results.clone());

        let mut produced = 0;
        let mut batch = buffers(32);
        loop {
            let sent = source.transform(&mut batch);
            if sent == 0 {
                break;
            }
            produced += sent;
        }

        assert_eq!(produced, 100);
        assert!(!source.active());
        assert_eq!(results.total().0, 100);
    }

    #[test]
    fn time_limit_derives_frame_count() {
        // 1 Mpps for 1 ms -> 1000 packets.
        let source = source(TrafficDuration::TimeNanos(1_000_000));
        assert_eq!(source.tx_limit(), Some(1000));
    }

    #[test]
    fn transform_writes_complete_packets() {
        let source = source(TrafficDuration::Frames(4));
        let results = Arc::new(SourceResult::new(&source));
        source.start(results.clone());

        let mut batch = buffers(4);
        assert_eq!(source.transform(&mut batch), 4);

        for (idx, buffer) in batch.iter().enumerate() {
            assert_eq!(buffer.length(), 124); // 128 minus FCS
            let data = buffer.data();

            assert_eq!(&data[12..14], &[0x08, 0x00]);
            // ipv4 total length = 124 - 14
            assert_eq!(&data[16..18], &110u16.to_be_bytes());
            // udp length = payload + 8
            assert_eq!(&data[38..40], &90u16.to_be_bytes());

            assert_eq!(buffer.signature_stream_id(), Some(7));
            assert_eq!(buffer.signature_sequence_number(), Some(idx as u32));
            assert!(buffer.tx_offload_request().is_some());
        }

        let counter = &results.counters()[0];
        assert_eq!(counter.packets(), 4);
        assert_eq!(counter.octets(), 4 * 128);
        assert!(counter.first().is_some());
    }
}
