//! The analyzer sink and its per-worker result shards.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use packet_bpf::Bpf;
use packet_stats::flow::map::ReaderId;
use packet_stats::{
    FlatCache, FlowCounterFlags, FlowCounters, FlowDigestFlags, FlowKey, FlowMap, FlowNode,
    ProtocolCounters, ProtocolFlags, SeqLock,
};
use packet_types::{PacketBuffer, SinkFeatures, worker};

const BURST_SIZE_MAX: usize = 64;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub id: String,
    pub source: String,
    pub protocol_counters: ProtocolFlags,
    pub flow_counters: FlowCounterFlags,
    pub flow_digests: FlowDigestFlags,
    pub filter: Option<String>,
}

/// One shard per worker: protocol counters behind a seqlock and the
/// flow map with its result-reader registration.
pub struct FlowShard {
    pub map: FlowMap,
    reader: ReaderId,
}

/// Per-run statistics, shared between the workers and the API thread.
pub struct SinkResult {
    active: AtomicBool,
    protocol_shards: Vec<SeqLock<ProtocolCounters>>,
    flow_shards: Vec<FlowShard>,
}

impl SinkResult {
    pub fn new(sink: &Sink) -> Self {
        let worker_count = sink.worker_count();
        assert!(worker_count > 0);

        let protocol_shards = (0..worker_count)
            .map(|_| SeqLock::new(ProtocolCounters::new(sink.config().protocol_counters)))
            .collect();

        let flow_shards = (0..worker_count)
            .map(|_| {
                let map = FlowMap::new();
                let reader = map.add_reader().expect("fresh map has reader slots");
                FlowShard { map, reader }
            })
            .collect();

        Self {
            active: AtomicBool::new(false),
            protocol_shards,
            flow_shards,
        }
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn start(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub(crate) fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn shard_count(&self) -> usize {
        self.flow_shards.len()
    }

    /// Tear-free snapshot of one worker's protocol counters.
    pub fn protocols(&self, shard: usize) -> ProtocolCounters {
        self.protocol_shards[shard].read()
    }

    /// Aggregated protocol counters across all workers.
    pub fn protocols_total(&self) -> ProtocolCounters {
        let mut total = self.protocol_shards[0].read();
        for shard in &self.protocol_shards[1..] {
            total.merge(&shard.read());
        }
        total
    }

    /// Snapshots every flow of one shard.
    pub fn flows(&self, shard: usize) -> Vec<(FlowKey, FlowCounters)> {
        let shard = &self.flow_shards[shard];
        let guard = shard.map.pin(&shard.reader);
        guard.iter().collect()
    }

    /// Snapshot of one flow.
    pub fn flow(&self, shard: usize, key: &FlowKey) -> Option<FlowCounters> {
        let shard = &self.flow_shards[shard];
        let guard = shard.map.pin(&shard.reader);
        guard.get(key)
    }

    pub fn flow_count(&self) -> usize {
        self.flow_shards.iter().map(|shard| shard.map.len()).sum()
    }
}

/// The analyzer sink.
///
/// Workers call [`Sink::push`] on their own threads; the API thread
/// installs and removes results. Workers acquire the current result for
/// the duration of one burst, so a result handed to [`Sink::stop`] is
/// only dropped after the last in-flight burst completes.
pub struct Sink {
    config: AnalyzerConfig,
    indexes: Vec<u8>,
    filter: Option<Bpf>,
    results: ArcSwapOption<SinkResult>,
}

impl Sink {
    pub fn new(config: AnalyzerConfig, rx_ids: &[usize]) -> Result<Self, packet_bpf::Error> {
        let filter = config
            .filter
            .as_deref()
            .map(Bpf::parse)
            .transpose()
            .inspect(|filter| {
                if let Some(filter) = filter {
                    tracing::debug!(
                        id = %config.id,
                        flags = ?filter.filter_flags(),
                        features = ?filter.sink_features(),
                        "analyzer filter compiled"
                    );
                }
            })?;

        Ok(Self {
            indexes: Self::make_indexes(rx_ids),
            filter,
            results: ArcSwapOption::empty(),
            config,
        })
    }

    /// Builds the worker-id to shard-index table. Worker ids must fit
    /// the table; shard indexes are 8 bit.
    fn make_indexes(rx_ids: &[usize]) -> Vec<u8> {
        let max = rx_ids.iter().copied().max().unwrap_or(0);
        assert!(rx_ids.len() < u8::MAX as usize);

        let mut indexes = vec![0u8; max + 1];
        for (idx, &id) in rx_ids.iter().enumerate() {
            indexes[id] = idx as u8;
        }
        indexes
    }

    pub fn config(&self) -> &AnalyzerConfig {
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
        results.start();
        self.results.store(Some(results));
    }

    /// Clears the live result. Workers may complete one more burst
    /// against it; their `Arc` keeps it alive until then.
    pub fn stop(&self) {
        if let Some(results) = self.results.swap(None) {
            results.stop();
        }
    }

    /// Swaps in a fresh result, returning the previous one.
    pub fn reset(&self, results: Arc<SinkResult>) -> Option<Arc<SinkResult>> {
        results.start();
        let stopped = self.results.swap(Some(results));
        if let Some(stopped) = &stopped {
            stopped.stop();
        }
        stopped
    }

    pub fn active(&self) -> bool {
        self.results.load().is_some()
    }

    /// Whether this sink needs any of the queried driver features.
    pub fn uses_feature(&self, flags: SinkFeatures) -> bool {
        const SIGNATURE_COUNTERS: FlowCounterFlags = FlowCounterFlags::JITTER_IPDV
            .union(FlowCounterFlags::JITTER_RFC)
            .union(FlowCounterFlags::LATENCY)
            .union(FlowCounterFlags::SEQUENCING);
        const SIGNATURE_DIGESTS: FlowDigestFlags = FlowDigestFlags::JITTER_IPDV
            .union(FlowDigestFlags::JITTER_RFC)
            .union(FlowDigestFlags::LATENCY)
            .union(FlowDigestFlags::SEQUENCE_RUN_LENGTH);

        // Timestamps and hashes are always consumed.
        let mut needed = SinkFeatures::RX_TIMESTAMP | SinkFeatures::RSS_HASH;

        if !self.config.protocol_counters.is_empty() {
            needed |= SinkFeatures::PACKET_TYPE_DECODE;
        }

        if self.config.flow_counters.intersects(SIGNATURE_COUNTERS)
            || self.config.flow_digests.intersects(SIGNATURE_DIGESTS)
        {
            needed |= SinkFeatures::SIGNATURE_DECODE;
        }

        if self.config.flow_counters.contains(FlowCounterFlags::PRBS) {
            // The signature carries the bit indicating PRBS payload.
            needed |= SinkFeatures::SIGNATURE_DECODE | SinkFeatures::PRBS_ERROR_DETECT;
        }

        if let Some(filter) = &self.filter {
            needed |= filter.sink_features();
        }

        needed.intersects(flags)
    }

    /// Feeds a burst of received packets; returns the number consumed.
    /// Packets are dropped (return 0) while no result is installed.
    pub fn push(&self, packets: &[&PacketBuffer]) -> usize {
        if packets.is_empty() {
            return 0;
        }

        let results = self.results.load();
        let Some(results) = results.as_ref() else {
            return 0;
        };

        let index = self.indexes[worker::get_id()] as usize;

        match &self.filter {
            Some(filter) => self.push_filtered(results, filter, index, packets),
            None => self.push_all(results, index, packets),
        }
    }

    fn push_filtered(
        &self,
        results: &SinkResult,
        filter: &Bpf,
        index: usize,
        packets: &[&PacketBuffer],
    ) -> usize {
        let mut filtered: [&PacketBuffer; BURST_SIZE_MAX] = [packets[0]; BURST_SIZE_MAX];

        for burst in packets.chunks(BURST_SIZE_MAX) {
            let kept = filter.filter_burst(burst, &mut filtered);
            self.push_all(results, index, &filtered[..kept]);
        }

        packets.len()
    }

    fn push_all(&self, results: &SinkResult, index: usize, packets: &[&PacketBuffer]) -> usize {
        // Protocol statistics, in sub-bursts.
        let protocol = &results.protocol_shards[index];
        let mut packet_types = [packet_types::PacketTypeFlags::default(); BURST_SIZE_MAX];
        for burst in packets.chunks(BURST_SIZE_MAX) {
            for (slot, packet) in packet_types.iter_mut().zip(burst) {
                *slot = packet.packet_type_flags();
            }
            protocol.write(|counters| counters.update(&packet_types[..burst.len()]));
        }

        // Flow statistics, memoizing the map lookup across the burst.
        let shard = &results.flow_shards[index];
        let mut cache: FlatCache<FlowKey, Option<NonNull<FlowNode>>, 64> = FlatCache::new();

        for packet in packets {
            let key = FlowKey {
                rss_hash: packet.rss_hash(),
                stream_id: packet.signature_stream_id(),
            };

            let mut node = cache.call(key, |key| shard.map.find(key));
            if node.is_none() {
                // New flow.
                shard.map.insert(
                    key,
                    FlowCounters::new(self.config.flow_counters, self.config.flow_digests),
                );
                node = cache.retry(key, |key| shard.map.find(key));

                if let Some(node) = node {
                    // Safety: nodes stay valid until this writer
                    // retires them; this burst does not.
                    unsafe { node.as_ref() }
                        .counters
                        .write(|counters| counters.set_header(packet));
                }
            }

            if let Some(node) = node {
                unsafe { node.as_ref() }
                    .counters
                    .write(|counters| counters.update(packet));
            }
        }

        shard.map.process_gc();

        packets.len()
    }
}
