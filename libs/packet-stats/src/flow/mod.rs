//! Per-flow statistics.
//!
//! A flow's counter set is configured at sink-create time; the struct
//! carries an option per counter family plus a mask, and the update
//! path only touches what the configuration selected. Dependencies are
//! closed over at construction: RFC jitter needs latency, IPDV jitter
//! needs latency and sequencing, and any digest needs its source
//! counter.

pub mod header;
pub mod map;

use bitflags::bitflags;
use packet_types::PacketBuffer;

use crate::digest::TDigest;
use header::HeaderCapture;

/// Spirent signature length at the tail of a test packet.
pub const SIGNATURE_LENGTH: u16 = 20;

/// Out-of-order classification window, in sequence numbers.
const SEQUENCE_WINDOW: u32 = 1024;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FlowCounterFlags: u16 {
        const FRAME_COUNT = 1 << 0;
        const INTERARRIVAL = 1 << 1;
        const FRAME_LENGTH = 1 << 2;
        const SEQUENCING = 1 << 3;
        const LATENCY = 1 << 4;
        const JITTER_IPDV = 1 << 5;
        const JITTER_RFC = 1 << 6;
        const HEADER = 1 << 7;
        const PRBS = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FlowDigestFlags: u8 {
        const FRAME_LENGTH = 1 << 0;
        const INTERARRIVAL = 1 << 1;
        const JITTER_IPDV = 1 << 2;
        const JITTER_RFC = 1 << 3;
        const LATENCY = 1 << 4;
        const SEQUENCE_RUN_LENGTH = 1 << 5;
    }
}

impl FlowCounterFlags {
    /// Adds the counters implied by the requested set.
    pub fn with_dependencies(mut self) -> Self {
        if self.contains(Self::JITTER_RFC) {
            self |= Self::LATENCY;
        }
        if self.contains(Self::JITTER_IPDV) {
            self |= Self::LATENCY | Self::SEQUENCING;
        }
        self | Self::FRAME_COUNT
    }

    /// Maps a configuration name to its counter flag; unknown names map
    /// to the empty set.
    pub fn from_config_name(name: &str) -> Self {
        match name {
            "frame_count" => Self::FRAME_COUNT,
            "frame_length" => Self::FRAME_LENGTH,
            "header" => Self::HEADER,
            "interarrival_time" => Self::INTERARRIVAL,
            "jitter_ipdv" => Self::JITTER_IPDV,
            "jitter_rfc" => Self::JITTER_RFC,
            "latency" => Self::LATENCY,
            "prbs" => Self::PRBS,
            "advanced_sequencing" => Self::SEQUENCING,
            _ => Self::empty(),
        }
    }
}

impl FlowDigestFlags {
    /// Maps a configuration name to its digest flag; unknown names map
    /// to the empty set.
    pub fn from_config_name(name: &str) -> Self {
        match name {
            "frame_length" => Self::FRAME_LENGTH,
            "interarrival_time" => Self::INTERARRIVAL,
            "jitter_ipdv" => Self::JITTER_IPDV,
            "jitter_rfc" => Self::JITTER_RFC,
            "latency" => Self::LATENCY,
            "sequence_run_length" => Self::SEQUENCE_RUN_LENGTH,
            _ => Self::empty(),
        }
    }

    /// Source counters required to feed the requested digests.
    pub fn required_counters(self) -> FlowCounterFlags {
        let pairs = [
            (Self::FRAME_LENGTH, FlowCounterFlags::FRAME_LENGTH),
            (Self::INTERARRIVAL, FlowCounterFlags::INTERARRIVAL),
            (Self::JITTER_IPDV, FlowCounterFlags::JITTER_IPDV),
            (Self::JITTER_RFC, FlowCounterFlags::JITTER_RFC),
            (Self::LATENCY, FlowCounterFlags::LATENCY),
            (Self::SEQUENCE_RUN_LENGTH, FlowCounterFlags::SEQUENCING),
        ];

        pairs
            .iter()
            .filter(|(digest, _)| self.contains(*digest))
            .fold(FlowCounterFlags::empty(), |acc, (_, counter)| acc | *counter)
    }
}

/// Flow identity: the RSS hash plus the signature stream id when the
/// packet carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub rss_hash: u32,
    pub stream_id: Option<u32>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Summary {
    pub count: u64,
    pub total: i64,
    pub sum_of_squares: u128,
    pub min: i64,
    pub max: i64,
}

impl Summary {
    fn update(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.total += value;
        self.sum_of_squares += (value as i128 * value as i128) as u128;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total as f64 / self.count as f64
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCounter {
    pub count: u64,
    pub octets: u64,
    pub first_rx: Option<u64>,
    pub last_rx: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SequencingCounter {
    pub in_order: u64,
    pub duplicate: u64,
    pub late: u64,
    pub reordered: u64,
    pub dropped: u64,
    pub run_length: u64,
    pub last_seq: Option<u32>,
    window: SequenceWindow,
}

/// Bitmap of recently seen sequence numbers, anchored at the highest
/// sequence observed so far. Bit `n` covers `last_seq - n`.
#[derive(Debug, Clone, Copy)]
struct SequenceWindow {
    bits: [u64; (SEQUENCE_WINDOW / 64) as usize],
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self {
            bits: [0; (SEQUENCE_WINDOW / 64) as usize],
        }
    }
}

impl SequenceWindow {
    fn advance(&mut self, by: u32) {
        let words = self.bits.len();
        let by = by.min(SEQUENCE_WINDOW) as usize;

        let word_shift = by / 64;
        let bit_shift = by % 64;

        for idx in (0..words).rev() {
            let mut value = if idx >= word_shift {
                self.bits[idx - word_shift]
            } else {
                0
            };
            if bit_shift != 0 {
                value <<= bit_shift;
                if idx > word_shift {
                    value |= self.bits[idx - word_shift - 1] >> (64 - bit_shift);
                }
            }
            self.bits[idx] = value;
        }
    }

    fn test(&self, age: u32) -> bool {
        self.bits[(age / 64) as usize] & (1 << (age % 64)) != 0
    }

    fn set(&mut self, age: u32) {
        self.bits[(age / 64) as usize] |= 1 << (age % 64);
    }
}

impl SequencingCounter {
    /// Classifies one sequence number.
    ///
    /// Returns the run length before the update so the caller can feed
    /// the run-length digest when an in-order run ends.
    fn update(&mut self, seq: u32) -> u64 {
        let previous_run = self.run_length;

        let Some(last) = self.last_seq else {
            self.last_seq = Some(seq);
            self.run_length = 1;
            self.window.set(0);
            return previous_run;
        };

        if seq == last.wrapping_add(1) {
            self.in_order += 1;
            self.run_length += 1;
            self.window.advance(1);
            self.window.set(0);
            self.last_seq = Some(seq);
        } else if seq > last {
            // A gap: the missing packets count as dropped until a
            // straggler shows up.
            self.dropped += (seq - last - 1) as u64;
            self.run_length = 1;
            self.window.advance(seq - last);
            self.window.set(0);
            self.last_seq = Some(seq);
        } else {
            let age = last - seq;
            if age < SEQUENCE_WINDOW && self.window.test(age) {
                self.duplicate += 1;
            } else if age < SEQUENCE_WINDOW {
                self.reordered += 1;
                self.window.set(age);
            } else {
                self.late += 1;
            }
            self.run_length = 1;
        }

        previous_run
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyCounter {
    pub summary: Summary,
    pub last_delay: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrbsCounter {
    pub octets: u64,
    pub bit_errors: u64,
}

/// Digest set gated by the configured mask.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowDigests {
    pub frame_length: Option<TDigest>,
    pub interarrival: Option<TDigest>,
    pub jitter_ipdv: Option<TDigest>,
    pub jitter_rfc: Option<TDigest>,
    pub latency: Option<TDigest>,
    pub sequence_run_length: Option<TDigest>,
}

impl FlowDigests {
    fn new(mask: FlowDigestFlags) -> Self {
        let make = |flag| mask.contains(flag).then(TDigest::new);
        Self {
            frame_length: make(FlowDigestFlags::FRAME_LENGTH),
            interarrival: make(FlowDigestFlags::INTERARRIVAL),
            jitter_ipdv: make(FlowDigestFlags::JITTER_IPDV),
            jitter_rfc: make(FlowDigestFlags::JITTER_RFC),
            latency: make(FlowDigestFlags::LATENCY),
            sequence_run_length: make(FlowDigestFlags::SEQUENCE_RUN_LENGTH),
        }
    }
}

/// The statistics of one flow.
#[derive(Debug, Clone)]
pub struct FlowCounters {
    mask: FlowCounterFlags,
    pub frames: FrameCounter,
    pub interarrival: Option<Summary>,
    pub frame_length: Option<Summary>,
    pub sequencing: Option<SequencingCounter>,
    pub latency: Option<LatencyCounter>,
    pub jitter_rfc: Option<Summary>,
    pub jitter_ipdv: Option<Summary>,
    pub prbs: Option<PrbsCounter>,
    pub header: Option<HeaderCapture>,
    pub digests: Option<FlowDigests>,
}

impl FlowCounters {
    pub fn new(counters: FlowCounterFlags, digests: FlowDigestFlags) -> Self {
        let mask = (counters | digests.required_counters()).with_dependencies();

        Self {
            mask,
            frames: FrameCounter::default(),
            interarrival: mask
                .contains(FlowCounterFlags::INTERARRIVAL)
                .then(Summary::default),
            frame_length: mask
                .contains(FlowCounterFlags::FRAME_LENGTH)
                .then(Summary::default),
            sequencing: mask
                .contains(FlowCounterFlags::SEQUENCING)
                .then(SequencingCounter::default),
            latency: mask
                .contains(FlowCounterFlags::LATENCY)
                .then(LatencyCounter::default),
            jitter_rfc: mask
                .contains(FlowCounterFlags::JITTER_RFC)
                .then(Summary::default),
            jitter_ipdv: mask
                .contains(FlowCounterFlags::JITTER_IPDV)
                .then(Summary::default),
            prbs: mask
                .contains(FlowCounterFlags::PRBS)
                .then(PrbsCounter::default),
            header: mask
                .contains(FlowCounterFlags::HEADER)
                .then(HeaderCapture::default),
            digests: (!digests.is_empty()).then(|| FlowDigests::new(digests)),
        }
    }

    pub fn mask(&self) -> FlowCounterFlags {
        self.mask
    }

    /// Records the first packet's type flags and leading bytes.
    pub fn set_header(&mut self, packet: &PacketBuffer) {
        if let Some(header) = &mut self.header {
            header.capture(packet.packet_type_flags(), packet.data());
        }
    }

    /// Folds one received packet into the flow.
    pub fn update(&mut self, packet: &PacketBuffer) {
        let rx = packet.rx_timestamp();
        let length = packet.length();

        let last_rx = self.frames.last_rx;
        self.frames.count += 1;
        self.frames.octets += length as u64;
        self.frames.first_rx.get_or_insert(rx);
        self.frames.last_rx = Some(rx);

        if let (Some(interarrival), Some(last_rx)) = (&mut self.interarrival, last_rx) {
            let delta = rx.saturating_sub(last_rx) as i64;
            interarrival.update(delta);
            if let Some(digest) = self.digests.as_mut().and_then(|d| d.interarrival.as_mut()) {
                digest.insert(delta as f64);
            }
        }

        if let Some(frame_length) = &mut self.frame_length {
            frame_length.update(length as i64);
            if let Some(digest) = self.digests.as_mut().and_then(|d| d.frame_length.as_mut()) {
                digest.insert(length as f64);
            }
        }

        if let (Some(sequencing), Some(seq)) =
            (&mut self.sequencing, packet.signature_sequence_number())
        {
            let previous_run = sequencing.update(seq);
            if sequencing.run_length == 1 {
                // This packet is out of sequence; the previous run just
                // ended.
                if let Some(digest) = self
                    .digests
                    .as_mut()
                    .and_then(|d| d.sequence_run_length.as_mut())
                {
                    digest.insert(previous_run as f64);
                }
            }
        }

        if let (Some(latency), Some(tx)) = (&mut self.latency, packet.signature_tx_timestamp()) {
            let delay = rx as i64 - tx as i64;
            let last_delay = latency.last_delay;
            latency.summary.update(delay);
            latency.last_delay = Some(delay);

            if let Some(digest) = self.digests.as_mut().and_then(|d| d.latency.as_mut()) {
                digest.insert(delay as f64);
            }

            if let Some(last_delay) = last_delay {
                if let Some(jitter_rfc) = &mut self.jitter_rfc {
                    let jitter = (delay - last_delay).abs();
                    jitter_rfc.update(jitter);
                    if let Some(digest) =
                        self.digests.as_mut().and_then(|d| d.jitter_rfc.as_mut())
                    {
                        digest.insert(jitter as f64);
                    }
                }

                if let Some(jitter_ipdv) = &mut self.jitter_ipdv {
                    let in_sequence = self
                        .sequencing
                        .as_ref()
                        .is_some_and(|seq| seq.run_length > 1);
                    if in_sequence {
                        let jitter = delay - last_delay;
                        jitter_ipdv.update(jitter);
                        if let Some(digest) =
                            self.digests.as_mut().and_then(|d| d.jitter_ipdv.as_mut())
                        {
                            digest.insert(jitter as f64);
                        }
                    }
                }
            }
        }

        if let Some(prbs) = &mut self.prbs {
            if let Some(bit_errors) = packet.prbs_bit_errors() {
                let header_length =
                    header::header_length(packet.packet_type_flags(), packet.data());
                prbs.octets +=
                    length.saturating_sub(header_length + SIGNATURE_LENGTH) as u64;
                prbs.bit_errors += bit_errors as u64;
            }
        }
    }

    /// Folds another flow snapshot into this one; used for whole-sink
    /// aggregation.
    pub fn merge(&mut self, other: &FlowCounters) {
        self.frames.count += other.frames.count;
        self.frames.octets += other.frames.octets;
        self.frames.first_rx = match (self.frames.first_rx, other.frames.first_rx) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.frames.last_rx = match (self.frames.last_rx, other.frames.last_rx) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}
