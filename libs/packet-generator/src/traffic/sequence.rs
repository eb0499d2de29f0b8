//! Transmit sequences over weighted traffic definitions.
//!
//! Both strategies are restartable and indexable in O(log n) over the
//! definition count via partial-sum searches: round-robin interleaves
//! weighted runs of each definition per iteration, sequential plays
//! each definition out completely before moving on.

use packet_types::{HeaderLengths, PacketTypeFlags};

use super::packet_template::PacketTemplate;
use crate::Error;

/// Signature stamping configuration of one definition; flow `n` of the
/// definition transmits with stream id `first_stream_id + n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureConfig {
    pub first_stream_id: u32,
}

/// One weighted traffic definition.
#[derive(Debug, Clone)]
pub struct Definition {
    pub template: PacketTemplate,
    pub weight: u32,
    pub signature: Option<SignatureConfig>,
}

/// Everything `unpack` reports for one packet slot.
#[derive(Debug, Clone, Copy)]
pub struct Unpacked<'a> {
    pub flow_idx: usize,
    pub header: &'a [u8],
    pub header_lengths: HeaderLengths,
    pub flags: PacketTypeFlags,
    pub stream_id: Option<u32>,
    pub pkt_len: u16,
}

#[derive(Debug)]
struct Templates {
    definitions: Vec<Definition>,
    /// Global flow-index offset of each definition.
    flow_offsets: Vec<usize>,
}

impl Templates {
    fn new(definitions: Vec<Definition>) -> Result<Self, Error> {
        if definitions.is_empty() {
            return Err(Error::EmptyDefinition);
        }

        let mut flow_offsets = Vec::with_capacity(definitions.len());
        let mut offset = 0;
        for definition in &definitions {
            flow_offsets.push(offset);
            offset += definition.template.flow_count();
        }

        Ok(Self {
            definitions,
            flow_offsets,
        })
    }

    fn flow_count(&self) -> usize {
        self.definitions
            .iter()
            .map(|definition| definition.template.flow_count())
            .sum()
    }

    fn max_packet_length(&self) -> u16 {
        self.definitions
            .iter()
            .map(|definition| definition.template.max_packet_length())
            .max()
            .unwrap_or(0)
    }

    fn unpack_one(&self, template_idx: usize, pkt_idx: usize) -> Unpacked<'_> {
        let definition = &self.definitions[template_idx];
        let (flow, header, pkt_len) = definition.template.get(pkt_idx);
        let flow_idx = self.flow_offsets[template_idx] + flow;

        Unpacked {
            flow_idx,
            header,
            header_lengths: definition.template.header_lengths(),
            flags: definition.template.header_flags(),
            stream_id: definition
                .signature
                .map(|signature| signature.first_stream_id + flow as u32),
            pkt_len,
        }
    }

    fn has_signature_config(&self) -> bool {
        self.definitions
            .iter()
            .any(|definition| definition.signature.is_some())
    }
}

/// Maps a sequence position to `(definition index, packet index)` via
/// an upper-bound search over run-length partial sums.
fn indexes_for(
    idx: usize,
    runs: &[usize],
    partial_sums: &[usize],
) -> (usize, usize) {
    let period: usize = *partial_sums.last().expect("non-empty partial sums");
    let round = idx / period;
    let rem = idx % period;

    let template_idx = partial_sums.partition_point(|&sum| sum <= rem);
    let run_start = if template_idx == 0 {
        0
    } else {
        partial_sums[template_idx - 1]
    };

    // Packets of this definition emitted in earlier rounds plus the
    // offset into the current run.
    let pkt_idx = round * runs[template_idx] + (rem - run_start);
    (template_idx, pkt_idx)
}

#[derive(Debug)]
pub struct RoundRobinSequence {
    templates: Templates,
    weights: Vec<usize>,
    weight_sums: Vec<usize>,
}

#[derive(Debug)]
pub struct SequentialSequence {
    templates: Templates,
    lengths: Vec<usize>,
    length_sums: Vec<usize>,
}

/// A transmit sequence.
#[derive(Debug)]
pub enum Sequence {
    RoundRobin(RoundRobinSequence),
    Sequential(SequentialSequence),
}

impl Sequence {
    pub fn round_robin(definitions: Vec<Definition>) -> Result<Self, Error> {
        let templates = Templates::new(definitions)?;
        let weights: Vec<usize> = templates
            .definitions
            .iter()
            .map(|definition| definition.weight.max(1) as usize)
            .collect();
        let weight_sums = partial_sums(&weights);

        Ok(Sequence::RoundRobin(RoundRobinSequence {
            templates,
            weights,
            weight_sums,
        }))
    }

    pub fn sequential(definitions: Vec<Definition>) -> Result<Self, Error> {
        let templates = Templates::new(definitions)?;
        let lengths: Vec<usize> = templates
            .definitions
            .iter()
            .map(|definition| {
                definition.weight.max(1) as usize * definition.template.size()
            })
            .collect();
        let length_sums = partial_sums(&lengths);

        Ok(Sequence::Sequential(SequentialSequence {
            templates,
            lengths,
            length_sums,
        }))
    }

    fn templates(&self) -> &Templates {
        match self {
            Sequence::RoundRobin(sequence) => &sequence.templates,
            Sequence::Sequential(sequence) => &sequence.templates,
        }
    }

    /// Packets in one full sequence iteration.
    pub fn size(&self) -> usize {
        match self {
            Sequence::RoundRobin(sequence) => sequence
                .templates
                .definitions
                .iter()
                .zip(&sequence.weights)
                .map(|(definition, &weight)| definition.template.size() * weight)
                .sum(),
            Sequence::Sequential(sequence) => {
                *sequence.length_sums.last().expect("non-empty sums")
            }
        }
    }

    /// Distinct flows across all definitions.
    pub fn flow_count(&self) -> usize {
        self.templates().flow_count()
    }

    pub fn max_packet_length(&self) -> u16 {
        self.templates().max_packet_length()
    }

    pub fn has_signature_config(&self) -> bool {
        self.templates().has_signature_config()
    }

    fn get(&self, idx: usize) -> Unpacked<'_> {
        let (template_idx, pkt_idx) = match self {
            Sequence::RoundRobin(sequence) => {
                indexes_for(idx, &sequence.weights, &sequence.weight_sums)
            }
            Sequence::Sequential(sequence) => {
                indexes_for(idx, &sequence.lengths, &sequence.length_sums)
            }
        };
        self.templates().unpack_one(template_idx, pkt_idx)
    }

    /// Fills `out` with the packets at sequence positions
    /// `[start, start + out.len())`; returns how many were unpacked.
    pub fn unpack<'a>(&'a self, start: usize, out: &mut [Option<Unpacked<'a>>]) -> usize {
        for (slot, offset) in out.iter_mut().zip(0..) {
            *slot = Some(self.get(start + offset));
        }
        out.len()
    }

    /// Sum of packet lengths over one full iteration.
    pub fn sum_packet_lengths(&self) -> u64 {
        (0..self.size())
            .map(|idx| self.get(idx).pkt_len as u64)
            .sum()
    }

    /// Sum of packet lengths for the first `count` sequence positions;
    /// `count` may exceed the iteration size.
    pub fn sum_packet_lengths_to(&self, count: u64) -> u64 {
        let size = self.size() as u64;
        let rounds = count / size;
        let rem = count % size;

        let partial: u64 = (0..rem as usize)
            .map(|idx| self.get(idx).pkt_len as u64)
            .sum();

        rounds * self.sum_packet_lengths() + partial
    }
}

fn partial_sums(values: &[usize]) -> Vec<usize> {
    values
        .iter()
        .scan(0usize, |acc, &value| {
            *acc += value;
            Some(*acc)
        })
        .collect()
}
