//! The compiled filter object and its burst entry points.

use packet_types::{PacketBuffer, SinkFeatures};

use crate::ast::{BinaryOp, Expr, split_special};
use crate::codegen::{FilterFlags, build_all_special, build_generic, build_mixed, filter_flags};
use crate::program::{Insn, execute, packet_mem, validate_program};
use crate::{Error, parse};

/// Evaluation strategy selected at compile time.
///
/// Common filters avoid the interpreter entirely: `signature`,
/// `not signature` and `not signature and <byte predicate>` have
/// dedicated evaluators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// No filter; everything passes.
    All,
    /// Interpret the compiled program.
    Vm,
    /// Signature packets only.
    Signature,
    /// Non-signature packets only.
    NoSignature,
    /// Non-signature packets matching the compiled byte program.
    NoSignatureAndProgram,
}

/// A compiled filter.
///
/// Owns its instruction buffer and filter flags for its lifetime; the
/// burst entry points never allocate.
#[derive(Debug, Clone)]
pub struct Bpf {
    mode: Mode,
    flags: FilterFlags,
    prog: Vec<Insn>,
}

impl Default for Bpf {
    fn default() -> Self {
        Self::new()
    }
}

impl Bpf {
    /// An always-pass filter.
    pub fn new() -> Self {
        Self {
            mode: Mode::All,
            flags: FilterFlags::empty(),
            prog: Vec::new(),
        }
    }

    /// Compiles a filter string.
    pub fn parse(filter: &str) -> Result<Self, Error> {
        let expr = parse(filter).inspect_err(
            |error| tracing::error!(filter, %error, "failed to parse BPF filter"),
        )?;

        if !expr.has_special() {
            let prog = build_generic(&expr)?;
            return Self::with_program(prog, FilterFlags::empty());
        }

        let expr = split_special(expr).inspect_err(
            |error| tracing::error!(filter, %error, "failed to split BPF filter"),
        )?;
        let flags = filter_flags(&expr);

        if !flags.contains(FilterFlags::BPF) {
            // Simple cases handled without a program.
            if flags == FilterFlags::SIGNATURE {
                return Ok(Self {
                    mode: Mode::Signature,
                    flags,
                    prog: Vec::new(),
                });
            }
            if flags == FilterFlags::SIGNATURE | FilterFlags::NOT {
                return Ok(Self {
                    mode: Mode::NoSignature,
                    flags,
                    prog: Vec::new(),
                });
            }
        }

        if let Expr::Binary { op, lhs, rhs } = &expr {
            if !rhs.has_special() {
                let lhs_flags = filter_flags(lhs);
                if lhs_flags == FilterFlags::SIGNATURE | FilterFlags::NOT && *op == BinaryOp::And
                {
                    // Filtering non-signature packets through a byte
                    // program is common enough to skip the signature
                    // check before entering the program.
                    let prog = build_generic(rhs)?;
                    let mut filter = Self::with_program(prog, flags)?;
                    filter.mode = Mode::NoSignatureAndProgram;
                    return Ok(filter);
                }
                let prog = build_mixed(*op, lhs, rhs)?;
                return Self::with_program(prog, flags);
            }
        }

        // All special terms.
        let prog = build_all_special(&expr)?;
        Self::with_program(prog, flags)
    }

    /// Installs a raw program after validation.
    pub fn with_program(prog: Vec<Insn>, flags: FilterFlags) -> Result<Self, Error> {
        if !validate_program(&prog) {
            tracing::error!("unable to validate BPF program");
            return Err(Error::InvalidProgram);
        }

        Ok(Self {
            mode: Mode::Vm,
            flags,
            prog,
        })
    }

    pub fn filter_flags(&self) -> FilterFlags {
        self.flags
    }

    pub fn program(&self) -> &[Insn] {
        &self.prog
    }

    #[cfg(test)]
    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    /// Sink features the compiled filter depends on.
    pub fn sink_features(&self) -> SinkFeatures {
        let mut needed = SinkFeatures::empty();

        if self.flags.contains(FilterFlags::SIGNATURE) {
            needed |= SinkFeatures::SIGNATURE_DECODE;
            if self.flags.contains(FilterFlags::PRBS_ERROR) {
                needed |= SinkFeatures::PRBS_ERROR_DETECT;
            }
        }
        if self.flags.intersects(
            FilterFlags::IP_CHKSUM_ERROR
                | FilterFlags::TCP_CHKSUM_ERROR
                | FilterFlags::UDP_CHKSUM_ERROR
                | FilterFlags::ICMP_CHKSUM_ERROR,
        ) {
            needed |= SinkFeatures::PACKET_TYPE_DECODE;
        }

        needed
    }

    #[inline]
    fn run_program(&self, packet: &PacketBuffer) -> bool {
        let mut mem = packet_mem(packet);
        execute(&self.prog, packet.data(), packet.length() as u32, &mut mem) != 0
    }

    #[inline]
    fn matches(&self, packet: &PacketBuffer) -> bool {
        match self.mode {
            Mode::All => true,
            Mode::Vm => self.run_program(packet),
            Mode::Signature => packet.signature_stream_id().is_some(),
            Mode::NoSignature => packet.signature_stream_id().is_none(),
            Mode::NoSignatureAndProgram => {
                packet.signature_stream_id().is_none() && self.run_program(packet)
            }
        }
    }

    /// Copies the packets that match into `results`; returns how many.
    pub fn filter_burst<'a>(
        &self,
        packets: &[&'a PacketBuffer],
        results: &mut [&'a PacketBuffer],
    ) -> usize {
        debug_assert!(results.len() >= packets.len());

        let mut kept = 0;
        for &packet in packets {
            if self.matches(packet) {
                results[kept] = packet;
                kept += 1;
            }
        }
        kept
    }

    /// Evaluates every packet, writing 0/1 per slot; returns the burst
    /// length.
    pub fn exec_burst(&self, packets: &[&PacketBuffer], results: &mut [u64]) -> usize {
        debug_assert!(results.len() >= packets.len());

        for (packet, result) in packets.iter().zip(results.iter_mut()) {
            *result = self.matches(packet) as u64;
        }
        packets.len()
    }

    /// Index of the first matching packet at or after `offset`; the
    /// burst length when none match.
    pub fn find_next(&self, packets: &[&PacketBuffer], offset: usize) -> usize {
        packets[offset..]
            .iter()
            .position(|packet| self.matches(packet))
            .map(|idx| offset + idx)
            .unwrap_or(packets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(stream_id: u32) -> PacketBuffer {
        let mut packet = PacketBuffer::from_data(&[0u8; 64]);
        packet.set_signature(stream_id, 0, 0);
        packet
    }

    #[test]
    fn default_filter_passes_everything() {
        let filter = Bpf::new();
        let packets = [signed(1), PacketBuffer::from_data(&[0u8; 64])];
        let refs: Vec<&PacketBuffer> = packets.iter().collect();
        let mut results = vec![&packets[0]; refs.len()];

        assert_eq!(filter.filter_burst(&refs, &mut results), 2);
        assert_eq!(filter.find_next(&refs, 0), 0);
        assert_eq!(filter.find_next(&refs, 1), 1);
    }

    #[test]
    fn signature_fast_path_is_selected() {
        let filter = Bpf::parse("signature").unwrap();
        assert_eq!(filter.mode(), Mode::Signature);

        let filter = Bpf::parse("not signature").unwrap();
        assert_eq!(filter.mode(), Mode::NoSignature);
    }

    #[test]
    fn no_signature_and_program_fast_path_is_selected() {
        let filter = Bpf::parse("not signature and ip src 10.0.0.1").unwrap();
        assert_eq!(filter.mode(), Mode::NoSignatureAndProgram);
    }

    #[test]
    fn stream_id_filter_uses_program() {
        let filter = Bpf::parse("signature streamid 7").unwrap();
        assert_eq!(filter.mode(), Mode::Vm);

        let packets = [signed(7), signed(8), PacketBuffer::from_data(&[0u8; 64])];
        let refs: Vec<&PacketBuffer> = packets.iter().collect();
        let mut results = vec![0u64; refs.len()];

        filter.exec_burst(&refs, &mut results);
        assert_eq!(results, vec![1, 0, 0]);
    }

    #[test]
    fn invalid_filters_are_rejected() {
        assert!(Bpf::parse("").is_err());
        assert!(Bpf::parse("nonsense predicate here").is_err());
        assert!(Bpf::parse("ip src 10.0.0.1 or signature and udp").is_err());
    }
}
