//! Program construction: jump-map bookkeeping, emission of special
//! (metadata) terms, byte-predicate programs and the mixed splice.
//!
//! Conditional jumps are emitted with unresolved PASS/FAIL branches
//! collected in a map; binary operators resolve one branch of the left
//! block to the start of the right block, and the final return
//! instructions absorb whatever remains.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::Error;
use crate::ast::{BinaryOp, Expr, ValidTerms};
use crate::primitives;
use crate::program::*;

bitflags! {
    /// Summary of everything a compiled filter matches on; used to pick
    /// fast paths and to derive required sink features.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FilterFlags: u32 {
        const FCS_ERROR = 1 << 0;
        const IP_CHKSUM_ERROR = 1 << 1;
        const TCP_CHKSUM_ERROR = 1 << 2;
        const UDP_CHKSUM_ERROR = 1 << 3;
        const ICMP_CHKSUM_ERROR = 1 << 4;
        const PRBS_ERROR = 1 << 5;
        const SIGNATURE = 1 << 6;
        const SIGNATURE_STREAM_ID = 1 << 7;
        const AND = 1 << 8;
        const OR = 1 << 9;
        const NOT = 1 << 10;
        const BPF = 1 << 11;
    }
}

/// Extracts the filter flags of an expression.
///
/// `BPF` is set whenever a byte predicate is present, a double NOT
/// survives, or AND and OR both appear (the specialized evaluators only
/// handle single-operator shapes).
pub fn filter_flags(expr: &Expr) -> FilterFlags {
    fn walk(expr: &Expr, flags: &mut FilterFlags) {
        match expr {
            Expr::Generic(_) => *flags |= FilterFlags::BPF,
            Expr::Valid(terms) => {
                if terms.contains(ValidTerms::ETH_FCS) {
                    *flags |= FilterFlags::FCS_ERROR;
                }
                if terms.contains(ValidTerms::CHKSUM) {
                    *flags |= FilterFlags::IP_CHKSUM_ERROR
                        | FilterFlags::TCP_CHKSUM_ERROR
                        | FilterFlags::UDP_CHKSUM_ERROR
                        | FilterFlags::ICMP_CHKSUM_ERROR;
                }
                if terms.contains(ValidTerms::PRBS) {
                    *flags |= FilterFlags::SIGNATURE | FilterFlags::PRBS_ERROR;
                }
            }
            Expr::Signature(stream_id) => {
                *flags |= FilterFlags::SIGNATURE;
                if stream_id.is_some() {
                    *flags |= FilterFlags::SIGNATURE_STREAM_ID;
                }
            }
            Expr::Not(inner) => {
                if flags.contains(FilterFlags::NOT) {
                    // A second NOT exceeds what the specialized
                    // evaluators track.
                    *flags |= FilterFlags::BPF;
                }
                *flags |= FilterFlags::NOT;
                walk(inner, flags);
            }
            Expr::Binary { op, lhs, rhs } => {
                *flags |= match op {
                    BinaryOp::And => FilterFlags::AND,
                    BinaryOp::Or => FilterFlags::OR,
                };
                if flags.contains(FilterFlags::AND | FilterFlags::OR) {
                    *flags |= FilterFlags::BPF;
                }
                walk(lhs, flags);
                walk(rhs, flags);
            }
        }
    }

    let mut flags = FilterFlags::empty();
    walk(expr, &mut flags);
    flags
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Branch {
    Pass,
    Fail,
}

impl Branch {
    fn inverted(self) -> Self {
        match self {
            Branch::Pass => Branch::Fail,
            Branch::Fail => Branch::Pass,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct JumpInfo {
    pub jt: Option<Branch>,
    pub jf: Option<Branch>,
}

pub(crate) type JumpMap = BTreeMap<usize, JumpInfo>;

/// Resolves every pending jump with branch type `branch` in
/// `[start, start + count)` to `target`.
fn resolve_jumps(
    insns: &mut [Insn],
    map: &mut JumpMap,
    start: usize,
    count: usize,
    branch: Branch,
    target: usize,
) {
    let range: Vec<usize> = map.range(start..start + count).map(|(&idx, _)| idx).collect();

    for idx in range {
        let Some(info) = map.get_mut(&idx) else {
            continue;
        };
        if info.jt == Some(branch) {
            insns[idx].jt = (target - idx - 1) as u8;
            info.jt = None;
        }
        if info.jf == Some(branch) {
            insns[idx].jf = (target - idx - 1) as u8;
            info.jf = None;
        }
        if info.jt.is_none() && info.jf.is_none() {
            map.remove(&idx);
        }
    }
}

/// Inverts the branch types of every pending jump in the range; emitted
/// for NOT nodes.
fn invert_jumps(map: &mut JumpMap, start: usize, count: usize) {
    for (_, info) in map.range_mut(start..start + count) {
        info.jt = info.jt.map(Branch::inverted);
        info.jf = info.jf.map(Branch::inverted);
    }
}

/// First return instruction at or after `offset` matching `branch`.
fn find_ret(insns: &[Insn], offset: usize, branch: Branch) -> usize {
    insns
        .iter()
        .enumerate()
        .skip(offset)
        .find(|(_, insn)| {
            insn.code & 0x07 == BPF_RET
                && match branch {
                    Branch::Pass => insn.k != 0,
                    Branch::Fail => insn.k == 0,
                }
        })
        .map(|(idx, _)| idx)
        .unwrap_or(insns.len())
}

/// The left block's branch that falls through to the right block: an AND
/// continues on PASS, an OR continues on FAIL.
fn op_resolves(op: BinaryOp) -> Branch {
    match op {
        BinaryOp::And => Branch::Pass,
        BinaryOp::Or => Branch::Fail,
    }
}

/// Where an unresolved conditional branch should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// Fall through to the next instruction.
    Next,
    /// A forward label bound later by the same leaf.
    Label(usize),
    Pass,
    Fail,
}

/// Instruction emitter shared by the special and byte-predicate
/// compilers. Leaf-local control flow uses forward labels; PASS/FAIL
/// branches go to the jump map for the logical layer to resolve.
pub(crate) struct Emitter<'a> {
    pub insns: &'a mut Vec<Insn>,
    pub map: &'a mut JumpMap,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, bool, usize)>,
}

impl<'a> Emitter<'a> {
    pub fn new(insns: &'a mut Vec<Insn>, map: &'a mut JumpMap) -> Self {
        Self {
            insns,
            map,
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn stmt(&mut self, code: u16, k: u32) {
        self.insns.push(Insn::stmt(code, k));
    }

    pub fn jump(&mut self, code: u16, k: u32, jt: Target, jf: Target) {
        let idx = self.insns.len();
        self.insns.push(Insn::jump(code, k, 0, 0));

        let mut info = JumpInfo::default();
        match jt {
            Target::Next => {}
            Target::Label(label) => self.fixups.push((idx, true, label)),
            Target::Pass => info.jt = Some(Branch::Pass),
            Target::Fail => info.jt = Some(Branch::Fail),
        }
        match jf {
            Target::Next => {}
            Target::Label(label) => self.fixups.push((idx, false, label)),
            Target::Pass => info.jf = Some(Branch::Pass),
            Target::Fail => info.jf = Some(Branch::Fail),
        }
        if info.jt.is_some() || info.jf.is_some() {
            self.map.insert(idx, info);
        }
    }

    pub fn label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    pub fn bind(&mut self, label: usize) {
        self.labels[label] = Some(self.insns.len());
    }

    /// Patches label fixups; every label must have been bound.
    pub fn finish(self) -> Result<(), Error> {
        for (idx, is_jt, label) in self.fixups {
            let target = self.labels[label].ok_or(Error::InvalidProgram)?;
            let offset = (target - idx - 1) as u8;
            if is_jt {
                self.insns[idx].jt = offset;
            } else {
                self.insns[idx].jf = offset;
            }
        }
        Ok(())
    }
}

fn valid_terms_mask(terms: ValidTerms) -> u32 {
    let mut mask = 0;
    if terms.contains(ValidTerms::ETH_FCS) {
        mask |= PKTFLAG_FCS_ERROR;
    }
    if terms.contains(ValidTerms::CHKSUM) {
        mask |= PKTFLAG_IP_CHKSUM_ERROR
            | PKTFLAG_TCP_CHKSUM_ERROR
            | PKTFLAG_UDP_CHKSUM_ERROR
            | PKTFLAG_ICMP_CHKSUM_ERROR;
    }
    if terms.contains(ValidTerms::PRBS) {
        mask |= PKTFLAG_PRBS_ERROR;
    }
    mask
}

/// Emits instructions for a pure-special expression subtree.
fn emit_special(expr: &Expr, insns: &mut Vec<Insn>, map: &mut JumpMap) -> Result<(), Error> {
    match expr {
        Expr::Generic(text) => Err(Error::Unsupported(format!(
            "unexpected byte predicate '{text}' in special block"
        ))),
        Expr::Valid(terms) => {
            let mut e = Emitter::new(insns, map);
            e.stmt(BPF_LD | BPF_MEM, MEM_PKTFLAGS);
            e.jump(
                BPF_JMP | BPF_JSET | BPF_K,
                valid_terms_mask(*terms),
                Target::Pass,
                Target::Fail,
            );
            e.finish()
        }
        Expr::Signature(stream_id) => {
            let mut e = Emitter::new(insns, map);
            e.stmt(BPF_LD | BPF_MEM, MEM_PKTFLAGS);
            match stream_id {
                None => {
                    e.jump(
                        BPF_JMP | BPF_JSET | BPF_K,
                        PKTFLAG_SIGNATURE,
                        Target::Pass,
                        Target::Fail,
                    );
                }
                Some(range) => {
                    e.jump(
                        BPF_JMP | BPF_JSET | BPF_K,
                        PKTFLAG_SIGNATURE,
                        Target::Next,
                        Target::Fail,
                    );
                    e.stmt(BPF_LD | BPF_MEM, MEM_STREAM_ID);
                    if range.start == range.end {
                        e.jump(
                            BPF_JMP | BPF_JEQ | BPF_K,
                            range.start,
                            Target::Pass,
                            Target::Fail,
                        );
                    } else {
                        e.jump(
                            BPF_JMP | BPF_JGE | BPF_K,
                            range.start,
                            Target::Next,
                            Target::Fail,
                        );
                        e.jump(
                            BPF_JMP | BPF_JGT | BPF_K,
                            range.end,
                            Target::Fail,
                            Target::Pass,
                        );
                    }
                }
            }
            e.finish()
        }
        Expr::Not(inner) => {
            let start = insns.len();
            emit_special(inner, insns, map)?;
            let end = insns.len();
            invert_jumps(map, start, end - start);
            Ok(())
        }
        Expr::Binary { op, lhs, rhs } => {
            let lhs_start = insns.len();
            emit_special(lhs, insns, map)?;
            let rhs_start = insns.len();
            emit_special(rhs, insns, map)?;
            resolve_jumps(
                insns,
                map,
                lhs_start,
                rhs_start - lhs_start,
                op_resolves(*op),
                rhs_start,
            );
            Ok(())
        }
    }
}

/// Emits instructions for a byte-predicate (normal) expression subtree.
fn emit_generic(expr: &Expr, insns: &mut Vec<Insn>, map: &mut JumpMap) -> Result<(), Error> {
    match expr {
        Expr::Generic(text) => primitives::emit_term(text, insns, map),
        Expr::Valid(_) | Expr::Signature(_) => Err(Error::Split),
        Expr::Not(inner) => {
            let start = insns.len();
            emit_generic(inner, insns, map)?;
            let end = insns.len();
            invert_jumps(map, start, end - start);
            Ok(())
        }
        Expr::Binary { op, lhs, rhs } => {
            let lhs_start = insns.len();
            emit_generic(lhs, insns, map)?;
            let rhs_start = insns.len();
            emit_generic(rhs, insns, map)?;
            resolve_jumps(
                insns,
                map,
                lhs_start,
                rhs_start - lhs_start,
                op_resolves(*op),
                rhs_start,
            );
            Ok(())
        }
    }
}

/// Appends the PASS/FAIL returns and resolves everything still pending.
fn seal(insns: &mut Vec<Insn>, map: &mut JumpMap, start: usize) {
    let end = insns.len();

    let pass_index = insns.len();
    insns.push(Insn::stmt(BPF_RET | BPF_K, RET_MATCH));
    let fail_index = insns.len();
    insns.push(Insn::stmt(BPF_RET | BPF_K, 0));

    resolve_jumps(insns, map, start, end - start, Branch::Pass, pass_index);
    resolve_jumps(insns, map, start, end - start, Branch::Fail, fail_index);
}

/// Builds a program for an all-special expression.
pub(crate) fn build_all_special(expr: &Expr) -> Result<Vec<Insn>, Error> {
    let mut insns = Vec::new();
    let mut map = JumpMap::new();

    emit_special(expr, &mut insns, &mut map)?;
    seal(&mut insns, &mut map, 0);

    Ok(insns)
}

/// Builds a program for a pure byte-predicate expression.
pub(crate) fn build_generic(expr: &Expr) -> Result<Vec<Insn>, Error> {
    let mut insns = Vec::new();
    let mut map = JumpMap::new();

    emit_generic(expr, &mut insns, &mut map)?;
    seal(&mut insns, &mut map, 0);

    Ok(insns)
}

/// Builds a program for `special <op> normal`: the special block is
/// emitted first, the byte-predicate program is appended, and the
/// special block's branches resolve to the start of the byte program or
/// to its matching return.
pub(crate) fn build_mixed(op: BinaryOp, special: &Expr, normal: &Expr) -> Result<Vec<Insn>, Error> {
    let mut insns = Vec::new();
    let mut map = JumpMap::new();

    emit_special(special, &mut insns, &mut map)?;
    let rhs_start = insns.len();

    let generic = build_generic(normal)?;
    insns.extend_from_slice(&generic);

    let resolved = op_resolves(op);
    resolve_jumps(&mut insns, &mut map, 0, rhs_start, resolved, rhs_start);

    let other = resolved.inverted();
    let mut ret_index = find_ret(&insns, rhs_start, other);
    if ret_index >= insns.len() {
        // A matching return normally exists in the byte program.
        let ret_val = match other {
            Branch::Pass => RET_MATCH,
            Branch::Fail => 0,
        };
        insns.push(Insn::stmt(BPF_RET | BPF_K, ret_val));
        ret_index = insns.len() - 1;
    }
    resolve_jumps(&mut insns, &mut map, 0, rhs_start, other, ret_index);

    Ok(insns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use crate::program::{execute, packet_mem, validate_program};
    use packet_types::PacketBuffer;

    fn run(insns: &[Insn], packet: &PacketBuffer) -> bool {
        let mut mem = packet_mem(packet);
        execute(insns, packet.data(), packet.length() as u32, &mut mem) != 0
    }

    fn signed_packet(stream_id: u32) -> PacketBuffer {
        let mut packet = PacketBuffer::from_data(&[0u8; 64]);
        packet.set_signature(stream_id, 0, 0);
        packet
    }

    #[test]
    fn signature_program() {
        let expr = parse("signature").unwrap();
        let insns = build_all_special(&expr).unwrap();
        assert!(validate_program(&insns));

        assert!(run(&insns, &signed_packet(1)));
        assert!(!run(&insns, &PacketBuffer::from_data(&[0u8; 64])));
    }

    #[test]
    fn stream_id_range_program() {
        let expr = parse("signature streamid 10-20").unwrap();
        let insns = build_all_special(&expr).unwrap();
        assert!(validate_program(&insns));

        assert!(run(&insns, &signed_packet(10)));
        assert!(run(&insns, &signed_packet(15)));
        assert!(run(&insns, &signed_packet(20)));
        assert!(!run(&insns, &signed_packet(9)));
        assert!(!run(&insns, &signed_packet(21)));
        assert!(!run(&insns, &PacketBuffer::from_data(&[0u8; 64])));
    }

    #[test]
    fn not_signature_program() {
        let expr = parse("not signature").unwrap();
        let insns = build_all_special(&expr).unwrap();
        assert!(validate_program(&insns));

        assert!(!run(&insns, &signed_packet(1)));
        assert!(run(&insns, &PacketBuffer::from_data(&[0u8; 64])));
    }

    #[test]
    fn valid_chksum_program() {
        let expr = parse("valid chksum").unwrap();
        let insns = build_all_special(&expr).unwrap();
        assert!(validate_program(&insns));

        let mut packet = PacketBuffer::from_data(&[0u8; 64]);
        assert!(!run(&insns, &packet));

        packet.set_udp_checksum_error(true);
        assert!(run(&insns, &packet));
    }

    #[test]
    fn signature_or_valid_program() {
        let expr = parse("signature or valid fcs").unwrap();
        let insns = build_all_special(&expr).unwrap();
        assert!(validate_program(&insns));

        assert!(run(&insns, &signed_packet(1)));
        assert!(!run(&insns, &PacketBuffer::from_data(&[0u8; 64])));
    }

    #[test]
    fn filter_flags_mixed_operators_require_bpf() {
        let expr = parse("signature and valid fcs or signature streamid 1").unwrap();
        let flags = filter_flags(&expr);

        assert!(flags.contains(FilterFlags::BPF));
    }

    #[test]
    fn filter_flags_signature_only() {
        let flags = filter_flags(&parse("signature").unwrap());
        assert_eq!(flags, FilterFlags::SIGNATURE);

        let flags = filter_flags(&parse("not signature").unwrap());
        assert_eq!(flags, FilterFlags::SIGNATURE | FilterFlags::NOT);
    }
}
