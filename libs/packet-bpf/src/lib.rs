//! BPF filter engine for analyzer and capture sinks.
//!
//! Accepts libpcap syntax extended with three term families:
//! `signature`, `signature streamid N[-M]` and `valid {fcs|chksum|prbs}`.
//! The extended terms match on packet metadata the driver decodes
//! (signature presence, stream ids, checksum/FCS/PRBS error flags) rather
//! than on packet bytes, so a parsed filter is rewritten to separate the
//! metadata predicates from the byte predicates before compilation.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod ast;
mod codegen;
mod filter;
mod parse;
mod primitives;
mod program;

pub use ast::{BinaryOp, Expr, StreamIdRange, ValidTerms, split_special};
pub use codegen::{FilterFlags, filter_flags};
pub use filter::Bpf;
pub use parse::parse;
pub use program::{Insn, MEM_PKTFLAGS, MEM_STREAM_ID, PKTFLAGS_MASK, validate_program};

/// Errors produced while parsing or compiling a filter expression.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("error parsing filter: {0}")]
    Parse(String),
    #[error("can not split filter into special and normal expressions")]
    Split,
    #[error("unsupported filter predicate: {0}")]
    Unsupported(String),
    #[error("filter program failed validation")]
    InvalidProgram,
}

/// Compile-checks a filter string without retaining the program.
pub fn validate_filter(filter: &str) -> bool {
    Bpf::parse(filter).is_ok()
}
