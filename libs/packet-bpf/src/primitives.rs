//! Byte-predicate compiler for the supported libpcap term subset.
//!
//! Each term compiles to a short block of loads and compares; leaf-local
//! control flow uses forward labels, while the final accept/reject
//! decisions are PASS/FAIL entries in the caller's jump map.
//!
//! Supported terms: `ether|mac src|dst|host <mac>`, `ip|ip6 src|dst|host
//! <addr>`, `host <addr>`, bare protocol keywords (`ip`, `ip6`, `arp`,
//! `tcp`, `udp`, `icmp`, `igmp`, `sctp`), `[proto] [src|dst]
//! port[range]`, and frame-length comparisons (`len <op> N`, `greater`,
//! `less`).

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::Error;
use crate::codegen::{Emitter, JumpMap, Target};
use crate::program::*;

const ETHERTYPE_IPV4: u32 = 0x0800;
const ETHERTYPE_IPV6: u32 = 0x86dd;
const ETHERTYPE_ARP: u32 = 0x0806;

const IP_PROTO_ICMP: u32 = 1;
const IP_PROTO_IGMP: u32 = 2;
const IP_PROTO_TCP: u32 = 6;
const IP_PROTO_UDP: u32 = 17;
const IP_PROTO_SCTP: u32 = 132;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Src,
    Dst,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    EtherAddr { dir: Dir, addr: [u8; 6] },
    Ipv4Addr { dir: Dir, addr: u32 },
    Ipv6Addr { dir: Dir, addr: [u8; 16] },
    EtherProto(u32),
    IpProto { protos: Vec<u32>, v4: bool, v6: bool },
    Port { protos: Vec<u32>, dir: Dir, lo: u16, hi: u16 },
    Length { op: CmpOp, value: u32 },
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut addr = [0u8; 6];
    let mut parts = text.split(':');
    for byte in addr.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(addr)
}

fn parse_dir(token: &str) -> Option<Dir> {
    match token {
        "src" => Some(Dir::Src),
        "dst" => Some(Dir::Dst),
        "host" => Some(Dir::Any),
        _ => None,
    }
}

fn parse_cmp(token: &str) -> Option<CmpOp> {
    match token {
        "==" => Some(CmpOp::Eq),
        "!=" => Some(CmpOp::Neq),
        ">" => Some(CmpOp::Gt),
        ">=" => Some(CmpOp::Gte),
        "<" => Some(CmpOp::Lt),
        "<=" => Some(CmpOp::Lte),
        _ => None,
    }
}

fn parse_u32(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// Parses an address term following an `ip`/`ip6`/`ether` qualifier.
fn parse_addr_term(proto: &str, dir: Dir, addr: &str) -> Result<Term, Error> {
    match proto {
        "ether" | "mac" => parse_mac(addr)
            .map(|addr| Term::EtherAddr { dir, addr })
            .ok_or_else(|| Error::Unsupported(format!("bad mac address '{addr}'"))),
        "ip" => Ipv4Addr::from_str(addr)
            .map(|addr| Term::Ipv4Addr {
                dir,
                addr: u32::from(addr),
            })
            .map_err(|_| Error::Unsupported(format!("bad ipv4 address '{addr}'"))),
        "ip6" | "ipv6" => Ipv6Addr::from_str(addr)
            .map(|addr| Term::Ipv6Addr {
                dir,
                addr: addr.octets(),
            })
            .map_err(|_| Error::Unsupported(format!("bad ipv6 address '{addr}'"))),
        _ => Err(Error::Unsupported(format!("unknown qualifier '{proto}'"))),
    }
}

/// Parses an unqualified `host <addr>` by address shape.
fn parse_host_term(dir: Dir, addr: &str) -> Result<Term, Error> {
    if let Ok(v4) = Ipv4Addr::from_str(addr) {
        return Ok(Term::Ipv4Addr {
            dir,
            addr: u32::from(v4),
        });
    }
    if let Some(mac) = parse_mac(addr) {
        return Ok(Term::EtherAddr { dir, addr: mac });
    }
    if let Ok(v6) = Ipv6Addr::from_str(addr) {
        return Ok(Term::Ipv6Addr {
            dir,
            addr: v6.octets(),
        });
    }
    Err(Error::Unsupported(format!("bad host address '{addr}'")))
}

fn port_protos(qualifier: Option<&str>) -> Result<Vec<u32>, Error> {
    match qualifier {
        None => Ok(vec![IP_PROTO_TCP, IP_PROTO_UDP]),
        Some("tcp") => Ok(vec![IP_PROTO_TCP]),
        Some("udp") => Ok(vec![IP_PROTO_UDP]),
        Some("sctp") => Ok(vec![IP_PROTO_SCTP]),
        Some(other) => Err(Error::Unsupported(format!(
            "'{other}' can not qualify a port"
        ))),
    }
}

fn parse_port(
    qualifier: Option<&str>,
    dir: Dir,
    keyword: &str,
    value: &str,
) -> Result<Term, Error> {
    let protos = port_protos(qualifier)?;

    let (lo, hi) = match keyword {
        "port" => {
            let port = parse_u32(value)
                .filter(|&port| port <= u16::MAX as u32)
                .ok_or_else(|| Error::Unsupported(format!("bad port '{value}'")))?;
            (port as u16, port as u16)
        }
        "portrange" => {
            let (lo, hi) = value
                .split_once('-')
                .ok_or_else(|| Error::Unsupported(format!("bad port range '{value}'")))?;
            let lo = parse_u32(lo)
                .filter(|&port| port <= u16::MAX as u32)
                .ok_or_else(|| Error::Unsupported(format!("bad port range '{value}'")))?;
            let hi = parse_u32(hi)
                .filter(|&port| port <= u16::MAX as u32)
                .ok_or_else(|| Error::Unsupported(format!("bad port range '{value}'")))?;
            (lo as u16, hi as u16)
        }
        _ => return Err(Error::Unsupported(format!("unknown keyword '{keyword}'"))),
    };

    Ok(Term::Port {
        protos,
        dir,
        lo,
        hi,
    })
}

fn parse_term(text: &str) -> Result<Term, Error> {
    let tokens: Vec<&str> = text.split_whitespace().collect();

    match tokens.as_slice() {
        ["ip"] => Ok(Term::EtherProto(ETHERTYPE_IPV4)),
        ["ip6"] | ["ipv6"] => Ok(Term::EtherProto(ETHERTYPE_IPV6)),
        ["arp"] => Ok(Term::EtherProto(ETHERTYPE_ARP)),
        ["tcp"] => Ok(Term::IpProto {
            protos: vec![IP_PROTO_TCP],
            v4: true,
            v6: true,
        }),
        ["udp"] => Ok(Term::IpProto {
            protos: vec![IP_PROTO_UDP],
            v4: true,
            v6: true,
        }),
        ["sctp"] => Ok(Term::IpProto {
            protos: vec![IP_PROTO_SCTP],
            v4: true,
            v6: true,
        }),
        ["icmp"] => Ok(Term::IpProto {
            protos: vec![IP_PROTO_ICMP],
            v4: true,
            v6: false,
        }),
        ["igmp"] => Ok(Term::IpProto {
            protos: vec![IP_PROTO_IGMP],
            v4: true,
            v6: false,
        }),
        [proto @ ("ether" | "mac" | "ip" | "ip6" | "ipv6"), dir, addr] => {
            let dir = parse_dir(dir)
                .ok_or_else(|| Error::Unsupported(format!("unknown direction '{dir}'")))?;
            parse_addr_term(proto, dir, addr)
        }
        ["host", addr] => parse_host_term(Dir::Any, addr),
        [dir @ ("src" | "dst"), "host", addr] =>

            parse_host_term(parse_dir(dir).unwrap_or(Dir::Any), addr),
        [keyword @ ("port" | "portrange"), value] => parse_port(None, Dir::Any, keyword, value),
        [dir @ ("src" | "dst"), keyword @ ("port" | "portrange"), value] => parse_port(
            None,
            parse_dir(dir).unwrap_or(Dir::Any),
            keyword,
            value,
        ),
        [proto, keyword @ ("port" | "portrange"), value] => {
            parse_port(Some(proto), Dir::Any, keyword, value)
        }
        [proto, dir @ ("src" | "dst"), keyword @ ("port" | "portrange"), value] => parse_port(
            Some(proto),
            parse_dir(dir).unwrap_or(Dir::Any),
            keyword,
            value,
        ),
        ["len" | "length", op, value] => {
            let op = parse_cmp(op)
                .ok_or_else(|| Error::Unsupported(format!("unknown comparison '{op}'")))?;
            let value = parse_u32(value)
                .ok_or_else(|| Error::Unsupported(format!("bad length '{value}'")))?;
            Ok(Term::Length { op, value })
        }
        ["greater", value] => {
            let value = parse_u32(value)
                .ok_or_else(|| Error::Unsupported(format!("bad length '{value}'")))?;
            Ok(Term::Length {
                op: CmpOp::Gte,
                value,
            })
        }
        ["less", value] => {
            let value = parse_u32(value)
                .ok_or_else(|| Error::Unsupported(format!("bad length '{value}'")))?;
            Ok(Term::Length {
                op: CmpOp::Lte,
                value,
            })
        }
        _ => Err(Error::Unsupported(text.to_string())),
    }
}

/// Emits a 6-byte MAC compare at `offset`: a word over the low four
/// bytes then a halfword over the high two.
fn emit_mac_compare(e: &mut Emitter, offset: u32, addr: &[u8; 6], jt: Target, jf: Target) {
    let low = u32::from_be_bytes([addr[2], addr[3], addr[4], addr[5]]);
    let high = u16::from_be_bytes([addr[0], addr[1]]) as u32;

    e.stmt(BPF_LD | BPF_W | BPF_ABS, offset + 2);
    e.jump(BPF_JMP | BPF_JEQ | BPF_K, low, Target::Next, jf);
    e.stmt(BPF_LD | BPF_H | BPF_ABS, offset);
    e.jump(BPF_JMP | BPF_JEQ | BPF_K, high, jt, jf);
}

fn emit_ether_addr(e: &mut Emitter, dir: Dir, addr: &[u8; 6]) {
    match dir {
        Dir::Src => emit_mac_compare(e, 6, addr, Target::Pass, Target::Fail),
        Dir::Dst => emit_mac_compare(e, 0, addr, Target::Pass, Target::Fail),
        Dir::Any => {
            let dst = e.label();
            emit_mac_compare(e, 6, addr, Target::Pass, Target::Label(dst));
            e.bind(dst);
            emit_mac_compare(e, 0, addr, Target::Pass, Target::Fail);
        }
    }
}

fn emit_ipv4_addr(e: &mut Emitter, dir: Dir, addr: u32) {
    e.stmt(BPF_LD | BPF_H | BPF_ABS, 12);
    e.jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        ETHERTYPE_IPV4,
        Target::Next,
        Target::Fail,
    );
    match dir {
        Dir::Src => {
            e.stmt(BPF_LD | BPF_W | BPF_ABS, 26);
            e.jump(BPF_JMP | BPF_JEQ | BPF_K, addr, Target::Pass, Target::Fail);
        }
        Dir::Dst => {
            e.stmt(BPF_LD | BPF_W | BPF_ABS, 30);
            e.jump(BPF_JMP | BPF_JEQ | BPF_K, addr, Target::Pass, Target::Fail);
        }
        Dir::Any => {
            e.stmt(BPF_LD | BPF_W | BPF_ABS, 26);
            e.jump(BPF_JMP | BPF_JEQ | BPF_K, addr, Target::Pass, Target::Next);
            e.stmt(BPF_LD | BPF_W | BPF_ABS, 30);
            e.jump(BPF_JMP | BPF_JEQ | BPF_K, addr, Target::Pass, Target::Fail);
        }
    }
}

/// Emits a 16-byte address compare as four word compares starting at
/// `offset`; failures go to `jf`.
fn emit_ipv6_compare(e: &mut Emitter, offset: u32, addr: &[u8; 16], jf: Target) {
    for word in 0..4u32 {
        let idx = (word * 4) as usize;
        let value =
            u32::from_be_bytes([addr[idx], addr[idx + 1], addr[idx + 2], addr[idx + 3]]);
        let jt = if word == 3 { Target::Pass } else { Target::Next };
        e.stmt(BPF_LD | BPF_W | BPF_ABS, offset + word * 4);
        e.jump(BPF_JMP | BPF_JEQ | BPF_K, value, jt, jf);
    }
}

fn emit_ipv6_addr(e: &mut Emitter, dir: Dir, addr: &[u8; 16]) {
    e.stmt(BPF_LD | BPF_H | BPF_ABS, 12);
    e.jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        ETHERTYPE_IPV6,
        Target::Next,
        Target::Fail,
    );
    match dir {
        Dir::Src => emit_ipv6_compare(e, 22, addr, Target::Fail),
        Dir::Dst => emit_ipv6_compare(e, 38, addr, Target::Fail),
        Dir::Any => {
            let dst = e.label();
            emit_ipv6_compare(e, 22, addr, Target::Label(dst));
            e.bind(dst);
            emit_ipv6_compare(e, 38, addr, Target::Fail);
        }
    }
}

/// Emits an ip-protocol chain: each listed protocol jumps to `matched`
/// when equal; a miss on the last entry goes to `on_miss`.
fn emit_proto_chain(e: &mut Emitter, protos: &[u32], matched: usize, on_miss: Target) {
    for (idx, &proto) in protos.iter().enumerate() {
        if idx + 1 == protos.len() {
            e.jump(BPF_JMP | BPF_JEQ | BPF_K, proto, Target::Next, on_miss);
        } else {
            e.jump(
                BPF_JMP | BPF_JEQ | BPF_K,
                proto,
                Target::Label(matched),
                Target::Next,
            );
        }
    }
    e.bind(matched);
}

/// Emits an ip-protocol chain whose matches PASS outright; a miss on the
/// last entry goes to `on_miss`.
fn emit_proto_pass_chain(e: &mut Emitter, protos: &[u32], on_miss: Target) {
    for (idx, &proto) in protos.iter().enumerate() {
        let jf = if idx + 1 == protos.len() {
            on_miss
        } else {
            Target::Next
        };
        e.jump(BPF_JMP | BPF_JEQ | BPF_K, proto, Target::Pass, jf);
    }
}

fn emit_ip_proto(e: &mut Emitter, protos: &[u32], v4: bool, v6: bool) {
    e.stmt(BPF_LD | BPF_H | BPF_ABS, 12);

    if v6 && v4 {
        let v4_check = e.label();
        e.jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            ETHERTYPE_IPV6,
            Target::Next,
            Target::Label(v4_check),
        );
        e.stmt(BPF_LD | BPF_B | BPF_ABS, 20);
        emit_proto_pass_chain(e, protos, Target::Fail);

        // Only reachable from the ethertype compare; A still holds it.
        e.bind(v4_check);
        e.jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            ETHERTYPE_IPV4,
            Target::Next,
            Target::Fail,
        );
        e.stmt(BPF_LD | BPF_B | BPF_ABS, 23);
        emit_proto_pass_chain(e, protos, Target::Fail);
    } else {
        let (ethertype, proto_offset) = if v4 {
            (ETHERTYPE_IPV4, 23)
        } else {
            (ETHERTYPE_IPV6, 20)
        };
        e.jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            ethertype,
            Target::Next,
            Target::Fail,
        );
        e.stmt(BPF_LD | BPF_B | BPF_ABS, proto_offset);
        emit_proto_pass_chain(e, protos, Target::Fail);
    }
}

/// Emits a port compare against the value already loaded by `load`;
/// `on_miss` is taken when this field does not match.
fn emit_port_compare(e: &mut Emitter, lo: u16, hi: u16, on_miss: Target) {
    if lo == hi {
        e.jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            lo as u32,
            Target::Pass,
            on_miss,
        );
    } else {
        e.jump(BPF_JMP | BPF_JGE | BPF_K, lo as u32, Target::Next, on_miss);
        e.jump(BPF_JMP | BPF_JGT | BPF_K, hi as u32, on_miss, Target::Pass);
    }
}

fn emit_port(e: &mut Emitter, protos: &[u32], dir: Dir, lo: u16, hi: u16) {
    // IPv6 leg: fixed 40-byte header, no extension-header walk.
    e.stmt(BPF_LD | BPF_H | BPF_ABS, 12);
    let v4_check = e.label();
    e.jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        ETHERTYPE_IPV6,
        Target::Next,
        Target::Label(v4_check),
    );
    e.stmt(BPF_LD | BPF_B | BPF_ABS, 20);
    let matched = e.label();
    emit_proto_chain(e, protos, matched, Target::Fail);
    match dir {
        Dir::Src => {
            e.stmt(BPF_LD | BPF_H | BPF_ABS, 54);
            emit_port_compare(e, lo, hi, Target::Fail);
        }
        Dir::Dst => {
            e.stmt(BPF_LD | BPF_H | BPF_ABS, 56);
            emit_port_compare(e, lo, hi, Target::Fail);
        }
        Dir::Any => {
            let dst = e.label();
            e.stmt(BPF_LD | BPF_H | BPF_ABS, 54);
            emit_port_compare(e, lo, hi, Target::Label(dst));
            e.bind(dst);
            e.stmt(BPF_LD | BPF_H | BPF_ABS, 56);
            emit_port_compare(e, lo, hi, Target::Fail);
        }
    }

    // IPv4 leg: skip fragments, index past the variable-length header.
    e.bind(v4_check);
    e.jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        ETHERTYPE_IPV4,
        Target::Next,
        Target::Fail,
    );
    e.stmt(BPF_LD | BPF_B | BPF_ABS, 23);
    let matched = e.label();
    emit_proto_chain(e, protos, matched, Target::Fail);
    e.stmt(BPF_LD | BPF_H | BPF_ABS, 20);
    e.jump(BPF_JMP | BPF_JSET | BPF_K, 0x1fff, Target::Fail, Target::Next);
    e.stmt(BPF_LDX | BPF_B | BPF_MSH, 14);
    match dir {
        Dir::Src => {
            e.stmt(BPF_LD | BPF_H | BPF_IND, 14);
            emit_port_compare(e, lo, hi, Target::Fail);
        }
        Dir::Dst => {
            e.stmt(BPF_LD | BPF_H | BPF_IND, 16);
            emit_port_compare(e, lo, hi, Target::Fail);
        }
        Dir::Any => {
            let dst = e.label();
            e.stmt(BPF_LD | BPF_H | BPF_IND, 14);
            emit_port_compare(e, lo, hi, Target::Label(dst));
            e.bind(dst);
            e.stmt(BPF_LD | BPF_H | BPF_IND, 16);
            emit_port_compare(e, lo, hi, Target::Fail);
        }
    }
}

fn emit_length(e: &mut Emitter, op: CmpOp, value: u32) {
    e.stmt(BPF_LD | BPF_W | BPF_LEN, 0);
    match op {
        CmpOp::Eq => e.jump(BPF_JMP | BPF_JEQ | BPF_K, value, Target::Pass, Target::Fail),
        CmpOp::Neq => e.jump(BPF_JMP | BPF_JEQ | BPF_K, value, Target::Fail, Target::Pass),
        CmpOp::Gt => e.jump(BPF_JMP | BPF_JGT | BPF_K, value, Target::Pass, Target::Fail),
        CmpOp::Gte => e.jump(BPF_JMP | BPF_JGE | BPF_K, value, Target::Pass, Target::Fail),
        CmpOp::Lt => e.jump(BPF_JMP | BPF_JGE | BPF_K, value, Target::Fail, Target::Pass),
        CmpOp::Lte => e.jump(BPF_JMP | BPF_JGT | BPF_K, value, Target::Fail, Target::Pass),
    }
}

/// Compiles one byte-predicate term into the caller's program.
pub(crate) fn emit_term(
    text: &str,
    insns: &mut Vec<Insn>,
    map: &mut JumpMap,
) -> Result<(), Error> {
    let term = parse_term(text)?;

    let mut e = Emitter::new(insns, map);
    match term {
        Term::EtherAddr { dir, addr } => emit_ether_addr(&mut e, dir, &addr),
        Term::Ipv4Addr { dir, addr } => emit_ipv4_addr(&mut e, dir, addr),
        Term::Ipv6Addr { dir, addr } => emit_ipv6_addr(&mut e, dir, &addr),
        Term::EtherProto(ethertype) => {
            e.stmt(BPF_LD | BPF_H | BPF_ABS, 12);
            e.jump(
                BPF_JMP | BPF_JEQ | BPF_K,
                ethertype,
                Target::Pass,
                Target::Fail,
            );
        }
        Term::IpProto { protos, v4, v6 } => emit_ip_proto(&mut e, &protos, v4, v6),
        Term::Port {
            protos,
            dir,
            lo,
            hi,
        } => emit_port(&mut e, &protos, dir, lo, hi),
        Term::Length { op, value } => emit_length(&mut e, op, value),
    }
    e.finish()
}
