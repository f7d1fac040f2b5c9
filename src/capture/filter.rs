// Capture filter expressions compiled to classic BPF.
//
// Supports the subset of tcpdump syntax the harness needs, for Ethernet
// framing only:
//
//   igmp | ip | ip proto <num|name> | ether proto <num|name>
//   host A | src [host] A | dst [host] A
//
// joined by `and` / `&&`. Anything else is rejected with InvalidFilter.

use std::net::Ipv4Addr;

use crate::error::IgmpError;

// BPF opcodes (identical layout on Linux and the BSDs)
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_RET: u16 = 0x06;
const BPF_K: u16 = 0x00;

const ETHERTYPE_OFFSET: u32 = 12;
const IP_PROTO_OFFSET: u32 = 14 + 9;
const IP_SRC_OFFSET: u32 = 14 + 12;
const IP_DST_OFFSET: u32 = 14 + 16;

const ETHERTYPE_IPV4: u32 = 0x0800;

/// Snapshot length returned for accepted packets.
const ACCEPT: u32 = 0x40000;

/// One classic BPF instruction, laid out like the kernel's `sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> BpfInsn {
    BpfInsn { code, jt, jf, k }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Primitive {
    EtherProto(u16),
    IpProto(u8),
    Host(Ipv4Addr),
    SrcHost(Ipv4Addr),
    DstHost(Ipv4Addr),
}

/// Compile a filter expression. An empty expression accepts everything.
pub fn compile(expr: &str) -> Result<Vec<BpfInsn>, IgmpError> {
    let primitives = parse(expr).map_err(|reason| IgmpError::InvalidFilter {
        expr: expr.to_string(),
        reason,
    })?;
    emit(&primitives).map_err(|reason| IgmpError::InvalidFilter {
        expr: expr.to_string(),
        reason,
    })
}

fn parse(expr: &str) -> Result<Vec<Primitive>, String> {
    let tokens: Vec<&str> = expr.split_whitespace().collect();
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < tokens.len() {
        if !out.is_empty() {
            match tokens[pos] {
                "and" | "&&" => pos += 1,
                other => return Err(format!("expected 'and', found '{other}'")),
            }
            if pos == tokens.len() {
                return Err("expression ends with 'and'".to_string());
            }
        }
        let (primitives, used) = parse_primitive(&tokens[pos..])?;
        out.extend(primitives);
        pos += used;
    }
    Ok(out)
}

/// Parse one primitive at the head of `tokens`, returning the checks it
/// expands to and the number of tokens consumed.
fn parse_primitive(tokens: &[&str]) -> Result<(Vec<Primitive>, usize), String> {
    let ip = Primitive::EtherProto(ETHERTYPE_IPV4 as u16);
    match tokens {
        ["ip", "proto", value, ..] => {
            let proto = ip_proto(value)?;
            Ok((vec![ip, Primitive::IpProto(proto)], 3))
        }
        ["ether", "proto", value, ..] => Ok((vec![Primitive::EtherProto(ether_proto(value)?)], 3)),
        ["igmp", ..] => Ok((vec![ip, Primitive::IpProto(2)], 1)),
        ["ip", ..] => Ok((vec![ip], 1)),
        ["host", addr, ..] => Ok((vec![ip, Primitive::Host(address(addr)?)], 2)),
        ["src", "host", addr, ..] => Ok((vec![ip, Primitive::SrcHost(address(addr)?)], 3)),
        ["dst", "host", addr, ..] => Ok((vec![ip, Primitive::DstHost(address(addr)?)], 3)),
        ["src", addr, ..] => Ok((vec![ip, Primitive::SrcHost(address(addr)?)], 2)),
        ["dst", addr, ..] => Ok((vec![ip, Primitive::DstHost(address(addr)?)], 2)),
        [op @ ("or" | "||" | "not" | "!"), ..] => Err(format!("operator '{op}' is not supported")),
        [other, ..] => Err(format!("unsupported or incomplete primitive '{other}'")),
        [] => Err("missing primitive".to_string()),
    }
}

fn number(value: &str) -> Option<u32> {
    match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn ip_proto(value: &str) -> Result<u8, String> {
    let proto = match value {
        "icmp" => 1,
        "igmp" => 2,
        "tcp" => 6,
        "udp" => 17,
        _ => number(value)
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| format!("bad IP protocol '{value}'"))?,
    };
    Ok(proto)
}

fn ether_proto(value: &str) -> Result<u16, String> {
    let proto = match value {
        "ip" => 0x0800,
        "arp" => 0x0806,
        "ip6" => 0x86dd,
        _ => number(value)
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| format!("bad ethertype '{value}'"))?,
    };
    Ok(proto)
}

fn address(value: &str) -> Result<Ipv4Addr, String> {
    value
        .parse()
        .map_err(|_| format!("'{value}' is not an IPv4 address"))
}

/// Emit a program that accepts only when every primitive matches.
///
/// Failed comparisons jump straight to the trailing reject instruction;
/// their `jf` fields are patched once the program length is known.
fn emit(primitives: &[Primitive]) -> Result<Vec<BpfInsn>, String> {
    let mut prog = Vec::new();
    let mut to_reject = Vec::new();
    let mut loaded_ethertype = None;

    for primitive in primitives {
        match *primitive {
            Primitive::EtherProto(proto) => {
                // `ip` is implied by most primitives; skip repeated checks.
                if loaded_ethertype == Some(proto) {
                    continue;
                }
                prog.push(insn(BPF_LD | BPF_H | BPF_ABS, 0, 0, ETHERTYPE_OFFSET));
                to_reject.push(prog.len());
                prog.push(insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, proto as u32));
                loaded_ethertype = Some(proto);
            }
            Primitive::IpProto(proto) => {
                prog.push(insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, IP_PROTO_OFFSET));
                to_reject.push(prog.len());
                prog.push(insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, proto as u32));
            }
            Primitive::SrcHost(addr) => {
                prog.push(insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, IP_SRC_OFFSET));
                to_reject.push(prog.len());
                prog.push(insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, u32::from(addr)));
            }
            Primitive::DstHost(addr) => {
                prog.push(insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, IP_DST_OFFSET));
                to_reject.push(prog.len());
                prog.push(insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, u32::from(addr)));
            }
            Primitive::Host(addr) => {
                // Source match skips the destination comparison.
                prog.push(insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, IP_SRC_OFFSET));
                prog.push(insn(BPF_JMP | BPF_JEQ | BPF_K, 2, 0, u32::from(addr)));
                prog.push(insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, IP_DST_OFFSET));
                to_reject.push(prog.len());
                prog.push(insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 0, u32::from(addr)));
            }
        }
    }

    prog.push(insn(BPF_RET | BPF_K, 0, 0, ACCEPT));
    let reject = prog.len();
    prog.push(insn(BPF_RET | BPF_K, 0, 0, 0));

    for idx in to_reject {
        let offset = reject - idx - 1;
        prog[idx].jf = u8::try_from(offset).map_err(|_| "expression is too long".to_string())?;
    }
    Ok(prog)
}
