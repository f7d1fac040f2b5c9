//! IGMP message model and payload parsing.
//!
//! Covers the messages a multicast receiver exchanges with a querier:
//! membership queries (v2 and v3 layouts), v2 and v3 membership reports and
//! v2 leave messages. Link and network layers are handled by
//! [`crate::packet`]; this module starts at the first IGMP byte.

pub mod builder;
pub mod decode;

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::StructuralViolation;

/// Microseconds since the Unix epoch, as stored in capture files.
pub type Timestamp = u64;

/// Seconds elapsed from `from` to `to` (negative if `to` is earlier).
pub fn seconds_between(from: Timestamp, to: Timestamp) -> f64 {
    (to as f64 - from as f64) / 1_000_000.0
}

/// All-systems group, destination of general queries.
pub const ALL_HOSTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
/// All-routers group, destination of v2 leave messages.
pub const ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);
/// All-IGMPv3-capable-routers group, destination of v3 reports.
pub const ALL_IGMPV3_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

const V2_MESSAGE_LEN: usize = 8;
const V3_QUERY_MIN_LEN: usize = 12;
const V3_REPORT_HLEN: usize = 8;
const GROUP_RECORD_HLEN: usize = 8;

/// IGMP protocol version under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum IgmpVersion {
    V2,
    V3,
}

impl fmt::Display for IgmpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgmpVersion::V2 => f.write_str("IGMPv2"),
            IgmpVersion::V3 => f.write_str("IGMPv3"),
        }
    }
}

/// IGMP message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    MembershipQuery = 0x11,
    V1MembershipReport = 0x12,
    V2MembershipReport = 0x16,
    LeaveGroup = 0x17,
    V3MembershipReport = 0x22,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x11 => Some(MessageType::MembershipQuery),
            0x12 => Some(MessageType::V1MembershipReport),
            0x16 => Some(MessageType::V2MembershipReport),
            0x17 => Some(MessageType::LeaveGroup),
            0x22 => Some(MessageType::V3MembershipReport),
            _ => None,
        }
    }
}

/// IGMPv3 group record type (RFC 3376 §4.2.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    ModeIsInclude,
    ModeIsExclude,
    ChangeToInclude,
    ChangeToExclude,
    AllowNewSources,
    BlockOldSources,
    Unknown(u8),
}

impl RecordType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => RecordType::ModeIsInclude,
            2 => RecordType::ModeIsExclude,
            3 => RecordType::ChangeToInclude,
            4 => RecordType::ChangeToExclude,
            5 => RecordType::AllowNewSources,
            6 => RecordType::BlockOldSources,
            other => RecordType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RecordType::ModeIsInclude => 1,
            RecordType::ModeIsExclude => 2,
            RecordType::ChangeToInclude => 3,
            RecordType::ChangeToExclude => 4,
            RecordType::AllowNewSources => 5,
            RecordType::BlockOldSources => 6,
            RecordType::Unknown(v) => v,
        }
    }
}

/// One group record of an IGMPv3 membership report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub record_type: RecordType,
    pub multicast: Ipv4Addr,
    pub sources: Vec<Ipv4Addr>,
}

/// A captured membership query.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipQuery {
    pub version: IgmpVersion,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Group address field; unspecified for a general query.
    pub group: Ipv4Addr,
    pub max_resp_code: u8,
    pub router_alert: bool,
    /// v3 only: Suppress Router-Side Processing flag.
    pub suppress_router_processing: bool,
    /// v3 only: Querier's Robustness Variable.
    pub qrv: u8,
    /// v3 only: Querier's Query Interval Code.
    pub qqic: u8,
    /// v3 only: source addresses of a group-and-source-specific query.
    pub sources: Vec<Ipv4Addr>,
    pub timestamp: Timestamp,
}

impl MembershipQuery {
    pub fn is_general(&self) -> bool {
        self.group.is_unspecified()
    }

    /// The queried group, or `None` for a general query.
    pub fn queried_group(&self) -> Option<Ipv4Addr> {
        (!self.is_general()).then_some(self.group)
    }

    pub fn max_response_secs(&self) -> f64 {
        decode::max_response_secs(self.max_resp_code, self.version)
    }
}

/// Payload of a membership report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportBody {
    /// v2: one group per message.
    Group(Ipv4Addr),
    /// v3: any number of group records.
    Records(Vec<GroupRecord>),
}

/// A captured membership report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipReport {
    pub version: IgmpVersion,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub body: ReportBody,
    pub timestamp: Timestamp,
}

impl MembershipReport {
    /// Group address of a v2 report.
    pub fn group(&self) -> Option<Ipv4Addr> {
        match &self.body {
            ReportBody::Group(g) => Some(*g),
            ReportBody::Records(_) => None,
        }
    }

    /// Group records of a v3 report (empty for v2).
    pub fn records(&self) -> &[GroupRecord] {
        match &self.body {
            ReportBody::Group(_) => &[],
            ReportBody::Records(r) => r,
        }
    }

    /// Whether the report announces membership of `group`.
    pub fn announces(&self, group: Ipv4Addr) -> bool {
        match &self.body {
            ReportBody::Group(g) => *g == group,
            ReportBody::Records(records) => records.iter().any(|r| r.multicast == group),
        }
    }
}

/// A captured v2 leave message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveGroup {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub group: Ipv4Addr,
    pub timestamp: Timestamp,
}

/// Kind of record an extraction asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    GeneralQuery,
    GroupQuery,
    V2Report,
    V3Report,
    Leave,
}

/// A decoded IGMP record.
#[derive(Debug, Clone, PartialEq)]
pub enum IgmpRecord {
    Query(MembershipQuery),
    Report(MembershipReport),
    Leave(LeaveGroup),
}

/// IGMP payload together with the IPv4 fields the records need.
#[derive(Debug, Clone, Copy)]
pub struct IgmpPacket<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub router_alert: bool,
    pub payload: &'a [u8],
}

/// Cheap classification of an IGMP payload, without validating its body.
pub fn classify(payload: &[u8]) -> Option<RecordKind> {
    if payload.len() < V2_MESSAGE_LEN {
        return None;
    }
    match MessageType::from_u8(payload[0])? {
        MessageType::MembershipQuery => {
            if read_addr(payload, 4).is_unspecified() {
                Some(RecordKind::GeneralQuery)
            } else {
                Some(RecordKind::GroupQuery)
            }
        }
        MessageType::V2MembershipReport => Some(RecordKind::V2Report),
        MessageType::V3MembershipReport => Some(RecordKind::V3Report),
        MessageType::LeaveGroup => Some(RecordKind::Leave),
        MessageType::V1MembershipReport => None,
    }
}

/// Fully decode an IGMP payload.
///
/// Returns `Ok(None)` for unknown or truncated messages. A v3 message whose
/// reserved bits are set is reported as a [`StructuralViolation`].
pub fn parse_record(
    pkt: &IgmpPacket<'_>,
    timestamp: Timestamp,
) -> Result<Option<IgmpRecord>, StructuralViolation> {
    let data = pkt.payload;
    if data.len() < V2_MESSAGE_LEN {
        return Ok(None);
    }
    let Some(msg_type) = MessageType::from_u8(data[0]) else {
        return Ok(None);
    };

    let record = match msg_type {
        MessageType::MembershipQuery => parse_query(pkt, timestamp)?.map(IgmpRecord::Query),
        MessageType::V2MembershipReport => Some(IgmpRecord::Report(MembershipReport {
            version: IgmpVersion::V2,
            src: pkt.src,
            dst: pkt.dst,
            body: ReportBody::Group(read_addr(data, 4)),
            timestamp,
        })),
        MessageType::V3MembershipReport => parse_v3_report(pkt, timestamp)?.map(IgmpRecord::Report),
        MessageType::LeaveGroup => Some(IgmpRecord::Leave(LeaveGroup {
            src: pkt.src,
            dst: pkt.dst,
            group: read_addr(data, 4),
            timestamp,
        })),
        MessageType::V1MembershipReport => None,
    };
    Ok(record)
}

fn parse_query(
    pkt: &IgmpPacket<'_>,
    timestamp: Timestamp,
) -> Result<Option<MembershipQuery>, StructuralViolation> {
    let data = pkt.payload;
    let mut query = MembershipQuery {
        version: IgmpVersion::V2,
        src: pkt.src,
        dst: pkt.dst,
        group: read_addr(data, 4),
        max_resp_code: data[1],
        router_alert: pkt.router_alert,
        suppress_router_processing: false,
        qrv: 0,
        qqic: 0,
        sources: Vec::new(),
        timestamp,
    };

    // RFC 3376 §7.1: a query of 12 octets or more is a v3 query.
    if data.len() >= V3_QUERY_MIN_LEN {
        let flags = data[8];
        let reserved = flags >> 4;
        if reserved != 0 {
            return Err(StructuralViolation::ReservedFieldSet {
                src: pkt.src,
                message: "membership query",
                value: u32::from(reserved),
            });
        }
        let num_sources = u16::from_be_bytes([data[10], data[11]]) as usize;
        if data.len() < V3_QUERY_MIN_LEN + num_sources * 4 {
            log::debug!("truncated v3 query from {}: {} sources", pkt.src, num_sources);
            return Ok(None);
        }
        query.version = IgmpVersion::V3;
        query.suppress_router_processing = flags & 0x08 != 0;
        query.qrv = flags & 0x07;
        query.qqic = data[9];
        query.sources = (0..num_sources)
            .map(|i| read_addr(data, V3_QUERY_MIN_LEN + i * 4))
            .collect();
    }

    Ok(Some(query))
}

fn parse_v3_report(
    pkt: &IgmpPacket<'_>,
    timestamp: Timestamp,
) -> Result<Option<MembershipReport>, StructuralViolation> {
    let data = pkt.payload;
    let reserved = (u32::from(data[1]) << 16) | u32::from(u16::from_be_bytes([data[4], data[5]]));
    if reserved != 0 {
        return Err(StructuralViolation::ReservedFieldSet {
            src: pkt.src,
            message: "membership report",
            value: reserved,
        });
    }

    let num_records = u16::from_be_bytes([data[6], data[7]]) as usize;
    let mut records = Vec::with_capacity(num_records);
    let mut offset = V3_REPORT_HLEN;
    for _ in 0..num_records {
        if data.len() < offset + GROUP_RECORD_HLEN {
            log::debug!("truncated v3 report from {}", pkt.src);
            return Ok(None);
        }
        let record_type = RecordType::from_u8(data[offset]);
        let aux_words = data[offset + 1] as usize;
        let num_sources = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let multicast = read_addr(data, offset + 4);
        let sources_start = offset + GROUP_RECORD_HLEN;
        let record_end = sources_start + num_sources * 4 + aux_words * 4;
        if data.len() < record_end {
            log::debug!("truncated group record in v3 report from {}", pkt.src);
            return Ok(None);
        }
        let sources = (0..num_sources)
            .map(|i| read_addr(data, sources_start + i * 4))
            .collect();
        records.push(GroupRecord {
            record_type,
            multicast,
            sources,
        });
        offset = record_end;
    }

    Ok(Some(MembershipReport {
        version: IgmpVersion::V3,
        src: pkt.src,
        dst: pkt.dst,
        body: ReportBody::Records(records),
        timestamp,
    }))
}

fn read_addr(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}
