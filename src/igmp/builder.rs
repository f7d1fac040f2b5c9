//! Construction of Ethernet-framed IGMP messages.
//!
//! Queries are what the harness transmits; reports and leaves are built for
//! replaying synthetic DUT traffic into capture files.

use std::net::Ipv4Addr;

use super::{
    ALL_HOSTS, ALL_IGMPV3_ROUTERS, ALL_ROUTERS, GroupRecord, IgmpVersion, MessageType,
};

const ETHERTYPE_IPV4: u16 = 0x0800;
const PROTO_IGMP: u8 = 2;
const IGMP_TTL: u8 = 1;
/// IP Router Alert option (RFC 2113): copied flag + option 20, length 4.
const ROUTER_ALERT: [u8; 4] = [0x94, 0x04, 0x00, 0x00];

/// Default source MAC for transmitted queries.
pub const DEFAULT_SRC_MAC: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

/// Membership query parameters.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    version: IgmpVersion,
    src_mac: [u8; 6],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    router_alert: bool,
    max_resp_code: u8,
    group: Ipv4Addr,
    sources: Vec<Ipv4Addr>,
    qrv: u8,
    qqic: u8,
}

impl QueryBuilder {
    /// A general query with a one second response time, sent from 2.0.0.1.
    pub fn new(version: IgmpVersion) -> Self {
        Self {
            version,
            src_mac: DEFAULT_SRC_MAC,
            src: Ipv4Addr::new(2, 0, 0, 1),
            dst: ALL_HOSTS,
            router_alert: true,
            max_resp_code: 10,
            group: Ipv4Addr::UNSPECIFIED,
            sources: Vec::new(),
            qrv: 2,
            qqic: 125,
        }
    }

    pub fn src_mac(mut self, mac: [u8; 6]) -> Self {
        self.src_mac = mac;
        self
    }

    pub fn source(mut self, src: Ipv4Addr) -> Self {
        self.src = src;
        self
    }

    pub fn destination(mut self, dst: Ipv4Addr) -> Self {
        self.dst = dst;
        self
    }

    pub fn router_alert(mut self, enabled: bool) -> Self {
        self.router_alert = enabled;
        self
    }

    pub fn max_resp_code(mut self, code: u8) -> Self {
        self.max_resp_code = code;
        self
    }

    /// Set the advertised response time, encoded for the query's version.
    pub fn max_response_deciseconds(mut self, deciseconds: u32) -> Self {
        self.max_resp_code = super::decode::encode(deciseconds, self.version);
        self
    }

    pub fn group(mut self, group: Ipv4Addr) -> Self {
        self.group = group;
        self
    }

    /// v3 only: make this a group-and-source-specific query.
    pub fn sources(mut self, sources: Vec<Ipv4Addr>) -> Self {
        self.sources = sources;
        self
    }

    pub fn version(&self) -> IgmpVersion {
        self.version
    }

    pub fn max_resp_code_value(&self) -> u8 {
        self.max_resp_code
    }

    /// The IGMP message alone, checksum included.
    pub fn payload(&self) -> Vec<u8> {
        let mut igmp = vec![MessageType::MembershipQuery as u8, self.max_resp_code, 0, 0];
        igmp.extend_from_slice(&self.group.octets());
        if self.version == IgmpVersion::V3 {
            igmp.push(self.qrv & 0x07);
            igmp.push(self.qqic);
            igmp.extend_from_slice(&(self.sources.len() as u16).to_be_bytes());
            for src in &self.sources {
                igmp.extend_from_slice(&src.octets());
            }
        }
        fill_checksum(&mut igmp, 2);
        igmp
    }

    /// The full Ethernet frame.
    pub fn build(&self) -> Vec<u8> {
        ethernet_frame(
            self.src_mac,
            self.src,
            self.dst,
            self.router_alert,
            &self.payload(),
        )
    }
}

/// IGMPv2 membership report for `group`, addressed to the group.
pub fn v2_report(src_mac: [u8; 6], src: Ipv4Addr, group: Ipv4Addr) -> Vec<u8> {
    let mut igmp = vec![MessageType::V2MembershipReport as u8, 0, 0, 0];
    igmp.extend_from_slice(&group.octets());
    fill_checksum(&mut igmp, 2);
    ethernet_frame(src_mac, src, group, true, &igmp)
}

/// IGMPv2 leave for `group`, addressed to all routers.
pub fn leave(src_mac: [u8; 6], src: Ipv4Addr, group: Ipv4Addr) -> Vec<u8> {
    let mut igmp = vec![MessageType::LeaveGroup as u8, 0, 0, 0];
    igmp.extend_from_slice(&group.octets());
    fill_checksum(&mut igmp, 2);
    ethernet_frame(src_mac, src, ALL_ROUTERS, true, &igmp)
}

/// IGMPv3 membership report carrying `records`, addressed to 224.0.0.22.
pub fn v3_report(src_mac: [u8; 6], src: Ipv4Addr, records: &[GroupRecord]) -> Vec<u8> {
    v3_report_to(src_mac, src, ALL_IGMPV3_ROUTERS, records)
}

/// IGMPv3 membership report with an explicit destination address.
pub fn v3_report_to(
    src_mac: [u8; 6],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    records: &[GroupRecord],
) -> Vec<u8> {
    let mut igmp = vec![MessageType::V3MembershipReport as u8, 0, 0, 0, 0, 0];
    igmp.extend_from_slice(&(records.len() as u16).to_be_bytes());
    for record in records {
        igmp.push(record.record_type.as_u8());
        igmp.push(0);
        igmp.extend_from_slice(&(record.sources.len() as u16).to_be_bytes());
        igmp.extend_from_slice(&record.multicast.octets());
        for s in &record.sources {
            igmp.extend_from_slice(&s.octets());
        }
    }
    fill_checksum(&mut igmp, 2);
    ethernet_frame(src_mac, src, dst, true, &igmp)
}

/// Ethernet multicast MAC for an IPv4 group (RFC 1112 §6.4).
pub fn multicast_mac(group: Ipv4Addr) -> [u8; 6] {
    let o = group.octets();
    [0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]]
}

/// Wrap an IGMP payload in IPv4 (TTL 1) and Ethernet headers.
pub fn ethernet_frame(
    src_mac: [u8; 6],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    router_alert: bool,
    igmp: &[u8],
) -> Vec<u8> {
    let options: &[u8] = if router_alert { &ROUTER_ALERT } else { &[] };
    let ihl = 20 + options.len();
    let total_len = (ihl + igmp.len()) as u16;

    let mut frame = Vec::with_capacity(14 + total_len as usize);
    frame.extend_from_slice(&multicast_mac(dst));
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip_start = frame.len();
    frame.push(0x40 | (ihl / 4) as u8);
    frame.push(0xc0); // DSCP CS6, as queriers send it
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]); // id, flags, fragment offset
    frame.push(IGMP_TTL);
    frame.push(PROTO_IGMP);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&dst.octets());
    frame.extend_from_slice(options);
    let ip_end = frame.len();
    fill_checksum(&mut frame[ip_start..ip_end], 10);

    frame.extend_from_slice(igmp);
    frame
}

/// RFC 1071 Internet checksum.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn fill_checksum(data: &mut [u8], offset: usize) {
    data[offset] = 0;
    data[offset + 1] = 0;
    let sum = internet_checksum(data);
    data[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
}
