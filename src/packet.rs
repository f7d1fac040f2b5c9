// Link-layer and IPv4 parsing down to the IGMP payload.
//
// Used both by the capture worker (stop predicates) and by the extractor when
// reading capture files back. Only IPv4 carrying IGMP is of interest; anything
// else is rejected early with `None`.

use std::net::Ipv4Addr;

use crate::igmp::IgmpPacket;

// ---------------------------------------------------------------------------
// Data link type
// ---------------------------------------------------------------------------

/// Link-layer framing of a capture source or capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet (LINKTYPE_ETHERNET = 1): 14-byte header, EtherType at offset 12.
    Ethernet,
    /// Raw IP (LINKTYPE_RAW = 101, or DLT_RAW = 12): IP starts at offset 0.
    Raw,
    /// BSD loopback (LINKTYPE_NULL = 0): 4-byte AF header in host byte order.
    Null,
    /// Linux cooked capture v1 (LINKTYPE_LINUX_SLL = 113): 16-byte header.
    LinuxSll,
}

impl LinkType {
    /// Map a pcap link-type number to a supported framing.
    pub fn from_linktype(value: i32) -> Option<Self> {
        match value {
            1 => Some(LinkType::Ethernet),
            12 | 101 => Some(LinkType::Raw),
            0 => Some(LinkType::Null),
            113 => Some(LinkType::LinuxSll),
            _ => None,
        }
    }

    /// The pcap link-type number written into capture file headers.
    pub fn linktype(self) -> u32 {
        match self {
            LinkType::Ethernet => 1,
            LinkType::Raw => 101,
            LinkType::Null => 0,
            LinkType::LinuxSll => 113,
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

// Ethernet
const ETH_HLEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const VLAN_TAG_LEN: usize = 4;

// Linux SLL
const SLL_HLEN: usize = 16;
const SLL_PROTO_OFFSET: usize = 14;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_TOTAL_LEN_OFFSET: usize = 2;
const IPV4_FLAGS_FRAG_OFFSET: usize = 6;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;

const PROTO_IGMP: u8 = 2;

// IPv4 options
const IPOPT_END: u8 = 0;
const IPOPT_NOOP: u8 = 1;
const IPOPT_ROUTER_ALERT: u8 = 0x94;

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

/// Parse a captured frame down to its IGMP payload.
///
/// Returns `None` if the frame is:
/// - Too short (truncated at any layer)
/// - Not IPv4
/// - A non-first IPv4 fragment
/// - Not carrying IGMP
pub fn parse_igmp_frame(data: &[u8], link_type: LinkType) -> Option<IgmpPacket<'_>> {
    let l3 = match link_type {
        LinkType::Ethernet => strip_ethernet(data)?,
        LinkType::Raw => data,
        LinkType::Null => strip_null(data)?,
        LinkType::LinuxSll => strip_sll(data)?,
    };
    parse_ipv4_igmp(l3)
}

/// Strip an Ethernet header (and one or more 802.1Q tags) off a frame.
fn strip_ethernet(data: &[u8]) -> Option<&[u8]> {
    if data.len() < ETH_HLEN {
        return None;
    }
    let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
    let mut offset = ETH_HLEN;
    while ethertype == ETHERTYPE_VLAN {
        if data.len() < offset + VLAN_TAG_LEN {
            return None;
        }
        ethertype = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
        offset += VLAN_TAG_LEN;
    }
    (ethertype == ETHERTYPE_IPV4).then(|| &data[offset..])
}

fn strip_null(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 4 {
        return None;
    }
    let af = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
    (af == libc::AF_INET as u32).then(|| &data[4..])
}

fn strip_sll(data: &[u8]) -> Option<&[u8]> {
    if data.len() < SLL_HLEN {
        return None;
    }
    let proto = u16::from_be_bytes([data[SLL_PROTO_OFFSET], data[SLL_PROTO_OFFSET + 1]]);
    (proto == ETHERTYPE_IPV4).then(|| &data[SLL_HLEN..])
}

/// Parse an IPv4 header and return the IGMP payload it carries.
fn parse_ipv4_igmp(data: &[u8]) -> Option<IgmpPacket<'_>> {
    if data.len() < IPV4_MIN_HLEN || data[0] >> 4 != 4 {
        return None;
    }

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_MIN_HLEN || data.len() < ihl {
        return None;
    }

    if data[IPV4_PROTO_OFFSET] != PROTO_IGMP {
        return None;
    }

    let flags_frag = u16::from_be_bytes([
        data[IPV4_FLAGS_FRAG_OFFSET],
        data[IPV4_FLAGS_FRAG_OFFSET + 1],
    ]);
    if (flags_frag & 0x1FFF) != 0 {
        // Non-first fragment.
        return None;
    }

    // Ethernet padding may follow the datagram; trust the IP total length
    // when it is consistent with what was captured.
    let total_len =
        u16::from_be_bytes([data[IPV4_TOTAL_LEN_OFFSET], data[IPV4_TOTAL_LEN_OFFSET + 1]])
            as usize;
    let end = if total_len >= ihl && total_len <= data.len() {
        total_len
    } else {
        data.len()
    };

    let src = read_ipv4(data, IPV4_SRC_OFFSET);
    let dst = read_ipv4(data, IPV4_DST_OFFSET);
    let router_alert = has_router_alert(&data[IPV4_MIN_HLEN..ihl]);

    Some(IgmpPacket {
        src,
        dst,
        router_alert,
        payload: &data[ihl..end],
    })
}

/// Scan IPv4 options for Router Alert (RFC 2113).
fn has_router_alert(options: &[u8]) -> bool {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            IPOPT_END => return false,
            IPOPT_NOOP => i += 1,
            kind => {
                if kind == IPOPT_ROUTER_ALERT {
                    return true;
                }
                let Some(&len) = options.get(i + 1) else {
                    return false;
                };
                if len < 2 {
                    return false;
                }
                i += len as usize;
            }
        }
    }
    false
}

fn read_ipv4(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

// ===========================================================================
// Unit tests
// ===========================================================================
