//! Streaming extraction of IGMP records from a capture file.
//!
//! Every call opens the file afresh and yields records lazily in file order,
//! so extraction can be repeated on the same capture any number of times.

use std::path::Path;

use crate::error::IgmpError;
use crate::igmp::{
    self, IgmpRecord, IgmpVersion, LeaveGroup, MembershipQuery, MembershipReport, RecordKind,
};
use crate::packet::{self, LinkType};
use crate::pcap::CaptureReader;

/// Lazy sequence of records of one kind.
pub struct Records {
    reader: CaptureReader,
    kind: RecordKind,
}

impl Iterator for Records {
    type Item = Result<IgmpRecord, IgmpError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = match self.reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };

            let Some(link_type) = LinkType::from_linktype(frame.linktype) else {
                log::debug!(
                    "frame {}: unsupported link type {}",
                    frame.frame_number,
                    frame.linktype
                );
                continue;
            };
            let Some(pkt) = packet::parse_igmp_frame(&frame.data, link_type) else {
                continue;
            };
            if igmp::classify(pkt.payload) != Some(self.kind) {
                continue;
            }

            match igmp::parse_record(&pkt, frame.timestamp) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => {
                    log::debug!("frame {}: malformed IGMP message skipped", frame.frame_number);
                }
                Err(violation) => return Some(Err(violation.into())),
            }
        }
    }
}

/// Open `path` and stream the records of `kind` it contains.
pub fn extract(path: impl AsRef<Path>, kind: RecordKind) -> Result<Records, IgmpError> {
    let reader = CaptureReader::open(path)?;
    Ok(Records { reader, kind })
}

/// All membership queries, general and group-specific, in file order.
pub fn queries(path: impl AsRef<Path>) -> Result<Vec<MembershipQuery>, IgmpError> {
    let path = path.as_ref();
    let mut out: Vec<MembershipQuery> = Vec::new();
    for kind in [RecordKind::GeneralQuery, RecordKind::GroupQuery] {
        for record in extract(path, kind)? {
            if let IgmpRecord::Query(q) = record? {
                out.push(q);
            }
        }
    }
    out.sort_by_key(|q| q.timestamp);
    Ok(out)
}

/// Membership queries of one protocol version.
pub fn queries_of(
    path: impl AsRef<Path>,
    version: IgmpVersion,
) -> Result<Vec<MembershipQuery>, IgmpError> {
    Ok(queries(path)?
        .into_iter()
        .filter(|q| q.version == version)
        .collect())
}

pub fn v2_reports(path: impl AsRef<Path>) -> Result<Vec<MembershipReport>, IgmpError> {
    collect_reports(path.as_ref(), RecordKind::V2Report)
}

pub fn v3_reports(path: impl AsRef<Path>) -> Result<Vec<MembershipReport>, IgmpError> {
    collect_reports(path.as_ref(), RecordKind::V3Report)
}

pub fn leaves(path: impl AsRef<Path>) -> Result<Vec<LeaveGroup>, IgmpError> {
    let mut out = Vec::new();
    for record in extract(path, RecordKind::Leave)? {
        if let IgmpRecord::Leave(l) = record? {
            out.push(l);
        }
    }
    Ok(out)
}

fn collect_reports(path: &Path, kind: RecordKind) -> Result<Vec<MembershipReport>, IgmpError> {
    let mut out = Vec::new();
    for record in extract(path, kind)? {
        if let IgmpRecord::Report(r) = record? {
            out.push(r);
        }
    }
    Ok(out)
}
