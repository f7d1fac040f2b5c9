//! Capture file reader over `pcap_parser`, for legacy pcap and pcapng.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};

use crate::error::IgmpError;
use crate::igmp::Timestamp;

/// Buffer size for pcap_parser readers (256KB). Must hold the largest
/// record the writer produces: a 16-byte header plus `SNAPLEN` bytes.
const BUFFER_SIZE: usize = 262144;

/// One captured frame, copied out of the parser buffer.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// 1-based position in the file.
    pub frame_number: u64,
    pub timestamp: Timestamp,
    /// pcap link-type number of the interface the frame was captured on.
    pub linktype: i32,
    pub data: Vec<u8>,
}

enum ReaderInner {
    Legacy(LegacyPcapReader<BufReader<File>>),
    Ng(PcapNGReader<BufReader<File>>),
}

/// Sequential reader for one capture file.
pub struct CaptureReader {
    path: PathBuf,
    inner: ReaderInner,
    frame_number: u64,
    linktype: i32,
    nanosecond: bool,
    // pcapng: per-interface link type and timestamp resolution (units per second).
    interfaces: Vec<(i32, u64)>,
    finished: bool,
}

impl CaptureReader {
    /// Open a capture file, detecting the format from its magic number.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IgmpError> {
        let path = path.as_ref();
        let unreadable = |reason: String| IgmpError::CaptureUnreadable {
            path: path.display().to_string(),
            reason,
        };

        let mut file = File::open(path).map_err(|e| unreadable(e.to_string()))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| unreadable("file too short for a capture header".to_string()))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| unreadable(e.to_string()))?;

        let source = BufReader::new(file);
        let inner = match u32::from_le_bytes(magic) {
            0xa1b2c3d4 | 0xd4c3b2a1 | 0xa1b23c4d | 0x4d3cb2a1 => {
                let reader = LegacyPcapReader::new(BUFFER_SIZE, source)
                    .map_err(|e| unreadable(format!("invalid pcap header: {e}")))?;
                ReaderInner::Legacy(reader)
            }
            0x0a0d0d0a => {
                let reader = PcapNGReader::new(BUFFER_SIZE, source)
                    .map_err(|e| unreadable(format!("invalid pcapng header: {e}")))?;
                ReaderInner::Ng(reader)
            }
            other => return Err(unreadable(format!("unknown capture magic 0x{other:08x}"))),
        };

        Ok(Self {
            path: path.to_path_buf(),
            inner,
            frame_number: 0,
            linktype: 1,
            nanosecond: false,
            interfaces: Vec::new(),
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next frame. Returns `Ok(None)` at end of file.
    pub fn next_frame(&mut self) -> Result<Option<CapturedFrame>, IgmpError> {
        if self.finished {
            return Ok(None);
        }
        let result = match &mut self.inner {
            ReaderInner::Legacy(reader) => next_legacy(
                reader,
                &mut self.frame_number,
                &mut self.linktype,
                &mut self.nanosecond,
            ),
            ReaderInner::Ng(reader) => {
                next_ng(reader, &mut self.frame_number, &mut self.interfaces)
            }
        };
        match result {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(reason) => {
                self.finished = true;
                Err(IgmpError::CaptureUnreadable {
                    path: self.path.display().to_string(),
                    reason,
                })
            }
        }
    }
}

impl Iterator for CaptureReader {
    type Item = Result<CapturedFrame, IgmpError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

fn next_legacy(
    reader: &mut LegacyPcapReader<BufReader<File>>,
    frame_number: &mut u64,
    linktype: &mut i32,
    nanosecond: &mut bool,
) -> Result<Option<CapturedFrame>, String> {
    let mut stalled = false;
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                stalled = false;
                let frame = match block {
                    PcapBlockOwned::LegacyHeader(header) => {
                        *linktype = header.network.0;
                        *nanosecond = header.is_nanosecond_precision();
                        None
                    }
                    PcapBlockOwned::Legacy(packet) => {
                        *frame_number += 1;
                        let sub = if *nanosecond {
                            u64::from(packet.ts_usec) / 1000
                        } else {
                            u64::from(packet.ts_usec)
                        };
                        Some(CapturedFrame {
                            frame_number: *frame_number,
                            timestamp: u64::from(packet.ts_sec) * 1_000_000 + sub,
                            linktype: *linktype,
                            data: packet.data.to_vec(),
                        })
                    }
                    PcapBlockOwned::NG(_) => None,
                };
                reader.consume(offset);
                if frame.is_some() {
                    return Ok(frame);
                }
            }
            Err(PcapError::Eof) => return Ok(None),
            Err(PcapError::Incomplete(_)) => {
                if stalled {
                    return Err("truncated capture record".to_string());
                }
                stalled = true;
                reader
                    .refill()
                    .map_err(|e| format!("pcap refill error: {e}"))?;
            }
            Err(e) => return Err(format!("pcap parse error: {e}")),
        }
    }
}

fn next_ng(
    reader: &mut PcapNGReader<BufReader<File>>,
    frame_number: &mut u64,
    interfaces: &mut Vec<(i32, u64)>,
) -> Result<Option<CapturedFrame>, String> {
    use pcap_parser::pcapng::Block;

    let mut stalled = false;
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                stalled = false;
                let frame = match block {
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        interfaces.clear();
                        None
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        let resolution = tsresol_units(idb.if_tsresol);
                        interfaces.push((idb.linktype.0, resolution));
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        *frame_number += 1;
                        let (linktype, resolution) = interfaces
                            .get(epb.if_id as usize)
                            .copied()
                            .unwrap_or((1, 1_000_000));
                        let units = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
                        let caplen = (epb.caplen as usize).min(epb.data.len());
                        Some(CapturedFrame {
                            frame_number: *frame_number,
                            timestamp: scale_to_micros(units, resolution),
                            linktype,
                            data: epb.data[..caplen].to_vec(),
                        })
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        *frame_number += 1;
                        let linktype = interfaces.first().map(|i| i.0).unwrap_or(1);
                        Some(CapturedFrame {
                            frame_number: *frame_number,
                            timestamp: 0,
                            linktype,
                            data: spb.data.to_vec(),
                        })
                    }
                    _ => None,
                };
                reader.consume(offset);
                if frame.is_some() {
                    return Ok(frame);
                }
            }
            Err(PcapError::Eof) => return Ok(None),
            Err(PcapError::Incomplete(_)) => {
                if stalled {
                    return Err("truncated pcapng block".to_string());
                }
                stalled = true;
                reader
                    .refill()
                    .map_err(|e| format!("pcapng refill error: {e}"))?;
            }
            Err(e) => return Err(format!("pcapng parse error: {e}")),
        }
    }
}

/// Decode an `if_tsresol` option value into timestamp units per second.
fn tsresol_units(tsresol: u8) -> u64 {
    let exp = u32::from(tsresol & 0x7f);
    let units = if tsresol & 0x80 != 0 {
        1u64.checked_shl(exp)
    } else {
        10u64.checked_pow(exp)
    };
    units.unwrap_or(1_000_000)
}

fn scale_to_micros(units: u64, resolution: u64) -> u64 {
    match resolution {
        0 | 1_000_000 => units,
        r if r > 1_000_000 => units / (r / 1_000_000),
        r => units.saturating_mul(1_000_000 / r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_unreadable() {
        let err = CaptureReader::open("/nonexistent/dir/capture.pcap").err().unwrap();
        assert!(matches!(err, IgmpError::CaptureUnreadable { .. }));
    }

    #[test]
    fn garbage_file_is_unreadable() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"this is not a capture file").unwrap();
        let err = CaptureReader::open(f.path()).err().unwrap();
        assert!(matches!(err, IgmpError::CaptureUnreadable { .. }));
    }

    #[test]
    fn empty_file_is_unreadable() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(CaptureReader::open(f.path()).is_err());
    }

    #[test]
    fn tsresol_decoding() {
        assert_eq!(tsresol_units(6), 1_000_000);
        assert_eq!(tsresol_units(9), 1_000_000_000);
        assert_eq!(tsresol_units(0x80 | 10), 1024);
    }

    #[test]
    fn resolution_scaling() {
        assert_eq!(scale_to_micros(1_500_000, 1_000_000), 1_500_000);
        assert_eq!(scale_to_micros(1_500_000_000, 1_000_000_000), 1_500_000);
        assert_eq!(scale_to_micros(15, 1_000), 15_000);
    }
}
