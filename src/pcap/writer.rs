//! Legacy pcap writer used by the capture worker.
//!
//! Writes the classic little-endian, microsecond-resolution format so the
//! files open in any capture tool. Every record is flushed as soon as it is
//! written: the capture file must reflect arrival order without buffering
//! delay, and a worker that dies mid-session still leaves a readable file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::igmp::Timestamp;

const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;

/// Snapshot length written into the file header.
pub const SNAPLEN: u32 = 65535;

pub struct PcapWriter<W: Write> {
    out: W,
    packets: u64,
}

impl PcapWriter<BufWriter<File>> {
    /// Create (or truncate) a capture file and write its header.
    pub fn create(path: impl AsRef<Path>, linktype: u32) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), linktype)
    }
}

impl<W: Write> PcapWriter<W> {
    pub fn new(mut out: W, linktype: u32) -> std::io::Result<Self> {
        let mut header = [0u8; 24];
        header[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        header[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        // thiszone and sigfigs stay zero
        header[16..20].copy_from_slice(&SNAPLEN.to_le_bytes());
        header[20..24].copy_from_slice(&linktype.to_le_bytes());
        out.write_all(&header)?;
        out.flush()?;
        Ok(Self { out, packets: 0 })
    }

    /// Append one record and flush it.
    pub fn write_packet(&mut self, timestamp: Timestamp, data: &[u8]) -> std::io::Result<()> {
        let caplen = data.len().min(SNAPLEN as usize);
        let secs = (timestamp / 1_000_000) as u32;
        let usecs = (timestamp % 1_000_000) as u32;

        let mut record = [0u8; 16];
        record[0..4].copy_from_slice(&secs.to_le_bytes());
        record[4..8].copy_from_slice(&usecs.to_le_bytes());
        record[8..12].copy_from_slice(&(caplen as u32).to_le_bytes());
        record[12..16].copy_from_slice(&(data.len() as u32).to_le_bytes());
        self.out.write_all(&record)?;
        self.out.write_all(&data[..caplen])?;
        self.out.flush()?;
        self.packets += 1;
        Ok(())
    }

    /// Number of records written so far.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
