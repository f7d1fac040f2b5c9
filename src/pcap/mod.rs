pub mod reader;
pub mod writer;

pub use reader::{CaptureReader, CapturedFrame};
pub use writer::PcapWriter;
