//! Capture pipeline: socket reads in, pcap records out.
//!
//! Components:
//! - `socket_reader`: reads a connected stream in fixed-size, time-stamped chunks.
//! - `reassembler`: turns the chunked byte stream back into protocol frames.
//! - `pcap_writer`: serialises each frame payload as a pcap record.
//! - `pipeline`: wires the stages together for one target connection.
//! - `types`: data shared between the stages.

pub mod pcap_writer;
pub mod pipeline;
pub mod reassembler;
pub mod socket_reader;
pub mod types;

pub use pcap_writer::CaptureFileWriter;
pub use pipeline::{CapturePipeline, CaptureSettings, StopHandle};
pub use reassembler::{Extraction, FrameReassembler};
pub use socket_reader::SocketReader;
pub use types::{CaptureSummary, Frame, PipelineState, StopReason, TimestampedChunk};
