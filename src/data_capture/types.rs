//! Common data types used across the data_capture subsystem.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// One successful socket read, stamped with the wall-clock time it completed.
///
/// Ownership of the bytes moves into the handoff channel on send; the chunk is
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedChunk {
    /// Capture time in microseconds since the Unix epoch.
    pub capture_time_micros: i64,
    /// Raw bytes exactly as returned by the read.
    pub bytes: Vec<u8>,
}

impl TimestampedChunk {
    pub fn new(captured_at: DateTime<Utc>, bytes: Vec<u8>) -> Self {
        Self {
            capture_time_micros: captured_at.timestamp_micros(),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A frame extracted from the reassembly buffer.
///
/// The payload is copied out of the buffer before it is handed back, so a
/// `Frame` stays valid after the buffer has been trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Declared total length, header included.
    pub total_length: u16,
    pub payload: Vec<u8>,
}

/// Lifecycle of one target connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Connecting,
    Capturing,
    Draining,
    Closed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Connecting => "connecting",
            PipelineState::Capturing => "capturing",
            PipelineState::Draining => "draining",
            PipelineState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why the reader stage stopped issuing reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The configured byte ceiling was reached.
    ByteCeiling,
    /// The remote end closed the connection (read returned zero bytes).
    RemoteClosed,
    /// A stop was requested through a [`StopHandle`](super::pipeline::StopHandle).
    Stopped,
    /// The read failed; treated as a connection failure.
    ReadFailed(String),
    /// The writer stage went away, so there was no one left to hand chunks to.
    WriterGone,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ByteCeiling => write!(f, "byte ceiling reached"),
            StopReason::RemoteClosed => write!(f, "remote closed"),
            StopReason::Stopped => write!(f, "stop requested"),
            StopReason::ReadFailed(e) => write!(f, "read failed: {}", e),
            StopReason::WriterGone => write!(f, "writer stage exited"),
        }
    }
}

/// Outcome of a completed capture, returned to whoever supervises the pipeline.
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub target: SocketAddr,
    pub output_path: PathBuf,
    /// Bytes read from the socket.
    pub bytes_received: u64,
    /// Records written to the capture file.
    pub frames_written: u64,
    /// Payload bytes written, synthetic headers excluded.
    pub payload_bytes_written: u64,
    /// Bytes dropped one at a time while resynchronising.
    pub bytes_discarded: u64,
    /// Incomplete frame bytes left in the buffer when the stream ended.
    pub trailing_bytes: usize,
    pub stop_reason: StopReason,
}
