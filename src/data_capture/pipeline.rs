//! Per-target capture pipeline.
//!
//! One `CapturePipeline` owns one TCP connection and one capture file. It runs
//! two stages that share nothing but a bounded channel:
//!
//! ```text
//! ┌──────────────┐  TimestampedChunk  ┌──────────────────────────────────┐
//! │ SocketReader │───── (bounded) ───▶│ FrameReassembler → CaptureFile   │
//! │ (tokio task) │                    │ Writer (blocking task)           │
//! └──────────────┘                    └──────────────────────────────────┘
//! ```
//!
//! The reader stops on the byte ceiling, remote close, read error or a stop
//! request and drops its sender. The writer keeps receiving until the channel
//! is empty and closed, so everything already queued is written before the
//! file is closed.
//!
//! Minimal usage
//! ```no_run
//! use mtcp_capture::data_capture::{CapturePipeline, CaptureSettings};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut pipeline = CapturePipeline::new("192.168.0.1:9800".parse()?, CaptureSettings::default());
//! let summary = pipeline.run().await?;
//! println!("{} frame(s) in {}", summary.frames_written, summary.output_path.display());
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use tokio::io::AsyncRead;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error_handling::types::CaptureError;

use super::pcap_writer::CaptureFileWriter;
use super::reassembler::{FrameReassembler, MAX_FRAME_SIZE};
use super::socket_reader::{stop_requested, ReaderOutcome, SocketReader};
use super::types::{CaptureSummary, PipelineState, StopReason, TimestampedChunk};

pub const MEGA_BYTE: usize = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = MEGA_BYTE;
pub const DEFAULT_BYTE_CEILING: u64 = 500 * MEGA_BYTE as u64;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Knobs shared by every pipeline started from one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    /// Bytes requested per socket read; also used as the socket receive buffer size.
    pub chunk_size: usize,
    /// Total bytes after which the reader stops.
    pub byte_ceiling: u64,
    /// Chunks the handoff channel holds before the reader is made to wait.
    pub channel_capacity: usize,
    /// Declared frame lengths above this are treated as corruption.
    pub max_frame_size: usize,
    /// Consecutive skipped bytes tolerated before giving up; 0 means never give up.
    pub max_resync_skip: usize,
    /// Directory capture files are created in.
    pub output_dir: PathBuf,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            byte_ceiling: DEFAULT_BYTE_CEILING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
            max_resync_skip: 0,
            output_dir: PathBuf::from("."),
        }
    }
}

/// Requests a cooperative stop of a running pipeline.
///
/// The reader stops issuing reads and the writer drains what is already queued.
/// Stopping more than once, or after the pipeline closed, does nothing.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Capture file name for a target: `yyMMdd_HHmm_<address>_<port>.pcap`.
pub fn capture_file_name(started_at: DateTime<Local>, target: SocketAddr) -> String {
    let address = target.ip().to_string().replace(':', "-");
    format!(
        "{}_{}_{}.pcap",
        started_at.format("%y%m%d_%H%M"),
        address,
        target.port()
    )
}

struct WriterOutcome {
    bytes_consumed: u64,
    frames_written: u64,
    payload_bytes_written: u64,
    bytes_discarded: u64,
    trailing_bytes: usize,
}

pub struct CapturePipeline {
    session_id: Uuid,
    target: SocketAddr,
    settings: CaptureSettings,
    state: PipelineState,
    stop: StopHandle,
}

impl CapturePipeline {
    pub fn new(target: SocketAddr, settings: CaptureSettings) -> Self {
        let (tx, _rx) = watch::channel(false);
        let session_id = Uuid::new_v4();
        debug!("[{}] CapturePipeline created for {}", session_id, target);
        Self {
            session_id,
            target,
            settings,
            state: PipelineState::Connecting,
            stop: StopHandle { tx: Arc::new(tx) },
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Same as `stop_handle().stop()`.
    pub fn shutdown(&self) {
        self.stop.stop();
    }

    /// Connects to the target and captures until the byte ceiling, a
    /// disconnect, or a stop request.
    ///
    /// Errors
    /// - [`CaptureError::ConnectFailed`] if the connection cannot be established;
    ///   no file is created and the pipeline goes straight to `Closed`.
    /// - [`CaptureError::Cancelled`] if a stop arrives before the connection is up.
    /// - Anything [`capture_from`](Self::capture_from) returns.
    pub async fn run(&mut self) -> Result<CaptureSummary, CaptureError> {
        self.ensure_not_closed()?;
        self.transition(PipelineState::Connecting);
        info!("[{}] connect: {}", self.session_id, self.target);

        let mut stop = self.stop.tx.subscribe();
        let connected = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => Err(CaptureError::Cancelled(self.target)),
            connected = self.connect() => connected,
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                match e {
                    CaptureError::Cancelled(_) => info!("[{}] {}", self.session_id, e),
                    _ => error!("[{}] {}", self.session_id, e),
                }
                self.transition(PipelineState::Closed);
                return Err(e);
            }
        };
        self.capture_from(stream).await
    }

    /// Captures from an already-connected stream.
    ///
    /// Errors
    /// - [`CaptureError::FileCreate`] if the capture file cannot be created.
    /// - [`CaptureError::FileWrite`] if writing the file fails midway.
    /// - [`CaptureError::PersistentDesync`] if the skip ceiling is configured and exceeded.
    /// - [`CaptureError::StageFailed`] if the writer stage panicked.
    pub async fn capture_from<R>(&mut self, stream: R) -> Result<CaptureSummary, CaptureError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.ensure_not_closed()?;
        let output_path = self
            .settings
            .output_dir
            .join(capture_file_name(Local::now(), self.target));

        let writer = match CaptureFileWriter::create(self.session_id, &output_path) {
            Ok(writer) => writer,
            Err(e) => {
                self.transition(PipelineState::Closed);
                return Err(e);
            }
        };
        let reassembler = FrameReassembler::new(
            self.session_id,
            self.settings.max_frame_size,
            self.settings.max_resync_skip,
        );

        self.transition(PipelineState::Capturing);
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));

        let session_id = self.session_id;
        let writer_task =
            tokio::task::spawn_blocking(move || writer_stage(session_id, rx, reassembler, writer));

        let reader = SocketReader::new(
            self.session_id,
            stream,
            self.settings.chunk_size,
            self.settings.byte_ceiling,
        );
        let reader_task = tokio::spawn(reader.run(tx, self.stop.tx.subscribe()));

        let reader_outcome = match reader_task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("[{}] reader stage failed: {}", self.session_id, e);
                None
            }
        };

        self.transition(PipelineState::Draining);
        let writer_result = match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(CaptureError::StageFailed(e.to_string())),
        };
        self.transition(PipelineState::Closed);

        let written = writer_result.inspect_err(|e| {
            error!("[{}] writer stage failed: {}", self.session_id, e);
        })?;

        let ReaderOutcome {
            bytes_received,
            stop_reason,
        } = reader_outcome.unwrap_or(ReaderOutcome {
            bytes_received: written.bytes_consumed,
            stop_reason: StopReason::ReadFailed("reader stage panicked".to_string()),
        });

        let summary = CaptureSummary {
            target: self.target,
            output_path,
            bytes_received,
            frames_written: written.frames_written,
            payload_bytes_written: written.payload_bytes_written,
            bytes_discarded: written.bytes_discarded,
            trailing_bytes: written.trailing_bytes,
            stop_reason,
        };
        info!(
            "[{}] capture finished: received={}, frames={}, payload={}, discarded={}, trailing={}, reason={}",
            self.session_id,
            summary.bytes_received,
            summary.frames_written,
            summary.payload_bytes_written,
            summary.bytes_discarded,
            summary.trailing_bytes,
            summary.stop_reason
        );
        Ok(summary)
    }

    async fn connect(&self) -> Result<TcpStream, CaptureError> {
        let socket = if self.target.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| CaptureError::ConnectFailed(self.target, e))?;

        let recv_buffer = u32::try_from(self.settings.chunk_size).unwrap_or(u32::MAX);
        if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
            warn!(
                "[{}] unable to set receive buffer to {} byte(s): {}",
                self.session_id, recv_buffer, e
            );
        }

        socket
            .connect(self.target)
            .await
            .map_err(|e| CaptureError::ConnectFailed(self.target, e))
    }

    fn ensure_not_closed(&self) -> Result<(), CaptureError> {
        if self.state == PipelineState::Closed {
            return Err(CaptureError::StageFailed(format!(
                "pipeline for {} already closed",
                self.target
            )));
        }
        Ok(())
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            debug!("[{}] {} -> {}", self.session_id, self.state, next);
            self.state = next;
        }
    }
}

/// Writer stage body. Runs on a blocking thread and owns the reassembly
/// buffer and the capture file.
fn writer_stage(
    session_id: Uuid,
    mut rx: mpsc::Receiver<TimestampedChunk>,
    mut reassembler: FrameReassembler,
    mut writer: CaptureFileWriter<BufWriter<File>>,
) -> Result<WriterOutcome, CaptureError> {
    writer.write_global_header_once()?;

    let mut bytes_consumed = 0u64;
    while let Some(chunk) = rx.blocking_recv() {
        bytes_consumed += chunk.len() as u64;
        reassembler.feed(&chunk.bytes);
        // Frames completed by this chunk carry this chunk's timestamp.
        while let Some(frame) = reassembler.next_frame()? {
            writer.write_record(chunk.capture_time_micros, &frame.payload)?;
        }
        writer.flush()?;
    }

    let trailing_bytes = reassembler.pending_len();
    if trailing_bytes > 0 {
        debug!(
            "[{}] discarding {} trailing byte(s) of an incomplete frame",
            session_id, trailing_bytes
        );
    }
    writer.close()?;

    Ok(WriterOutcome {
        bytes_consumed,
        frames_written: writer.records_written(),
        payload_bytes_written: writer.payload_bytes_written(),
        bytes_discarded: reassembler.bytes_discarded(),
        trailing_bytes,
    })
}
