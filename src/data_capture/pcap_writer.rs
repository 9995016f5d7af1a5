//! Classic libpcap file writer.
//!
//! Records are little-endian and declare an Ethernet link layer. The frames
//! we capture carry no link layer of their own, so every record gets the same
//! fixed 14-byte Ethernet-looking prefix ([`SYNTHETIC_LINK_HEADER`]) in front
//! of the payload. Viewers then dissect the payload as IPv4. Those 14 bytes are
//! made up and say nothing about the traffic; they are part of the file format
//! consumers expect, so do not replace them with anything derived from the
//! payload.
//!
//! Useful resources:
//! * https://wiki.wireshark.org/Development/LibpcapFileFormat
//! * https://www.tcpdump.org/linktypes.html

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use uuid::Uuid;

use crate::error_handling::types::CaptureError;

/// Global header, written once at the top of every file.
///
/// magic d4c3b2a1 (little endian, microsecond timestamps), version 2.4,
/// thiszone 0xffff8170 (-32400 s), sigfigs 0, snaplen 65536, linktype 1 (Ethernet).
pub const GLOBAL_HEADER: [u8; 24] = [
    0xD4, 0xC3, 0xB2, 0xA1, 0x02, 0x00, 0x04, 0x00, 0x70, 0x81, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00,
];

/// dst 01:00:5e:7f:3a:04 (IPv4 multicast), src 00:1e:1b:00:00:00, ethertype 0x0800.
pub const SYNTHETIC_LINK_HEADER: [u8; 14] = [
    0x01, 0x00, 0x5E, 0x7F, 0x3A, 0x04, 0x00, 0x1E, 0x1B, 0x00, 0x00, 0x00, 0x08, 0x00,
];

/// Size of the per-record header preceding the synthetic link header.
pub const RECORD_HEADER_LEN: usize = 16;

const MEGA_BYTE: u64 = 1024 * 1024;

/// Appends capture records to a sink, writing the global header exactly once.
///
/// A record is assembled in memory and handed to the sink in a single
/// `write_all`, so a failed write never leaves half a record behind the last
/// successful flush. Any write error is fatal for the owning pipeline.
pub struct CaptureFileWriter<W: Write> {
    session_id: Uuid,
    path: Option<PathBuf>,
    sink: Option<W>,
    header_written: bool,
    records_written: u64,
    payload_bytes_written: u64,
    saved_mib: u64,
}

impl CaptureFileWriter<BufWriter<File>> {
    /// Creates (or truncates) the capture file at `path`.
    pub fn create(session_id: Uuid, path: &Path) -> Result<Self, CaptureError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                error!("[{}] Failed to create capture file {}: {}", session_id, path.display(), e);
                CaptureError::FileCreate(path.to_path_buf(), e)
            })?;
        info!("[{}] {} record start", session_id, path.display());

        let mut writer = Self::new(session_id, BufWriter::new(file));
        writer.path = Some(path.to_path_buf());
        Ok(writer)
    }
}

impl<W: Write> CaptureFileWriter<W> {
    pub fn new(session_id: Uuid, sink: W) -> Self {
        Self {
            session_id,
            path: None,
            sink: Some(sink),
            header_written: false,
            records_written: 0,
            payload_bytes_written: 0,
            saved_mib: 0,
        }
    }

    /// Writes the global header unless it is already there.
    pub fn write_global_header_once(&mut self) -> Result<(), CaptureError> {
        if self.header_written {
            return Ok(());
        }
        let sink = Self::open_sink(&mut self.sink)?;
        sink.write_all(&GLOBAL_HEADER).map_err(CaptureError::FileWrite)?;
        self.header_written = true;
        debug!("[{}] global header written", self.session_id);
        Ok(())
    }

    /// Appends one record for `payload`, stamped with `timestamp_micros`
    /// (microseconds since the Unix epoch).
    pub fn write_record(&mut self, timestamp_micros: i64, payload: &[u8]) -> Result<(), CaptureError> {
        self.write_global_header_once()?;

        let session_id = self.session_id;
        let record = encode_record(timestamp_micros, payload)?;
        let sink = Self::open_sink(&mut self.sink)?;
        sink.write_all(&record).map_err(|e| {
            error!("[{}] Failed to write capture record: {}", session_id, e);
            CaptureError::FileWrite(e)
        })?;

        self.records_written += 1;
        self.payload_bytes_written += payload.len() as u64;
        let mib = self.payload_bytes_written / MEGA_BYTE;
        if mib != self.saved_mib {
            self.saved_mib = mib;
            info!("[{}] saved {} MiB", self.session_id, mib);
        }
        Ok(())
    }

    /// Pushes buffered records down to the underlying sink.
    pub fn flush(&mut self) -> Result<(), CaptureError> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush().map_err(CaptureError::FileWrite),
            None => Ok(()),
        }
    }

    /// Flushes and releases the sink. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<(), CaptureError> {
        let Some(mut sink) = self.sink.take() else {
            return Ok(());
        };
        sink.flush().map_err(CaptureError::FileWrite)?;
        match &self.path {
            Some(path) => info!(
                "[{}] {} record end ({} record(s))",
                self.session_id,
                path.display(),
                self.records_written
            ),
            None => debug!("[{}] capture sink closed", self.session_id),
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn payload_bytes_written(&self) -> u64 {
        self.payload_bytes_written
    }

    /// Hands back the sink without closing it, if it is still open.
    #[cfg(test)]
    pub fn into_inner(mut self) -> Option<W> {
        self.sink.take()
    }

    fn open_sink(sink: &mut Option<W>) -> Result<&mut W, CaptureError> {
        sink.as_mut().ok_or_else(|| {
            CaptureError::FileWrite(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "capture file already closed",
            ))
        })
    }
}

/// Serialises one record: timestamps, lengths, synthetic link header, payload.
pub fn encode_record(timestamp_micros: i64, payload: &[u8]) -> Result<Vec<u8>, CaptureError> {
    let captured_len = u32::try_from(payload.len() + SYNTHETIC_LINK_HEADER.len()).map_err(|_| {
        CaptureError::FileWrite(io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload too large for a capture record",
        ))
    })?;
    let ts_sec = timestamp_micros.div_euclid(1_000_000) as u32;
    let ts_usec = timestamp_micros.rem_euclid(1_000_000) as u32;

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + captured_len as usize);
    record.extend_from_slice(&ts_sec.to_le_bytes());
    record.extend_from_slice(&ts_usec.to_le_bytes());
    // No truncation is ever applied, so both lengths are the same.
    record.extend_from_slice(&captured_len.to_le_bytes());
    record.extend_from_slice(&captured_len.to_le_bytes());
    record.extend_from_slice(&SYNTHETIC_LINK_HEADER);
    record.extend_from_slice(payload);
    Ok(record)
}
