use chrono::Utc;
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::types::{StopReason, TimestampedChunk};

const MEGA_BYTE: u64 = 1024 * 1024;

/// What the reader stage reports back once it stops reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderOutcome {
    pub bytes_received: u64,
    pub stop_reason: StopReason,
}

/// Reads a connected stream in fixed-size chunks and forwards each chunk,
/// time-stamped, onto the handoff channel.
///
/// Reads never go past the byte ceiling: the last read is shortened so the
/// total lands exactly on it. Sending blocks while the channel is full, so a
/// slow writer stage throttles the socket instead of growing memory.
pub struct SocketReader<R> {
    session_id: Uuid,
    stream: R,
    chunk_size: usize,
    byte_ceiling: u64,
    bytes_received: u64,
    received_mib: u64,
}

impl<R: AsyncRead + Unpin> SocketReader<R> {
    pub fn new(session_id: Uuid, stream: R, chunk_size: usize, byte_ceiling: u64) -> Self {
        Self {
            session_id,
            stream,
            chunk_size: chunk_size.max(1),
            byte_ceiling,
            bytes_received: 0,
            received_mib: 0,
        }
    }

    /// Reads until the ceiling, end of stream, a read error, a stop request,
    /// or the writer stage hanging up. The sender is dropped on return, which
    /// is what lets the writer stage drain and finish.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<TimestampedChunk>,
        mut stop: watch::Receiver<bool>,
    ) -> ReaderOutcome {
        let mut buf = vec![0u8; self.chunk_size];

        let stop_reason = loop {
            if *stop.borrow() {
                break StopReason::Stopped;
            }
            let remaining = self.byte_ceiling.saturating_sub(self.bytes_received);
            if remaining == 0 {
                break StopReason::ByteCeiling;
            }
            let want = remaining.min(self.chunk_size as u64) as usize;

            let read = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break StopReason::Stopped,
                _ = tx.closed() => {
                    debug!("[{}] writer stage exited while waiting for data", self.session_id);
                    break StopReason::WriterGone;
                }
                read = self.stream.read(&mut buf[..want]) => read,
            };

            let n = match read {
                Ok(0) => break StopReason::RemoteClosed,
                Ok(n) => n,
                Err(e) => {
                    warn!("[{}] socket read failed: {}", self.session_id, e);
                    break StopReason::ReadFailed(e.to_string());
                }
            };

            let chunk = TimestampedChunk::new(Utc::now(), buf[..n].to_vec());
            self.bytes_received += n as u64;
            trace!("[{}] read {} byte(s)", self.session_id, n);
            self.report_progress();

            if tx.send(chunk).await.is_err() {
                debug!("[{}] handoff channel closed by writer stage", self.session_id);
                break StopReason::WriterGone;
            }
        };

        info!(
            "[{}] reader stopped after {} byte(s): {}",
            self.session_id, self.bytes_received, stop_reason
        );
        ReaderOutcome {
            bytes_received: self.bytes_received,
            stop_reason,
        }
    }

    fn report_progress(&mut self) {
        let mib = self.bytes_received / MEGA_BYTE;
        if mib != self.received_mib {
            self.received_mib = mib;
            info!("[{}] received {} MiB", self.session_id, mib);
        }
    }
}

/// Resolves once a stop is requested. If every stop handle is gone no stop
/// can ever arrive, so it never resolves.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let sender_gone = stop.wait_for(|stopped| *stopped).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;
    use tokio_test::io::Builder;

    fn collect(rx: &mut mpsc::Receiver<TimestampedChunk>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push(chunk.bytes);
        }
        out
    }

    #[tokio::test]
    async fn forwards_each_read_until_remote_close() {
        let stream = Builder::new().read(b"hello").read(b"world").build();
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let outcome = SocketReader::new(Uuid::nil(), stream, 1024, 1 << 20)
            .run(tx, stop_rx)
            .await;

        assert_eq!(outcome.stop_reason, StopReason::RemoteClosed);
        assert_eq!(outcome.bytes_received, 10);
        assert_eq!(collect(&mut rx), vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[tokio::test]
    async fn stops_exactly_at_the_byte_ceiling_on_an_endless_stream() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let outcome = SocketReader::new(Uuid::nil(), tokio::io::repeat(0xA0), 4096, 10 * 1024)
            .run(tx, stop_rx)
            .await;

        assert_eq!(outcome.stop_reason, StopReason::ByteCeiling);
        assert_eq!(outcome.bytes_received, 10 * 1024);
        let sizes: Vec<usize> = collect(&mut rx).iter().map(Vec::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 10 * 1024);
        assert!(sizes.iter().all(|&n| n <= 4096));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_error_ends_capture_as_connection_failure() {
        let stream = Builder::new()
            .read(b"abc")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let outcome = SocketReader::new(Uuid::nil(), stream, 1024, 1 << 20)
            .run(tx, stop_rx)
            .await;

        assert!(matches!(outcome.stop_reason, StopReason::ReadFailed(_)));
        assert_eq!(outcome.bytes_received, 3);
        assert_eq!(collect(&mut rx), vec![b"abc".to_vec()]);
    }

    #[tokio::test]
    async fn stop_request_prevents_further_reads() {
        let (tx, mut rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send_replace(true);

        let outcome = SocketReader::new(Uuid::nil(), tokio::io::repeat(0), 1024, 1 << 20)
            .run(tx, stop_rx)
            .await;

        assert_eq!(outcome.stop_reason, StopReason::Stopped);
        assert_eq!(outcome.bytes_received, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_channel_blocks_the_reader() {
        let (tx, mut rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let reader = tokio::spawn(
            SocketReader::new(Uuid::nil(), tokio::io::repeat(1), 16, 64).run(tx, stop_rx),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        let mut total = 0;
        while let Some(chunk) = rx.recv().await {
            total += chunk.len();
        }
        let outcome = reader.await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::ByteCeiling);
        assert_eq!(total, 64);
    }

    #[tokio::test]
    async fn idle_stream_ends_when_the_writer_hangs_up() {
        let (_remote, local) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let reader =
            tokio::spawn(SocketReader::new(Uuid::nil(), local, 16, 1 << 20).run(tx, stop_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);

        let outcome = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader kept waiting on an idle stream")
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::WriterGone);
        assert_eq!(outcome.bytes_received, 0);
    }

    #[tokio::test]
    async fn dropped_receiver_stops_the_reader() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let outcome = SocketReader::new(Uuid::nil(), tokio::io::repeat(1), 16, 1 << 20)
            .run(tx, stop_rx)
            .await;

        assert_eq!(outcome.stop_reason, StopReason::WriterGone);
        assert_eq!(outcome.bytes_received, 0);
    }
}
