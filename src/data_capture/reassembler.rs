//! Byte-stream reassembly for the length-prefixed capture protocol.
//!
//! Wire layout of one frame:
//!
//! ```text
//! 0      4      5      6             8                 total_length
//! ┌──────┬──────┬──────┬─────────────┬─────────────────┐
//! │ A0×4 │ rsvd │  00  │ len (BE u16)│ payload ...     │
//! └──────┴──────┴──────┴─────────────┴─────────────────┘
//! ```
//!
//! `len` counts the 8 header bytes too. A head that fails the marker, flag
//! or length checks is skipped one byte at a time until a plausible header
//! lines up again.

use log::{debug, trace};
use uuid::Uuid;

use crate::error_handling::types::CaptureError;

use super::types::Frame;

pub const SYNC_MARKER: [u8; 4] = [0xA0, 0xA0, 0xA0, 0xA0];
pub const HEADER_LEN: usize = 8;
/// Largest total length the 16-bit length field can express.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Result of one extraction attempt at the buffer head.
#[derive(Debug, PartialEq, Eq)]
pub enum Extraction {
    Frame(Frame),
    NeedMoreData,
    /// The head byte was dropped; the caller should try again.
    Desync,
}

/// Stateful accumulator that turns arbitrary chunk splits back into frames.
#[derive(Debug)]
pub struct FrameReassembler {
    session_id: Uuid,
    buffer: Vec<u8>,
    /// Start of unconsumed data in `buffer`. Everything before it is dead.
    head: usize,
    max_frame_size: usize,
    /// 0 disables the ceiling.
    max_resync_skip: usize,
    consecutive_skipped: usize,
    bytes_discarded: u64,
    frames_extracted: u64,
}

impl FrameReassembler {
    pub fn new(session_id: Uuid, max_frame_size: usize, max_resync_skip: usize) -> Self {
        Self {
            session_id,
            buffer: Vec::new(),
            head: 0,
            max_frame_size: max_frame_size.clamp(HEADER_LEN, MAX_FRAME_SIZE),
            max_resync_skip,
            consecutive_skipped: 0,
            bytes_discarded: 0,
            frames_extracted: 0,
        }
    }

    /// Appends `bytes` behind whatever is still pending.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.head > 0 {
            self.buffer.drain(..self.head);
            self.head = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Attempts to pull one frame off the buffer head.
    pub fn try_extract(&mut self) -> Extraction {
        let pending = &self.buffer[self.head..];
        if pending.len() < HEADER_LEN {
            return Extraction::NeedMoreData;
        }

        if pending[..4] != SYNC_MARKER || pending[5] != 0 {
            self.skip_one();
            return Extraction::Desync;
        }

        let total_length = u16::from_be_bytes([pending[6], pending[7]]);
        let total = total_length as usize;
        if total < HEADER_LEN || total > self.max_frame_size {
            self.skip_one();
            return Extraction::Desync;
        }

        if pending.len() < total {
            return Extraction::NeedMoreData;
        }

        let payload = pending[HEADER_LEN..total].to_vec();
        self.head += total;
        self.frames_extracted += 1;

        if self.consecutive_skipped > 0 {
            debug!(
                "[{}] resynchronised after skipping {} byte(s)",
                self.session_id, self.consecutive_skipped
            );
            self.consecutive_skipped = 0;
        }
        trace!(
            "[{}] extracted frame: total_length={}, payload={} byte(s)",
            self.session_id,
            total_length,
            payload.len()
        );

        Extraction::Frame(Frame {
            total_length,
            payload,
        })
    }

    /// Runs [`try_extract`](Self::try_extract) until a frame comes out or
    /// more input is needed.
    ///
    /// Errors
    /// - [`CaptureError::PersistentDesync`] once more than `max_resync_skip`
    ///   consecutive bytes have been skipped (only when the ceiling is set).
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        loop {
            match self.try_extract() {
                Extraction::Frame(frame) => return Ok(Some(frame)),
                Extraction::NeedMoreData => return Ok(None),
                Extraction::Desync => {
                    if self.max_resync_skip > 0 && self.consecutive_skipped > self.max_resync_skip
                    {
                        return Err(CaptureError::PersistentDesync(self.consecutive_skipped));
                    }
                }
            }
        }
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len() - self.head
    }

    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }

    pub fn frames_extracted(&self) -> u64 {
        self.frames_extracted
    }

    fn skip_one(&mut self) {
        self.head += 1;
        self.consecutive_skipped += 1;
        self.bytes_discarded += 1;
    }
}

/// Wraps `payload` in a protocol header.
#[cfg(test)]
pub(crate) fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    let total = u16::try_from(payload.len() + HEADER_LEN).ok()?;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&SYNC_MARKER);
    out.push(0);
    out.push(0);
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(payload);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembler() -> FrameReassembler {
        FrameReassembler::new(Uuid::nil(), MAX_FRAME_SIZE, 0)
    }

    fn drain(r: &mut FrameReassembler) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = r.next_frame().unwrap() {
            out.push(frame.payload);
        }
        out
    }

    #[test]
    fn single_frame_fed_whole() {
        let mut r = reassembler();
        r.feed(&encode_frame(b"hello").unwrap());
        let frame = r.next_frame().unwrap().unwrap();
        assert_eq!(frame.total_length, 13);
        assert_eq!(frame.payload, b"hello");
        assert_eq!(r.next_frame().unwrap(), None);
        assert_eq!(r.pending_len(), 0);
    }

    #[test]
    fn byte_by_byte_feed_yields_exactly_one_frame() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let encoded = encode_frame(&payload).unwrap();
        let mut r = reassembler();
        let mut frames = Vec::new();
        for b in &encoded {
            r.feed(std::slice::from_ref(b));
            frames.extend(drain(&mut r));
        }
        assert_eq!(frames, vec![payload]);
        assert_eq!(r.bytes_discarded(), 0);
    }

    #[test]
    fn arbitrary_splits_do_not_change_the_result() {
        let payload = vec![0xA0; 300];
        let encoded = encode_frame(&payload).unwrap();
        for split in [1, 3, 7, 8, 9, 150, 307] {
            let mut r = reassembler();
            let mut frames = Vec::new();
            for piece in encoded.chunks(split) {
                r.feed(piece);
                frames.extend(drain(&mut r));
            }
            assert_eq!(frames, vec![payload.clone()], "split size {}", split);
        }
    }

    #[test]
    fn empty_and_largest_payloads() {
        let mut r = reassembler();
        let largest = vec![0x5A; MAX_FRAME_SIZE - HEADER_LEN];
        r.feed(&encode_frame(&[]).unwrap());
        r.feed(&encode_frame(&largest).unwrap());
        assert_eq!(drain(&mut r), vec![Vec::new(), largest]);
        assert!(encode_frame(&vec![0; MAX_FRAME_SIZE - HEADER_LEN + 1]).is_none());
    }

    #[test]
    fn garbage_prefix_is_skipped_one_byte_at_a_time() {
        let garbage = [0x00, 0xA0, 0xA0, 0xA0, 0x11, 0xA0, 0xFF];
        let mut stream = garbage.to_vec();
        stream.extend(encode_frame(b"payload").unwrap());

        let mut r = reassembler();
        r.feed(&stream);
        for _ in 0..garbage.len() {
            assert_eq!(r.try_extract(), Extraction::Desync);
        }
        match r.try_extract() {
            Extraction::Frame(frame) => assert_eq!(frame.payload, b"payload"),
            other => panic!("expected frame, got {:?}", other),
        }
        assert_eq!(r.bytes_discarded(), garbage.len() as u64);
    }

    #[test]
    fn nonzero_flag_byte_desyncs() {
        let mut encoded = encode_frame(b"abc").unwrap();
        encoded[5] = 1;
        let mut r = reassembler();
        r.feed(&encoded);
        assert_eq!(r.try_extract(), Extraction::Desync);
    }

    #[test]
    fn reserved_byte_is_not_validated() {
        let mut encoded = encode_frame(b"abc").unwrap();
        encoded[4] = 0x7F;
        let mut r = reassembler();
        r.feed(&encoded);
        assert_eq!(drain(&mut r), vec![b"abc".to_vec()]);
    }

    #[test]
    fn three_concatenated_frames_come_out_in_order() {
        let mut stream = Vec::new();
        stream.extend(encode_frame(b"one").unwrap());
        stream.extend(encode_frame(b"two").unwrap());
        stream.extend(encode_frame(b"three").unwrap());
        let mut r = reassembler();
        r.feed(&stream);
        assert_eq!(
            drain(&mut r),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert_eq!(r.frames_extracted(), 3);
    }

    #[test]
    fn incomplete_frame_waits_for_the_rest() {
        let payload = vec![7u8; 92];
        let encoded = encode_frame(&payload).unwrap();
        assert_eq!(encoded.len(), 100);

        let mut r = reassembler();
        r.feed(&encoded[..58]);
        assert_eq!(r.try_extract(), Extraction::NeedMoreData);
        assert_eq!(r.pending_len(), 58);

        r.feed(&encoded[58..]);
        assert_eq!(drain(&mut r), vec![payload]);
    }

    #[test]
    fn short_header_needs_more_data() {
        let mut r = reassembler();
        r.feed(&[0xA0, 0xA0, 0xA0]);
        assert_eq!(r.try_extract(), Extraction::NeedMoreData);
    }

    #[test]
    fn length_below_header_size_desyncs() {
        let mut r = reassembler();
        r.feed(&[0xA0, 0xA0, 0xA0, 0xA0, 0x00, 0x00, 0x00, 0x04]);
        assert_eq!(r.try_extract(), Extraction::Desync);
    }

    #[test]
    fn length_above_max_frame_size_desyncs() {
        let mut r = FrameReassembler::new(Uuid::nil(), 64, 0);
        let mut stream = encode_frame(&[1u8; 100]).unwrap();
        stream.extend(encode_frame(b"ok").unwrap());
        r.feed(&stream);
        assert_eq!(drain(&mut r), vec![b"ok".to_vec()]);
        assert_eq!(r.bytes_discarded(), 108);
    }

    #[test]
    fn skip_ceiling_turns_persistent_desync_into_error() {
        let mut r = FrameReassembler::new(Uuid::nil(), MAX_FRAME_SIZE, 16);
        r.feed(&[0u8; 64]);
        match r.next_frame() {
            Err(CaptureError::PersistentDesync(n)) => assert_eq!(n, 17),
            other => panic!("expected persistent desync, got {:?}", other),
        }
    }

    #[test]
    fn skip_counter_resets_after_a_good_frame() {
        let mut r = FrameReassembler::new(Uuid::nil(), MAX_FRAME_SIZE, 10);
        let mut stream = vec![0u8; 8];
        stream.extend(encode_frame(b"a").unwrap());
        stream.extend(vec![0u8; 8]);
        stream.extend(encode_frame(b"b").unwrap());
        r.feed(&stream);
        assert_eq!(drain(&mut r), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(r.bytes_discarded(), 16);
    }
}
