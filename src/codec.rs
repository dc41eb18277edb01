//! Length-prefixed framing for peer connections.
//!
//! Every wire message travels as one frame: a 4-byte big-endian length
//! followed by that many payload bytes. The decoder is incremental —
//! bytes arrive from a non-blocking socket in arbitrary chunks, and a
//! frame is surfaced only once complete. A length above the configured
//! maximum is a [`ErrorKind::Frame`] error; the connection that produced
//! it is not recoverable because frame boundaries are lost.

use crate::error::{Error, ErrorKind, Result};

/// Number of bytes in the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Default maximum frame length (8 MiB), matching the upper bound a
/// single result value is allowed to occupy.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Appends one length-prefixed frame to `out`.
pub fn encode_frame(payload: &[u8], max_frame_length: usize, out: &mut Vec<u8>) -> Result<()> {
    if payload.len() > max_frame_length {
        return Err(Error::new(ErrorKind::Frame)
            .with_context(format!("frame of {} bytes exceeds max {max_frame_length}", payload.len())));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::new(ErrorKind::Frame).with_context("frame length overflows u32"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Reading the 4-byte length prefix.
    Head,
    /// Reading a payload of the given length.
    Data(usize),
}

/// Incremental decoder for length-prefixed frames.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_length: usize,
    buf: Vec<u8>,
    state: DecodeState,
}

impl FrameDecoder {
    /// Creates a decoder with the given maximum frame length.
    #[must_use]
    pub const fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            buf: Vec::new(),
            state: DecodeState::Head,
        }
    }

    /// Feeds bytes read from the connection into the decoder.
    pub fn ingest(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns true if undecoded bytes are buffered.
    ///
    /// A connection with buffered bytes counts as readable for the event
    /// loop even when the socket itself has nothing new.
    #[must_use]
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty() || matches!(self.state, DecodeState::Data(_))
    }

    /// Extracts the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An oversized length
    /// prefix poisons the stream: the buffer is drained and an error is
    /// returned.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if self.buf.len() < LENGTH_PREFIX {
                        return Ok(None);
                    }
                    let mut prefix = [0u8; LENGTH_PREFIX];
                    prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
                    let len = u32::from_be_bytes(prefix) as usize;
                    if len > self.max_frame_length {
                        self.drain();
                        return Err(Error::new(ErrorKind::Frame).with_context(format!(
                            "incoming frame of {len} bytes exceeds max {}",
                            self.max_frame_length
                        )));
                    }
                    self.buf.drain(..LENGTH_PREFIX);
                    self.state = DecodeState::Data(len);
                }
                DecodeState::Data(len) => {
                    if self.buf.len() < len {
                        return Ok(None);
                    }
                    let frame: Vec<u8> = self.buf.drain(..len).collect();
                    self.state = DecodeState::Head;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Discards all buffered bytes and resets to the head state.
    ///
    /// Used after a decode failure: frame boundaries are lost, so the
    /// remaining bytes cannot be re-synchronized.
    pub fn drain(&mut self) {
        self.buf.clear();
        self.state = DecodeState::Head;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_frame(payload, DEFAULT_MAX_FRAME_LENGTH, &mut out).unwrap();
        out
    }

    #[test]
    fn roundtrip_single_frame() {
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_LENGTH);
        dec.ingest(&frame(b"hello"));
        assert_eq!(dec.next_frame().unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(dec.next_frame().unwrap(), None);
        assert!(!dec.has_buffered());
    }

    #[test]
    fn partial_feeds_accumulate() {
        let bytes = frame(b"split across reads");
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_LENGTH);
        let (a, b) = bytes.split_at(3);
        dec.ingest(a);
        assert_eq!(dec.next_frame().unwrap(), None);
        dec.ingest(b);
        assert_eq!(
            dec.next_frame().unwrap().as_deref(),
            Some(&b"split across reads"[..])
        );
    }

    #[test]
    fn several_frames_in_one_read() {
        let mut bytes = frame(b"one");
        bytes.extend_from_slice(&frame(b"two"));
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_LENGTH);
        dec.ingest(&bytes);
        assert_eq!(dec.next_frame().unwrap().as_deref(), Some(&b"one"[..]));
        assert!(dec.has_buffered());
        assert_eq!(dec.next_frame().unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn empty_frame_is_legal() {
        let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_LENGTH);
        dec.ingest(&frame(b""));
        assert_eq!(dec.next_frame().unwrap().as_deref(), Some(&b""[..]));
    }

    #[test]
    fn oversized_length_poisons_stream() {
        let mut dec = FrameDecoder::new(16);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1024u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        dec.ingest(&bytes);
        let err = dec.next_frame().expect_err("oversize must error");
        assert_eq!(err.kind(), ErrorKind::Frame);
        assert!(!dec.has_buffered());
    }

    #[test]
    fn encode_rejects_oversize() {
        let mut out = Vec::new();
        let err = encode_frame(&[0u8; 64], 16, &mut out).expect_err("oversize");
        assert_eq!(err.kind(), ErrorKind::Frame);
        assert!(out.is_empty());
    }
}
