//! Stream reassembly
//!
//! TCP delivers the gateway's output as an unstructured byte sequence. The
//! [`FrameBuffer`] accumulates reads and cuts complete frames out of it,
//! whatever the chunking was.
//!
//! - bytes before a start marker are skipped
//! - an implausible length field drops the marker and resyncs on the next one
//! - a checksum mismatch is reported so the caller can fail the transaction
//!   the header points at; with a readable header the whole declared span is
//!   skipped, otherwise only the marker

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::constants::START_BYTE;
use crate::error::{FrameDefect, XcomError};
use crate::frame::Frame;

const DEFAULT_CAPACITY: usize = 4 * 1024;

/// Item produced by [`FrameBuffer::push`]
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Complete frame with a valid checksum
    Frame(Frame),
    /// Complete-looking frame that failed validation
    ///
    /// `header` carries the parsed fields when they could be read, so the
    /// owner of the pending table can still tell which request it was for.
    Corrupt {
        header: Option<Frame>,
        error: XcomError,
    },
}

/// Accumulates incoming bytes and extracts frames
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    discarded: u64,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            discarded: 0,
        }
    }

    /// Append `data` and return everything that became complete
    pub fn push(&mut self, data: &[u8]) -> Vec<Inbound> {
        self.buffer.extend_from_slice(data);

        let mut out = Vec::new();
        while let Some(item) = self.try_extract_one() {
            out.push(item);
        }
        out
    }

    fn try_extract_one(&mut self) -> Option<Inbound> {
        loop {
            if !self.skip_to_marker() {
                return None;
            }

            match Frame::split(&self.buffer) {
                Ok(raw) if raw.computed == raw.carried => {
                    let total = raw.total_len;
                    let parsed = Frame::parse_body(raw.body);
                    self.buffer.advance(total);
                    return Some(match parsed {
                        Ok(frame) => Inbound::Frame(frame),
                        Err(error) => Inbound::Corrupt {
                            header: None,
                            error,
                        },
                    });
                },
                Ok(raw) => {
                    let error = XcomError::Checksum {
                        expected: raw.computed,
                        actual: raw.carried,
                    };
                    let header = Frame::parse_body(raw.body).ok();
                    let total = raw.total_len;
                    if header.is_some() {
                        // stray markers inside the damaged body must not stall the stream
                        self.discarded += total as u64;
                        self.buffer.advance(total);
                    } else {
                        self.drop_marker();
                    }
                    return Some(Inbound::Corrupt { header, error });
                },
                Err(e) if e.is_incomplete() => {
                    trace!(buffered = self.buffer.len(), "Partial frame");
                    return None;
                },
                Err(XcomError::MalformedFrame(FrameDefect::BadLength(len))) => {
                    trace!(len, "Implausible length, resyncing");
                    self.drop_marker();
                },
                Err(e) => {
                    trace!("Unexpected split error: {}", e);
                    self.drop_marker();
                },
            }
        }
    }

    /// Advance to the next start marker. Returns false when none is buffered.
    fn skip_to_marker(&mut self) -> bool {
        match self.buffer.iter().position(|&b| b == START_BYTE) {
            Some(0) => true,
            Some(pos) => {
                trace!(skipped = pos, "Skipping bytes before start marker");
                self.discarded += pos as u64;
                self.buffer.advance(pos);
                true
            },
            None => {
                if !self.buffer.is_empty() {
                    trace!(skipped = self.buffer.len(), "No start marker in buffer");
                    self.discarded += self.buffer.len() as u64;
                    self.buffer.clear();
                }
                false
            },
        }
    }

    fn drop_marker(&mut self) {
        self.discarded += 1;
        self.buffer.advance(1);
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total bytes thrown away while resynchronizing
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drop buffered bytes, e.g. after a reconnect
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::{ObjectType, PropertyId, ServiceId};

    fn sample_frames() -> Vec<Frame> {
        let read = Frame::read_request(1, 101, ObjectType::Info, 3000, PropertyId::Value);
        let write = Frame::write_request(1, 102, 1107, vec![0x00, 0x00, 0x20, 0x41]);
        vec![
            read.response(ServiceId::Read, vec![0x00, 0x00, 0x48, 0x42]),
            write.response(ServiceId::Write, Vec::new()),
            read.error_response(crate::types::ScomErrorCode::ObjectIdNotFound),
        ]
    }

    fn stream_of(frames: &[Frame]) -> Vec<u8> {
        frames
            .iter()
            .flat_map(|f| f.encode().unwrap().to_vec())
            .collect()
    }

    fn frames_only(items: Vec<Inbound>) -> Vec<Frame> {
        items
            .into_iter()
            .map(|i| match i {
                Inbound::Frame(f) => f,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_all_at_once() {
        let frames = sample_frames();
        let mut buf = FrameBuffer::new();
        let out = frames_only(buf.push(&stream_of(&frames)));
        assert_eq!(out, frames);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_byte_at_a_time_matches_all_at_once() {
        let frames = sample_frames();
        let stream = stream_of(&frames);

        let mut whole = FrameBuffer::new();
        let expected = whole.push(&stream);

        let mut single = FrameBuffer::new();
        let mut got = Vec::new();
        for byte in &stream {
            got.extend(single.push(std::slice::from_ref(byte)));
        }

        assert_eq!(got, expected);
        assert!(single.is_empty());
    }

    #[test]
    fn test_arbitrary_split_points() {
        let frames = sample_frames();
        let stream = stream_of(&frames);

        for cut in 1..stream.len() {
            let mut buf = FrameBuffer::new();
            let mut got = buf.push(&stream[..cut]);
            got.extend(buf.push(&stream[cut..]));
            assert_eq!(frames_only(got), frames, "cut at {cut}");
        }
    }

    #[test]
    fn test_leading_garbage_skipped() {
        let frames = sample_frames();
        let mut stream = vec![0xFF, 0xFF, 0x00, 0x13];
        stream.extend(stream_of(&frames[..1]));

        let mut buf = FrameBuffer::new();
        assert_eq!(frames_only(buf.push(&stream)), frames[..1].to_vec());
        assert_eq!(buf.discarded(), 4);
    }

    #[test]
    fn test_bad_length_resyncs() {
        let frames = sample_frames();
        // marker followed by a length of 3, then a real frame
        let mut stream = vec![START_BYTE, 0x03, 0x00, 0x00, 0x00];
        stream.extend(stream_of(&frames[..1]));

        let mut buf = FrameBuffer::new();
        assert_eq!(frames_only(buf.push(&stream)), frames[..1].to_vec());
    }

    #[test]
    fn test_checksum_error_reports_header_and_continues() {
        let frames = sample_frames();
        let mut first = frames[0].encode().unwrap().to_vec();
        let last = first.len() - 1;
        first[last] ^= 0xFF;

        let mut stream = first;
        stream.extend(stream_of(&frames[1..2]));

        let mut buf = FrameBuffer::new();
        let out = buf.push(&stream);
        assert_eq!(out.len(), 2);

        match &out[0] {
            Inbound::Corrupt { header, error } => {
                assert!(matches!(error, XcomError::Checksum { .. }));
                let header = header.as_ref().unwrap();
                assert_eq!(header.object_id, 3000);
                assert_eq!(header.src, 101);
            },
            other => panic!("expected corrupt frame, got {other:?}"),
        }
        assert_eq!(out[1], Inbound::Frame(frames[1].clone()));
    }

    #[test]
    fn test_marker_inside_corrupt_body_does_not_stall() {
        let frames = sample_frames();
        let read = Frame::read_request(1, 101, ObjectType::Info, 3000, PropertyId::Value);
        // payload holds a marker with a plausible 1024-byte length
        let damaged = read.response(ServiceId::Read, vec![START_BYTE, 0x00, 0x04, 0x00, 0x00]);
        let mut first = damaged.encode().unwrap().to_vec();
        let last = first.len() - 1;
        first[last] ^= 0xFF;
        let corrupt_len = first.len();

        let mut stream = first;
        stream.extend(stream_of(&frames[1..2]));

        let mut buf = FrameBuffer::new();
        let out = buf.push(&stream);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Inbound::Corrupt { header: Some(_), .. }));
        assert_eq!(out[1], Inbound::Frame(frames[1].clone()));
        assert!(buf.is_empty());
        assert_eq!(buf.discarded(), corrupt_len as u64);
    }

    #[test]
    fn test_pure_garbage_is_dropped() {
        let mut buf = FrameBuffer::new();
        assert!(buf.push(&[0x01, 0x02, 0x03]).is_empty());
        assert!(buf.is_empty());
        assert_eq!(buf.discarded(), 3);
    }
}
