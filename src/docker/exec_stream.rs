// ABOUTME: Demultiplexer for the runtime's exec stream framing: 8-byte header
// (stream id, three zero bytes, u32 big-endian payload length), then payload

use bytes::{Buf, Bytes, BytesMut};

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn from_byte(b: u8) -> StreamKind {
        match b {
            0 => StreamKind::Stdin,
            2 => StreamKind::Stderr,
            // Channel 1, and anything the runtime invents, surfaces as stdout.
            _ => StreamKind::Stdout,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub data: Bytes,
}

/// Incremental frame parser. Chunks may split a frame anywhere, including
/// mid-header; whatever does not yet form a complete frame stays buffered
/// until the next feed.
#[derive(Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let kind = StreamKind::from_byte(self.buf[0]);
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < HEADER_LEN + len {
                break;
            }
            self.buf.advance(HEADER_LEN);
            let data = self.buf.split_to(len).freeze();
            frames.push(Frame { kind, data });
        }
        frames
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Wrap a payload in the wire framing. Used by the runtime adapter to
/// normalize its output and by test doubles to fabricate streams.
pub fn encode_frame(kind: StreamKind, data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + data.len());
    out.extend_from_slice(&[kind.as_byte(), 0, 0, 0]);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame(kind: StreamKind, data: &[u8]) -> Frame {
        Frame {
            kind,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn parses_a_whole_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(&encode_frame(StreamKind::Stdout, b"hello"));
        assert_eq!(frames, vec![frame(StreamKind::Stdout, b"hello")]);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn preserves_frame_split_mid_header() {
        let mut parser = FrameParser::new();
        let encoded = encode_frame(StreamKind::Stderr, b"oops");
        assert!(parser.feed(&encoded[..3]).is_empty());
        assert!(parser.feed(&encoded[3..6]).is_empty());
        let frames = parser.feed(&encoded[6..]);
        assert_eq!(frames, vec![frame(StreamKind::Stderr, b"oops")]);
    }

    #[test]
    fn preserves_frame_split_mid_payload() {
        let mut parser = FrameParser::new();
        let encoded = encode_frame(StreamKind::Stdout, b"split payload");
        let cut = HEADER_LEN + 5;
        assert!(parser.feed(&encoded[..cut]).is_empty());
        let frames = parser.feed(&encoded[cut..]);
        assert_eq!(frames, vec![frame(StreamKind::Stdout, b"split payload")]);
    }

    #[test]
    fn drains_multiple_frames_from_one_chunk() {
        let mut parser = FrameParser::new();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&encode_frame(StreamKind::Stdout, b"one"));
        chunk.extend_from_slice(&encode_frame(StreamKind::Stderr, b"two"));
        chunk.extend_from_slice(&encode_frame(StreamKind::Stdout, b""));
        let frames = parser.feed(&chunk);
        assert_eq!(
            frames,
            vec![
                frame(StreamKind::Stdout, b"one"),
                frame(StreamKind::Stderr, b"two"),
                frame(StreamKind::Stdout, b""),
            ]
        );
    }

    #[test]
    fn carries_tail_across_chunks() {
        let mut parser = FrameParser::new();
        let first = encode_frame(StreamKind::Stdout, b"complete");
        let second = encode_frame(StreamKind::Stdout, b"tail");
        let mut chunk = first.to_vec();
        chunk.extend_from_slice(&second[..2]);
        let frames = parser.feed(&chunk);
        assert_eq!(frames, vec![frame(StreamKind::Stdout, b"complete")]);
        assert_eq!(parser.pending(), 2);
        let frames = parser.feed(&second[2..]);
        assert_eq!(frames, vec![frame(StreamKind::Stdout, b"tail")]);
    }

    #[test]
    fn unknown_channel_surfaces_as_stdout() {
        let mut encoded = encode_frame(StreamKind::Stdout, b"x").to_vec();
        encoded[0] = 9;
        let mut parser = FrameParser::new();
        let frames = parser.feed(&encoded);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
    }
}
