//! Message framing layer
//!
//! Handles Content-Length framing as used by the Language Server Protocol
//! wire format:
//!
//! `Content-Length: <length>\r\n\r\n<content>`
//!
//! The header is ASCII; the body is a UTF-8 JSON document of exactly
//! `<length>` bytes. The same framing is spoken in both directions.

use tracing::trace;

/// Header terminator shared with the peer process. Wire invariant, not
/// configurable.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed representation of a message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Body length in bytes. Zero means "no frame yet": an absent or
    /// malformed Content-Length field is not an error, callers keep
    /// waiting for more input instead.
    pub content_length: usize,
}

/// Parse a header block from its ASCII text
///
/// Splits the text into lines and each line at the first `:`. The value is
/// whitespace-trimmed; the `Content-Length` field name match is
/// case-sensitive; unknown fields are ignored. A missing or non-numeric
/// value leaves `content_length` at 0.
pub fn parse_header(text: &str) -> Header {
    let mut content_length = 0;

    for line in text.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name == "Content-Length" {
                content_length = value.trim().parse().unwrap_or(content_length);
            }
        }
    }

    Header { content_length }
}

/// Render the header block for a body of `content_length` bytes
pub fn render_header(content_length: usize) -> String {
    format!("Content-Length: {content_length}\r\n\r\n")
}

/// Frame a message body for the wire: rendered header followed by the body,
/// concatenated so the transport can submit it as a single ordered write
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = render_header(body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Incremental frame extractor over an arbitrarily-chunked byte stream
///
/// Chunks are appended with [`FrameBuffer::extend`]; complete bodies are
/// pulled out with [`FrameBuffer::next_frame`] until it returns `None`. A
/// single appended chunk may complete zero, one, or several frames. A frame
/// is never emitted before its full byte count has arrived.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    /// Create an empty frame buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a newly received chunk
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Try to extract the next complete frame body
    ///
    /// Returns `None` when the buffer does not yet hold a complete
    /// header+body pair; the buffered bytes are retained and the header is
    /// re-derived from them on the next call rather than cached.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let terminator_at = find_terminator(&self.buffer)?;

        let header_text = String::from_utf8_lossy(&self.buffer[..terminator_at]);
        let header = parse_header(&header_text);

        // Malformed or empty header: keep waiting for further input. Known
        // soft failure, never a hard error.
        if header.content_length == 0 {
            return None;
        }

        let body_start = terminator_at + HEADER_TERMINATOR.len();
        let available = self.buffer.len() - body_start;

        if available < header.content_length {
            trace!(
                "FrameBuffer: incomplete body, need {} more bytes",
                header.content_length - available
            );
            return None;
        }

        let body_end = body_start + header.content_length;
        let frame = self.buffer[body_start..body_end].to_vec();

        if available == header.content_length {
            self.buffer.clear();
        } else {
            // Excess bytes belong to the next frame(s); retain them
            self.buffer.drain(..body_end);
        }

        trace!("FrameBuffer: extracted frame ({} bytes)", frame.len());
        Some(frame)
    }

    /// Number of buffered bytes not yet emitted as a frame
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Locate the first header terminator occurrence
fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &str) -> Vec<u8> {
        encode_frame(body.as_bytes())
    }

    #[test]
    fn test_header_roundtrip() {
        for n in [0usize, 1, 2, 10, 127, 1024, 65535, 10_000_000] {
            let rendered = render_header(n);
            assert_eq!(parse_header(&rendered).content_length, n);
        }
    }

    #[test]
    fn test_render_header_exact_bytes() {
        assert_eq!(render_header(42), "Content-Length: 42\r\n\r\n");
    }

    #[test]
    fn test_parse_header_ignores_unknown_fields() {
        let header = parse_header("Content-Type: application/json\r\nContent-Length: 17\r\n");
        assert_eq!(header.content_length, 17);
    }

    #[test]
    fn test_parse_header_is_case_sensitive() {
        assert_eq!(parse_header("content-length: 17\r\n").content_length, 0);
    }

    #[test]
    fn test_parse_header_non_numeric_value() {
        assert_eq!(parse_header("Content-Length: banana\r\n").content_length, 0);
    }

    #[test]
    fn test_parse_header_missing_field() {
        assert_eq!(parse_header("X-Whatever: 3\r\n").content_length, 0);
    }

    #[test]
    fn test_single_frame_exact_fit() {
        let mut buf = FrameBuffer::new();
        buf.extend(&framed(r#"{"id":"1"}"#));

        assert_eq!(buf.next_frame().unwrap(), br#"{"id":"1"}"#);
        assert_eq!(buf.pending_len(), 0);
        assert!(buf.next_frame().is_none());
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let body1 = r#"{"id":"1","result":{}}"#;
        let body2 = r#"{"method":"note","params":{}}"#;

        let mut chunk = framed(body1);
        chunk.extend(framed(body2));

        let mut buf = FrameBuffer::new();
        buf.extend(&chunk);

        assert_eq!(buf.next_frame().unwrap(), body1.as_bytes());
        assert_eq!(buf.next_frame().unwrap(), body2.as_bytes());
        assert!(buf.next_frame().is_none());
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_partial_delivery_across_three_chunks() {
        let body = r#"{"jsonrpc":"2.0","id":"7","result":{"ok":true}}"#;
        let wire = framed(body);

        // Split mid-header and mid-body
        let mut buf = FrameBuffer::new();
        buf.extend(&wire[..9]);
        assert!(buf.next_frame().is_none());

        buf.extend(&wire[9..30]);
        assert!(buf.next_frame().is_none());

        buf.extend(&wire[30..]);
        assert_eq!(buf.next_frame().unwrap(), body.as_bytes());
        assert!(buf.next_frame().is_none());
    }

    #[test]
    fn test_no_terminator_waits() {
        let mut buf = FrameBuffer::new();
        buf.extend(b"Content-Length: 10\r\n");
        assert!(buf.next_frame().is_none());
        assert_eq!(buf.pending_len(), 20);
    }

    #[test]
    fn test_zero_content_length_waits() {
        let mut buf = FrameBuffer::new();
        buf.extend(b"Content-Length: 0\r\n\r\n");
        assert!(buf.next_frame().is_none());
    }

    #[test]
    fn test_frame_plus_partial_retains_remainder() {
        let body1 = r#"{"id":"1"}"#;
        let body2 = r#"{"id":"2"}"#;

        let mut chunk = framed(body1);
        let second = framed(body2);
        chunk.extend(&second[..second.len() - 4]);

        let mut buf = FrameBuffer::new();
        buf.extend(&chunk);

        assert_eq!(buf.next_frame().unwrap(), body1.as_bytes());
        assert!(buf.next_frame().is_none());

        buf.extend(&second[second.len() - 4..]);
        assert_eq!(buf.next_frame().unwrap(), body2.as_bytes());
    }

    #[test]
    fn test_multibyte_utf8_body_counted_in_bytes() {
        let body = r#"{"msg":"héllo wörld"}"#;
        let mut buf = FrameBuffer::new();
        buf.extend(&encode_frame(body.as_bytes()));

        assert_eq!(buf.next_frame().unwrap(), body.as_bytes());
    }
}
