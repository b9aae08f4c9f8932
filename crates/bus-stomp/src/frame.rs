//! STOMP 1.2 frame codec.
//!
//! # Wire Format
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! ...\n
//! \n
//! body\0
//! ```
//!
//! Frames with a `content-length` header may carry NUL bytes in the body;
//! without it the body ends at the first NUL. Header names and values escape
//! `\`, newline, carriage return and `:` per the STOMP 1.2 specification.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Errors from frame parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("frame not terminated with NUL")]
    MissingTerminator,

    #[error("frame is not valid UTF-8 where it must be")]
    InvalidUtf8,
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// First value of a header, unescaped.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to wire bytes. A `content-length` header is always added so
    /// binary bodies survive.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            out.extend_from_slice(escape(name).as_bytes());
            out.push(b':');
            out.extend_from_slice(escape(value).as_bytes());
            out.push(b'\n');
        }
        out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(FrameError::MalformedHeader(format!(
                    "bad escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Try to parse one frame from the front of `buf`. Returns `None` when more
/// bytes are needed; consumed bytes are removed from the buffer only when a
/// full frame was read.
pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    // Heartbeats are bare newlines between frames.
    let mut start = 0;
    while start < buf.len() && (buf[start] == b'\n' || buf[start] == b'\r') {
        start += 1;
    }

    let Some(head_end) = find_double_newline(&buf[start..]) else {
        return Ok(None);
    };
    let head_end = start + head_end;

    let head =
        std::str::from_utf8(&buf[start..head_end]).map_err(|_| FrameError::InvalidUtf8)?;
    let mut lines = head.split('\n').map(|l| l.trim_end_matches('\r'));
    let command = match lines.next() {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => return Err(FrameError::MalformedHeader("empty command".into())),
    };

    let mut headers = Vec::new();
    let mut content_length: Option<usize> = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        let name = unescape(name)?;
        let value = unescape(value)?;
        if name == "content-length" {
            content_length = Some(
                value
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(value.clone()))?,
            );
        }
        headers.push((name, value));
    }

    // head_end points at the first of the two newlines; the body starts after
    // the blank line.
    let body_start = head_end + blank_line_width(&buf[head_end..]);

    let (body, frame_end) = match content_length {
        Some(len) => {
            if buf.len() < body_start + len + 1 {
                return Ok(None);
            }
            if buf[body_start + len] != 0 {
                return Err(FrameError::MissingTerminator);
            }
            (buf[body_start..body_start + len].to_vec(), body_start + len + 1)
        }
        None => {
            let Some(nul) = buf[body_start..].iter().position(|&b| b == 0) else {
                return Ok(None);
            };
            (
                buf[body_start..body_start + nul].to_vec(),
                body_start + nul + 1,
            )
        }
    };

    buf.advance(frame_end);
    Ok(Some(Frame {
        command,
        headers,
        body,
    }))
}

/// Position of the first `\n\n` (or `\r\n\r\n` mix) ending the header block,
/// relative to the slice start. Points at the newline ending the last header
/// line.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            let mut j = i + 1;
            if j < buf.len() && buf[j] == b'\r' {
                j += 1;
            }
            if j < buf.len() && buf[j] == b'\n' {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Width of the `\n[\r]\n` blank-line sequence starting at `buf[0]`.
fn blank_line_width(buf: &[u8]) -> usize {
    let mut width = 1; // the newline ending the last header line
    if buf.len() > width && buf[width] == b'\r' {
        width += 1;
    }
    width + 1 // the blank line's own newline
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::from(&frame.encode()[..]);
        let parsed = parse(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        parsed
    }

    #[test]
    fn encode_parse_roundtrip() {
        let frame = Frame::new("SEND")
            .header("destination", "/queue/fts.q.worker")
            .header("persistent", "true")
            .body(b"{\"state\":\"READY\"}".to_vec());
        let parsed = roundtrip(frame.clone());
        assert_eq!(parsed.command, "SEND");
        assert_eq!(parsed.get("destination"), Some("/queue/fts.q.worker"));
        assert_eq!(parsed.body, frame.body);
    }

    #[test]
    fn header_escaping() {
        let frame = Frame::new("SEND").header("weird", "a:b\nc\\d");
        let parsed = roundtrip(frame);
        assert_eq!(parsed.get("weird"), Some("a:b\nc\\d"));
    }

    #[test]
    fn binary_body_with_content_length() {
        let frame = Frame::new("SEND").body(vec![0, 1, 2, 0, 3]);
        let parsed = roundtrip(frame);
        assert_eq!(parsed.body, vec![0, 1, 2, 0, 3]);
    }

    #[test]
    fn partial_frame_needs_more_bytes() {
        let encoded = Frame::new("CONNECTED").header("version", "1.2").encode();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert_eq!(parse(&mut buf).unwrap(), None);
        // The partial bytes stay in the buffer.
        assert_eq!(buf.len(), encoded.len() - 3);
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut bytes = Frame::new("RECEIPT").header("receipt-id", "r-1").encode();
        bytes.extend(Frame::new("RECEIPT").header("receipt-id", "r-2").encode());
        let mut buf = BytesMut::from(&bytes[..]);

        let first = parse(&mut buf).unwrap().unwrap();
        let second = parse(&mut buf).unwrap().unwrap();
        assert_eq!(first.get("receipt-id"), Some("r-1"));
        assert_eq!(second.get("receipt-id"), Some("r-2"));
        assert!(buf.is_empty());
    }

    #[test]
    fn skips_heartbeat_newlines() {
        let mut bytes = vec![b'\n', b'\n'];
        bytes.extend(Frame::new("MESSAGE").header("subscription", "0").encode());
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, "MESSAGE");
    }

    #[test]
    fn garbage_header_is_an_error() {
        let mut buf = BytesMut::from(&b"SEND\nnocolon\n\nbody\0"[..]);
        assert!(matches!(
            parse(&mut buf),
            Err(FrameError::MalformedHeader(_))
        ));
    }
}
