//! Line/multi-line/binary framing over a client connection.
//!
//! Grounded on `HandleConnection`/`WriteString`/`SendMultiLines` in
//! `examples/original_source/src/pvdd.c`: a 4 KiB read buffer feeding a
//! growable line buffer, with the binary prefix length encoded in the
//! daemon host's native byte order there. spec.md 9 asks implementations to
//! declare and enforce network byte order instead, so `BinaryFrame`'s length
//! prefix below is big-endian.

use tracing::{trace, warn};

use crate::MAX_MSG_SIZE;

pub const BEGIN_MULTILINE: &str = "BEGIN_MULTILINE";
pub const END_MULTILINE: &str = "END_MULTILINE";

const READ_BUFFER_SIZE: usize = 4096;

/// The three connection modes a client can be in. Promotion is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    General,
    Binary,
    Control,
}

/// Internal reader state machine, driven one read-buffer-full at a time.
#[derive(Debug, Default)]
enum ReaderState {
    #[default]
    Idle,
    InMultiLine(String),
}

/// Accumulates bytes from a socket and yields complete frames (single lines,
/// or the concatenated body of a `BEGIN_MULTILINE`/`END_MULTILINE` section).
#[derive(Debug, Default)]
pub struct FrameReader {
    state: ReaderState,
    pending: Vec<u8>,
}

/// A decoded inbound frame: either a plain line or a multi-line body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    MultiLine(String),
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds freshly-read bytes in and returns any frames now complete.
    /// Incomplete trailing data is retained for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            let Some(pos) = self.pending.iter().position(|&b| b == b'\n') else {
                if self.pending.len() > MAX_MSG_SIZE {
                    warn!(
                        "dropping unterminated line exceeding {MAX_MSG_SIZE} bytes ({} buffered)",
                        self.pending.len()
                    );
                    self.pending.clear();
                }
                break;
            };
            let line_bytes: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).into_owned();
            let line = line.trim_end_matches('\r').to_string();
            self.handle_line(line, &mut frames);
        }
        frames
    }

    fn handle_line(&mut self, line: String, frames: &mut Vec<Frame>) {
        match &mut self.state {
            ReaderState::Idle => {
                if line == BEGIN_MULTILINE {
                    trace!("entering multi-line section");
                    self.state = ReaderState::InMultiLine(String::new());
                } else {
                    frames.push(Frame::Line(line));
                }
            }
            ReaderState::InMultiLine(buf) => {
                if line == BEGIN_MULTILINE {
                    // A missed END_MULTILINE: discard and restart, per
                    // spec.md 4.1.
                    trace!("nested BEGIN_MULTILINE seen, discarding prior accumulator");
                    *buf = String::new();
                } else if line == END_MULTILINE {
                    let body = std::mem::take(buf);
                    self.state = ReaderState::Idle;
                    frames.push(Frame::MultiLine(body));
                } else {
                    if !buf.is_empty() {
                        buf.push('\n');
                    }
                    buf.push_str(&line);
                    if buf.len() > MAX_MSG_SIZE {
                        warn!("multi-line body exceeded {MAX_MSG_SIZE} bytes, discarding");
                        self.state = ReaderState::Idle;
                    }
                }
            }
        }
    }

    pub fn read_buffer_size() -> usize {
        READ_BUFFER_SIZE
    }
}

/// Serializes a payload for sending to a client in the given mode.
///
/// `GENERAL`/`CONTROL` connections get the payload written as-is (single
/// line) or sandwiched in `BEGIN_MULTILINE`/`END_MULTILINE` (multi-line).
/// `BINARY` connections get a 4-byte big-endian length prefix with no
/// sentinel lines.
pub fn encode_outbound(mode: ConnectionMode, payload: &str, multiline: bool) -> Vec<u8> {
    match mode {
        ConnectionMode::Binary => {
            let mut out = Vec::with_capacity(payload.len() + 4);
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(payload.as_bytes());
            out
        }
        ConnectionMode::General | ConnectionMode::Control => {
            let mut out = String::new();
            if multiline {
                out.push_str(BEGIN_MULTILINE);
                out.push('\n');
                out.push_str(payload);
                if !payload.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(END_MULTILINE);
                out.push('\n');
            } else {
                out.push_str(payload);
                if !payload.ends_with('\n') {
                    out.push('\n');
                }
            }
            out.into_bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_frames_dispatch_immediately() {
        let mut reader = FrameReader::new();
        let frames = reader.feed(b"GET_LIST\n");
        assert_eq!(frames, vec![Frame::Line("GET_LIST".to_string())]);
    }

    #[test]
    fn multiline_concatenates_with_newlines() {
        let mut reader = FrameReader::new();
        let frames = reader.feed(b"BEGIN_MULTILINE\nline one\nline two\nEND_MULTILINE\n");
        assert_eq!(
            frames,
            vec![Frame::MultiLine("line one\nline two".to_string())]
        );
    }

    #[test]
    fn missed_close_is_recovered_by_fresh_begin() {
        let mut reader = FrameReader::new();
        let frames = reader.feed(b"BEGIN_MULTILINE\nstale\nBEGIN_MULTILINE\nfresh\nEND_MULTILINE\n");
        assert_eq!(frames, vec![Frame::MultiLine("fresh".to_string())]);
    }

    #[test]
    fn partial_reads_are_buffered_until_newline() {
        let mut reader = FrameReader::new();
        assert!(reader.feed(b"GET_L").is_empty());
        let frames = reader.feed(b"IST\n");
        assert_eq!(frames, vec![Frame::Line("GET_LIST".to_string())]);
    }

    #[test]
    fn oversized_unterminated_line_is_dropped() {
        let mut reader = FrameReader::new();
        let garbage = vec![b'a'; MAX_MSG_SIZE + 1];
        assert!(reader.feed(&garbage).is_empty());
        // The buffer was discarded; a fresh line still frames normally.
        let frames = reader.feed(b"GET_LIST\n");
        assert_eq!(frames, vec![Frame::Line("GET_LIST".to_string())]);
    }

    #[test]
    fn binary_frame_prefix_matches_payload_length() {
        let encoded = encode_outbound(ConnectionMode::Binary, "ATTRIBUTES foo\n{}\n", false);
        let len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - 4);
    }
}
