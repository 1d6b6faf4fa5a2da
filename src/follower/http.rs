//! HTTP/1.x header framing: the `http`, `http_length` and `http_chunked`
//! states (spec.md §4.3).
//!
//! Deliberately hand-rolled rather than built on a header-parsing crate —
//! the point of this module is the framing state machine itself, and
//! `httparse` would parse exactly the part spec.md asks us to parse by hand.

use std::io::Write;

use super::decode::Decoder;
use super::{FatalFollowerError, Follower, ParserState, StepOutcome};

/// What state to return to once the current body has been fully consumed.
#[derive(Debug, Clone, Copy)]
pub enum PostBodyState {
    Http,
    Eof,
}

impl PostBodyState {
    /// spec.md §4.3: `http` if a `Connection: keep-alive` header is present
    /// (case-insensitive), `eof` otherwise — a strict binary, not an
    /// HTTP-version-aware default.
    fn from_connection_header(header_block: &[u8]) -> PostBodyState {
        match get_header(header_block, "connection") {
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => PostBodyState::Http,
            _ => PostBodyState::Eof,
        }
    }

    fn into_state(self) -> ParserState {
        match self {
            PostBodyState::Http => ParserState::Http,
            PostBodyState::Eof => ParserState::Eof,
        }
    }
}

pub struct LengthState {
    header_block: Vec<u8>,
    status: String,
    remaining: usize,
    decoder: Decoder,
    post_body: PostBodyState,
}

pub struct ChunkedState {
    header_block: Vec<u8>,
    status: String,
    decoder: Decoder,
    post_body: PostBodyState,
    acc: Vec<u8>,
}

/// Scan for the blank line ending a header block, tolerant of bare `\n` as
/// well as `\r\n` on either line of the pair (spec.md §4.3). Returns the
/// index one past the end of the blank line.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let mut newline_run = 0;
    for (i, &b) in buf.iter().enumerate() {
        match b {
            b'\r' => {}
            b'\n' => {
                newline_run += 1;
                if newline_run == 2 {
                    return Some(i + 1);
                }
            }
            _ => newline_run = 0,
        }
    }
    None
}

/// Case-insensitive header lookup tolerant of horizontal whitespace around
/// the colon. Skips the first line (the request/status line).
fn get_header<'a>(header_block: &'a [u8], name: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(header_block).ok()?;
    for line in text.split("\n").skip(1) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim());
        }
    }
    None
}

/// The request/status line, i.e. the first line of the header block, with
/// its line ending stripped (spec.md §4.3 "stash ... the first header line
/// as 'status'").
fn status_line(header_block: &[u8]) -> String {
    let text = String::from_utf8_lossy(header_block);
    text.lines().next().unwrap_or("").to_string()
}

fn is_websocket_upgrade(header_block: &[u8]) -> bool {
    let upgrade_is_ws = get_header(header_block, "upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_has_upgrade = get_header(header_block, "connection")
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    upgrade_is_ws && connection_has_upgrade
}

impl<W: Write> Follower<W> {
    pub(super) fn step_http(&mut self) -> Result<StepOutcome, FatalFollowerError> {
        let end = match find_header_end(&self.buffer) {
            Some(e) => e,
            None => {
                self.state = ParserState::Http;
                return Ok(StepOutcome::NeedMoreData);
            }
        };
        let header_block: Vec<u8> = self.buffer.drain(..end).collect();

        if is_websocket_upgrade(&header_block) {
            self.event("websocket upgrade", header_block, Vec::new());
            self.state = ParserState::Websocket(super::WsState::default());
            return Ok(StepOutcome::Consumed);
        }

        let decoder = Decoder::from_content_encoding(get_header(&header_block, "content-encoding"));
        let post_body = PostBodyState::from_connection_header(&header_block);
        let status = status_line(&header_block);

        if let Some(len) = get_header(&header_block, "content-length") {
            let len: usize = len.trim().parse().map_err(|_| {
                FatalFollowerError(format!("invalid content-length: {len}"))
            })?;
            self.event(format!("content-length: {len}"), header_block.clone(), Vec::new());
            self.state = ParserState::HttpLength(LengthState {
                header_block,
                status,
                remaining: len,
                decoder,
                post_body,
            });
            return Ok(StepOutcome::Consumed);
        }

        if get_header(&header_block, "transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            self.event("transfer-encoding: chunked", header_block.clone(), Vec::new());
            self.state = ParserState::HttpChunked(ChunkedState {
                header_block,
                status,
                decoder,
                post_body,
                acc: Vec::new(),
            });
            return Ok(StepOutcome::Consumed);
        }

        self.event(status, header_block, Vec::new());
        self.state = post_body.into_state();
        Ok(StepOutcome::Consumed)
    }

    /// Waits until the buffer holds the full declared body (spec.md §4.3):
    /// bytes are left untouched in `self.buffer` while incomplete, so a
    /// connection that drops mid-body leaves them as the residual bytes
    /// `close()` reports in an `unexpected EOF` event (spec.md §4.5, §8).
    pub(super) fn step_http_length(
        &mut self,
        s: LengthState,
    ) -> Result<StepOutcome, FatalFollowerError> {
        if self.buffer.len() < s.remaining {
            self.state = ParserState::HttpLength(s);
            return Ok(StepOutcome::NeedMoreData);
        }

        let raw: Vec<u8> = self.buffer.drain(..s.remaining).collect();
        let body = s.decoder.decode(&raw);
        self.event(s.status, s.header_block, body);
        self.state = s.post_body.into_state();
        Ok(StepOutcome::Consumed)
    }

    pub(super) fn step_http_chunked(
        &mut self,
        mut s: ChunkedState,
    ) -> Result<StepOutcome, FatalFollowerError> {
        let line_end = match self.buffer.windows(2).position(|w| w == b"\r\n") {
            Some(i) => i + 2,
            None => match self.buffer.iter().position(|&b| b == b'\n') {
                Some(i) => i + 1,
                None => {
                    self.state = ParserState::HttpChunked(s);
                    return Ok(StepOutcome::NeedMoreData);
                }
            },
        };
        let size_line = std::str::from_utf8(&self.buffer[..line_end])
            .map_err(|_| FatalFollowerError("non-utf8 chunk size line".into()))?
            .trim();
        let size_text = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| FatalFollowerError(format!("invalid chunk size: {size_text}")))?;

        let needed = line_end + size + 2;
        if self.buffer.len() < needed {
            self.state = ParserState::HttpChunked(s);
            return Ok(StepOutcome::NeedMoreData);
        }

        self.buffer.drain(..line_end);
        let chunk: Vec<u8> = self.buffer.drain(..size).collect();
        self.buffer.drain(..2); // trailing CRLF

        if size == 0 {
            s.acc.extend(chunk);
            let body = s.decoder.decode(&s.acc);
            let post_body = s.post_body;
            self.event(s.status, s.header_block, body);
            self.state = post_body.into_state();
        } else {
            s.acc.extend(chunk);
            self.state = ParserState::HttpChunked(s);
        }
        Ok(StepOutcome::Consumed)
    }
}
