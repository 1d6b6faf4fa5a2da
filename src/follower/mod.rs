//! # Follower
//!
//! One `Follower` per direction per connection (spec.md §2, §3). Owns the
//! accumulated-but-unparsed byte buffer, the current parser state (with its
//! per-state scratch data), and the begin/end timestamps of the event
//! currently being assembled.
//!
//! The state machine (spec.md §4.3, §4.4) is expressed as a Rust enum
//! (`ParserState`) dispatched on by `Follower::step`, rather than a table of
//! closures keyed by string — the enum-plus-match is the idiomatic Rust
//! rendition of the "state table keyed by name" design note in spec.md §9;
//! `ParserState::name()` still gives every state the string identity the
//! trace format requires.

mod decode;
mod http;
mod ws;

pub use decode::Decoder;
pub use ws::WsState;

use std::cell::RefCell;
use std::io::Write;
use std::rc::{Rc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::timer::TimerSet;
use crate::trace::{Event, TraceWriter};

/// `up` = client→server, `down` = server→client (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Per-state scratch data (spec.md §3, §9): fields are mutually exclusive by
/// state, which a Rust enum expresses directly.
pub enum ParserState {
    Http,
    HttpLength(http::LengthState),
    HttpChunked(http::ChunkedState),
    Websocket(WsState),
    Eof,
    Closed,
}

impl ParserState {
    pub fn name(&self) -> &'static str {
        match self {
            ParserState::Http => "http",
            ParserState::HttpLength(_) => "http_length",
            ParserState::HttpChunked(_) => "http_chunked",
            ParserState::Websocket(_) => "websocket",
            ParserState::Eof => "eof",
            ParserState::Closed => "closed",
        }
    }
}

/// An invariant violation (spec.md §7): data arriving in the `closed`
/// state. Fatal to the owning connection, not to the process.
#[derive(Debug)]
pub struct FatalFollowerError(pub String);

pub(crate) enum StepOutcome {
    /// Buffer left untouched (or only begin-times updated); stop driving.
    NeedMoreData,
    /// A prefix was consumed; the state may or may not have changed name.
    Consumed,
}

/// Generic over the trace sink so tests can inspect emitted events directly
/// instead of capturing real stdout; production code always instantiates
/// `Follower<std::io::Stdout>`.
pub struct Follower<W: Write = std::io::Stdout> {
    trace: Rc<RefCell<TraceWriter<W>>>,
    timers: Rc<RefCell<TimerSet>>,
    conn_id: i64,
    direction: Direction,
    peer: Weak<RefCell<Follower<W>>>,
    state: ParserState,
    buffer: Vec<u8>,
    begin: Option<f64>,
    end: Option<f64>,
}

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX_EPOCH")
        .as_secs_f64()
}

impl<W: Write> Follower<W> {
    pub fn new(
        trace: Rc<RefCell<TraceWriter<W>>>,
        timers: Rc<RefCell<TimerSet>>,
        conn_id: i64,
        direction: Direction,
    ) -> Rc<RefCell<Follower<W>>> {
        Rc::new(RefCell::new(Follower {
            trace,
            timers,
            conn_id,
            direction,
            peer: Weak::new(),
            state: ParserState::Http,
            buffer: Vec::new(),
            begin: None,
            end: None,
        }))
    }

    /// Cross-pair two followers of the same connection. Never an ownership
    /// edge (spec.md §9) — each side only ever inspects the other's state.
    pub fn pair(a: &Rc<RefCell<Follower<W>>>, b: &Rc<RefCell<Follower<W>>>) {
        a.borrow_mut().peer = Rc::downgrade(b);
        b.borrow_mut().peer = Rc::downgrade(a);
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ParserState::Closed)
    }

    /// Read-only view of whichever follower this one is paired with, if any.
    pub fn peer_state_name(&self) -> Option<&'static str> {
        self.peer.upgrade().map(|p| p.borrow().state_name())
    }

    /// Sets the begin-timestamp (if unset) and updates the end-timestamp to
    /// now, without consuming bytes (spec.md §4.5).
    pub fn ping(&mut self) {
        let now = now_secs();
        if self.begin.is_none() {
            self.begin = Some(now);
        }
        self.end = Some(now);
    }

    /// Feed newly-received bytes and drive the state machine until it can
    /// make no further progress (spec.md §4.5).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), FatalFollowerError> {
        if self.is_closed() {
            log::error!(
                "conn {} {}: data arrived after close, aborting connection",
                self.conn_id,
                self.direction.as_str()
            );
            return Err(FatalFollowerError("data after closed".into()));
        }

        self.ping();
        self.buffer.extend_from_slice(bytes);

        let timers = self.timers.clone();
        loop {
            let before = self.state.name();
            timers.borrow_mut().parse.start();
            let r = self.step();
            timers.borrow_mut().parse.stop();
            let outcome = r?;
            match outcome {
                StepOutcome::NeedMoreData => break,
                StepOutcome::Consumed => {
                    if self.state.name() != before {
                        // a transition just happened: collapse the pending
                        // timeframe onto "now" (spec.md §4.5).
                        self.begin = self.end;
                    }
                    if self.buffer.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn step(&mut self) -> Result<StepOutcome, FatalFollowerError> {
        match std::mem::replace(&mut self.state, ParserState::Closed) {
            ParserState::Http => self.step_http(),
            ParserState::HttpLength(s) => self.step_http_length(s),
            ParserState::HttpChunked(s) => self.step_http_chunked(s),
            ParserState::Websocket(s) => self.step_websocket(s),
            ParserState::Eof => self.step_eof(),
            ParserState::Closed => Err(FatalFollowerError("data in closed state".into())),
        }
    }

    fn step_eof(&mut self) -> Result<StepOutcome, FatalFollowerError> {
        if !self.buffer.is_empty() {
            log::warn!(
                "conn {} {}: {} bytes arrived after eof, discarding",
                self.conn_id,
                self.direction.as_str(),
                self.buffer.len()
            );
            self.buffer.clear();
        }
        self.state = ParserState::Eof;
        Ok(StepOutcome::NeedMoreData)
    }

    /// Write a trace row using the follower's own begin/end timestamps.
    pub fn event(&mut self, notes: impl Into<String>, headings: Vec<u8>, body: Vec<u8>) {
        let begin = self.begin.unwrap_or_else(now_secs);
        let end = self.end.unwrap_or(begin);
        self.event_at(notes, headings, body, begin, end);
    }

    /// Write a trace row with explicit timestamps (used by the WebSocket
    /// reassembler, which tracks two independent begin-times; spec.md §4.4).
    pub fn event_at(
        &mut self,
        notes: impl Into<String>,
        headings: Vec<u8>,
        body: Vec<u8>,
        begin: f64,
        end: f64,
    ) {
        let ev = Event {
            begin,
            end,
            conn_id: self.conn_id,
            direction: self.direction,
            state: self.state.name(),
            notes: notes.into(),
            headings,
            body,
        };
        let timers = self.timers.clone();
        let mut t = timers.borrow_mut();
        t.trace_write.start();
        if let Err(e) = self.trace.borrow_mut().write_event(&ev) {
            log::error!("trace write failed: {e}");
        }
        t.trace_write.stop();
    }

    /// Ping, mark the follower closed, and flush any residual buffered
    /// bytes as a final `unexpected EOF` event (spec.md §4.5).
    pub fn close(&mut self) {
        self.ping();
        if !self.buffer.is_empty() {
            let residual = std::mem::take(&mut self.buffer);
            self.event("unexpected EOF", Vec::new(), residual);
        }
        self.state = ParserState::Closed;
    }
}

impl<W: Write> Drop for Follower<W> {
    fn drop(&mut self) {
        if !matches!(self.state, ParserState::Closed) {
            log::warn!(
                "conn {} {}: follower dropped in state {} instead of closed",
                self.conn_id,
                self.direction.as_str(),
                self.state.name()
            );
        }
    }
}

/// A `Vec<u8>` sink sharable between a `Follower` and its test, so a test can
/// read back exactly the bytes the real trace writer would have emitted —
/// this stands in for `std::io::Stdout` the way the rest of the pack swaps a
/// production sink for an in-memory one in tests.
#[cfg(test)]
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
struct Row {
    begin: f64,
    end: f64,
    direction: String,
    state: String,
    notes: String,
    headings: Vec<u8>,
    body: Vec<u8>,
}

#[cfg(test)]
fn parse_rows(buf: &[u8]) -> Vec<Row> {
    String::from_utf8(buf.to_vec())
        .unwrap()
        .lines()
        .map(|line| {
            let f: Vec<&str> = line.split('\t').collect();
            assert_eq!(f.len(), 8, "row must have 8 tab-separated fields: {line:?}");
            Row {
                begin: f[0].parse().unwrap(),
                end: f[1].parse().unwrap(),
                direction: f[3].to_string(),
                state: f[4].to_string(),
                notes: f[5].to_string(),
                headings: hex::decode(f[6]).unwrap(),
                body: hex::decode(f[7]).unwrap(),
            }
        })
        .collect()
}

#[cfg(test)]
fn new_test_follower() -> (Rc<RefCell<Follower<SharedBuf>>>, Rc<RefCell<Vec<u8>>>) {
    let sink: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let trace = Rc::new(RefCell::new(TraceWriter::new(SharedBuf(sink.clone()))));
    let timers = Rc::new(RefCell::new(TimerSet::new()));
    let f = Follower::new(trace, timers, 1, Direction::Up);
    (f, sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_length_round_trip_emits_pre_event_and_body_event() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();
        let rows = parse_rows(&sink.borrow());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].state, "http");
        assert_eq!(rows[0].notes, "content-length: 5");
        assert_eq!(rows[1].state, "http_length");
        assert_eq!(rows[1].notes, "HTTP/1.1 200 OK");
        assert_eq!(rows[1].body, b"hello");
        assert_eq!(f.borrow().state_name(), "eof");
    }

    #[test]
    fn chunked_round_trip_emits_pre_event_and_final_event() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .unwrap();
        let rows = parse_rows(&sink.borrow());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].notes, "transfer-encoding: chunked");
        assert_eq!(rows[1].body, b"hello world");
        assert_eq!(f.borrow().state_name(), "eof");
    }

    #[test]
    fn keep_alive_returns_to_http_state_for_next_request() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\nhiGET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let rows = parse_rows(&sink.borrow());
        // pre-event, body event, then a fresh status-line event for the second
        // request — reaching this third row proves the follower returned to
        // `http` between messages. The second request carries no `Connection:
        // keep-alive` of its own, so per spec.md §4.3 its own post-body state
        // is `eof`.
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].notes, "GET / HTTP/1.1");
        assert_eq!(f.borrow().state_name(), "eof");
    }

    #[test]
    fn gzip_body_is_decompressed() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"X").unwrap();
        let gz = enc.finish().unwrap();

        let mut req = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            gz.len()
        )
        .into_bytes();
        req.extend_from_slice(&gz);

        let (f, sink) = new_test_follower();
        f.borrow_mut().feed(&req).unwrap();
        let rows = parse_rows(&sink.borrow());
        assert_eq!(rows.last().unwrap().body, b"X");
    }

    #[test]
    fn websocket_upgrade_transitions_and_emits_pre_event() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
            .unwrap();
        let rows = parse_rows(&sink.borrow());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].notes, "websocket upgrade");
        assert_eq!(f.borrow().state_name(), "websocket");
    }

    #[test]
    fn websocket_short_masked_text_frame() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
            .unwrap();

        let key = [0x11u8, 0x22, 0x33, 0x44];
        let plain = b"Hi";
        let masked: Vec<u8> = plain.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect();
        let mut frame = vec![0x81, 0x80 | 2];
        frame.extend_from_slice(&key);
        frame.extend_from_slice(&masked);

        f.borrow_mut().feed(&frame).unwrap();
        let rows = parse_rows(&sink.borrow());
        let last = rows.last().unwrap();
        assert_eq!(last.state, "websocket");
        assert_eq!(last.notes, "text");
        assert_eq!(last.body, b"Hi");
    }

    #[test]
    fn websocket_fragmentation_with_interleaved_ping() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
            .unwrap();

        // initial fragment "He" (FIN=0, opcode=text), unmasked (server->client direction)
        f.borrow_mut().feed(&[0x01, 0x02, b'H', b'e']).unwrap();
        // interleaved empty ping
        f.borrow_mut().feed(&[0x89, 0x00]).unwrap();
        // final fragment "llo" (FIN=1, opcode=continuation)
        f.borrow_mut().feed(&[0x80, 0x03, b'l', b'l', b'o']).unwrap();

        let rows = parse_rows(&sink.borrow());
        // upgrade pre-event + ping + text
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].notes, "ping");
        assert_eq!(rows[2].notes, "text");
        assert_eq!(rows[2].body, b"Hello");
        assert!(rows[1].end <= rows[2].end);
    }

    #[test]
    fn websocket_extended_length_126_is_big_endian_16_bit() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
            .unwrap();

        let payload = vec![b'z'; 200];
        let mut frame = vec![0x82, 126, 0x00, 0xC8]; // 200 big-endian
        frame.extend_from_slice(&payload);
        f.borrow_mut().feed(&frame).unwrap();

        let rows = parse_rows(&sink.borrow());
        assert_eq!(rows.last().unwrap().body.len(), 200);
    }

    #[test]
    fn websocket_close_opcode_transitions_to_eof() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
            .unwrap();
        f.borrow_mut().feed(&[0x88, 0x00]).unwrap();
        assert_eq!(f.borrow().state_name(), "eof");

        f.borrow_mut().feed(b"stray").unwrap();
        let rows = parse_rows(&sink.borrow());
        assert_eq!(rows.last().unwrap().notes, "close");
        assert_eq!(f.borrow().state_name(), "eof");
    }

    #[test]
    fn unexpected_eof_emits_residual_bytes() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhel")
            .unwrap();
        f.borrow_mut().close();
        let rows = parse_rows(&sink.borrow());
        let last = rows.last().unwrap();
        assert_eq!(last.notes, "unexpected EOF");
        assert_eq!(last.body, b"hel");
        assert_eq!(f.borrow().state_name(), "closed");
    }

    #[test]
    fn event_ordering_is_non_decreasing_by_end_time() {
        let (f, sink) = new_test_follower();
        f.borrow_mut()
            .feed(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 1\r\n\r\nA")
            .unwrap();
        f.borrow_mut()
            .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nB")
            .unwrap();
        let rows = parse_rows(&sink.borrow());
        for pair in rows.windows(2) {
            assert!(pair[0].end <= pair[1].end);
        }
        for r in &rows {
            assert_eq!(r.direction, "up");
            assert!(r.begin <= r.end);
        }
    }

    #[test]
    fn data_arriving_after_closed_is_fatal() {
        let (f, _sink) = new_test_follower();
        f.borrow_mut().close();
        assert!(f.borrow_mut().feed(b"more").is_err());
    }
}
