//! Trace record model and writer (spec.md §2 "Trace writer", §6).
//!
//! One record is emitted per protocol event. Fields are tab-separated,
//! records are newline-terminated, and `headings`/`body` are hex-encoded —
//! the `hex` crate does the encoding, matching how the rest of this pack
//! reaches for a small, focused crate rather than hand-rolling it.

use std::io::{self, Write};

use crate::follower::Direction;

/// A single protocol-level event (spec.md §3 "Event").
#[derive(Debug, Clone)]
pub struct Event {
    pub begin: f64,
    pub end: f64,
    pub conn_id: i64,
    pub direction: Direction,
    pub state: &'static str,
    pub notes: String,
    pub headings: Vec<u8>,
    pub body: Vec<u8>,
}

/// Synchronous sink that appends one record per event, fully flushing each
/// record before returning (spec.md §2, §5, §7: the only intentional
/// blocking site; partial writes are retried, a write error is fatal).
pub struct TraceWriter<W: Write> {
    out: W,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W) -> Self {
        TraceWriter { out }
    }

    pub fn write_event(&mut self, ev: &Event) -> io::Result<()> {
        let mut line = Vec::with_capacity(64 + ev.headings.len() * 2 + ev.body.len() * 2);
        write!(
            line,
            "{:.6}\t{:.6}\t{}\t{}\t{}\t",
            ev.begin,
            ev.end,
            ev.conn_id,
            ev.direction.as_str(),
            ev.state,
        )?;
        line.extend(ev.notes.replace('\t', " ").into_bytes());
        line.push(b'\t');
        line.extend(hex::encode(&ev.headings).into_bytes());
        line.push(b'\t');
        line.extend(hex::encode(&ev.body).into_bytes());
        line.push(b'\n');

        self.write_all_retrying(&line)
    }

    /// Write the full buffer, retrying on partial writes; any genuine error
    /// is fatal to the process (spec.md §7).
    fn write_all_retrying(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.out.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "trace writer stalled"));
            }
            buf = &buf[n..];
        }
        self.out.flush()
    }
}
