//! A single client↔upstream connection: two byte buffers, two
//! [`Follower`]s, and the one-shot request rewrite (spec.md §4.2, §4.2.1).
//!
//! Grounded on the teacher's `app/proxy_fast.rs` duplex loop: read/write
//! pairs gated by buffer occupancy instead of a manual readiness bitmap,
//! generalized to drive a `Follower` on every read and to rewrite only the
//! first request instead of passing every byte straight through. Each
//! socket is split into owned read/write halves so a single `select!` can
//! have a read and a write in flight on the same socket at once.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::config::{Args, BUF_LIMIT};
use crate::follower::{Direction, Follower};
use crate::timer::TimerSet;
use crate::trace::TraceWriter;

/// Scan for the blank line ending an HTTP header block, tolerant of bare
/// `\n`. Mirrors `follower::http`'s scanner; kept separate because the
/// rewrite operates on `pending_request`, the raw pre-latch uplink
/// accumulator, before the (rewritten) bytes are ever handed to a
/// `Follower`.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let mut run = 0;
    for (i, &b) in buf.iter().enumerate() {
        match b {
            b'\r' => {}
            b'\n' => {
                run += 1;
                if run == 2 {
                    return Some(i + 1);
                }
            }
            _ => run = 0,
        }
    }
    None
}

/// Rewrite the first request's header block in place (spec.md §4.2.1):
/// collapse any `HTTP/2...` request line to `HTTP/1.1`, replace the `Host:`
/// header with the real upstream address, and strip
/// `Sec-WebSocket-Extensions` (compression extensions this proxy cannot
/// re-derive across the rewrite).
fn rewrite_http_request(header_block: &[u8], upstream_host_header: &str) -> Vec<u8> {
    let text = match std::str::from_utf8(header_block) {
        Ok(t) => t,
        Err(_) => return header_block.to_vec(),
    };

    let mut out_lines: Vec<String> = Vec::new();
    for (i, line) in text.split_inclusive('\n').enumerate() {
        let (body, ending) = match line.strip_suffix("\r\n") {
            Some(b) => (b, "\r\n"),
            None => match line.strip_suffix('\n') {
                Some(b) => (b, "\n"),
                None => (line, ""),
            },
        };

        if i == 0 {
            let rewritten = if let Some(pos) = body.find("HTTP/2") {
                format!("{}HTTP/1.1", &body[..pos])
            } else {
                body.to_string()
            };
            out_lines.push(format!("{rewritten}{ending}"));
            continue;
        }

        if body.is_empty() {
            out_lines.push(line.to_string());
            continue;
        }

        let Some((key, _)) = body.split_once(':') else {
            out_lines.push(line.to_string());
            continue;
        };

        if key.trim().eq_ignore_ascii_case("host") {
            out_lines.push(format!("Host: {upstream_host_header}{ending}"));
        } else if key.trim().eq_ignore_ascii_case("sec-websocket-extensions") {
            // dropped
        } else {
            out_lines.push(line.to_string());
        }
    }

    out_lines.concat().into_bytes()
}

#[derive(PartialEq, Eq)]
enum HalfClose {
    Open,
    Eof,
}

/// How many bytes a single read may fill into the scratch buffer (spec.md
/// §4.2 step 2/step 4): the downlink, and the uplink once the rewrite latch
/// has fired, may only read up to the room remaining below `BUF_LIMIT`; the
/// uplink before the latch fires reads unconditionally so the header
/// terminator can be found "regardless of current buffer size".
fn read_budget(current_len: usize, unconditional: bool) -> usize {
    if unconditional {
        BUF_LIMIT
    } else {
        BUF_LIMIT.saturating_sub(current_len)
    }
}

pub struct Connection {
    conn_id: i64,
    client_r: OwnedReadHalf,
    client_w: OwnedWriteHalf,
    upstream_r: OwnedReadHalf,
    upstream_w: OwnedWriteHalf,
    follower_up: Rc<RefCell<Follower<std::io::Stdout>>>,
    follower_down: Rc<RefCell<Follower<std::io::Stdout>>>,
    /// Raw uplink bytes read before the request rewrite has fired, held back
    /// from both the follower and the forwarding buffer until the header
    /// terminator is found and the rewrite is known (spec.md §4.2 step 5).
    pending_request: BytesMut,
    client_to_upstream: BytesMut,
    upstream_to_client: BytesMut,
    client_eof: HalfClose,
    upstream_eof: HalfClose,
    request_rewritten: bool,
    upstream_host_header: String,
    timers: Rc<RefCell<TimerSet>>,
}

impl Connection {
    pub fn new(
        conn_id: i64,
        client: TcpStream,
        upstream: TcpStream,
        args: &Args,
        trace: Rc<RefCell<TraceWriter<std::io::Stdout>>>,
        timers: Rc<RefCell<TimerSet>>,
    ) -> Connection {
        let follower_up = Follower::new(trace.clone(), timers.clone(), conn_id, Direction::Up);
        let follower_down = Follower::new(trace, timers.clone(), conn_id, Direction::Down);
        Follower::pair(&follower_up, &follower_down);

        let (client_r, client_w) = client.into_split();
        let (upstream_r, upstream_w) = upstream.into_split();

        Connection {
            conn_id,
            client_r,
            client_w,
            upstream_r,
            upstream_w,
            follower_up,
            follower_down,
            pending_request: BytesMut::new(),
            client_to_upstream: BytesMut::new(),
            upstream_to_client: BytesMut::new(),
            client_eof: HalfClose::Open,
            upstream_eof: HalfClose::Open,
            request_rewritten: false,
            upstream_host_header: args.upstream_host_header(),
            timers,
        }
    }

    /// Run the connection to completion: forward bytes in both directions,
    /// feeding each direction's `Follower`, until both sides have reached
    /// EOF and all buffered bytes have been flushed (spec.md §4.1, §4.2).
    pub async fn run(mut self, timers: Rc<RefCell<TimerSet>>) {
        let mut client_buf = vec![0u8; BUF_LIMIT];
        let mut upstream_buf = vec![0u8; BUF_LIMIT];

        loop {
            if self.client_eof == HalfClose::Eof
                && self.upstream_eof == HalfClose::Eof
                && self.client_to_upstream.is_empty()
                && self.upstream_to_client.is_empty()
            {
                break;
            }

            // Pre-latch, the uplink reads unconditionally regardless of
            // buffer occupancy (spec.md §4.2 step 4); post-latch it reads
            // only while there is room below `BUF_LIMIT` in the forwarding
            // buffer.
            let can_read_client = self.client_eof == HalfClose::Open
                && (!self.request_rewritten || self.client_to_upstream.len() < BUF_LIMIT);
            let can_read_upstream =
                self.upstream_eof == HalfClose::Open && self.upstream_to_client.len() < BUF_LIMIT;
            let can_write_upstream = !self.client_to_upstream.is_empty();
            let can_write_client = !self.upstream_to_client.is_empty();

            if !can_read_client && !can_read_upstream && !can_write_upstream && !can_write_client {
                break;
            }

            let client_read_len =
                read_budget(self.client_to_upstream.len(), !self.request_rewritten);
            let upstream_read_len = read_budget(self.upstream_to_client.len(), false);

            timers.borrow_mut().io_wait.start();
            tokio::select! {
                biased;

                result = self.client_r.read(&mut client_buf[..client_read_len]), if can_read_client => {
                    timers.borrow_mut().io_wait.stop();
                    match result {
                        Ok(0) => {
                            self.client_eof = HalfClose::Eof;
                            self.follower_up.borrow_mut().close();
                        }
                        Ok(n) => self.on_client_read(&client_buf[..n]),
                        Err(e) => {
                            log::warn!("conn {}: client read error: {e}", self.conn_id);
                            self.client_eof = HalfClose::Eof;
                            self.follower_up.borrow_mut().close();
                        }
                    }
                }

                result = self.upstream_r.read(&mut upstream_buf[..upstream_read_len]), if can_read_upstream => {
                    timers.borrow_mut().io_wait.stop();
                    match result {
                        Ok(0) => {
                            self.upstream_eof = HalfClose::Eof;
                            self.follower_down.borrow_mut().close();
                        }
                        Ok(n) => {
                            if let Err(e) = self.follower_down.borrow_mut().feed(&upstream_buf[..n]) {
                                log::error!("conn {}: {:?}", self.conn_id, e);
                                self.upstream_eof = HalfClose::Eof;
                                break;
                            }
                            self.upstream_to_client.extend_from_slice(&upstream_buf[..n]);
                        }
                        Err(e) => {
                            log::warn!("conn {}: upstream read error: {e}", self.conn_id);
                            self.upstream_eof = HalfClose::Eof;
                            self.follower_down.borrow_mut().close();
                        }
                    }
                }

                result = self.upstream_w.write(&self.client_to_upstream), if can_write_upstream => {
                    timers.borrow_mut().io_wait.stop();
                    match result {
                        Ok(0) => {
                            log::warn!("conn {}: upstream write stalled", self.conn_id);
                        }
                        Ok(n) => { self.client_to_upstream.split_to(n); }
                        Err(e) => {
                            log::warn!("conn {}: upstream write error: {e}", self.conn_id);
                            break;
                        }
                    }
                }

                result = self.client_w.write(&self.upstream_to_client), if can_write_client => {
                    timers.borrow_mut().io_wait.stop();
                    match result {
                        Ok(0) => {
                            log::warn!("conn {}: client write stalled", self.conn_id);
                        }
                        Ok(n) => { self.upstream_to_client.split_to(n); }
                        Err(e) => {
                            log::warn!("conn {}: client write error: {e}", self.conn_id);
                            break;
                        }
                    }
                }
            }
        }

        if self.follower_up.borrow().state_name() != "closed" {
            self.follower_up.borrow_mut().close();
        }
        if self.follower_down.borrow().state_name() != "closed" {
            self.follower_down.borrow_mut().close();
        }
    }

    /// Feed the uplink follower and record a fatal error the same way in
    /// both the rewritten and already-latched paths.
    fn feed_follower_up(&mut self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        if let Err(e) = self.follower_up.borrow_mut().feed(bytes) {
            log::error!("conn {}: {:?}", self.conn_id, e);
            self.client_eof = HalfClose::Eof;
            return false;
        }
        true
    }

    /// spec.md §4.2 step 4/5: before the rewrite latch fires, raw bytes are
    /// held in `pending_request` — not yet forwarded, not yet parsed — since
    /// the rewrite can still change the header block's content. The follower
    /// is only ever fed the bytes that end up forwarded, preserving "follower
    /// observed bytes ⊆ forwarded bytes" for content, not just timing: once
    /// the header terminator is found, the follower is fed the *rewritten*
    /// header block (what actually goes out), never the client's original.
    fn on_client_read(&mut self, bytes: &[u8]) {
        if self.request_rewritten {
            if !self.feed_follower_up(bytes) {
                return;
            }
            self.client_to_upstream.extend_from_slice(bytes);
            return;
        }

        // begin-time must reflect the first byte seen, even though parsing
        // of these bytes is deferred until the rewrite is known (spec.md
        // §4.2 step 4: "ping the uplink follower ... even if the data is
        // still being buffered for rewrite").
        self.follower_up.borrow_mut().ping();
        self.pending_request.extend_from_slice(bytes);

        if let Some(end) = find_header_end(&self.pending_request) {
            self.timers.borrow_mut().rewrite.start();
            let header_block = self.pending_request.split_to(end);
            let rewritten = rewrite_http_request(&header_block, &self.upstream_host_header);
            self.timers.borrow_mut().rewrite.stop();

            if !self.feed_follower_up(&rewritten) {
                return;
            }
            self.client_to_upstream.extend_from_slice(&rewritten);

            let leftover = std::mem::take(&mut self.pending_request);
            if !self.feed_follower_up(&leftover) {
                return;
            }
            self.client_to_upstream.extend_from_slice(&leftover);
            self.request_rewritten = true;
        } else if self.pending_request.len() >= BUF_LIMIT {
            // no header terminator within the buffer bound: give up
            // rewriting and forward the bytes as received (spec.md §7).
            log::warn!(
                "conn {}: request header exceeds buffer bound, forwarding unrewritten",
                self.conn_id
            );
            let raw = std::mem::take(&mut self.pending_request);
            if !self.feed_follower_up(&raw) {
                return;
            }
            self.client_to_upstream.extend_from_slice(&raw);
            self.request_rewritten = true;
        }
    }
}
