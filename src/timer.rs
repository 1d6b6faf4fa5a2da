//! Monotonic accumulator used to attribute runtime to categories, per
//! spec.md §2/§6 (I/O wait, HTTP rewrite, follower parse, trace write,
//! other).
//!
//! A `Timer` can be started and stopped repeatedly; it reports the total
//! accumulated interval. `TimerSet` bundles the categories the timing
//! summary needs and knows how to render itself to stderr on shutdown.

use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Timer {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl Timer {
    pub fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    pub fn total(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }

    /// Measure a closure's wall-clock time into this timer.
    pub fn time<T>(&mut self, f: impl FnOnce() -> T) -> T {
        self.start();
        let out = f();
        self.stop();
        out
    }
}

/// The five tracked categories plus process start time, per spec.md §6.
#[derive(Debug, Default)]
pub struct TimerSet {
    pub start: Option<Instant>,
    pub io_wait: Timer,
    pub rewrite: Timer,
    pub parse: Timer,
    pub trace_write: Timer,
}

impl TimerSet {
    pub fn new() -> Self {
        TimerSet {
            start: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Print the timing summary to stderr: each category's absolute and
    /// percentage share of total runtime, plus the residual "other".
    pub fn print_summary(&self) {
        let total = self
            .start
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let io_wait = self.io_wait.total().as_secs_f64();
        let rewrite = self.rewrite.total().as_secs_f64();
        let parse = self.parse.total().as_secs_f64();
        let trace_write = self.trace_write.total().as_secs_f64();
        let other = (total - (io_wait + rewrite + parse + trace_write)).max(0.0);

        let pct = |part: f64| if total > 0.0 { part / total * 100.0 } else { 0.0 };

        eprintln!("---- timing summary ----");
        eprintln!("total        {total:10.6}s  {:6.2}%", pct(total));
        eprintln!("io wait      {io_wait:10.6}s  {:6.2}%", pct(io_wait));
        eprintln!("http rewrite {rewrite:10.6}s  {:6.2}%", pct(rewrite));
        eprintln!("parse        {parse:10.6}s  {:6.2}%", pct(parse));
        eprintln!("trace write  {trace_write:10.6}s  {:6.2}%", pct(trace_write));
        eprintln!("other        {other:10.6}s  {:6.2}%", pct(other));
    }
}
