//! # relaytrace
//!
//! A recording man-in-the-middle TCP proxy for HTTP/1.x and WebSocket
//! traffic. Every request and response, and every WebSocket frame (or
//! reassembled message), is written to stdout as a tab-separated trace row
//! as it passes through (spec.md §1, §2).
//!
//! ## Architecture
//!
//! - [`proxy`] accepts client connections and spawns one task per connection.
//! - [`connection`] forwards bytes between client and upstream, one shared
//!   buffer per direction, and drives a [`follower::Follower`] over each
//!   direction's byte stream.
//! - [`follower`] implements the HTTP/1.x and WebSocket parsing state
//!   machines and emits trace events.
//! - [`trace`] serializes trace events to stdout.
//! - [`timer`] accumulates the runtime breakdown printed on shutdown.
//!
//! Everything runs on a single OS thread (`#[tokio::main(flavor =
//! "current_thread")]`): connection state is shared with `Rc<RefCell<_>>`
//! rather than `Arc<Mutex<_>>`, so the runtime is pinned to one thread via a
//! [`tokio::task::LocalSet`].

use std::cell::RefCell;
use std::process::ExitCode;
use std::rc::Rc;

mod config;
mod connection;
mod follower;
mod id;
mod proxy;
mod signal;
mod timer;
mod trace;

use proxy::Proxy;
use timer::TimerSet;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match config::parse_args(std::env::args()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("relaytrace: {e}");
            eprintln!("{}", config::USAGE);
            return ExitCode::FAILURE;
        }
    };

    id::seed();
    let timers = Rc::new(RefCell::new(TimerSet::new()));

    let shutdown_rx = signal::shutdown_signal();
    let local = tokio::task::LocalSet::new();

    let proxy = Proxy::new(args, timers.clone());
    local
        .run_until(proxy.run(&local, async {
            let _ = shutdown_rx.await;
        }))
        .await;

    // let already-spawned connection tasks drain before printing the
    // timing summary, matching what a real shutdown would observe.
    local.await;

    timers.borrow().print_summary();
    ExitCode::SUCCESS
}
