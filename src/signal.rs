//! Graceful shutdown on SIGINT/SIGTERM (spec.md §6).
//!
//! Grounded on the teacher's `main.rs` `ctrlc::set_handler` usage; here the
//! handler hands off to a oneshot channel instead of flipping an
//! `AtomicBool`, since the accept loop already `select!`s on a future
//! rather than polling a flag each iteration.

use std::sync::Mutex;

use tokio::sync::oneshot;

/// Returns a future that resolves the first time SIGINT or SIGTERM is
/// received. Must be called from the thread that will install the signal
/// handler (once per process).
pub fn shutdown_signal() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));

    if let Err(e) = ctrlc::set_handler(move || {
        if let Some(tx) = tx.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = tx.send(());
        }
    }) {
        log::warn!("failed to install signal handler: {e}, ctrl-c will not shut down cleanly");
    }

    rx
}
