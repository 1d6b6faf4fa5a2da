//! Connection identifier generation.
//!
//! Grounded in the teacher's `system/writer/rawid.rs` atomic-counter
//! generator, stripped down to what spec.md §3 actually asks for: a single
//! process-wide, strictly increasing sequence seeded so that distinct runs
//! land in visually distinct ranges.

use std::sync::atomic::{AtomicI64, Ordering};

static NEXT_ID: AtomicI64 = AtomicI64::new(0);

/// Must be called exactly once, before the first `next_connection_id` call.
pub fn seed() {
    let pid = std::process::id() as i64;
    NEXT_ID.store(pid * 1_000_000_000, Ordering::SeqCst);
}

/// Allocate the next connection id. Strictly increasing within a run.
pub fn next_connection_id() -> i64 {
    NEXT_ID.fetch_add(1, Ordering::SeqCst)
}
