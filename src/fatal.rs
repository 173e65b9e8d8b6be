//! Fatal-error path for internal invariant violations.
//!
//! Entered by the table verifier and the hook consistency check (debug
//! builds).  The path must survive being entered while the trace lock is
//! held, so it forcibly releases the lock instead of unwinding through a
//! guard, and it must never recurse into itself.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

static IN_FATAL: AtomicBool = AtomicBool::new(false);

/// Reports an unrecoverable internal inconsistency and aborts the process.
///
/// A secondary assertion raised while a fatal error is already being
/// handled returns silently instead of recursing into the handler.
pub fn fatal_error(msg: &str) {
    if IN_FATAL.swap(true, Ordering::SeqCst) {
        return;
    }
    // Route this thread's remaining allocations straight to the real
    // allocator; the report below allocates.
    crate::suppress_tracing_on_thread();
    unsafe {
        crate::force_unlock_tracer();
    }
    eprintln!("malloc_trace: fatal error: {}", msg);
    crate::report::print_error_report();
    process::abort();
}
