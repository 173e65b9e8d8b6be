//! A malloc call-site tracer.  `malloc_trace` intercepts every heap
//! allocation a process makes, captures a bounded call stack per
//! allocation, and aggregates per-site statistics (invocation counts,
//! allocation-size ranges) in a fixed-memory hash table, without itself
//! allocating while tracing is active.
//!
//! Note: `malloc_trace` is not a leak detector.  It reports *hot* call
//! sites, not liveness, and coverage is best-effort: small windows exist
//! where interception is deliberately switched off (while the tracer's own
//! bookkeeping runs), so not every allocation is guaranteed to be captured
//! -- but tracing is never unsafe.
//!
//! ## Enabling `malloc_trace` in a Rust program
//!
//! Configure [`TraceAllocator`] as the global allocator instead of
//! [`std::alloc::System`], then switch tracing on:
//!
//! ```
//! use malloc_trace::{CaptureMethod, TraceAllocator};
//!
//! #[global_allocator]
//! static GLOBAL: TraceAllocator = TraceAllocator;
//!
//! fn main() {
//!     malloc_trace::enable(CaptureMethod::FrameWalk);
//!     // ... workload ...
//!     if let Some(report) = malloc_trace::print_report(false) {
//!         eprintln!("{}", report);
//!     }
//! }
//! ```
//!
//! ## Using `malloc_trace` via `LD_PRELOAD`
//!
//! For programs in other languages, including a mix of Rust, C, etc., use
//! the companion [`lib_malloc_trace`] crate, which produces a dynamic
//! library that intercepts `malloc`, `realloc`, and `memalign` calls issued
//! by the program:
//!
//! ```bash
//! MALLOC_TRACE_ENABLE=1 MALLOC_TRACE_AT_EXIT=1 \
//!     LD_PRELOAD=libmalloc_trace.so ./my_program
//! ```
//!
//! At exit the library prints the report to stderr and dumps a YAML
//! snapshot into `malloc_trace.<pid>/`.  Use the `mt_print` tool to view
//! (and merge) dumped snapshots:
//!
//! ```bash
//! mt_print --dir malloc_trace.<pid> --all
//! ```
//!
//! ## In-process control
//!
//! The four control operations are also reachable through a textual
//! surface, [`command::execute`]: `enable [walk|unwind]`, `disable`,
//! `print [all]`, `reset`.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::RefCell,
    fmt::Write,
    thread_local,
};

use libc::{c_void, size_t};
use once_cell::sync::Lazy;

pub mod command;
mod config;
mod fatal;
mod lock;
pub mod report;
mod snapshot;
mod stack;
mod table;
mod tracer;

pub use config::Config;
pub use snapshot::{SiteRecord, Snapshot};
pub use stack::{CallStack, CaptureMethod, MAX_FRAMES};
pub use table::{Site, SiteTable, MAX_ENTRIES, TABLE_SIZE};
pub use tracer::Tracer;

thread_local! {
    // Flag used to detect nested calls into the tracer.
    pub(crate) static NESTED: RefCell<bool> = RefCell::new(false);
}

// The single tracer instance for this process.  Construction happens on
// first use, always with the nested flag already set, so the table's own
// allocations are never traced.
static TRACER: Lazy<lock::TraceLock<Tracer>> = Lazy::new(|| lock::TraceLock::new(Tracer::new()));

/// Runs `f` with the tracer locked and nested-call detection engaged.
///
/// Returns `None` when called re-entrantly from tracer bookkeeping on the
/// same thread, or during thread destruction; callers fall back to the
/// untraced path in that case.
pub(crate) fn with_tracer<R>(f: impl FnOnce(&mut Tracer) -> R) -> Option<R> {
    NESTED
        .try_with(|nested| {
            if *nested.borrow() {
                return None;
            }
            *nested.borrow_mut() = true;
            let res = {
                let mut guard = TRACER.lock();
                f(&mut guard)
            };
            *nested.borrow_mut() = false;
            Some(res)
        })
        .ok()
        .flatten()
}

/// Marks the current thread as inside tracer bookkeeping for the rest of
/// its life.  Used by the fatal-error path, which never returns.
pub(crate) fn suppress_tracing_on_thread() {
    let _ = NESTED.try_with(|nested| *nested.borrow_mut() = true);
}

/// Forcibly releases the tracer lock without going through a guard.
///
/// # Safety
///
/// Only for the fatal-error path; see [`lock::TraceLock::force_unlock`].
pub unsafe fn force_unlock_tracer() {
    if let Some(lock) = Lazy::get(&TRACER) {
        lock.force_unlock();
    }
}

// Lock-free tracer access for the fatal-error report printer.
pub(crate) unsafe fn tracer_unlocked() -> Option<&'static Tracer> {
    Lazy::get(&TRACER).map(|lock| lock.data_unlocked())
}

/// Switches call-site tracing on with the given capture method.  Idempotent.
/// Returns `false` only when the tracer is unreachable (nested call or
/// thread teardown).
pub fn enable(method: CaptureMethod) -> bool {
    with_tracer(|tracer| tracer.enable(method)).is_some()
}

/// Switches call-site tracing off, restoring the previous hook state.
/// Idempotent.
pub fn disable() -> bool {
    with_tracer(|tracer| tracer.disable()).is_some()
}

/// Clears all recorded sites and capture counters.  Valid whether or not
/// tracing is currently enabled.
pub fn reset() -> bool {
    with_tracer(|tracer| tracer.reset()).is_some()
}

/// Renders the statistics line plus the ranked site listing (all sites, or
/// the top 10), then zeroes the per-site delta counters.
pub fn print_report(all: bool) -> Option<String> {
    with_tracer(|tracer| {
        let mut out = String::new();
        let _ = report::write_stats(tracer.table(), &mut out);
        let _ = writeln!(
            out,
            "captures: {} (without stack: {})",
            tracer.captures(),
            tracer.captures_without_stack()
        );
        let mut sites = report::collect_sites(tracer.table());
        let _ = report::write_sites(&mut sites, all, &report::resolve_symbol, &mut out);
        tracer.reset_deltas();
        out
    })
}

/// Disables tracing, prints the final report to stderr, and dumps a YAML
/// snapshot.  Wired to `atexit` by the `LD_PRELOAD` companion library.
pub fn shutdown_report(config: &Config) {
    let dumped = with_tracer(|tracer| {
        tracer.disable();
        let mut out = String::new();
        let _ = report::write_stats(tracer.table(), &mut out);
        let mut sites = report::collect_sites(tracer.table());
        let _ = report::write_sites(&mut sites, config.print_all, &report::resolve_symbol, &mut out);
        (out, Snapshot::from_table(tracer.table()))
    });
    if let Some((out, snapshot)) = dumped {
        eprint!("{}", out);
        if let Err(e) = snapshot.dump() {
            eprintln!("malloc_trace: failed to write snapshot: {}", e);
        }
    }
}

/// Allocator facade that feeds every allocation through the tracer before
/// delegating to the real allocator.  Use the `global_allocator` attribute
/// to route a Rust program through it:
///
/// ```
/// use malloc_trace::TraceAllocator;
///
/// #[global_allocator]
/// static GLOBAL: TraceAllocator = TraceAllocator;
///
/// fn main() {}
/// ```
pub struct TraceAllocator;

impl TraceAllocator {
    /// A replacement `malloc()` that records the call site before invoking
    /// the real allocator.  When loaded via `LD_PRELOAD`,
    /// [`lib_malloc_trace`] redirects `malloc` calls here.
    pub unsafe fn malloc(size: size_t) -> *mut c_void {
        match tracer::installed_malloc_hook() {
            Some(hook) => hook(size),
            None => (tracer::real_alloc().malloc)(size),
        }
    }

    /// Replacement `realloc()`.  `realloc(ptr, 0)` bypasses tracing to
    /// preserve the real allocator's free-equivalent contract.
    pub unsafe fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
        match tracer::installed_realloc_hook() {
            Some(hook) => hook(ptr, size),
            None => (tracer::real_alloc().realloc)(ptr, size),
        }
    }

    /// Replacement `memalign()`.
    pub unsafe fn memalign(align: size_t, size: size_t) -> *mut c_void {
        match tracer::installed_memalign_hook() {
            Some(hook) => hook(align, size),
            None => (tracer::real_alloc().memalign)(align, size),
        }
    }

    fn record(size: usize) {
        let _ = with_tracer(|tracer| {
            if tracer.is_active() {
                tracer.record_allocation(size);
                tracer.maybe_verify();
            }
        });
    }
}

unsafe impl GlobalAlloc for TraceAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::record(layout.size());
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread::spawn;

    #[global_allocator]
    static GLOBAL: TraceAllocator = TraceAllocator;

    // The tracer is process-global; tests that flip its lifecycle must not
    // interleave.
    static TEST_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn lifecycle_is_idempotent() {
        let _guard = TEST_GUARD.lock().unwrap();
        assert!(enable(CaptureMethod::FrameWalk));
        assert!(enable(CaptureMethod::FrameWalk));
        with_tracer(|tracer| assert!(tracer.is_active())).unwrap();
        assert!(disable());
        assert!(disable());
        with_tracer(|tracer| assert!(!tracer.is_active())).unwrap();
        assert!(reset());
    }

    #[test]
    fn command_surface_round_trip() {
        let _guard = TEST_GUARD.lock().unwrap();
        let status = command::execute("enable walk").unwrap();
        assert!(status.contains("enabled"));

        // Traced allocations land in the table.
        let mut v: Vec<u64> = Vec::new();
        for i in 0..1000 {
            v.push(i);
        }
        drop(v);

        let report = command::execute("print").unwrap();
        assert!(report.contains("Table size:"));
        assert!(report.contains("invocs:"));

        assert_eq!(command::execute("reset").unwrap(), "Tracing data reset");
        with_tracer(|tracer| {
            assert_eq!(tracer.table().size(), 0);
            assert_eq!(tracer.table().invocations(), 0);
        })
        .unwrap();

        assert_eq!(command::execute("disable").unwrap(), "Tracing disabled");
        assert!(command::execute("bogus").is_err());
        assert!(command::execute("enable sideways").is_err());
        assert!(command::execute("").is_err());
    }

    #[test]
    fn report_resets_deltas() {
        let _guard = TEST_GUARD.lock().unwrap();
        assert!(reset());
        assert!(enable(CaptureMethod::FrameWalk));
        let _boxes: Vec<Box<u64>> = (0..100).map(Box::new).collect();
        assert!(disable());

        let _ = print_report(false).unwrap();
        with_tracer(|tracer| {
            for site in tracer.table().sites() {
                assert_eq!(site.invocations_delta(), 0);
                assert!(site.invocations() > 0);
            }
        })
        .unwrap();
    }

    #[test]
    fn concurrent_hook_calls_keep_the_table_consistent() {
        let _guard = TEST_GUARD.lock().unwrap();
        assert!(reset());
        assert!(enable(CaptureMethod::FrameWalk));

        let mut handles = vec![];
        for _ in 0..8 {
            handles.push(spawn(|| {
                for i in 0..500 {
                    unsafe {
                        let ptr = TraceAllocator::malloc(64 + (i % 32));
                        assert!(!ptr.is_null());
                        libc::free(ptr);
                        let ptr = TraceAllocator::realloc(std::ptr::null_mut(), 128);
                        assert!(!ptr.is_null());
                        libc::free(ptr);
                        // realloc(ptr, 0) short-circuits the traced path.
                        let _ = TraceAllocator::realloc(std::ptr::null_mut(), 0);
                        let ptr = TraceAllocator::memalign(64, 256);
                        assert!(!ptr.is_null());
                        libc::free(ptr);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(disable());

        with_tracer(|tracer| {
            tracer.table().check_consistency().unwrap();
            assert!(tracer.table().invocations() > 0);
            assert!(tracer.captures() >= tracer.table().invocations());
        })
        .unwrap();
    }
}
