//! Companion crate to [`malloc_trace`].  This crate compiles into a dynamic
//! library that can be loaded via `LD_PRELOAD` to intercept the program's
//! `malloc`, `realloc`, and `memalign` calls and redirect them to the
//! call-site tracer.
//!
//! Boot-time behavior is driven by the environment (see
//! [`malloc_trace::Config`]): `MALLOC_TRACE_ENABLE=1` switches tracing on as
//! soon as the first allocation arrives, and `MALLOC_TRACE_AT_EXIT=1`
//! prints a report and dumps a snapshot when the process exits.

use std::cell::Cell;

use libc::{c_void, size_t};
use malloc_trace::{Config, TraceAllocator};
use once_cell::sync::Lazy;

static BOOT: Lazy<Config> = Lazy::new(|| {
    let config = Config::from_env();
    if config.enable_at_start {
        malloc_trace::enable(config.method);
    }
    if config.report_at_exit {
        unsafe {
            libc::atexit(report_at_exit);
        }
    }
    config
});

extern "C" fn report_at_exit() {
    malloc_trace::shutdown_report(&Config::from_env());
}

thread_local! {
    // Boot reads the environment, which allocates; those nested calls must
    // not re-enter the one-time initializer.
    static IN_BOOT: Cell<bool> = Cell::new(false);
}

fn ensure_booted() {
    let _ = IN_BOOT.try_with(|in_boot| {
        if in_boot.get() {
            return;
        }
        in_boot.set(true);
        Lazy::force(&BOOT);
        in_boot.set(false);
    });
}

/// When this library is loaded with `LD_PRELOAD`, this `malloc`
/// implementation catches `malloc` calls performed by the program and
/// records them in the call-site table before invoking the original `libc`
/// malloc.
///
/// # Safety
///
/// This method internally delegates to the `libc` allocator, which is
/// `unsafe extern "C"`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    ensure_booted();
    TraceAllocator::malloc(size)
}

/// `realloc` interposer; see [`malloc`].
///
/// # Safety
///
/// Same contract as [`malloc`].
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    ensure_booted();
    TraceAllocator::realloc(ptr, size)
}

/// `memalign` interposer; see [`malloc`].
///
/// # Safety
///
/// Same contract as [`malloc`].
#[no_mangle]
pub unsafe extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    ensure_booted();
    TraceAllocator::memalign(align, size)
}
