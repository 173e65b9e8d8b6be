//! Allocation interception and hook lifecycle.
//!
//! The process-wide hook slots below play the role of the allocator's hook
//! table: the exported `malloc`/`realloc`/`memalign` entry points call
//! through whatever the slots hold, and hold nothing while tracing is off.
//! [`Tracer::enable`] saves the slots' previous contents and installs the
//! traced entry points; [`Tracer::disable`] restores the saved values
//! verbatim.  The same save/restore runs inside every traced call so that
//! allocations made by the bookkeeping itself fall through untraced instead
//! of recursing.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_void, dlsym, size_t, RTLD_NEXT};
use once_cell::sync::Lazy;

use crate::stack::{CallStack, CaptureMethod};
use crate::table::SiteTable;

/// How often (in successful captures) the debug verifier re-checks the
/// table's structural invariants.
const VERIFY_INTERVAL: u64 = 10_000;

pub(crate) type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub(crate) type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub(crate) type MemalignFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;

type MallocHookFn = unsafe fn(size_t) -> *mut c_void;
type ReallocHookFn = unsafe fn(*mut c_void, size_t) -> *mut c_void;
type MemalignHookFn = unsafe fn(size_t, size_t) -> *mut c_void;

/// The real allocator, resolved once behind any interposed symbols.
pub(crate) struct RealAlloc {
    pub malloc: MallocFn,
    pub realloc: ReallocFn,
    pub memalign: MemalignFn,
}

static REAL_ALLOC: Lazy<RealAlloc> = Lazy::new(|| unsafe {
    RealAlloc {
        malloc: resolve_real(b"malloc\0"),
        realloc: resolve_real(b"realloc\0"),
        memalign: resolve_real(b"memalign\0"),
    }
});

unsafe fn resolve_real<F>(name: &'static [u8]) -> F {
    let sym = dlsym(RTLD_NEXT, name.as_ptr() as *const c_char);
    if sym.is_null() {
        panic!(
            "malloc_trace: couldn't find original {}",
            String::from_utf8_lossy(&name[..name.len() - 1])
        );
    }
    mem::transmute_copy(&sym)
}

pub(crate) fn real_alloc() -> &'static RealAlloc {
    &REAL_ALLOC
}

// The hook slots.  Zero means "not installed"; calls fall through to the
// real allocator.
static MALLOC_HOOK: AtomicUsize = AtomicUsize::new(0);
static REALLOC_HOOK: AtomicUsize = AtomicUsize::new(0);
static MEMALIGN_HOOK: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn installed_malloc_hook() -> Option<MallocHookFn> {
    match MALLOC_HOOK.load(Ordering::Acquire) {
        0 => None,
        f => Some(unsafe { mem::transmute::<usize, MallocHookFn>(f) }),
    }
}

pub(crate) fn installed_realloc_hook() -> Option<ReallocHookFn> {
    match REALLOC_HOOK.load(Ordering::Acquire) {
        0 => None,
        f => Some(unsafe { mem::transmute::<usize, ReallocHookFn>(f) }),
    }
}

pub(crate) fn installed_memalign_hook() -> Option<MemalignHookFn> {
    match MEMALIGN_HOOK.load(Ordering::Acquire) {
        0 => None,
        f => Some(unsafe { mem::transmute::<usize, MemalignHookFn>(f) }),
    }
}

fn our_hooks() -> (usize, usize, usize) {
    (
        traced_malloc as MallocHookFn as usize,
        traced_realloc as ReallocHookFn as usize,
        traced_memalign as MemalignHookFn as usize,
    )
}

#[derive(Clone, Copy, Default)]
struct SavedHooks {
    malloc: usize,
    realloc: usize,
    memalign: usize,
}

struct HookState {
    active: bool,
    method: CaptureMethod,
    saved: Option<SavedHooks>,
}

/// The single, process-wide tracer context: lifecycle state, the site
/// table, and the layer's own capture counters.  Always accessed under the
/// trace lock except by the fatal-error report printer.
pub struct Tracer {
    state: HookState,
    table: SiteTable,
    captures: u64,
    captures_without_stack: u64,
}

impl Tracer {
    pub fn new() -> Self {
        Tracer {
            state: HookState {
                active: false,
                method: CaptureMethod::FrameWalk,
                saved: None,
            },
            table: SiteTable::new(),
            captures: 0,
            captures_without_stack: 0,
        }
    }

    /// Installs the traced entry points and flips to Active.  No-op when
    /// already active.
    pub fn enable(&mut self, method: CaptureMethod) {
        self.check_hooks();
        if self.state.active {
            return;
        }
        // Resolve the real allocator before interception can begin.
        Lazy::force(&REAL_ALLOC);
        self.state.saved = Some(SavedHooks {
            malloc: MALLOC_HOOK.load(Ordering::Acquire),
            realloc: REALLOC_HOOK.load(Ordering::Acquire),
            memalign: MEMALIGN_HOOK.load(Ordering::Acquire),
        });
        let (m, r, a) = our_hooks();
        MALLOC_HOOK.store(m, Ordering::Release);
        REALLOC_HOOK.store(r, Ordering::Release);
        MEMALIGN_HOOK.store(a, Ordering::Release);
        self.state.method = method;
        self.state.active = true;
    }

    /// Restores the previously saved hook values verbatim and flips to
    /// Inactive.  No-op when already inactive.
    pub fn disable(&mut self) {
        self.check_hooks();
        if !self.state.active {
            return;
        }
        let saved = self.state.saved.take().unwrap_or_default();
        MALLOC_HOOK.store(saved.malloc, Ordering::Release);
        REALLOC_HOOK.store(saved.realloc, Ordering::Release);
        MEMALIGN_HOOK.store(saved.memalign, Ordering::Release);
        self.state.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.check_hooks();
        self.state.active
    }

    pub fn method(&self) -> CaptureMethod {
        self.state.method
    }

    pub fn table(&self) -> &SiteTable {
        &self.table
    }

    /// Stack-capture attempts, including ones that produced no frames.
    pub fn captures(&self) -> u64 {
        self.captures
    }

    /// Captures that produced no frames and were not recorded.
    pub fn captures_without_stack(&self) -> u64 {
        self.captures_without_stack
    }

    /// Clears the table and the layer's capture counters.  Valid in either
    /// lifecycle state.
    pub fn reset(&mut self) {
        self.table.reset();
        self.captures = 0;
        self.captures_without_stack = 0;
    }

    /// Zeroes per-site delta counters.  Valid in either lifecycle state.
    pub fn reset_deltas(&mut self) {
        self.table.reset_deltas();
    }

    /// Captures the current stack and feeds it to the table.  The caller
    /// holds the trace lock and has already dealt with recursion.
    pub(crate) fn record_allocation(&mut self, size: usize) {
        self.captures += 1;
        let mut stack = CallStack::empty();
        if stack.capture(self.state.method) {
            self.table.add_site(&stack, size);
        } else {
            self.captures_without_stack += 1;
        }
    }

    pub(crate) fn maybe_verify(&self) {
        if self.captures % VERIFY_INTERVAL == 0 {
            self.table.verify();
        }
    }

    // Active state must match the hook slots exactly: anything else means
    // an external party rewrote the shared slots, which is surfaced rather
    // than silently losing data.  Debug builds only.
    fn check_hooks(&self) {
        #[cfg(debug_assertions)]
        {
            let (m, r, a) = our_hooks();
            let ours_installed = MALLOC_HOOK.load(Ordering::Acquire) == m
                && REALLOC_HOOK.load(Ordering::Acquire) == r
                && MEMALIGN_HOOK.load(Ordering::Acquire) == a;
            if ours_installed != self.state.active {
                crate::fatal::fatal_error(
                    "allocator hook slots do not match tracer state; \
                     external hook interference?",
                );
            }
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

// Traced entry points, installed in the hook slots while tracing is
// active.  Each one: take the lock, re-check the lifecycle state, switch
// the hooks off around the bookkeeping and the real allocation, switch
// them back on, and hand the real allocator's result through unchanged.

pub(crate) unsafe fn traced_malloc(size: size_t) -> *mut c_void {
    match crate::with_tracer(|tracer| {
        if !tracer.is_active() {
            // Tracing was switched off while this thread waited on the
            // lock.
            return None;
        }
        let method = tracer.method();
        tracer.disable();
        tracer.record_allocation(size);
        let ptr = unsafe { (real_alloc().malloc)(size) };
        tracer.maybe_verify();
        tracer.enable(method);
        Some(ptr)
    }) {
        Some(Some(ptr)) => ptr,
        // Nested call, inactive tracer, or thread teardown: untraced path.
        _ => (real_alloc().malloc)(size),
    }
}

pub(crate) unsafe fn traced_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    // realloc(ptr, 0) is a free in disguise on many allocators; preserve
    // the real allocator's observable contract and skip the traced path.
    if size == 0 {
        return (real_alloc().realloc)(ptr, size);
    }
    match crate::with_tracer(|tracer| {
        if !tracer.is_active() {
            return None;
        }
        let method = tracer.method();
        tracer.disable();
        tracer.record_allocation(size);
        let res = unsafe { (real_alloc().realloc)(ptr, size) };
        tracer.maybe_verify();
        tracer.enable(method);
        Some(res)
    }) {
        Some(Some(res)) => res,
        _ => (real_alloc().realloc)(ptr, size),
    }
}

pub(crate) unsafe fn traced_memalign(align: size_t, size: size_t) -> *mut c_void {
    match crate::with_tracer(|tracer| {
        if !tracer.is_active() {
            return None;
        }
        let method = tracer.method();
        tracer.disable();
        tracer.record_allocation(size);
        let res = unsafe { (real_alloc().memalign)(align, size) };
        tracer.maybe_verify();
        tracer.enable(method);
        Some(res)
    }) {
        Some(Some(res)) => res,
        _ => (real_alloc().memalign)(align, size),
    }
}
