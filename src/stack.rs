//! Fixed-size call-stack capture.
//!
//! A [`CallStack`] identifies one allocation site: the sequence of return
//! addresses active when `malloc` was entered, top frame first.  Stacks are
//! plain value types so they can live inside the preallocated site table
//! without ever allocating during capture.

use std::{fmt, mem};

use libc::{c_char, c_int, c_void, dlsym, RTLD_DEFAULT};
use once_cell::sync::Lazy;

/// Number of frames retained per call site.  Deeper stacks are truncated,
/// shallower ones are zero-padded.
pub const MAX_FRAMES: usize = 16;

/// Strategy used to capture a [`CallStack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMethod {
    /// Bounded frame walk via the `backtrace` crate.  Always available.
    FrameWalk,
    /// `backtrace(3)` from the platform C library, resolved once at startup.
    /// Not available on every platform; capture fails when unresolved.
    PlatformUnwind,
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMethod::FrameWalk => f.write_str("frame walk"),
            CaptureMethod::PlatformUnwind => f.write_str("platform unwind"),
        }
    }
}

type PlatformBacktraceFn = unsafe extern "C" fn(*mut *mut c_void, c_int) -> c_int;

// `backtrace(3)` is a glibc extension and may be missing entirely (musl,
// stripped environments).  Resolve it once; capture sites branch on presence.
static PLATFORM_BACKTRACE: Lazy<Option<PlatformBacktraceFn>> = Lazy::new(|| {
    let sym = unsafe { dlsym(RTLD_DEFAULT, b"backtrace\0".as_ptr() as *const c_char) };
    if sym.is_null() {
        None
    } else {
        Some(unsafe { mem::transmute::<*mut c_void, PlatformBacktraceFn>(sym) })
    }
});

/// An ordered, fixed-length call path.  Immutable once inserted into the
/// site table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallStack {
    frames: [usize; MAX_FRAMES],
}

impl CallStack {
    pub const fn empty() -> Self {
        CallStack {
            frames: [0; MAX_FRAMES],
        }
    }

    /// Builds a stack from raw frame addresses, truncating or zero-padding
    /// to [`MAX_FRAMES`].
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut stack = Self::empty();
        for (slot, frame) in stack.frames.iter_mut().zip(frames.iter()) {
            *slot = *frame;
        }
        stack
    }

    /// Captured frames, with trailing zero padding stripped.
    pub fn frames(&self) -> &[usize] {
        let depth = self
            .frames
            .iter()
            .position(|f| *f == 0)
            .unwrap_or(MAX_FRAMES);
        &self.frames[..depth]
    }

    /// Cheap, collision-tolerant hash: the wrapping sum of all frames.
    pub fn hash(&self) -> usize {
        self.frames.iter().fold(0usize, |acc, f| acc.wrapping_add(*f))
    }

    /// Overwrites `self` with the current thread's call stack using the
    /// given capture method.  Returns `true` iff at least one frame was
    /// captured.
    pub fn capture(&mut self, method: CaptureMethod) -> bool {
        self.frames = [0; MAX_FRAMES];
        match method {
            CaptureMethod::FrameWalk => self.capture_walk(),
            CaptureMethod::PlatformUnwind => self.capture_platform(),
        }
    }

    fn capture_platform(&mut self) -> bool {
        let unwind = match *PLATFORM_BACKTRACE {
            Some(f) => f,
            None => return false,
        };
        let mut buf = [std::ptr::null_mut::<c_void>(); MAX_FRAMES];
        let depth = unsafe { unwind(buf.as_mut_ptr(), MAX_FRAMES as c_int) };
        if depth <= 0 {
            return false;
        }
        for (slot, ip) in self.frames.iter_mut().zip(buf[..depth as usize].iter()) {
            *slot = *ip as usize;
        }
        true
    }

    fn capture_walk(&mut self) -> bool {
        let mut depth = 0;
        backtrace::trace(|frame| {
            let ip = frame.ip() as usize;
            // A null instruction pointer marks the outermost frame.
            if ip == 0 {
                return false;
            }
            self.frames[depth] = ip;
            depth += 1;
            depth < MAX_FRAMES
        });
        depth > 0
    }
}

impl Default for CallStack {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_frames_pads_and_truncates() {
        let short = CallStack::from_frames(&[1, 2, 3]);
        assert_eq!(short.frames(), &[1, 2, 3]);

        let long: Vec<usize> = (1..=(MAX_FRAMES + 4)).collect();
        let truncated = CallStack::from_frames(&long);
        assert_eq!(truncated.frames().len(), MAX_FRAMES);
        assert_eq!(truncated.frames()[MAX_FRAMES - 1], MAX_FRAMES);
    }

    #[test]
    fn hash_is_frame_sum() {
        let stack = CallStack::from_frames(&[10, 20, 30]);
        assert_eq!(stack.hash(), 60);
        assert_eq!(CallStack::empty().hash(), 0);
    }

    #[test]
    fn equality_is_structural() {
        let a = CallStack::from_frames(&[1, 2, 3]);
        let b = CallStack::from_frames(&[1, 2, 3]);
        let c = CallStack::from_frames(&[3, 2, 1]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Same hash, different structure.
        assert_eq!(a.hash(), c.hash());
    }

    #[test]
    fn frame_walk_captures_at_least_one_frame() {
        let mut stack = CallStack::empty();
        assert!(stack.capture(CaptureMethod::FrameWalk));
        assert!(!stack.frames().is_empty());
    }

    #[test]
    fn platform_unwind_is_all_or_nothing() {
        let mut stack = CallStack::empty();
        if stack.capture(CaptureMethod::PlatformUnwind) {
            assert!(!stack.frames().is_empty());
        } else {
            // Capability unresolved on this platform; stack must stay empty.
            assert!(stack.frames().is_empty());
        }
    }
}
