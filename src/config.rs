//! Process-wide configuration, read from the environment.
//!
//! Used by the `LD_PRELOAD` companion library at boot; the in-process API
//! takes the same options as explicit arguments.

use std::env;

use crate::stack::CaptureMethod;

/// Recognized variables:
///
/// - `MALLOC_TRACE_ENABLE` — start tracing as soon as the library loads.
/// - `MALLOC_TRACE_METHOD` — `walk` (default) or `unwind`.
/// - `MALLOC_TRACE_ALL` — print every site at exit instead of the top 10.
/// - `MALLOC_TRACE_AT_EXIT` — print a report and dump a snapshot at exit.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub enable_at_start: bool,
    pub method: CaptureMethod,
    pub print_all: bool,
    pub report_at_exit: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            enable_at_start: env_flag("MALLOC_TRACE_ENABLE"),
            method: match env::var("MALLOC_TRACE_METHOD") {
                Ok(ref v) if v == "unwind" => CaptureMethod::PlatformUnwind,
                _ => CaptureMethod::FrameWalk,
            },
            print_all: env_flag("MALLOC_TRACE_ALL"),
            report_at_exit: env_flag("MALLOC_TRACE_AT_EXIT"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_at_start: false,
            method: CaptureMethod::FrameWalk,
            print_all: false,
            report_at_exit: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(env::var(name).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}
