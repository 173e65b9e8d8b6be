//! Textual control surface: `enable`, `disable`, `print`, `reset`.
//!
//! Thin dispatch over the tracer's public operations, producing a short
//! status line per command.  Embedders wire this to whatever command channel
//! they have (a debug socket, a REPL, a signal handler).

use anyhow::{bail, Result};

use crate::stack::CaptureMethod;

/// Executes one command line and returns its status output.
///
/// Grammar: `enable [walk|unwind]` | `disable` | `print [all]` | `reset`.
pub fn execute(line: &str) -> Result<String> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("enable") => {
            let method = match words.next() {
                None | Some("walk") => CaptureMethod::FrameWalk,
                Some("unwind") => CaptureMethod::PlatformUnwind,
                Some(other) => bail!("unknown capture method: {}", other),
            };
            if !crate::enable(method) {
                bail!("tracer unavailable");
            }
            Ok(format!("Tracing enabled (method: {})", method))
        }
        Some("disable") => {
            if !crate::disable() {
                bail!("tracer unavailable");
            }
            Ok("Tracing disabled".to_string())
        }
        Some("print") => {
            let all = match words.next() {
                None => false,
                Some("all") => true,
                Some(other) => bail!("unknown print option: {}", other),
            };
            match crate::print_report(all) {
                Some(report) => Ok(report),
                None => bail!("tracer unavailable"),
            }
        }
        Some("reset") => {
            if !crate::reset() {
                bail!("tracer unavailable");
            }
            Ok("Tracing data reset".to_string())
        }
        Some(other) => bail!("unknown command: {}", other),
        None => bail!("empty command"),
    }
}
