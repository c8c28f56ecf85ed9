//! Process-fatal failures
//!
//! Ordering violations and local storage failures leave the export buffers in
//! a state that cannot be reasoned about. The node stops immediately rather
//! than acknowledge or deliver anything further.

use tracing::error;

/// Log `reason` with its context and abort the process
pub fn crash_local(reason: &str, context: &dyn std::fmt::Display) -> ! {
    error!(reason, %context, "Unrecoverable export failure, aborting");
    std::process::abort()
}
