//! Subscriber setup shared by the three binaries.
//!
//! Everything is written to stderr: stdout carries the MCP protocol for
//! `bugdesk-server`, and `bugdesk-launch` hands its stdout to that child.

use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the filter directives, e.g. `bugdesk=debug`.
pub const LOG_ENV: &str = "BUGDESK_LOG";

pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (tests, embedded use) is not an error.
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
