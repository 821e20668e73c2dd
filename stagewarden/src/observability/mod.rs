//! Tracing subscriber setup for the binary and embedding applications.
//!
//! Library code only emits `tracing` events. Installing a subscriber is left
//! to the application; [`init_tracing`] is the one the CLI uses.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::errors::SupervisorError;

/// Filter directive used when `RUST_LOG` is not set.
#[must_use]
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "stagewarden=info",
        1 => "stagewarden=debug",
        _ => "stagewarden=trace",
    }
}

/// Installs a global `fmt` subscriber writing to stderr.
///
/// `RUST_LOG` wins over `verbosity`. With `json` set, every event is written
/// as one JSON object per line.
///
/// # Errors
///
/// Returns a config error if a global subscriber is already installed.
pub fn init_tracing(verbosity: u8, json: bool) -> Result<(), SupervisorError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };

    installed.map_err(|e| SupervisorError::config(format!("cannot install tracing subscriber: {e}")))
}
