//! Tracing setup for the `racestream` binary and tests.
//!
//! Log events carry structured fields (`event_id`, `generation`, `attempt`,
//! `delay_ms`, `error`) so a single connection can be followed with a
//! `RUST_LOG` filter.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How much the binary logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Connection lifecycle (info and above).
    #[default]
    Normal,
    /// Reconnect and routing decisions (debug).
    Verbose,
    /// Every frame (trace).
    Trace,
}

impl Verbosity {
    /// Map `-q` / `-v` command-line flags to a verbosity.
    #[must_use]
    pub fn from_flags(quiet: bool, verbose: u8) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, _) => Self::Trace,
        }
    }

    /// Tracing level for this verbosity.
    #[must_use]
    pub fn level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// Default filter directive, scoped to this crate.
    #[must_use]
    pub fn directive(self) -> String {
        format!("racestream={}", self.level())
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, replaces the
/// verbosity-derived filter. Calling this more than once is harmless.
///
/// ```no_run
/// use racestream::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::Verbose);
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    // Logs go to stderr so `--json` output on stdout stays parseable.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init();
}

/// Quiet subscriber for unit tests; warnings and errors only.
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}
