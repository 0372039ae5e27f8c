//! Worker fleet supervision for the gantry application server.
//!
//! [`Server`] is the multi-process supervisor: it owns the listening socket
//! and PID file, forks worker processes and enforces fleet policies
//! (respawn-on-crash, reload, lifetime and memory limits).
//! [`EmbeddedServer`] applies the same state machine to worker tasks on the
//! caller's event loop.
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod embed;
pub mod envfiles;
pub mod pidfile;
pub mod reload;
mod rss;
mod server;
mod signals;
mod state;
mod worker;

pub use embed::{EmbeddedServer, WorkerSignal};
pub use reload::ReloadConfig;
pub use server::{Hook, Server, WORKER_CONFIG_ENV, WORKER_ID_ENV};

use tracing_subscriber::EnvFilter;

/// Log verbosity levels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Operational messages.
    #[default]
    Info,
    /// Verbose diagnostics.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides `level` when set. Safe to call more than once; later
/// calls are no-ops.
pub fn configure_logging(level: LogLevel, enabled: bool) {
    if !enabled {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_logging_idempotent() {
        configure_logging(LogLevel::Info, true);
        configure_logging(LogLevel::Debug, true);
        configure_logging(LogLevel::Error, false);
    }
}
