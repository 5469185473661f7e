//! Runner error types

use thiserror::Error;

/// Errors raised by the dispatcher core and test selection.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to create pipe: {0}")]
    ChannelCreate(#[source] nix::Error),

    #[error("failed to start worker: {0}")]
    Spawn(String),

    #[error("event multiplexer error: {0}")]
    Multiplexer(#[source] std::io::Error),

    #[error("failed to discover queue count: {0}")]
    Discovery(String),

    #[error("failed to install signal handling: {0}")]
    Signal(#[source] nix::Error),

    #[error("invalid runner options: {0}")]
    InvalidOptions(String),

    #[error("invalid test pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to write JUnit XML to {path}: {source}")]
    Junit {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Dispatcher bookkeeping is corrupt; the run cannot continue.
    #[error("internal runner error: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
