use crate::model::ConnectionTarget;
use std::io;
use thiserror::Error;

/// Failures talking to a command station.
///
/// None of these are fatal to the process: runtime errors are logged by the
/// component that hit them, and only [`StationError::Unreachable`] is meant
/// to be surfaced to whoever is accepting a new station.
#[derive(Debug, Error)]
pub enum StationError {
    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: ConnectionTarget,
        #[source]
        source: io::Error,
    },

    #[error("connection to {target} timed out after {timeout_ms}ms")]
    Timeout {
        target: ConnectionTarget,
        timeout_ms: u64,
    },

    #[error("failed to send {command} to {target}: {source}")]
    Send {
        target: ConnectionTarget,
        command: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("stream from {target} failed: {source}")]
    StreamRead {
        target: ConnectionTarget,
        #[source]
        source: io::Error,
    },

    #[error("cannot_connect: {target} is not reachable ({reason})")]
    Unreachable {
        target: ConnectionTarget,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, StationError>;
