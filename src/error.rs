//! Custom error types for the master.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer
//! of the control plane. Each subsystem keeps its own narrow error enum
//! (`CodecError`, `StoreError`, `WorkerError`, `ScheduleError`) and `DaqError`
//! wraps them with `#[from]` so the `?` operator works across layers.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment extraction failures and semantic
//!   validation failures of `MasterConfig`.
//! - **`Io`**: socket, pipe and file I/O.
//! - **`Codec`**: a line that is not a valid wire literal.
//! - **`Protocol`**: a well-formed value with the wrong shape for the protocol
//!   being spoken (missing fields, unknown actions, bad handshake).
//! - **`Remote`**: an RPC call that the remote side answered with an error. The
//!   message carries the remote error kind, e.g. `"ValueError: bad"`.
//! - **`Store`**, **`Worker`**, **`Scheduler`**: subsystem errors.

use crate::codec::CodecError;
use crate::scheduler::ScheduleError;
use crate::sync_struct::StoreError;
use crate::worker::WorkerError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] ScheduleError),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Remote("ValueError: bad".to_string());
        assert_eq!(err.to_string(), "Remote error: ValueError: bad");
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Protocol("bad handshake".into()),
            DaqError::ConnectionClosed,
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }

    #[test]
    fn test_subsystem_errors_convert() {
        let err: DaqError = CodecError::TrailingInput(3).into();
        assert!(matches!(err, DaqError::Codec(_)));
        let err: DaqError = WorkerError::WorkerFailed("no ack".into()).into();
        assert!(err.to_string().contains("no ack"));
    }
}
