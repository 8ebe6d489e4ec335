//! Daemon-level errors and iteration outcomes

use std::io;

use thiserror::Error;

use autosync_core::ConfigError;

use crate::binder::BindError;
use crate::collaborators::CollaboratorError;

/// Anything that can abort a scheduler iteration
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("listener error: {0}")]
    Bind(#[from] BindError),

    #[error("synchronization failed: {0}")]
    Sync(#[source] CollaboratorError),

    #[error("callback registration failed: {0}")]
    Callback(#[source] CollaboratorError),

    #[error("callback listener failed: {0}")]
    Listener(#[from] io::Error),
}

impl DaemonError {
    /// Whether retrying can never help
    ///
    /// Invalid configuration and an explicitly configured port the process
    /// is not allowed to bind end the loop; everything else is retried
    /// after a backoff.
    pub fn is_fatal(&self) -> bool {
        match self {
            DaemonError::Config(_) => true,
            DaemonError::Bind(BindError::Bind { source, .. }) => matches!(
                source.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::AddrNotAvailable
            ),
            _ => false,
        }
    }
}

/// Result of one pass through the scheduler loop
#[derive(Debug)]
pub enum IterationOutcome {
    Ok,
    Recoverable(DaemonError),
    Fatal(DaemonError),
}

impl From<Result<(), DaemonError>> for IterationOutcome {
    fn from(result: Result<(), DaemonError>) -> Self {
        match result {
            Ok(()) => IterationOutcome::Ok,
            Err(e) if e.is_fatal() => IterationOutcome::Fatal(e),
            Err(e) => IterationOutcome::Recoverable(e),
        }
    }
}

/// Error message followed by every `source()` in the chain
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        current = cause.source();
    }
    out
}
