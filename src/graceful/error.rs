//! Graceful manager error types.

use std::fmt;
use std::io;

/// Errors reported by the graceful manager.
#[derive(Debug)]
pub enum GracefulError {
    /// The manager finished terminating; the context view is done.
    Done,
    /// A forked child already owns the listeners.
    AlreadyForked,
    /// Starting or signalling another process failed.
    Process(io::Error),
    /// Socket handoff is not available on this platform.
    Unsupported(&'static str),
}

impl GracefulError {
    pub fn is_done(&self) -> bool {
        matches!(self, GracefulError::Done)
    }
}

impl fmt::Display for GracefulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GracefulError::Done => write!(f, "manager terminated"),
            GracefulError::AlreadyForked => {
                write!(f, "another process already forked, ignoring this one")
            }
            GracefulError::Process(e) => write!(f, "process error: {}", e),
            GracefulError::Unsupported(what) => write!(f, "not supported on this platform: {}", what),
        }
    }
}

impl std::error::Error for GracefulError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GracefulError::Process(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GracefulError {
    fn from(err: io::Error) -> Self {
        GracefulError::Process(err)
    }
}
