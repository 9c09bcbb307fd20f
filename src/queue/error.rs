//! Queue error types.

use std::fmt;
use std::time::Duration;

/// Errors returned by queues, worker pools and the queue registry.
#[derive(Debug)]
pub enum QueueError {
    /// An equal item is already waiting in a unique queue.
    AlreadyInQueue,

    /// The queue variant does not support the operation.
    Unsupported(&'static str),

    /// Unknown queue type name.
    UnsupportedType(String),

    /// A flush did not complete before its timeout.
    FlushTimeout(Duration),

    /// The flush context was cancelled before the queue drained.
    FlushCancelled,

    /// `flush_all` gave up with these queues still holding items.
    NonEmptyQueues(Vec<String>),

    /// The pool has been terminated.
    Terminated,

    /// A `push_func` callback refused the item.
    Rejected(String),

    /// Reading or writing the durable backing failed.
    Persistence(String),
}

impl QueueError {
    /// Check if this is a duplicate-item error.
    pub fn is_already_in_queue(&self) -> bool {
        matches!(self, QueueError::AlreadyInQueue)
    }

    /// Check if a flush stopped early, by timeout or cancellation.
    pub fn is_flush_interrupted(&self) -> bool {
        matches!(
            self,
            QueueError::FlushTimeout(_) | QueueError::FlushCancelled | QueueError::NonEmptyQueues(_)
        )
    }

    /// Check if this is a termination error.
    pub fn is_terminated(&self) -> bool {
        matches!(self, QueueError::Terminated)
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::AlreadyInQueue => write!(f, "already in queue"),
            QueueError::Unsupported(op) => write!(f, "operation not supported by this queue: {}", op),
            QueueError::UnsupportedType(ty) => write!(f, "unsupported queue type: {}", ty),
            QueueError::FlushTimeout(d) => {
                write!(f, "flush timed out after {}ms", d.as_millis())
            }
            QueueError::FlushCancelled => write!(f, "flush cancelled"),
            QueueError::NonEmptyQueues(names) => {
                write!(f, "flush timeout with non-empty queues: {}", names.join(", "))
            }
            QueueError::Terminated => write!(f, "queue has been terminated"),
            QueueError::Rejected(msg) => write!(f, "push rejected: {}", msg),
            QueueError::Persistence(msg) => write!(f, "persistence error: {}", msg),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Persistence(err.to_string())
    }
}

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_in_queue() {
        let err = QueueError::AlreadyInQueue;
        assert!(err.is_already_in_queue());
        assert!(!err.is_flush_interrupted());
        assert_eq!(err.to_string(), "already in queue");
    }

    #[test]
    fn test_flush_errors_distinguishable() {
        let timeout = QueueError::FlushTimeout(Duration::from_millis(1500));
        let cancelled = QueueError::FlushCancelled;
        assert!(timeout.is_flush_interrupted());
        assert!(cancelled.is_flush_interrupted());
        assert!(timeout.to_string().contains("1500"));
        assert!(!matches!(cancelled, QueueError::FlushTimeout(_)));
    }

    #[test]
    fn test_non_empty_queues_lists_names() {
        let err = QueueError::NonEmptyQueues(vec!["issues".into(), "mirror".into()]);
        assert!(err.to_string().ends_with("issues, mirror"));
    }
}
