use thiserror::Error;

pub type Result<T> = std::result::Result<T, JournalError>;

/// Error kinds surfaced by the journal core. Variants are cloneable and
/// comparable so completion chains can store the first observed error and
/// replays can match on the exact failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    #[error("malformed message: {0}")]
    BadMessage(String),
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("superseded by a newer commit position")]
    Stale,
    #[error("journal shut down")]
    ShutDown,
    #[error("configuration out of range: {0}")]
    Domain(String),
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("object store I/O error: {0}")]
    Io(String),
    #[error("no space left in data pool")]
    NoSpace,
    #[error("object set full")]
    Overflow,
    #[error("resource busy")]
    Busy,
    #[error("restarted before completion")]
    Restart,
}

impl JournalError {
    pub fn bad_message(context: impl Into<String>) -> Self {
        JournalError::BadMessage(context.into())
    }

    pub fn invalid(context: impl Into<String>) -> Self {
        JournalError::Invalid(context.into())
    }

    /// Watch errors other than a deleted header are retried; a missing
    /// header means the journal is gone and the watch must not re-arm.
    pub fn is_fatal_watch_error(&self) -> bool {
        matches!(self, JournalError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_error_classification() {
        assert!(JournalError::NotFound.is_fatal_watch_error());
        assert!(!JournalError::Io("timeout".into()).is_fatal_watch_error());
        assert!(!JournalError::Stale.is_fatal_watch_error());
    }

    #[test]
    fn errors_compare_by_kind_and_context() {
        assert_eq!(JournalError::Exists, JournalError::Exists);
        assert_ne!(
            JournalError::Io("a".into()),
            JournalError::Io("b".into())
        );
    }
}
