use thiserror::Error;

/// Error taxonomy for stage bodies. Whether a failure is retryable is a
/// property of the error, not of the stage that raised it.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("transient i/o failure: {0}")]
    Transient(String),
    #[error("precondition not met: {0}")]
    Precondition(String),
    #[error("{0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Why a run ended up `failed`. Persisted as a prefix of the run's error
/// string so operators can tell a cancel apart from a crash or a stage bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFailureKind {
    Cancelled,
    Orphaned,
    StageFailed,
}

impl RunFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Orphaned => "orphaned",
            Self::StageFailed => "stage_failed",
        }
    }

    pub fn tag(self, detail: &str) -> String {
        format!("{}: {detail}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{RunFailureKind, StageError};

    #[test]
    fn transient_errors_are_retryable() {
        assert!(StageError::transient("read interrupted").is_transient());
        assert!(!StageError::fatal("bad payload").is_transient());
        assert!(!StageError::Precondition("missing input".into()).is_transient());
    }

    #[test]
    fn failure_tags_are_prefixed() {
        assert_eq!(
            RunFailureKind::Cancelled.tag("by operator"),
            "cancelled: by operator"
        );
        assert_eq!(
            RunFailureKind::Orphaned.tag("pid 42 is gone"),
            "orphaned: pid 42 is gone"
        );
    }
}
