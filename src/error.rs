use uuid::Uuid;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stale position report for train {train_id}: {reported} is not newer than {latest}")]
    Stale {
        train_id: u32,
        reported: chrono::DateTime<chrono::Utc>,
        latest: chrono::DateTime<chrono::Utc>,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Precondition failed: {0}")]
    Precondition(Precondition),

    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Overloaded: ingestion queue full")]
    Overloaded,

    #[error("Internal error [{correlation_id}]")]
    Internal { correlation_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Precondition {
    #[error("conflict already resolved")]
    AlreadyResolved,
    #[error("ai solution id does not match the conflict's current suggestions")]
    AiSolutionMismatch,
    #[error("decision awaiting approval")]
    AwaitingApproval,
    #[error("decision already executed")]
    AlreadyExecuted,
}

impl EngineError {
    /// Wrap an uncovered failure, logging it with a correlation id so the
    /// opaque code surfaced to the caller can be matched to the log line.
    pub fn internal(err: anyhow::Error) -> Self {
        let correlation_id = Uuid::new_v4();
        tracing::error!(%correlation_id, error = ?err, "internal engine error");
        EngineError::Internal { correlation_id }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_error_formats_both_timestamps() {
        let latest = chrono::Utc::now();
        let reported = latest - chrono::Duration::seconds(30);
        let err = EngineError::Stale {
            train_id: 301,
            reported,
            latest,
        };
        let text = err.to_string();
        assert!(text.contains("301"));
        assert!(text.contains("not newer"));
    }

    #[test]
    fn transient_is_flagged_retryable() {
        assert!(EngineError::Transient("db closed".into()).is_transient());
        assert!(!EngineError::Overloaded.is_transient());
    }
}
