use thiserror::Error;

/// Failure taxonomy for the correlation pipeline.
///
/// Per-alert failures are isolated and logged with the fingerprint; only
/// `SourceUnavailable` aborts an entire scheduled run. Nothing here is ever
/// allowed to crash the process — the pipeline is re-entrant on the next tick.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Alert fetch failed. Retried on the next scheduled run, never within
    /// the same run.
    #[error("alert source unavailable: {0}")]
    SourceUnavailable(String),

    /// The source handed us an alert missing required fields. The alert is
    /// dropped and logged; it does not fail the batch.
    #[error("malformed alert: {0}")]
    MalformedAlert(String),

    /// A concurrent writer won a uniqueness race: the open-incident index
    /// for a fingerprint, or a duplicate rule name. The incident-create
    /// loser degrades to AlreadyOpen; this is not an operational error.
    #[error("conflicting write for {key}")]
    StorageConflict { key: String },

    /// Incident write failed. Fatal for that alert this run; the alert will
    /// reappear from the source while still firing.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Delivery through the notification channel failed. Retried with
    /// backoff by the dispatcher; exhaustion marks the task failed.
    #[error("notification delivery failed: {0}")]
    NotificationDeliveryFailed(String),
}

impl PipelineError {
    /// Split storage errors into conflict vs. unavailable. A unique-index
    /// violation means another writer won the race for `key`.
    pub fn from_sqlite(err: rusqlite::Error, key: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                PipelineError::StorageConflict {
                    key: key.to_string(),
                }
            }
            _ => PipelineError::StorageUnavailable(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::StorageUnavailable(err.to_string())
    }
}
