use crate::alerts::Alert;
use crate::error::PipelineError;
use async_trait::async_trait;

/// One batch of current alert state from an external monitoring system.
///
/// Implementations normalize whatever they poll into [`Alert`] values and
/// drop (with a logged diagnostic) entries that fail validation; only a
/// total fetch failure is an error.
#[async_trait]
pub trait AlertSource: Send + Sync {
    async fn fetch_active_alerts(&self) -> Result<Vec<Alert>, PipelineError>;
}
