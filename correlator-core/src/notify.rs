use crate::error::PipelineError;
use crate::store::{EventKind, Incident};
use async_trait::async_trait;

/// Outbound delivery capability. The concrete channel (email, SMS, chat) is
/// an external collaborator; the pipeline only needs this one call.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), PipelineError>;
}

/// Render the subject/body pair for a lifecycle notification.
pub fn render(incident: &Incident, kind: EventKind) -> (String, String) {
    let severity = incident.severity.as_str().to_uppercase();
    match kind {
        EventKind::Created => (
            format!("New incident [{severity}]: {}", incident.title),
            format!(
                "Incident {} opened for alert fingerprint {}.\n\
                 Severity: {severity}\n\
                 Detected at: {}\n\n\
                 {}\n\n\
                 Automated notification from the incident correlation pipeline.",
                incident.id,
                incident.fingerprint,
                incident.created_at.to_rfc3339(),
                incident.description,
            ),
        ),
        EventKind::Resolved => (
            format!("Incident resolved [{severity}]: {}", incident.title),
            format!(
                "Incident {} for alert fingerprint {} is resolved.\n\
                 Resolved at: {}\n\n\
                 Automated notification from the incident correlation pipeline.",
                incident.id,
                incident.fingerprint,
                incident
                    .resolved_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "unknown".into()),
            ),
        ),
    }
}
