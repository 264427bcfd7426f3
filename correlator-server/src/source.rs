use alert_registry::RawAlertV1;
use async_trait::async_trait;
use correlator_core::alerts::Alert;
use correlator_core::error::PipelineError;
use correlator_core::source::AlertSource;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, warn};

/// Response envelope of a Prometheus Alertmanager-style alerts endpoint:
/// `{"status": "success", "data": {"alerts": [...]}}`.
#[derive(Debug, Deserialize)]
struct SourceResponse {
    status: String,
    #[serde(default)]
    data: SourceData,
}

#[derive(Debug, Default, Deserialize)]
struct SourceData {
    #[serde(default)]
    alerts: Vec<serde_json::Value>,
}

/// Polls one or more Alertmanager endpoints and merges their alerts by
/// fingerprint. Individual endpoint failures are logged and tolerated; the
/// fetch only fails when every configured endpoint does.
pub struct AlertmanagerSource {
    urls: Vec<String>,
    client: reqwest::Client,
}

impl AlertmanagerSource {
    pub fn new(urls: Vec<String>) -> Self {
        AlertmanagerSource {
            urls,
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_endpoint(&self, url: &str) -> Result<Vec<Alert>, PipelineError> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("{url}: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::SourceUnavailable(format!("{url}: {e}")))?;

        let payload: SourceResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("{url}: decode: {e}")))?;

        if payload.status != "success" {
            return Err(PipelineError::SourceUnavailable(format!(
                "{url} returned status '{}'",
                payload.status
            )));
        }

        Ok(normalize_entries(url, payload.data.alerts))
    }
}

/// Normalize raw payload entries, dropping anything that fails validation.
/// A missing fingerprint is a diagnostic, never a batch error.
fn normalize_entries(source: &str, entries: Vec<serde_json::Value>) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for entry in entries {
        let normalized = serde_json::from_value::<RawAlertV1>(entry)
            .map_err(|e| PipelineError::MalformedAlert(e.to_string()))
            .and_then(Alert::from_raw);
        match normalized {
            Ok(alert) => alerts.push(alert),
            Err(err) => warn!(source, error = %err, "dropping alert that failed normalization"),
        }
    }
    alerts
}

#[async_trait]
impl AlertSource for AlertmanagerSource {
    async fn fetch_active_alerts(&self) -> Result<Vec<Alert>, PipelineError> {
        if self.urls.is_empty() {
            warn!("no alert source urls configured; nothing to fetch");
            return Ok(Vec::new());
        }

        let results =
            futures::future::join_all(self.urls.iter().map(|url| self.fetch_endpoint(url))).await;

        let mut merged: BTreeMap<String, Alert> = BTreeMap::new();
        let mut failures = 0usize;
        for (url, result) in self.urls.iter().zip(results) {
            match result {
                Ok(alerts) => {
                    // multiple sources may report the same condition
                    for alert in alerts {
                        merged.insert(alert.fingerprint.clone(), alert);
                    }
                }
                Err(err) => {
                    failures += 1;
                    error!(source = url.as_str(), error = %err, "alert endpoint fetch failed");
                }
            }
        }

        if failures == self.urls.len() {
            return Err(PipelineError::SourceUnavailable(
                "all alert endpoints failed".into(),
            ));
        }
        Ok(merged.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use correlator_core::alerts::AlertStatus;
    use serde_json::json;

    #[test]
    fn normalizes_well_formed_entries() {
        let entries = vec![json!({
            "fingerprint": "abc",
            "state": "firing",
            "labels": {"severity": "critical"},
            "annotations": {"summary": "cpu is high"},
            "startsAt": "2026-08-01T10:00:00Z",
            "endsAt": null
        })];
        let alerts = normalize_entries("test", entries);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].fingerprint, "abc");
        assert_eq!(alerts[0].status, AlertStatus::Firing);
    }

    #[test]
    fn drops_entry_without_fingerprint() {
        let entries = vec![
            json!({
                "state": "firing",
                "labels": {},
                "startsAt": "2026-08-01T10:00:00Z"
            }),
            json!({
                "fingerprint": "keep-me",
                "status": "resolved",
                "startsAt": "2026-08-01T10:00:00Z",
                "endsAt": "2026-08-01T11:00:00Z"
            }),
        ];
        let alerts = normalize_entries("test", entries);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].fingerprint, "keep-me");
        assert_eq!(alerts[0].status, AlertStatus::Resolved);
        assert!(alerts[0].ends_at.is_some());
    }

    #[test]
    fn drops_entry_with_unknown_status() {
        let entries = vec![json!({
            "fingerprint": "abc",
            "state": "suppressed",
            "startsAt": "2026-08-01T10:00:00Z"
        })];
        assert!(normalize_entries("test", entries).is_empty());
    }

    #[test]
    fn decodes_envelope() {
        let payload: SourceResponse = serde_json::from_str(
            r#"{"status": "success", "data": {"alerts": []}}"#,
        )
        .expect("parse");
        assert_eq!(payload.status, "success");
        assert!(payload.data.alerts.is_empty());
    }
}
