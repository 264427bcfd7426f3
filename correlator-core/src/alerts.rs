use crate::error::PipelineError;
use alert_registry::{validate_raw_alert, RawAlertV1};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Severity taken from an alert's `severity` label.
/// Variant order is the comparison order: Critical > High > Warning > Info.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl Severity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// Normalized snapshot of an external alert. Immutable once fetched; every
/// poll produces fresh values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub fingerprint: String,
    pub status: AlertStatus,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn from_raw(raw: RawAlertV1) -> Result<Self, PipelineError> {
        validate_raw_alert(&raw).map_err(PipelineError::MalformedAlert)?;
        let status = match raw.status.to_lowercase().as_str() {
            "firing" => AlertStatus::Firing,
            _ => AlertStatus::Resolved,
        };
        Ok(Alert {
            fingerprint: raw.fingerprint,
            status,
            labels: raw.labels,
            annotations: raw.annotations,
            starts_at: raw.starts_at,
            ends_at: raw.ends_at,
        })
    }

    /// Missing or unrecognized severity labels parse to the lowest level so
    /// that min-severity rules never match on them.
    pub fn severity(&self) -> Severity {
        self.labels
            .get("severity")
            .and_then(|value| Severity::parse(value))
            .unwrap_or(Severity::Info)
    }

    pub fn title(&self) -> String {
        self.annotations
            .get("summary")
            .or_else(|| self.labels.get("alertname"))
            .cloned()
            .unwrap_or_else(|| "Untitled alert".to_string())
    }

    pub fn description(&self) -> String {
        self.annotations
            .get("description")
            .cloned()
            .unwrap_or_else(|| "No description provided.".to_string())
    }
}
