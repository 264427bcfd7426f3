use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire shape of one alert entry as reported by a monitoring source.
///
/// The transport around this shape is unspecified; adapters normalize
/// whatever they poll into this record before anything downstream sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawAlertV1 {
    #[serde(default)]
    pub fingerprint: String,
    #[serde(alias = "state")]
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
    #[serde(rename = "endsAt", default)]
    pub ends_at: Option<DateTime<Utc>>,
}

pub fn validate_raw_alert(alert: &RawAlertV1) -> Result<(), String> {
    if alert.fingerprint.trim().is_empty() {
        return Err("fingerprint is required".into());
    }
    match alert.status.to_lowercase().as_str() {
        "firing" | "resolved" => {}
        other => return Err(format!("unknown alert status '{other}'")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawAlertV1 {
        RawAlertV1 {
            fingerprint: "abc123".into(),
            status: "firing".into(),
            labels: BTreeMap::from([("severity".into(), "critical".into())]),
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
        }
    }

    #[test]
    fn validates_raw_alert() {
        assert!(validate_raw_alert(&sample()).is_ok());
    }

    #[test]
    fn rejects_missing_fingerprint() {
        let mut alert = sample();
        alert.fingerprint = "  ".into();
        assert!(validate_raw_alert(&alert).is_err());
    }

    #[test]
    fn rejects_unknown_status() {
        let mut alert = sample();
        alert.status = "pending".into();
        assert!(validate_raw_alert(&alert).is_err());
    }

    #[test]
    fn deserializes_alertmanager_shape() {
        let raw: RawAlertV1 = serde_json::from_str(
            r#"{
                "fingerprint": "deadbeef",
                "state": "firing",
                "labels": {"alertname": "HighCpu", "severity": "warning"},
                "annotations": {"summary": "cpu is high"},
                "startsAt": "2026-08-01T10:00:00Z",
                "endsAt": null
            }"#,
        )
        .expect("parse");
        assert_eq!(raw.fingerprint, "deadbeef");
        assert_eq!(raw.status, "firing");
        assert_eq!(raw.labels.get("severity").map(String::as_str), Some("warning"));
        assert!(raw.ends_at.is_none());
    }
}
