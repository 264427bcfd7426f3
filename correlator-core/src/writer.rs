use crate::alerts::Alert;
use crate::error::PipelineError;
use crate::store::{EventKind, Incident, IncidentStatus, IncidentStore, NotificationTask};
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

/// Performs the incident writes and enqueues the matching notification
/// tasks. Each write is a single SQLite statement, so it is all-or-nothing;
/// losing a notification is the cheaper failure, so enqueue errors are
/// logged and never roll the incident back.
#[derive(Clone)]
pub struct IncidentWriter {
    store: IncidentStore,
}

impl IncidentWriter {
    pub fn new(store: IncidentStore) -> Self {
        IncidentWriter { store }
    }

    pub fn create_from_alert(&self, alert: &Alert) -> Result<Incident, PipelineError> {
        let incident = Incident {
            id: Uuid::new_v4(),
            fingerprint: alert.fingerprint.clone(),
            status: IncidentStatus::Open,
            severity: alert.severity(),
            title: alert.title(),
            description: alert.description(),
            source_type: "alert".into(),
            // detection time is the alert's own start, not the poll time;
            // the stale-resolve comparison depends on this
            created_at: alert.starts_at,
            resolved_at: None,
        };
        self.store.insert_incident(&incident)?;
        self.enqueue(incident.id, EventKind::Created);
        Ok(incident)
    }

    /// Returns `None` when the incident was not open anymore; a concurrent
    /// run may have resolved it first.
    pub fn resolve(
        &self,
        incident_id: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<Incident>, PipelineError> {
        let Some(incident) = self.store.resolve_incident(incident_id, resolved_at)? else {
            return Ok(None);
        };
        self.enqueue(incident.id, EventKind::Resolved);
        Ok(Some(incident))
    }

    fn enqueue(&self, incident_id: Uuid, kind: EventKind) {
        let task = NotificationTask::new(incident_id, kind, Utc::now());
        if let Err(err) = self.store.enqueue_task(&task) {
            warn!(
                incident_id = %incident_id,
                kind = kind.as_str(),
                error = %err,
                "failed to enqueue notification task; incident write kept"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertStatus, Severity};
    use crate::store::tests::db_path;
    use crate::store::TaskStatus;
    use std::collections::BTreeMap;

    fn firing_alert(fingerprint: &str) -> Alert {
        Alert {
            fingerprint: fingerprint.into(),
            status: AlertStatus::Firing,
            labels: BTreeMap::from([
                ("severity".into(), "critical".into()),
                ("alertname".into(), "HighCpu".into()),
            ]),
            annotations: BTreeMap::from([("summary".into(), "cpu is high".into())]),
            starts_at: Utc::now(),
            ends_at: None,
        }
    }

    #[test]
    fn create_derives_fields_and_enqueues_task() {
        let store = IncidentStore::open(&db_path("writer-create")).expect("open");
        let writer = IncidentWriter::new(store.clone());

        let incident = writer
            .create_from_alert(&firing_alert("fp-a"))
            .expect("create");
        assert_eq!(incident.fingerprint, "fp-a");
        assert_eq!(incident.severity, Severity::Critical);
        assert_eq!(incident.title, "cpu is high");
        assert_eq!(incident.source_type, "alert");

        let tasks = store.due_tasks(Utc::now(), 10).expect("due");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].incident_id, incident.id);
        assert_eq!(tasks[0].event_kind, EventKind::Created);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
    }

    #[test]
    fn create_uses_alert_start_as_created_at() {
        let store = IncidentStore::open(&db_path("writer-created-at")).expect("open");
        let writer = IncidentWriter::new(store);

        let mut alert = firing_alert("fp-a");
        alert.starts_at = Utc::now() - chrono::Duration::minutes(42);
        let incident = writer.create_from_alert(&alert).expect("create");
        assert_eq!(incident.created_at, alert.starts_at);
    }

    #[test]
    fn duplicate_create_surfaces_conflict() {
        let store = IncidentStore::open(&db_path("writer-conflict")).expect("open");
        let writer = IncidentWriter::new(store);

        writer.create_from_alert(&firing_alert("fp-a")).expect("first");
        let err = writer
            .create_from_alert(&firing_alert("fp-a"))
            .expect_err("second");
        assert!(matches!(err, PipelineError::StorageConflict { .. }));
    }

    #[test]
    fn resolve_enqueues_resolved_task() {
        let store = IncidentStore::open(&db_path("writer-resolve")).expect("open");
        let writer = IncidentWriter::new(store.clone());

        let incident = writer
            .create_from_alert(&firing_alert("fp-a"))
            .expect("create");
        let resolved = writer
            .resolve(incident.id, Utc::now())
            .expect("resolve call")
            .expect("was open");
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        let kinds: Vec<EventKind> = store
            .due_tasks(Utc::now(), 10)
            .expect("due")
            .into_iter()
            .map(|t| t.event_kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::Created, EventKind::Resolved]);
    }

    #[test]
    fn resolving_missing_incident_returns_none() {
        let store = IncidentStore::open(&db_path("writer-missing")).expect("open");
        let writer = IncidentWriter::new(store);
        let out = writer.resolve(Uuid::new_v4(), Utc::now()).expect("call");
        assert!(out.is_none());
    }
}
