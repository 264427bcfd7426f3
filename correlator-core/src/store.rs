use crate::alerts::Severity;
use crate::error::PipelineError;
use crate::filter::{FilterRule, RuleAction};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Resolved => "resolved",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(IncidentStatus::Open),
            "resolved" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }
}

/// Incident record owned by the pipeline. Never deleted here; downstream
/// lifecycle (mitigation, closure) belongs to the surrounding module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub fingerprint: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub source_type: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Resolved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Resolved => "resolved",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(EventKind::Created),
            "resolved" => Some(EventKind::Resolved),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Attempting,
    Sent,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Attempting => "attempting",
            TaskStatus::Sent => "sent",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "attempting" => Some(TaskStatus::Attempting),
            "sent" => Some(TaskStatus::Sent),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Persisted retry state for one lifecycle notification. The dispatcher
/// drives this through pending → attempting → sent | failed; keeping it in
/// the store means a crash mid-retry recovers from the table, not from
/// in-process state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationTask {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub event_kind: EventKind,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NotificationTask {
    pub fn new(incident_id: Uuid, event_kind: EventKind, now: DateTime<Utc>) -> Self {
        NotificationTask {
            id: Uuid::new_v4(),
            incident_id,
            event_kind,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: i64,
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub min_severity: Option<Severity>,
    pub action: RuleAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update for a rule; absent fields are left unchanged.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub match_labels: Option<BTreeMap<String, String>>,
    pub min_severity: Option<Severity>,
    pub action: Option<RuleAction>,
    pub enabled: Option<bool>,
}

#[derive(Clone)]
pub struct IncidentStore {
    db_path: Arc<PathBuf>,
}

const INCIDENT_COLUMNS: &str =
    "id, fingerprint, status, severity, title, description, source_type, created_at, resolved_at";
const TASK_COLUMNS: &str =
    "id, incident_id, event_kind, status, attempts, last_error, next_attempt_at, created_at";
const RULE_COLUMNS: &str =
    "id, seq, name, description, priority, match_labels, min_severity, action, enabled, created_at";

impl IncidentStore {
    pub fn open(path: &str) -> Result<Self, PipelineError> {
        let db_path = PathBuf::from(path);
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::StorageUnavailable(e.to_string()))?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                source_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_open_fingerprint
                ON incidents(fingerprint) WHERE status = 'open';
            CREATE INDEX IF NOT EXISTS idx_incidents_created ON incidents(created_at);
            CREATE TABLE IF NOT EXISTS notification_tasks (
                id TEXT PRIMARY KEY,
                incident_id TEXT NOT NULL,
                event_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                next_attempt_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON notification_tasks(status, next_attempt_at);
            CREATE TABLE IF NOT EXISTS filter_rules (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                priority INTEGER NOT NULL,
                match_labels TEXT NOT NULL,
                min_severity TEXT,
                action TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    fn conn(&self) -> Result<Connection, PipelineError> {
        let conn = Connection::open(&*self.db_path)?;
        // writers from concurrent runs may contend on the same file
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    // ── incidents ────────────────────────────────────────────────────────

    /// Single atomic insert. The partial unique index rejects a second open
    /// incident for the fingerprint; that surfaces as `StorageConflict`.
    pub fn insert_incident(&self, incident: &Incident) -> Result<(), PipelineError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO incidents
                 (id, fingerprint, status, severity, title, description,
                  source_type, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                incident.id.to_string(),
                incident.fingerprint,
                incident.status.as_str(),
                incident.severity.as_str(),
                incident.title,
                incident.description,
                incident.source_type,
                incident.created_at.to_rfc3339(),
                incident.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| PipelineError::from_sqlite(e, &incident.fingerprint))?;
        Ok(())
    }

    pub fn open_incident_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Incident>, PipelineError> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents
                     WHERE fingerprint = ?1 AND status = 'open'"
                ),
                params![fingerprint],
                map_incident_row,
            )
            .optional()?;
        Ok(incident)
    }

    pub fn incident_by_id(&self, id: Uuid) -> Result<Option<Incident>, PipelineError> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
                params![id.to_string()],
                map_incident_row,
            )
            .optional()?;
        Ok(incident)
    }

    pub fn list_incidents(&self, limit: usize) -> Result<Vec<Incident>, PipelineError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents
             ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_incident_row)?;
        collect_rows(rows)
    }

    /// Transition open → resolved. Returns `None` when the incident is
    /// missing or was already resolved (e.g. by a concurrent run).
    pub fn resolve_incident(
        &self,
        id: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<Incident>, PipelineError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE incidents SET status = 'resolved', resolved_at = ?1
             WHERE id = ?2 AND status = 'open'",
            params![resolved_at.to_rfc3339(), id.to_string()],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.incident_by_id(id)
    }

    // ── notification tasks ───────────────────────────────────────────────

    pub fn enqueue_task(&self, task: &NotificationTask) -> Result<(), PipelineError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notification_tasks
                 (id, incident_id, event_kind, status, attempts, last_error,
                  next_attempt_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id.to_string(),
                task.incident_id.to_string(),
                task.event_kind.as_str(),
                task.status.as_str(),
                task.attempts,
                task.last_error,
                task.next_attempt_at.to_rfc3339(),
                task.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Tasks eligible for delivery. `attempting` rows are included so that a
    /// dispatcher crash between send and mark re-delivers (at-least-once).
    pub fn due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationTask>, PipelineError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM notification_tasks
             WHERE status IN ('pending', 'attempting') AND next_attempt_at <= ?1
             ORDER BY next_attempt_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![now.to_rfc3339(), limit as i64], map_task_row)?;
        collect_rows(rows)
    }

    /// Mark a task attempting and bump its attempt counter; returns the new
    /// counter value.
    pub fn begin_attempt(&self, id: Uuid) -> Result<u32, PipelineError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE notification_tasks
             SET status = 'attempting', attempts = attempts + 1
             WHERE id = ?1",
            params![id.to_string()],
        )?;
        let attempts = conn.query_row(
            "SELECT attempts FROM notification_tasks WHERE id = ?1",
            params![id.to_string()],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(attempts)
    }

    pub fn mark_task_sent(&self, id: Uuid) -> Result<(), PipelineError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE notification_tasks SET status = 'sent', last_error = NULL
             WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub fn schedule_retry(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE notification_tasks
             SET status = 'attempting', last_error = ?1, next_attempt_at = ?2
             WHERE id = ?3",
            params![error, next_attempt_at.to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn mark_task_failed(&self, id: Uuid, error: &str) -> Result<(), PipelineError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE notification_tasks SET status = 'failed', last_error = ?1
             WHERE id = ?2",
            params![error, id.to_string()],
        )?;
        Ok(())
    }

    /// Tasks that exhausted their retry budget, for operator visibility.
    pub fn failed_tasks(&self) -> Result<Vec<NotificationTask>, PipelineError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM notification_tasks
             WHERE status = 'failed' ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], map_task_row)?;
        collect_rows(rows)
    }

    pub fn task_by_id(&self, id: Uuid) -> Result<Option<NotificationTask>, PipelineError> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM notification_tasks WHERE id = ?1"),
                params![id.to_string()],
                map_task_row,
            )
            .optional()?;
        Ok(task)
    }

    // ── filter rules ─────────────────────────────────────────────────────

    pub fn create_rule(&self, rule: &NewRule) -> Result<FilterRule, PipelineError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let match_labels = serde_json::to_string(&rule.match_labels)
            .map_err(|e| PipelineError::StorageUnavailable(e.to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO filter_rules
                 (id, name, description, priority, match_labels, min_severity,
                  action, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.to_string(),
                rule.name,
                rule.description,
                rule.priority,
                match_labels,
                rule.min_severity.map(|s| s.as_str()),
                rule.action.as_str(),
                rule.enabled,
                created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| PipelineError::from_sqlite(e, &rule.name))?;

        self.rule_by_id(id)?.ok_or_else(|| {
            PipelineError::StorageUnavailable("rule vanished after insert".into())
        })
    }

    pub fn rule_by_id(&self, id: Uuid) -> Result<Option<FilterRule>, PipelineError> {
        let conn = self.conn()?;
        let rule = conn
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM filter_rules WHERE id = ?1"),
                params![id.to_string()],
                map_rule_row,
            )
            .optional()?;
        Ok(rule)
    }

    pub fn list_rules(&self) -> Result<Vec<FilterRule>, PipelineError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM filter_rules ORDER BY priority ASC, seq ASC"
        ))?;
        let rows = stmt.query_map([], map_rule_row)?;
        collect_rows(rows)
    }

    /// The rule set the filter engine evaluates. Loaded once per scheduler
    /// run, so staleness is bounded by the poll interval.
    pub fn enabled_rules(&self) -> Result<Vec<FilterRule>, PipelineError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM filter_rules
             WHERE enabled = 1 ORDER BY priority ASC, seq ASC"
        ))?;
        let rows = stmt.query_map([], map_rule_row)?;
        collect_rows(rows)
    }

    /// Apply a partial update; absent fields keep their stored value.
    /// Returns `None` for an unknown rule id.
    pub fn update_rule(
        &self,
        id: Uuid,
        update: &RuleUpdate,
    ) -> Result<Option<FilterRule>, PipelineError> {
        let Some(current) = self.rule_by_id(id)? else {
            return Ok(None);
        };

        let name = update.name.clone().unwrap_or(current.name);
        let description = update.description.clone().or(current.description);
        let priority = update.priority.unwrap_or(current.priority);
        let match_labels = update
            .match_labels
            .clone()
            .unwrap_or(current.match_labels);
        let min_severity = update.min_severity.or(current.min_severity);
        let action = update.action.unwrap_or(current.action);
        let enabled = update.enabled.unwrap_or(current.enabled);

        let labels_json = serde_json::to_string(&match_labels)
            .map_err(|e| PipelineError::StorageUnavailable(e.to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            "UPDATE filter_rules
             SET name = ?1, description = ?2, priority = ?3, match_labels = ?4,
                 min_severity = ?5, action = ?6, enabled = ?7
             WHERE id = ?8",
            params![
                name,
                description,
                priority,
                labels_json,
                min_severity.map(|s| s.as_str()),
                action.as_str(),
                enabled,
                id.to_string(),
            ],
        )
        .map_err(|e| PipelineError::from_sqlite(e, &name))?;

        self.rule_by_id(id)
    }

    pub fn disable_rule(&self, id: Uuid) -> Result<Option<FilterRule>, PipelineError> {
        self.update_rule(
            id,
            &RuleUpdate {
                enabled: Some(false),
                ..RuleUpdate::default()
            },
        )
    }
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, PipelineError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn conversion_failure(idx: usize, what: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized {what}").into(),
    )
}

fn map_incident_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let severity: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    let resolved_at: Option<String> = row.get(8)?;

    Ok(Incident {
        id: id.parse().map_err(|_| conversion_failure(0, "uuid"))?,
        fingerprint: row.get(1)?,
        status: IncidentStatus::parse(&status)
            .ok_or_else(|| conversion_failure(2, "incident status"))?,
        severity: Severity::parse(&severity)
            .ok_or_else(|| conversion_failure(3, "severity"))?,
        title: row.get(4)?,
        description: row.get(5)?,
        source_type: row.get(6)?,
        created_at: parse_timestamp(7, &created_at)?,
        resolved_at: resolved_at
            .map(|t| parse_timestamp(8, &t))
            .transpose()?,
    })
}

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationTask> {
    let id: String = row.get(0)?;
    let incident_id: String = row.get(1)?;
    let event_kind: String = row.get(2)?;
    let status: String = row.get(3)?;
    let next_attempt_at: String = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(NotificationTask {
        id: id.parse().map_err(|_| conversion_failure(0, "uuid"))?,
        incident_id: incident_id
            .parse()
            .map_err(|_| conversion_failure(1, "uuid"))?,
        event_kind: EventKind::parse(&event_kind)
            .ok_or_else(|| conversion_failure(2, "event kind"))?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| conversion_failure(3, "task status"))?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        next_attempt_at: parse_timestamp(6, &next_attempt_at)?,
        created_at: parse_timestamp(7, &created_at)?,
    })
}

fn map_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FilterRule> {
    let id: String = row.get(0)?;
    let match_labels: String = row.get(5)?;
    let min_severity: Option<String> = row.get(6)?;
    let action: String = row.get(7)?;
    let created_at: String = row.get(9)?;

    Ok(FilterRule {
        id: id.parse().map_err(|_| conversion_failure(0, "uuid"))?,
        seq: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        priority: row.get(4)?,
        match_labels: serde_json::from_str(&match_labels).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?,
        min_severity: min_severity
            .map(|s| Severity::parse(&s).ok_or_else(|| conversion_failure(6, "severity")))
            .transpose()?,
        action: RuleAction::parse(&action)
            .ok_or_else(|| conversion_failure(7, "rule action"))?,
        enabled: row.get(8)?,
        created_at: parse_timestamp(9, &created_at)?,
    })
}
