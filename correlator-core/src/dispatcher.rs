use crate::error::PipelineError;
use crate::notify::{render, NotificationChannel};
use crate::store::{IncidentStore, NotificationTask};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts have been
    /// made so far: base * 2^(attempts-1), capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Delivers due notification tasks through the configured channel.
///
/// Delivery is at-least-once: a crash after send but before the sent mark
/// re-delivers on the next sweep, so notification consumers must tolerate
/// duplicates.
pub struct NotificationDispatcher {
    store: IncidentStore,
    channel: Arc<dyn NotificationChannel>,
    recipients: Vec<String>,
    policy: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(
        store: IncidentStore,
        channel: Arc<dyn NotificationChannel>,
        recipients: Vec<String>,
        policy: RetryPolicy,
    ) -> Self {
        NotificationDispatcher {
            store,
            channel,
            recipients,
            policy,
        }
    }

    /// One sweep over tasks whose next attempt is due.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<DispatchReport, PipelineError> {
        let mut report = DispatchReport::default();
        for task in self.store.due_tasks(now, 64)? {
            self.process_task(&task, now, &mut report).await;
        }
        Ok(report)
    }

    async fn process_task(
        &self,
        task: &NotificationTask,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) {
        let attempts = match self.store.begin_attempt(task.id) {
            Ok(attempts) => attempts,
            Err(err) => {
                error!(task_id = %task.id, error = %err, "could not claim notification task");
                return;
            }
        };

        let outcome = self.deliver(task).await;
        match outcome {
            Ok(()) => {
                if let Err(err) = self.store.mark_task_sent(task.id) {
                    // delivery happened; the unsent mark means one more
                    // duplicate on the next sweep, which consumers tolerate
                    error!(task_id = %task.id, error = %err, "delivered but failed to mark sent");
                }
                debug!(task_id = %task.id, attempts, "notification delivered");
                report.sent += 1;
            }
            Err(err) => {
                if attempts >= self.policy.max_attempts {
                    error!(
                        task_id = %task.id,
                        incident_id = %task.incident_id,
                        attempts,
                        error = %err,
                        "notification retry budget exhausted; task marked failed"
                    );
                    if let Err(mark_err) = self.store.mark_task_failed(task.id, &err.to_string()) {
                        error!(task_id = %task.id, error = %mark_err, "failed to mark task failed");
                    }
                    report.failed += 1;
                } else {
                    let delay = self.policy.backoff(attempts);
                    let next = now
                        + ChronoDuration::from_std(delay)
                            .unwrap_or_else(|_| ChronoDuration::seconds(60));
                    warn!(
                        task_id = %task.id,
                        attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %err,
                        "notification delivery failed; retry scheduled"
                    );
                    if let Err(mark_err) =
                        self.store.schedule_retry(task.id, &err.to_string(), next)
                    {
                        error!(task_id = %task.id, error = %mark_err, "failed to schedule retry");
                    }
                    report.retried += 1;
                }
            }
        }
    }

    async fn deliver(&self, task: &NotificationTask) -> Result<(), PipelineError> {
        let incident = self
            .store
            .incident_by_id(task.incident_id)?
            .ok_or_else(|| {
                PipelineError::NotificationDeliveryFailed(format!(
                    "incident {} not found",
                    task.incident_id
                ))
            })?;

        if self.recipients.is_empty() {
            warn!(
                incident_id = %incident.id,
                "no notification recipients configured; delivery skipped"
            );
            return Ok(());
        }

        let (subject, body) = render(&incident, task.event_kind);
        for recipient in &self.recipients {
            self.channel.send(recipient, &subject, &body).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{db_path, open_incident};
    use crate::store::{EventKind, TaskStatus};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Channel that fails a fixed number of times before succeeding.
    struct FlakyChannel {
        failures_left: AtomicU32,
        delivered: Mutex<Vec<(String, String)>>,
    }

    impl FlakyChannel {
        fn failing(times: u32) -> Self {
            FlakyChannel {
                failures_left: AtomicU32::new(times),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl NotificationChannel for FlakyChannel {
        async fn send(
            &self,
            recipient: &str,
            subject: &str,
            _body: &str,
        ) -> Result<(), PipelineError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(PipelineError::NotificationDeliveryFailed(
                    "smtp timeout".into(),
                ));
            }
            self.delivered
                .lock()
                .expect("lock")
                .push((recipient.to_string(), subject.to_string()));
            Ok(())
        }
    }

    fn setup(name: &str, channel: Arc<FlakyChannel>) -> (IncidentStore, NotificationDispatcher) {
        let store = IncidentStore::open(&db_path(name)).expect("open");
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            channel,
            vec!["oncall@example.com".into()],
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(600),
            },
        );
        (store, dispatcher)
    }

    fn seed_task(store: &IncidentStore) -> NotificationTask {
        let incident = open_incident("fp");
        store.insert_incident(&incident).expect("incident");
        let task = NotificationTask::new(incident.id, EventKind::Created, Utc::now());
        store.enqueue_task(&task).expect("enqueue");
        task
    }

    #[tokio::test]
    async fn delivers_pending_task_and_marks_sent() {
        let channel = Arc::new(FlakyChannel::failing(0));
        let (store, dispatcher) = setup("dispatch-ok", channel.clone());
        let task = seed_task(&store);

        let report = dispatcher.run_due(Utc::now()).await.expect("sweep");
        assert_eq!(report.sent, 1);

        let stored = store.task_by_id(task.id).expect("query").expect("present");
        assert_eq!(stored.status, TaskStatus::Sent);
        assert_eq!(stored.attempts, 1);
        assert_eq!(channel.delivered.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_budget() {
        let channel = Arc::new(FlakyChannel::failing(1));
        let (store, dispatcher) = setup("dispatch-flaky", channel.clone());
        let task = seed_task(&store);

        let report = dispatcher.run_due(Utc::now()).await.expect("first sweep");
        assert_eq!(report.retried, 1);

        let stored = store.task_by_id(task.id).expect("query").expect("present");
        assert_eq!(stored.status, TaskStatus::Attempting);
        assert!(stored.last_error.is_some());
        assert!(stored.next_attempt_at > Utc::now());

        // second sweep at the scheduled retry time succeeds
        let report = dispatcher
            .run_due(stored.next_attempt_at)
            .await
            .expect("second sweep");
        assert_eq!(report.sent, 1);

        let stored = store.task_by_id(task.id).expect("query").expect("present");
        assert_eq!(stored.status, TaskStatus::Sent);
        assert_eq!(stored.attempts, 2);
        assert_eq!(channel.delivered.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_marks_failed_not_dropped() {
        let channel = Arc::new(FlakyChannel::failing(u32::MAX));
        let (store, dispatcher) = setup("dispatch-exhaust", channel);
        let task = seed_task(&store);

        let mut at = Utc::now();
        for _ in 0..3 {
            dispatcher.run_due(at).await.expect("sweep");
            at = store
                .task_by_id(task.id)
                .expect("query")
                .expect("present")
                .next_attempt_at
                .max(at);
        }

        let stored = store.task_by_id(task.id).expect("query").expect("present");
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert!(stored.last_error.is_some());
        assert_eq!(store.failed_tasks().expect("failed").len(), 1);

        // failed tasks are terminal; no further sweeps pick them up
        let report = dispatcher.run_due(at + ChronoDuration::hours(1)).await.expect("sweep");
        assert_eq!(report, DispatchReport::default());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(100));
        assert_eq!(policy.backoff(10), Duration::from_secs(100));
    }
}
