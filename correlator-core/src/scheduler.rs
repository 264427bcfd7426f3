use crate::alerts::{Alert, AlertStatus};
use crate::dedup::{self, DedupOutcome};
use crate::dispatcher::NotificationDispatcher;
use crate::error::PipelineError;
use crate::filter::{self, FilterRule};
use crate::source::AlertSource;
use crate::store::IncidentStore;
use crate::writer::IncidentWriter;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Counters for one pipeline run, logged at the end of every cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub fetched: usize,
    pub created: usize,
    pub resolved: usize,
    pub already_open: usize,
    pub filtered: usize,
    pub noop: usize,
    pub failed: usize,
}

/// Per-fingerprint locks serializing the check-then-write critical section.
/// The partial unique index in the store backstops writers in other
/// processes; this map covers concurrent workers inside one run.
#[derive(Clone, Default)]
struct FingerprintLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FingerprintLocks {
    fn for_fingerprint(&self, fingerprint: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(fingerprint.to_string()).or_default().clone()
    }

    /// Drop entries no worker holds. Fingerprints are label-set hashes and
    /// high-cardinality, so the map must not grow for the process lifetime.
    fn prune(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Drives the pipeline: fetch a batch, push every alert through
/// filter → dedup → write independently, then sweep due notifications.
pub struct Scheduler {
    store: IncidentStore,
    source: Arc<dyn AlertSource>,
    writer: IncidentWriter,
    dispatcher: NotificationDispatcher,
    locks: FingerprintLocks,
    concurrency: usize,
    run_deadline: Duration,
}

impl Scheduler {
    pub fn new(
        store: IncidentStore,
        source: Arc<dyn AlertSource>,
        dispatcher: NotificationDispatcher,
        concurrency: usize,
        run_deadline: Duration,
    ) -> Self {
        Scheduler {
            writer: IncidentWriter::new(store.clone()),
            store,
            source,
            dispatcher,
            locks: FingerprintLocks::default(),
            concurrency: concurrency.max(1),
            run_deadline,
        }
    }

    /// Loop until the trigger channel closes: every poll-interval tick or
    /// pushed trigger event runs one cycle.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, mut trigger_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                triggered = trigger_rx.recv() => {
                    if triggered.is_none() {
                        break;
                    }
                }
            }
            let report = self.run_once().await;
            info!(
                fetched = report.fetched,
                created = report.created,
                resolved = report.resolved,
                already_open = report.already_open,
                filtered = report.filtered,
                noop = report.noop,
                failed = report.failed,
                "pipeline run complete"
            );
        }
    }

    /// One scheduled cycle. Only a total fetch failure aborts the run;
    /// per-alert failures are isolated and counted.
    pub async fn run_once(&self) -> RunReport {
        let report = Mutex::new(RunReport::default());

        let rules = match self.store.enabled_rules() {
            Ok(rules) => rules,
            Err(err) => {
                error!(error = %err, "could not load filter rules; run skipped");
                return take_report(report);
            }
        };

        // the deadline covers the fetch too: a hung source must not stop
        // the run loop from ever ticking again
        let work = self.fetch_and_process(&rules, &report);
        if tokio::time::timeout(self.run_deadline, work).await.is_err() {
            warn!(
                deadline_secs = self.run_deadline.as_secs(),
                "run deadline exceeded; unprocessed alerts wait for the next run"
            );
        }
        self.locks.prune();

        match self.dispatcher.run_due(Utc::now()).await {
            Ok(dispatched) => debug!(
                sent = dispatched.sent,
                retried = dispatched.retried,
                failed = dispatched.failed,
                "notification sweep done"
            ),
            Err(err) => error!(error = %err, "notification sweep failed"),
        }

        take_report(report)
    }

    async fn fetch_and_process(&self, rules: &[FilterRule], report: &Mutex<RunReport>) {
        let alerts = match self.source.fetch_active_alerts().await {
            Ok(alerts) => alerts,
            Err(err) => {
                error!(error = %err, "alert fetch failed; run aborted until next tick");
                return;
            }
        };

        // the source may repeat fingerprints across endpoints or polls;
        // keep the last snapshot per fingerprint
        let mut batch: HashMap<String, Alert> = HashMap::new();
        for alert in alerts {
            batch.insert(alert.fingerprint.clone(), alert);
        }
        report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fetched = batch.len();

        futures::stream::iter(batch.into_values())
            .for_each_concurrent(self.concurrency, |alert| async move {
                self.process_alert(alert, rules, report).await;
            })
            .await;
    }

    async fn process_alert(&self, alert: Alert, rules: &[FilterRule], report: &Mutex<RunReport>) {
        let decision = filter::evaluate(&alert, rules);

        let lock = self.locks.for_fingerprint(&alert.fingerprint);
        let _guard = lock.lock().await;

        let open = match self.store.open_incident_by_fingerprint(&alert.fingerprint) {
            Ok(open) => open,
            Err(err) => {
                error!(
                    fingerprint = %alert.fingerprint,
                    error = %err,
                    "open-incident lookup failed"
                );
                bump(report, |r| r.failed += 1);
                return;
            }
        };

        match dedup::decide(&alert, decision, open.as_ref()) {
            DedupOutcome::CreateNew => match self.writer.create_from_alert(&alert) {
                Ok(incident) => {
                    info!(
                        fingerprint = %alert.fingerprint,
                        incident_id = %incident.id,
                        severity = incident.severity.as_str(),
                        "incident created"
                    );
                    bump(report, |r| r.created += 1);
                }
                Err(PipelineError::StorageConflict { .. }) => {
                    debug!(
                        fingerprint = %alert.fingerprint,
                        "lost create race; incident already open"
                    );
                    bump(report, |r| r.already_open += 1);
                }
                Err(err) => {
                    error!(
                        fingerprint = %alert.fingerprint,
                        error = %err,
                        "incident create failed; alert retried while it keeps firing"
                    );
                    bump(report, |r| r.failed += 1);
                }
            },
            DedupOutcome::AlreadyOpen { incident_id } => {
                debug!(
                    fingerprint = %alert.fingerprint,
                    incident_id = %incident_id,
                    "alert still firing for open incident"
                );
                bump(report, |r| r.already_open += 1);
            }
            DedupOutcome::ResolveExisting { incident_id } => {
                let resolved_at = alert.ends_at.unwrap_or_else(Utc::now);
                match self.writer.resolve(incident_id, resolved_at) {
                    Ok(Some(incident)) => {
                        info!(
                            fingerprint = %alert.fingerprint,
                            incident_id = %incident.id,
                            "incident resolved"
                        );
                        bump(report, |r| r.resolved += 1);
                    }
                    Ok(None) => {
                        debug!(
                            fingerprint = %alert.fingerprint,
                            incident_id = %incident_id,
                            "incident was already resolved"
                        );
                        bump(report, |r| r.noop += 1);
                    }
                    Err(err) => {
                        error!(
                            fingerprint = %alert.fingerprint,
                            error = %err,
                            "incident resolve failed"
                        );
                        bump(report, |r| r.failed += 1);
                    }
                }
            }
            DedupOutcome::NoOp => {
                if alert.status == AlertStatus::Firing {
                    debug!(fingerprint = %alert.fingerprint, "alert excluded by filter rules");
                    bump(report, |r| r.filtered += 1);
                } else {
                    debug!(fingerprint = %alert.fingerprint, "resolution without open incident");
                    bump(report, |r| r.noop += 1);
                }
            }
        }
    }
}

fn bump(report: &Mutex<RunReport>, update: impl FnOnce(&mut RunReport)) {
    update(&mut report.lock().unwrap_or_else(PoisonError::into_inner));
}

fn take_report(report: Mutex<RunReport>) -> RunReport {
    *report.lock().unwrap_or_else(PoisonError::into_inner)
}
