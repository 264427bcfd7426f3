use crate::dispatcher::RetryPolicy;
use std::time::Duration;

/// Pipeline configuration, read from the environment so rules of thumb like
/// poll cadence and retry budget can change without a redeploy of the code.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub database_path: String,
    pub alert_source_urls: Vec<String>,
    pub poll_interval: Duration,
    pub run_deadline: Duration,
    pub worker_concurrency: usize,
    pub notification_recipients: Vec<String>,
    pub notification_webhook_url: Option<String>,
    pub retry_policy: RetryPolicy,
    pub bind_addr: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        PipelineConfig {
            database_path: std::env::var("CORRELATOR_DB_PATH")
                .unwrap_or_else(|_| "correlator.db".into()),
            alert_source_urls: csv_env("ALERT_SOURCE_URLS"),
            poll_interval: secs_env("POLL_INTERVAL_SECS", 60),
            run_deadline: secs_env("RUN_DEADLINE_SECS", 45),
            worker_concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(8),
            notification_recipients: csv_env("NOTIFICATION_RECIPIENTS"),
            notification_webhook_url: std::env::var("NOTIFICATION_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            retry_policy: RetryPolicy {
                max_attempts: std::env::var("NOTIFICATION_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse::<u32>().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(3),
                base_delay: secs_env("NOTIFICATION_BACKOFF_SECS", 30),
                max_delay: secs_env("NOTIFICATION_BACKOFF_CAP_SECS", 600),
            },
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
        }
    }
}

fn csv_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn secs_env(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}
