use correlator_core::config::PipelineConfig;
use correlator_core::dispatcher::NotificationDispatcher;
use correlator_core::notify::NotificationChannel;
use correlator_core::scheduler::Scheduler;
use correlator_core::store::IncidentStore;
use correlator_server::notify::{LogChannel, WebhookChannel};
use correlator_server::routes::{router, AppState};
use correlator_server::source::AlertmanagerSource;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PipelineConfig::from_env();
    let store = IncidentStore::open(&config.database_path).expect("open incident store");

    let channel: Arc<dyn NotificationChannel> = match &config.notification_webhook_url {
        Some(url) => Arc::new(WebhookChannel::new(url.clone())),
        None => Arc::new(LogChannel),
    };
    let dispatcher = NotificationDispatcher::new(
        store.clone(),
        channel,
        config.notification_recipients.clone(),
        config.retry_policy,
    );
    let source = Arc::new(AlertmanagerSource::new(config.alert_source_urls.clone()));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        source,
        dispatcher,
        config.worker_concurrency,
        config.run_deadline,
    ));

    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(scheduler.run(config.poll_interval, trigger_rx));

    let app = router(AppState { store, trigger_tx });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("bind listener");

    info!(
        addr = config.bind_addr.as_str(),
        poll_interval_secs = config.poll_interval.as_secs(),
        sources = config.alert_source_urls.len(),
        "correlator-server listening"
    );
    axum::serve(listener, app).await.expect("serve");
}
