use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use correlator_core::error::PipelineError;
use correlator_core::filter::FilterRule;
use correlator_core::store::{Incident, IncidentStore, NewRule, NotificationTask, RuleUpdate};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub store: IncidentStore,
    pub trigger_tx: mpsc::Sender<()>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/trigger", post(trigger_run))
        .route("/rules", post(create_rule).get(list_rules))
        .route("/rules/:id", put(update_rule))
        .route("/rules/:id/disable", post(disable_rule))
        .route("/incidents", get(list_incidents))
        .route("/incidents/:id", get(get_incident))
        .route("/notifications/failed", get(failed_notifications))
        .with_state(state)
}

fn error_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::StorageConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Push trigger: runs a poll cycle ahead of the next scheduled tick.
async fn trigger_run(State(state): State<AppState>) -> StatusCode {
    match state.trigger_tx.try_send(()) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn create_rule(
    State(state): State<AppState>,
    Json(rule): Json<NewRule>,
) -> Result<(StatusCode, Json<FilterRule>), StatusCode> {
    match state.store.create_rule(&rule) {
        Ok(created) => Ok((StatusCode::CREATED, Json(created))),
        Err(err) => {
            warn!(rule = rule.name.as_str(), error = %err, "rule create rejected");
            Err(error_status(&err))
        }
    }
}

async fn list_rules(
    State(state): State<AppState>,
) -> Result<Json<Vec<FilterRule>>, StatusCode> {
    state
        .store
        .list_rules()
        .map(Json)
        .map_err(|err| error_status(&err))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<RuleUpdate>,
) -> Result<Json<FilterRule>, StatusCode> {
    match state.store.update_rule(id, &update) {
        Ok(Some(rule)) => Ok(Json(rule)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            warn!(rule_id = %id, error = %err, "rule update rejected");
            Err(error_status(&err))
        }
    }
}

async fn disable_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FilterRule>, StatusCode> {
    match state.store.disable_rule(id) {
        Ok(Some(rule)) => Ok(Json(rule)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => Err(error_status(&err)),
    }
}

async fn list_incidents(
    State(state): State<AppState>,
) -> Result<Json<Vec<Incident>>, StatusCode> {
    state
        .store
        .list_incidents(200)
        .map(Json)
        .map_err(|err| error_status(&err))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Incident>, StatusCode> {
    match state.store.incident_by_id(id) {
        Ok(Some(incident)) => Ok(Json(incident)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => Err(error_status(&err)),
    }
}

/// Tasks that exhausted their retry budget; exposed so exhausted
/// notifications are visible to operators rather than silently dropped.
async fn failed_notifications(
    State(state): State<AppState>,
) -> Result<Json<Vec<NotificationTask>>, StatusCode> {
    state
        .store
        .failed_tasks()
        .map(Json)
        .map_err(|err| error_status(&err))
}
