use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use agency_core::{types::Reminder, ExpiryWindow, ReminderStore, StoreError};
use agency_storage::{ClientError, Database, PolicyError};
use agency_util::ReminderConfig;

use crate::problem::ProblemResponse;
use crate::telemetry;

const DEFAULT_REMINDER_LIMIT: u32 = 5;
const MAX_REMINDER_LIMIT: u32 = 50;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    timezone: Tz,
    lookahead_days: u32,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database, reminders: &ReminderConfig) -> Self {
        Self {
            metrics,
            storage,
            clock: Arc::new(Utc::now),
            timezone: reminders.timezone,
            lookahead_days: reminders.lookahead_days,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    /// Calendar date in the monitor's timezone.
    pub fn today(&self) -> NaiveDate {
        (self.clock)().with_timezone(&self.timezone).date_naive()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/dashboard", get(dashboard))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Deserialize)]
struct DashboardQuery {
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct DashboardResponse {
    client_count: i64,
    policy_count: i64,
    expiring_count: i64,
    window_start: NaiveDate,
    window_end: NaiveDate,
    reminders: Vec<Reminder>,
}

async fn dashboard(
    State(state): State<AppState>,
    query: Result<Query<DashboardQuery>, QueryRejection>,
) -> Result<Json<DashboardResponse>, ProblemResponse> {
    let Query(query) = query.map_err(|rejection| {
        counter!("api_dashboard_requests_total", "result" => "invalid").increment(1);
        ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text())
    })?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_REMINDER_LIMIT)
        .clamp(1, MAX_REMINDER_LIMIT);
    let window = ExpiryWindow::starting(state.today(), state.lookahead_days);

    match load_dashboard(state.storage(), window, limit).await {
        Ok(response) => {
            counter!("api_dashboard_requests_total", "result" => "ok").increment(1);
            Ok(Json(response))
        }
        Err(err) => {
            counter!("api_dashboard_requests_total", "result" => "error").increment(1);
            error!(stage = "storage", error = %err, "failed to load dashboard");
            Err(ProblemResponse::storage_unavailable(
                "failed to load dashboard data",
            ))
        }
    }
}

async fn load_dashboard(
    storage: &Database,
    window: ExpiryWindow,
    limit: u32,
) -> Result<DashboardResponse, DashboardError> {
    let client_count = storage.clients().count().await?;
    let policies = storage.policies();
    let policy_count = policies.count().await?;
    let expiring_count = policies.count_expiring(window.start, window.end).await?;
    let reminders = storage.list_recent(limit).await?;

    Ok(DashboardResponse {
        client_count,
        policy_count,
        expiring_count,
        window_start: window.start,
        window_end: window.end,
        reminders,
    })
}

#[derive(Debug, Error)]
enum DashboardError {
    #[error("failed to count clients: {0}")]
    Clients(#[from] ClientError),
    #[error("failed to count policies: {0}")]
    Policies(#[from] PolicyError),
    #[error("failed to list reminders: {0}")]
    Reminders(#[from] StoreError),
}
