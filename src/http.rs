use crate::errors::{AppError, AppResult};
use crate::models::{
    BatchSyncSummary, BooleanResponse, Business, CreateBusinessPayload, HealthReport, ManualSyncResponse,
    PayrollSummary, StoredPnlLine, XeroConnection,
};
use crate::policy::AccessPolicy;
use crate::runner::SyncRunner;
use crate::scheduler::SyncScheduler;
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<SyncRunner>,
    pub policy: AccessPolicy,
    pub scheduler: SyncScheduler,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/businesses", get(list_businesses).post(create_business))
        .route("/api/xero/callback", get(oauth_callback))
        .route("/api/xero/sync-all", get(sync_all).post(sync_all))
        .route("/api/xero/sync-all/enqueue", post(enqueue_sync_all))
        .route("/api/xero/sync/:business_id", post(sync_business))
        .route("/api/xero/disconnect/:business_id", post(disconnect))
        .route("/api/xero/pnl/:business_id", get(pnl_lines))
        .route("/api/xero/payroll/:business_id", get(payroll))
        .route("/api/reports/health", get(health_report))
        .with_state(state)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::TokenRefresh(reason) => (
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": format!("Xero token refresh failed: {}", reason),
                    "reconnect": true
                }),
            ),
            AppError::Upstream { status, body } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                json!({ "error": format!("Xero API error: {}", status), "details": body }),
            ),
            AppError::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, json!({ "error": reason })),
            AppError::NotFound(reason) => (StatusCode::NOT_FOUND, json!({ "error": reason })),
            AppError::Config(reason) => (StatusCode::BAD_REQUEST, json!({ "error": reason })),
            AppError::Crypto(_) | AppError::Io(_) | AppError::Database(_) | AppError::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

async fn blocking<T, F>(work: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| AppError::Internal(format!("blocking task failed: {}", error)))?
}

fn authorize(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let authorization = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
    state.policy.authorize(authorization)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_businesses(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Vec<Business>>> {
    authorize(&state, &headers)?;
    let runner = state.runner.clone();
    blocking(move || runner.db().list_businesses()).await.map(Json)
}

async fn create_business(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateBusinessPayload>,
) -> AppResult<(StatusCode, Json<Business>)> {
    authorize(&state, &headers)?;
    let runner = state.runner.clone();
    let business = blocking(move || runner.db().create_business(payload)).await?;
    Ok((StatusCode::CREATED, Json(business)))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> AppResult<Json<XeroConnection>> {
    if let Some(error) = query.error {
        return Err(AppError::Config(format!("Xero authorisation was not granted: {}", error)));
    }
    let business_id = query
        .state
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| AppError::Config("Missing state parameter".to_string()))?;
    let code = query
        .code
        .ok_or_else(|| AppError::Config("Missing authorization code".to_string()))?;

    let runner = state.runner.clone();
    blocking(move || runner.connect_from_callback(&business_id, &code))
        .await
        .map(Json)
}

async fn sync_all(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<BatchSyncSummary>> {
    authorize(&state, &headers)?;
    let runner = state.runner.clone();
    blocking(move || runner.sync_all()).await.map(Json)
}

async fn enqueue_sync_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<(StatusCode, Json<BooleanResponse>)> {
    authorize(&state, &headers)?;
    state.scheduler.request_run();
    Ok((StatusCode::ACCEPTED, Json(BooleanResponse { success: true })))
}

async fn sync_business(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(business_id): Path<String>,
) -> AppResult<Json<ManualSyncResponse>> {
    authorize(&state, &headers)?;
    let runner = state.runner.clone();
    blocking(move || runner.sync_business(&business_id)).await.map(Json)
}

async fn disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(business_id): Path<String>,
) -> AppResult<Json<BooleanResponse>> {
    authorize(&state, &headers)?;
    let runner = state.runner.clone();
    let success = blocking(move || runner.disconnect(&business_id)).await?;
    Ok(Json(BooleanResponse { success }))
}

async fn pnl_lines(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(business_id): Path<String>,
) -> AppResult<Json<Vec<StoredPnlLine>>> {
    authorize(&state, &headers)?;
    let runner = state.runner.clone();
    blocking(move || runner.pnl_lines(&business_id)).await.map(Json)
}

async fn payroll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(business_id): Path<String>,
) -> AppResult<Json<PayrollSummary>> {
    authorize(&state, &headers)?;
    let runner = state.runner.clone();
    blocking(move || runner.payroll_summary(&business_id)).await.map(Json)
}

async fn health_report(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<HealthReport>> {
    authorize(&state, &headers)?;
    let runner = state.runner.clone();
    blocking(move || runner.health_report()).await.map(Json)
}
