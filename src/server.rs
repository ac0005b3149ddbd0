//! HTTP surface for submitting and polling jobs.

use crate::jobs::AgentJob;
use crate::orchestrator::{JobRequest, Orchestrator, RequestError};
use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

// ============================================================================
// Error envelope
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

/// `{ "error": { code, message, details? } }` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "JOB_NOT_FOUND",
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status()).unwrap_or(StatusCode::BAD_REQUEST),
            code: err.code(),
            message: err.to_string(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    #[serde(rename = "jobId")]
    job_id: Option<String>,
}

/// Answer to a poll without a job id.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LatestStatus {
    branch: String,
    changed_files: Vec<String>,
    latest_job: Option<AgentJob>,
}

async fn submit_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AgentJob>), ApiError> {
    let Json(request) = body.map_err(|rejection| {
        ApiError::bad_request("INVALID_REQUEST", "request body must be a JSON object")
            .with_details(json!({ "reason": rejection.body_text() }))
    })?;

    let job = orchestrator.submit(request).map_err(|err| {
        tracing::info!(code = err.code(), error = %err, "job request rejected");
        ApiError::from(err)
    })?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn job_status(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, ApiError> {
    let registry = orchestrator.registry();
    match query.job_id.filter(|id| !id.trim().is_empty()) {
        Some(job_id) => registry
            .get(&job_id)
            .map(|job| Json(job).into_response())
            .ok_or_else(|| ApiError::not_found(format!("no job with id {}", job_id))),
        None => {
            let latest = registry.latest();
            let status = LatestStatus {
                branch: latest.as_ref().map(|j| j.branch.clone()).unwrap_or_default(),
                changed_files: latest
                    .as_ref()
                    .map(|j| j.changed_files.clone())
                    .unwrap_or_default(),
                latest_job: latest,
            };
            Ok(Json(status).into_response())
        }
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/api/agent", get(job_status).post(submit_job))
        .route("/healthz", get(healthz))
        .with_state(orchestrator)
}

/// Serve until Ctrl-C. In-flight jobs keep running until the runtime stops.
pub async fn serve(bind: &str, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let addr = listener.local_addr().context("Failed to read bound address")?;
    tracing::info!(%addr, providers = ?orchestrator.configured_providers(), "patchflow listening");

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "could not install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
