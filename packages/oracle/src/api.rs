//! Health & Status API endpoints
//!
//! Provides HTTP endpoints for monitoring and operators:
//! - GET /health - Worker health (JSON)
//! - GET /healthz - Liveness probe
//! - GET /metrics - Prometheus metrics
//! - GET /status - Task counts by status
//! - GET /failed - Failed tasks awaiting manual intervention

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::WrapErr;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::metrics;
use crate::store::TaskStore;
use crate::types::{RelayTask, Status};

/// Most failed tasks returned by /failed
const FAILED_LIMIT: usize = 50;

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub worker: String,
    pub store: Arc<dyn TaskStore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(worker: impl Into<String>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            worker: worker.into(),
            store,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub worker: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub worker: String,
    pub uptime_seconds: u64,
    pub tasks: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct FailedTask {
    pub fingerprint: String,
    pub event_type: String,
    pub destination_chain_id: u64,
    pub destination_tx_hash: Option<String>,
    pub error_message: Option<String>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<String>,
}

impl From<RelayTask> for FailedTask {
    fn from(task: RelayTask) -> Self {
        Self {
            fingerprint: task.fingerprint.to_string(),
            event_type: task.event_type.to_string(),
            destination_chain_id: task.destination_chain_id,
            destination_tx_hash: task.destination_tx_hash.map(|h| h.to_string()),
            error_message: task.error_message,
            attempt_count: task.attempt_count,
            last_attempt_at: task.last_attempt_at.map(|t| t.to_rfc3339()),
        }
    }
}

fn internal_error(message: String) -> Response {
    warn!(error = %message, "API request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        worker: state.worker.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Response {
    let counts = match state.store.count_by_status().await {
        Ok(counts) => counts,
        Err(e) => return internal_error(format!("failed to count tasks: {}", e)),
    };

    let mut tasks = BTreeMap::new();
    for (status, count) in counts {
        metrics::set_task_count(status.as_str(), count);
        tasks.insert(status.as_str().to_string(), count);
    }

    Json(StatusResponse {
        status: "ok".to_string(),
        worker: state.worker.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        tasks,
    })
    .into_response()
}

async fn failed(State(state): State<AppState>) -> Response {
    match state.store.list_by_status(Status::Failed, FAILED_LIMIT).await {
        Ok(tasks) => {
            Json(tasks.into_iter().map(FailedTask::from).collect::<Vec<_>>()).into_response()
        }
        Err(e) => internal_error(format!("failed to list failed tasks: {}", e)),
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return internal_error("failed to encode metrics".to_string());
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(liveness))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/failed", get(failed))
        .with_state(state)
}

/// Bind the API listener; a port already in use is an error for the caller
pub async fn bind_api(addr: SocketAddr) -> eyre::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind API server to {}", addr))
}

/// Serve the API on a bound listener
pub async fn serve_api(listener: TcpListener, state: AppState) -> eyre::Result<()> {
    metrics::UP.set(1.0);
    let addr = listener.local_addr()?;
    info!(%addr, worker = %state.worker, "API server started");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RelayPayload;
    use crate::store::MemoryTaskStore;
    use crate::types::Fingerprint;
    use alloy::primitives::{Address, B256, U256};

    fn task(n: u8) -> RelayTask {
        RelayTask::new(
            Fingerprint::new(1, B256::repeat_byte(n), 0),
            2,
            RelayPayload::AffirmationRequest {
                recipient: Address::repeat_byte(0xaa),
                value: U256::from(1u64),
            },
            1,
            1,
            Status::Pending,
        )
    }

    async fn state() -> (AppState, Arc<MemoryTaskStore>) {
        let store = Arc::new(MemoryTaskStore::new(1));
        store.upsert(&task(1)).await.unwrap();
        store.upsert(&task(2)).await.unwrap();
        store
            .mark_failed(&task(2).fingerprint, "execution reverted")
            .await
            .unwrap();
        (AppState::new("home-sender", store.clone()), store)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_counts_tasks() {
        let (state, _) = state().await;
        let response = status(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["worker"], "home-sender");
        assert_eq!(body["tasks"]["pending"], 1);
        assert_eq!(body["tasks"]["failed"], 1);
        assert_eq!(body["tasks"]["confirmed"], 0);
    }

    #[tokio::test]
    async fn test_failed_lists_reasons() {
        let (state, _) = state().await;
        let body = body_json(failed(State(state)).await).await;

        let tasks = body.as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["error_message"], "execution reverted");
        assert_eq!(tasks[0]["event_type"], "affirmation_request");
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state().await;
        let Json(health) = health(State(state)).await;
        assert_eq!(health.status, "healthy");
    }

    #[tokio::test]
    async fn test_second_worker_on_same_port_fails_to_bind() {
        let first = bind_api(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let taken = first.local_addr().unwrap();

        let err = bind_api(taken).await.unwrap_err();
        assert!(err.to_string().contains("Failed to bind API server"));

        let mut next = taken;
        next.set_port(0);
        assert!(bind_api(next).await.is_ok());
    }

    #[tokio::test]
    async fn test_metrics_are_text() {
        metrics::UP.set(1.0);
        let response = prometheus_metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));
    }
}
