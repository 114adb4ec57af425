//! HTTP server for health and metrics endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use t2t_core::engine::EngineState;
use t2t_core::health::{ComponentStatus, HealthCheck, HealthStatus};
use t2t_core::metrics::StreamMetrics;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub health: Arc<HealthCheck>,
    pub metrics: Arc<StreamMetrics>,
    pub engine_state: watch::Receiver<EngineState>,
}

/// Body of `/health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub engine_state: &'static str,
    pub active_partitions: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    pub components: BTreeMap<String, ComponentStatusResponse>,
}

/// One component in the `/health` body.
#[derive(Debug, Serialize)]
pub struct ComponentStatusResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ComponentStatus> for ComponentStatusResponse {
    fn from(status: &ComponentStatus) -> Self {
        let (status, message) = match status {
            ComponentStatus::Healthy => ("healthy", None),
            ComponentStatus::Degraded(msg) => ("degraded", Some(msg.clone())),
            ComponentStatus::Unhealthy(msg) => ("unhealthy", Some(msg.clone())),
            ComponentStatus::Unknown => ("unknown", None),
        };
        Self { status, message }
    }
}

fn health_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

fn metrics_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn bind(port: u16, what: &str) -> Option<tokio::net::TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(port = port, "{} server started", what);
            Some(listener)
        }
        Err(e) => {
            error!(error = %e, port = port, "Failed to bind {} server", what);
            None
        }
    }
}

/// Serve health and metrics until `shutdown` resolves.
///
/// A port that fails to bind is logged and skipped; the engine keeps running
/// without that endpoint.
pub async fn start_server(
    state: Arc<ServerState>,
    health_port: u16,
    metrics_port: u16,
    shutdown: impl Future<Output = ()>,
) {
    let health_listener = bind(health_port, "Health").await;
    let metrics_listener = bind(metrics_port, "Metrics").await;

    let health_server = async {
        match health_listener {
            Some(listener) => {
                if let Err(e) = axum::serve(listener, health_router(Arc::clone(&state))).await {
                    error!(error = %e, "Health server error");
                }
            }
            None => std::future::pending().await,
        }
    };

    let metrics_server = async {
        match metrics_listener {
            Some(listener) => {
                if let Err(e) = axum::serve(listener, metrics_router(Arc::clone(&state))).await {
                    error!(error = %e, "Metrics server error");
                }
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = health_server => {}
        _ = metrics_server => {}
        _ = shutdown => {
            info!("HTTP servers shutting down");
        }
    }
}

fn status_label(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Unhealthy => "unhealthy",
    }
}

/// Health endpoint handler.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let overall = state.health.overall_status();
    let components = state
        .health
        .get_all_statuses()
        .iter()
        .map(|(name, status)| (name.clone(), ComponentStatusResponse::from(status)))
        .collect();

    let response = HealthResponse {
        status: status_label(overall),
        engine_state: state.engine_state.borrow().as_str(),
        active_partitions: state.metrics.active_partitions(),
        uptime_secs: state.health.uptime().map(|d| d.as_secs()),
        components,
    };

    let status_code = match overall {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

/// Liveness probe: fails once any component is unhealthy.
async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.health.overall_status() != HealthStatus::Unhealthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Readiness probe: engine running with partitions being processed.
async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let running = *state.engine_state.borrow() == EngineState::Running;
    if running && state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.export_prometheus_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Response;

    fn server_state(engine_state: EngineState) -> (Arc<ServerState>, watch::Sender<EngineState>) {
        let (tx, rx) = watch::channel(engine_state);
        let state = Arc::new(ServerState {
            health: Arc::new(HealthCheck::new()),
            metrics: Arc::new(StreamMetrics::new()),
            engine_state: rx,
        });
        (state, tx)
    }

    async fn call<R: IntoResponse>(handler: impl Future<Output = R>) -> Response {
        handler.await.into_response()
    }

    #[test]
    fn test_component_status_conversion() {
        let response = ComponentStatusResponse::from(&ComponentStatus::Healthy);
        assert_eq!(response.status, "healthy");
        assert!(response.message.is_none());

        let response =
            ComponentStatusResponse::from(&ComponentStatus::Degraded("retrying".to_string()));
        assert_eq!(response.status, "degraded");
        assert_eq!(response.message.as_deref(), Some("retrying"));

        let response = ComponentStatusResponse::from(&ComponentStatus::Unhealthy("down".into()));
        assert_eq!(response.status, "unhealthy");
        assert_eq!(response.message.as_deref(), Some("down"));
    }

    #[tokio::test]
    async fn test_readiness_follows_engine_state() {
        let (state, tx) = server_state(EngineState::Starting);
        state.health.register_component("source");
        state.health.mark_healthy("source");
        state.health.job_started();

        let response = call(readyz_handler(State(Arc::clone(&state)))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        tx.send(EngineState::Running).unwrap();
        let response = call(readyz_handler(State(Arc::clone(&state)))).await;
        assert_eq!(response.status(), StatusCode::OK);

        tx.send(EngineState::Draining).unwrap();
        let response = call(readyz_handler(State(state))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unhealthy_partition_fails_probes() {
        let (state, _tx) = server_state(EngineState::Running);
        state.health.register_component("partition-3");
        state.health.mark_unhealthy("partition-3", "publish failed");

        let response = call(healthz_handler(State(Arc::clone(&state)))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = call(health_handler(State(state))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_served_as_prometheus_text() {
        let (state, _tx) = server_state(EngineState::Running);
        state.metrics.record_records_in(5);

        let response = call(metrics_handler(State(state))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));
    }
}
