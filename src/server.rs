//! HTTP surface
//!
//! `GET /api/capture-content` runs a capture and streams the result back as
//! an attachment. `GET /health` reports service health and `GET /metrics`
//! renders Prometheus text when a recorder is installed.

use crate::{CaptureError, CaptureQuery, CaptureResult, CaptureService, ClientId, HealthLevel, SystemHealthChecker};
use axum::extract::rejection::QueryRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CaptureService>,
    pub health: Arc<SystemHealthChecker>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(service: Arc<CaptureService>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            health: Arc::new(SystemHealthChecker::new(service.clone())),
            service,
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/capture-content", get(capture_content))
        .route("/health", get(health));

    if state.metrics.is_some() {
        router = router.route("/metrics", get(render_metrics));
    }

    router.with_state(state)
}

async fn capture_content(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    query: Result<Query<CaptureQuery>, QueryRejection>,
) -> Result<Response, CaptureError> {
    let Query(query) = query.map_err(|e| CaptureError::InvalidRequest(e.body_text()))?;

    let client = ClientId::from_request(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.service.config().rate_limit.trust_forwarded_for,
    );

    let result = state.service.capture_query(&client, query).await?;
    Ok(capture_response(result))
}

fn capture_response(result: CaptureResult) -> Response {
    let headers = [
        (header::CONTENT_TYPE, result.mime_type.to_string()),
        (header::CONTENT_DISPOSITION, result.content_disposition()),
    ];

    (headers, result.bytes).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.check_system_health().await;

    let status = match report.status {
        HealthLevel::Critical => StatusCode::SERVICE_UNAVAILABLE,
        HealthLevel::Healthy | HealthLevel::Warning => StatusCode::OK,
    };

    (status, Json(report)).into_response()
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve until SIGINT or SIGTERM
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    serve_with_shutdown(listener, state, shutdown_signal()).await
}

pub async fn serve_with_shutdown<F>(listener: TcpListener, state: AppState, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
}

/// Resolves on Ctrl+C, SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {}
    }
}
