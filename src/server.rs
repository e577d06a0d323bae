//! Health and metrics HTTP endpoints.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::status::{AdminStatus, MappingStatus, SyncStatus};

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub mappings: Vec<MappingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminStatus>,
}

pub fn router(status: Arc<SyncStatus>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(status)
}

/// Health check endpoint. Answers 503 while any mapping's or the admin pass's latest run failed.
async fn health_check(State(status): State<Arc<SyncStatus>>) -> impl IntoResponse {
    let healthy = status.is_healthy().await;
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: status.started_at(),
        mappings: status.snapshot().await,
        admin: status.admin_snapshot().await,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn metrics_handler(State(status): State<Arc<SyncStatus>>) -> Response {
    let output = match status.encode() {
        Ok(output) => output,
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)
        .body(Body::from(output))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(addr: SocketAddr, status: Arc<SyncStatus>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(status)).await
}
