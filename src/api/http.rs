//! HTTP API Server
//!
//! REST API for cluster status queries and broadcast ingress.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cluster::{BufferStats, ClusterMember, ClusterSummary, MemberInfo, Sequence};
use crate::config::ApiConfig;
use crate::coordinator::Coordinator;
use crate::error::{Error, Result};

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    coordinator: Coordinator,
    shutdown: CancellationToken,
}

impl HttpServer {
    pub fn new(config: ApiConfig, coordinator: Coordinator) -> Self {
        Self {
            config,
            coordinator,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Create the router
    pub fn router(coordinator: Coordinator) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/cluster", get(handle_cluster_info))
            .route("/cluster/members", get(handle_members))
            .route("/cluster/members/:member_id", get(handle_member_info))
            .route("/buffer", get(handle_buffer))
            .route("/broadcast", post(handle_broadcast))
            .layer(TraceLayer::new_for_http())
            .with_state(coordinator)
    }

    /// Serve until the shutdown token is cancelled
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::router(self.coordinator.clone());

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Broadcast request
#[derive(Debug, Deserialize, Serialize)]
pub struct BroadcastRequest {
    /// UTF-8 payload
    pub payload: String,
}

/// Envelope of an accepted broadcast
#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub uuid: Uuid,
    pub sequence: Sequence,
    pub timestamp: DateTime<Utc>,
    pub recipients: usize,
    /// Recipients still replaying history, served after their snapshot
    pub queued: usize,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub member_id: String,
    pub membership_scheme: String,
}

/// Cluster info response
#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterInfoResponse {
    pub summary: ClusterSummary,
    pub local_member: ClusterMember,
    pub members: Vec<MemberInfo>,
}

/// Buffer response
#[derive(Debug, Serialize, Deserialize)]
pub struct BufferResponse {
    #[serde(flatten)]
    pub stats: BufferStats,
    pub replays_in_flight: usize,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(coordinator): State<Coordinator>) -> impl IntoResponse {
    let healthy = coordinator.is_running();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            member_id: coordinator.local_member().id().to_string(),
            membership_scheme: coordinator.scheme_name().to_string(),
        }),
    )
}

async fn handle_cluster_info(State(coordinator): State<Coordinator>) -> impl IntoResponse {
    Json(ClusterInfoResponse {
        summary: coordinator.summary(),
        local_member: coordinator.local_member().clone(),
        members: coordinator.member_infos(),
    })
}

async fn handle_members(State(coordinator): State<Coordinator>) -> impl IntoResponse {
    Json(coordinator.member_infos())
}

async fn handle_member_info(
    State(coordinator): State<Coordinator>,
    Path(member_id): Path<String>,
) -> impl IntoResponse {
    match coordinator.member(&member_id) {
        Some(member) => Json(member).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "MEMBER_NOT_FOUND",
            format!("Member {} not found", member_id),
        ),
    }
}

async fn handle_buffer(State(coordinator): State<Coordinator>) -> impl IntoResponse {
    Json(BufferResponse {
        stats: coordinator.buffer_stats(),
        replays_in_flight: coordinator.replays_in_flight(),
    })
}

async fn handle_broadcast(
    State(coordinator): State<Coordinator>,
    Json(req): Json<BroadcastRequest>,
) -> impl IntoResponse {
    match coordinator.broadcast_receipt(req.payload).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(BroadcastResponse {
                uuid: receipt.message.uuid,
                sequence: receipt.message.sequence,
                timestamp: receipt.message.timestamp,
                recipients: receipt.recipients(),
                queued: receipt.queued_recipients,
            }),
        )
            .into_response(),
        Err(Error::NotRunning) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "NOT_RUNNING",
            Error::NotRunning,
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "BROADCAST_FAILED", e),
    }
}
