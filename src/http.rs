use crate::auth::{AdminToken, AdminUser};
use crate::error::{AppError, AppResult};
use crate::health::HealthState;
use crate::pipeline::{QueuePipeline, QueueStats};
use crate::recovery::RecoveryStats;
use crate::registry::QueueMetrics;
use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct HttpState {
    pub pipeline: Arc<QueuePipeline>,
    pub admin: AdminToken,
}

impl FromRef<HttpState> for AdminToken {
    fn from_ref(state: &HttpState) -> Self {
        state.admin.clone()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueHealthResponse {
    status: &'static str,
    queues: BTreeMap<String, QueueMetrics>,
    redis: HealthState,
    fallback_mode: bool,
    recovery: RecoveryStats,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RecoveryActionRequest {
    action: String,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn queue_health(State(state): State<HttpState>) -> (StatusCode, Json<QueueHealthResponse>) {
    let stats = state.pipeline.get_queue_stats().await;
    let recovery = state.pipeline.get_recovery_stats().await;
    let healthy = stats.redis.connected && !recovery.exhausted;
    let body = QueueHealthResponse {
        status: if healthy { "ok" } else { "error" },
        queues: stats.queues,
        redis: stats.redis,
        fallback_mode: stats.fallback_mode,
        recovery,
        timestamp: Utc::now(),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn queue_stats(_admin: AdminUser, State(state): State<HttpState>) -> Json<QueueStats> {
    Json(state.pipeline.get_queue_stats().await)
}

async fn recovery_stats(_admin: AdminUser, State(state): State<HttpState>) -> Json<RecoveryStats> {
    Json(state.pipeline.get_recovery_stats().await)
}

async fn recovery_action(
    _admin: AdminUser,
    State(state): State<HttpState>,
    Json(request): Json<RecoveryActionRequest>,
) -> AppResult<Json<RecoveryStats>> {
    let recovery = state.pipeline.recovery();
    match request.action.trim().to_ascii_lowercase().as_str() {
        "start" => {
            recovery.start();
        }
        "stop" => {
            recovery.stop();
        }
        "run" => {
            let outcome = recovery.run_cycle_now().await?;
            tracing::info!(?outcome, "recovery cycle triggered over http");
        }
        other => {
            return Err(AppError::bad_request(format!(
                "unknown action {other:?} (expected start, stop or run)"
            )))
        }
    }
    Ok(Json(recovery.stats().await))
}

pub fn router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/health/queues", get(queue_health))
        .route("/api/queues/stats", get(queue_stats))
        .route(
            "/api/queues/recovery",
            get(recovery_stats).post(recovery_action),
        )
        .layer(cors)
        .with_state(state)
}
