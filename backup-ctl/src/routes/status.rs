use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use backup_engine::health::metrics;
use backup_engine::scheduler::TierRunState;
use backup_engine::{HealthMonitor, Severity};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/tiers", get(list_tiers))
        .route("/tiers/{name}", get(get_tier))
}

/// Latest monitor verdict; 503 when critical or when no check has run yet.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    if let Some(report) = state.last_health.read().await.as_ref() {
        let status = if report.verdict == Severity::Critical {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };
        return (status, Json(report.clone())).into_response();
    }

    // A previous process may have left its verdict on disk.
    match HealthMonitor::read_latest(&state.ctx.layout) {
        Some(report) => {
            let critical = report.get("verdict").and_then(|v| v.as_str()) == Some(Severity::Critical.as_str());
            let status = if critical { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
            (status, Json(report)).into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "verdict": "unknown", "error": "no health check has run yet" })),
        )
            .into_response(),
    }
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let guard = state.last_health.read().await;
    let Some(report) = guard.as_ref() else {
        return Err(AppError::NotFound("no health check has run yet".into()));
    };
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(report),
    )
        .into_response())
}

#[derive(Serialize)]
struct TierStatus {
    tier: String,
    #[serde(flatten)]
    state: TierRunState,
}

async fn list_tiers(State(state): State<Arc<AppState>>) -> Json<Vec<TierStatus>> {
    let tiers = state
        .ctx
        .scheduler
        .snapshot()
        .into_iter()
        .map(|(tier, state)| TierStatus { tier, state })
        .collect();
    Json(tiers)
}

async fn get_tier(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<TierStatus>, AppError> {
    match state.ctx.scheduler.state(&name) {
        Some(tier_state) => Ok(Json(TierStatus {
            tier: name,
            state: tier_state,
        })),
        None => Err(AppError::NotFound(format!("unknown tier `{}`", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use backup_engine::health::CheckResult;
    use crate::state::test_state;
    use backup_engine::HealthReport;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn report(verdict: Severity) -> HealthReport {
        HealthReport {
            checked_at: chrono::Utc::now(),
            verdict,
            checks: vec![CheckResult {
                name: "staleness".to_string(),
                severity: verdict,
                issues: Vec::new(),
            }],
            tiers: Vec::new(),
            storage_bytes: 0,
            log_errors: 0,
            log_warnings: 0,
            cleanup: None,
        }
    }

    async fn get_status(state: Arc<AppState>, uri: &str) -> StatusCode {
        let app = crate::routes::create_router(state);
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn test_health_reflects_verdict() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        assert_eq!(get_status(state.clone(), "/health").await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(get_status(state.clone(), "/metrics").await, StatusCode::NOT_FOUND);

        *state.last_health.write().await = Some(report(Severity::Warning));
        assert_eq!(get_status(state.clone(), "/health").await, StatusCode::OK);
        assert_eq!(get_status(state.clone(), "/metrics").await, StatusCode::OK);

        *state.last_health.write().await = Some(report(Severity::Critical));
        assert_eq!(get_status(state, "/health").await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_tier_status() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        assert_eq!(get_status(state.clone(), "/tiers").await, StatusCode::OK);
        assert_eq!(get_status(state.clone(), "/tiers/critical").await, StatusCode::OK);
        assert_eq!(get_status(state, "/tiers/nightly").await, StatusCode::NOT_FOUND);
    }
}
