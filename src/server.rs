//! Read-only HTTP surface over the triage statistics.

use crate::statistics::StatisticsCollector;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

#[derive(Clone)]
pub struct ServerState {
    pub stats: StatisticsCollector,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .fallback(not_found)
        .with_state(state)
}

async fn health(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let snapshot = state.stats.snapshot();
    let status = if snapshot.degraded { "degraded" } else { "ok" };
    Json(json!({
        "status": status,
        "uptimeSeconds": (Utc::now() - snapshot.started_at).num_seconds(),
        "lastCheck": snapshot.last_check,
    }))
}

async fn stats(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!({ "stats": state.stats.snapshot() }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

/// Bind `host:port` and serve until the task is dropped.
pub async fn serve(host: &str, port: u16, state: ServerState) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind health server to {addr}: {e}"))?;
    log::info!("Health server listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::StatEvent;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_degraded_state() {
        let stats = StatisticsCollector::new();
        let app = router(ServerState {
            stats: stats.clone(),
        });

        let (status, body) = get_json(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["lastCheck"].is_null());
        assert!(body["uptimeSeconds"].as_i64().unwrap() >= 0);

        stats.record_event(StatEvent::Polled);
        stats.record_event(StatEvent::CycleFailed("token refresh failed".to_string()));
        let (_, body) = get_json(app, "/health").await;
        assert_eq!(body["status"], "degraded");
        assert!(body["lastCheck"].is_string());
    }

    #[tokio::test]
    async fn test_stats_and_not_found() {
        let stats = StatisticsCollector::new();
        stats.record_event(StatEvent::Decision {
            rule_name: Some("vip".to_string()),
            action: "escalate".to_string(),
        });
        let app = router(ServerState { stats });

        let (status, body) = get_json(app.clone(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["totalEscalated"], 1);
        assert_eq!(body["stats"]["byRule"]["vip"], 1);

        let (status, body) = get_json(app, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");
    }
}
