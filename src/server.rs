//! HTTP dashboard (spec §6 CLI surface, `dashboard --port <p>`): read-only
//! endpoints over the in-process [`MetricsCollector`] and the routing
//! decisions table.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::domain::RunId;
use crate::persistence::SqliteRunStore;
use crate::telemetry::MetricsCollector;

/// Shared state handed to every dashboard route.
#[derive(Clone)]
pub struct DashboardState {
    /// Process-wide metrics collector.
    pub metrics: Arc<MetricsCollector>,
    /// Routing-decision store, if persistence is configured.
    pub run_store: Option<Arc<SqliteRunStore>>,
}

/// Builds the dashboard router: `/metrics`, `/runs`, `/routing`, `/health`.
#[must_use]
pub fn create_dashboard_router(state: DashboardState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/runs", get(runs))
        .route("/routing", get(routing))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn metrics(State(state): State<DashboardState>) -> impl IntoResponse {
    let metrics = &state.metrics;
    Json(json!({
        "tier_distribution": metrics.tier_distribution(),
        "escalation_rate": metrics.escalation_rate(),
        "provider_distribution": metrics
            .provider_distribution()
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect::<std::collections::HashMap<_, _>>(),
        "cost_by_provider": metrics
            .cost_by_provider()
            .into_iter()
            .map(|(name, cost)| (name.to_string(), cost.to_string()))
            .collect::<std::collections::HashMap<_, _>>(),
    }))
}

async fn runs(State(state): State<DashboardState>) -> impl IntoResponse {
    let run_ids = state.metrics.run_ids();
    let summaries: Vec<_> = run_ids
        .iter()
        .filter_map(|id| state.metrics.run_summary(id).map(|summary| (id.clone(), summary)))
        .map(|(id, summary)| {
            json!({
                "run_id": id,
                "duration_secs": summary.duration.as_secs_f64(),
                "total_tokens": summary.total_tokens.into_inner(),
                "total_cost": summary.total_cost.to_string(),
                "frontier_call_rate": summary.frontier_call_rate,
                "qa_failure_rate": summary.qa_failure_rate,
            })
        })
        .collect();
    Json(json!({ "runs": summaries }))
}

/// Query parameters for `/routing`.
#[derive(Debug, Deserialize)]
pub struct RoutingQuery {
    /// The run whose routing decisions to list.
    pub run_id: RunId,
}

async fn routing(
    State(state): State<DashboardState>,
    Query(query): Query<RoutingQuery>,
) -> impl IntoResponse {
    let Some(run_store) = &state.run_store else {
        return Json(json!({ "decisions": [], "error": "no persistence configured" }));
    };
    match run_store.routing_decisions_for_run(query.run_id).await {
        Ok(decisions) => Json(json!({
            "decisions": decisions.iter().map(|d| json!({
                "node_id": d.node_id,
                "agent_id": d.agent_id,
                "request_tier": d.request_tier.as_u8(),
                "chosen_tier": d.chosen_tier.as_u8(),
                "provider_name": d.provider_name.as_ref().map(ToString::to_string),
                "reason": d.reason,
                "confidence": d.confidence.into_inner(),
                "complexity": d.complexity.into_inner(),
                "latency_ms": d.latency_ms,
            })).collect::<Vec<_>>(),
        })),
        Err(e) => Json(json!({ "decisions": [], "error": e.to_string() })),
    }
}

/// Binds a `TcpListener` on `127.0.0.1:port` for the dashboard.
///
/// # Errors
///
/// Returns an error if the port cannot be bound.
pub async fn bind(port: u16) -> std::io::Result<(TcpListener, SocketAddr)> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    Ok((listener, actual_addr))
}

/// Serves the dashboard router on `listener` until the process is killed.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(listener, router).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let state = DashboardState { metrics: Arc::new(MetricsCollector::new()), run_store: None };
        let router = create_dashboard_router(state);
        let (listener, addr) = bind(0).await.unwrap();
        let handle = tokio::spawn(serve(listener, router));

        let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), "OK");

        handle.abort();
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_json_summary() {
        let collector = Arc::new(MetricsCollector::new());
        let state = DashboardState { metrics: collector, run_store: None };
        let router = create_dashboard_router(state);
        let (listener, addr) = bind(0).await.unwrap();
        let handle = tokio::spawn(serve(listener, router));

        let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body.get("tier_distribution").is_some());

        handle.abort();
    }
}
