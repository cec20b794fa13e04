//! Health check HTTP server.
//!
//! Provides `/health` (liveness), `/ready` (readiness), `/stats` (component
//! sizes) and `/metrics` (Prometheus text format) endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::HealthConfig;
use crate::error::Result;
use crate::guard::{Action, Guard};
use crate::metrics::Metrics;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct HealthResponse {
    status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct ReadyResponse {
    status: String,
    rate_limiters_enforcing: bool,
    state_store_open: bool,
}

/// Shared state for handlers.
struct HealthState {
    guard: Arc<Guard>,
    metrics: Option<Metrics>,
}

/// Health check HTTP server.
pub struct HealthServer {
    config: HealthConfig,
    guard: Arc<Guard>,
    metrics: Option<Metrics>,
}

impl HealthServer {
    /// Create a new health server.
    pub fn new(config: HealthConfig, guard: Arc<Guard>, metrics: Option<Metrics>) -> Self {
        Self {
            config,
            guard,
            metrics,
        }
    }

    /// Run the health server until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            info!("Health server disabled");
            let _ = shutdown.changed().await;
            return Ok(());
        }

        let state = Arc::new(HealthState {
            guard: self.guard.clone(),
            metrics: self.metrics.clone(),
        });

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        info!(address = %self.config.bind_address, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
                info!("Health server shutting down");
            })
            .await?;

        Ok(())
    }
}

/// Liveness check handler.
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Ready while every request limiter enforces limits and the state store
/// sweeper is running.
async fn ready_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let rate_limiters_enforcing = [Action::Login, Action::Register, Action::ResetPassword]
        .into_iter()
        .all(|action| !state.guard.limiter(action).is_pass_through());
    let state_store_open = !state.guard.states().is_closed();

    let is_ready = rate_limiters_enforcing && state_store_open;

    let response = ReadyResponse {
        status: if is_ready { "ready" } else { "not_ready" }.to_string(),
        rate_limiters_enforcing,
        state_store_open,
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn stats_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    Json(state.guard.stats().await)
}

/// Prometheus exposition handler.
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> Response {
    let Some(ref metrics) = state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metrics.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::net::SocketAddr;
    use std::time::Duration;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("ok"));
    }

    #[test]
    fn test_ready_response_serialization() {
        let response = ReadyResponse {
            status: "ready".to_string(),
            rate_limiters_enforcing: true,
            state_store_open: true,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("ready"));
        assert!(json.contains("rate_limiters_enforcing"));
    }

    async fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    async fn start(
        app_config: &AppConfig,
        metrics: Option<Metrics>,
    ) -> (
        SocketAddr,
        Arc<Guard>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let guard = Arc::new(Guard::build(app_config, metrics.clone()).unwrap());
        let addr = free_addr().await;
        let config = HealthConfig {
            enabled: true,
            bind_address: addr.to_string(),
        };

        let server = HealthServer::new(config, guard.clone(), metrics);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { server.run(shutdown_rx).await });

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;
        (addr, guard, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_health_and_ready_endpoints() {
        let (addr, guard, shutdown_tx, handle) = start(&AppConfig::default(), None).await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: HealthResponse = response.json().await.unwrap();
        assert_eq!(body.status, "ok");

        let response = client
            .get(format!("http://{addr}/ready"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: ReadyResponse = response.json().await.unwrap();
        assert!(body.rate_limiters_enforcing);
        assert!(body.state_store_open);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        guard.close().await;
    }

    #[tokio::test]
    async fn test_ready_endpoint_not_ready() {
        let mut config = AppConfig::default();
        config.rate_limit.register_burst = 0;
        let (addr, guard, shutdown_tx, handle) = start(&config, None).await;

        let response = reqwest::get(format!("http://{addr}/ready")).await.unwrap();
        assert_eq!(response.status(), 503);
        let body: ReadyResponse = response.json().await.unwrap();
        assert_eq!(body.status, "not_ready");
        assert!(!body.rate_limiters_enforcing);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        guard.close().await;
    }

    #[tokio::test]
    async fn test_stats_and_metrics_endpoints() {
        let metrics = Metrics::new().unwrap();
        let (addr, guard, shutdown_tx, handle) =
            start(&AppConfig::default(), Some(metrics)).await;

        guard.allow(Action::Login, "192.0.2.44").await;

        let stats: serde_json::Value = reqwest::get(format!("http://{addr}/stats"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["loginEntries"], 1);
        assert_eq!(stats["userCache"]["size"], 0);

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("gatekeeper_rate_limit_decisions_total"));

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        guard.close().await;
    }

    #[tokio::test]
    async fn test_metrics_endpoint_disabled() {
        let (addr, guard, shutdown_tx, handle) = start(&AppConfig::default(), None).await;

        let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
        assert_eq!(response.status(), 404);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        guard.close().await;
    }

    #[tokio::test]
    async fn test_server_disabled() {
        let guard = Arc::new(Guard::build(&AppConfig::default(), None).unwrap());
        let config = HealthConfig {
            enabled: false,
            bind_address: "127.0.0.1:0".to_string(),
        };
        let server = HealthServer::new(config, guard.clone(), None);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(async move { server.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), server_handle)
            .await
            .expect("Server should complete")
            .expect("Server task should not panic");

        assert!(result.is_ok());
        guard.close().await;
    }
}
