use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Settings;
use crate::metrics::{self, Metrics};

/// Set by `POST /v1/update`; the Main Loop polls this and resets it after
/// every tick so the tick reason can be attributed to `http_api`.
#[derive(Default)]
pub struct TriggerFlag(AtomicBool);

impl TriggerFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ApiState {
    token: Option<String>,
    metrics_enabled: bool,
    metrics: Arc<Metrics>,
    wake: Arc<Notify>,
    trigger: Arc<TriggerFlag>,
}

/// Starts the optional control API (§4.8), mirroring the teacher's
/// approval-server wiring: an `axum::Router` behind `TraceLayer`, served on
/// its own `tokio::spawn`ed task.
pub async fn start(settings: &Settings, metrics: Arc<Metrics>, wake: Arc<Notify>, trigger: Arc<TriggerFlag>) -> JoinHandle<()> {
    let state = ApiState {
        token: settings.http_api_token.clone(),
        metrics_enabled: settings.http_api_metrics,
        metrics,
        wake,
        trigger,
    };

    let app = Router::new()
        .route("/v1/update", post(trigger_update))
        .route("/v1/metrics", get(render_metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", settings.http_api_host, settings.http_api_port);
    info!("starting control API on {addr}");

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind control API");
        axum::serve(listener, app).await.expect("control API server failed");
    })
}

fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.token else { return true };
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else { return false };
    let Ok(value) = header.to_str() else { return false };
    value.strip_prefix("Bearer ") == Some(expected.as_str())
}

async fn trigger_update(State(state): State<ApiState>, headers: HeaderMap) -> (StatusCode, Json<serde_json::Value>) {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})));
    }
    state.trigger.set();
    state.wake.notify_one();
    (StatusCode::ACCEPTED, Json(json!({"status": "scheduled"})))
}

async fn render_metrics(State(state): State<ApiState>, headers: HeaderMap) -> (StatusCode, String) {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized\n".to_string());
    }
    if !state.metrics_enabled {
        return (StatusCode::NOT_FOUND, "metrics disabled\n".to_string());
    }
    (StatusCode::OK, metrics::render(state.metrics.snapshot()))
}

async fn health() -> StatusCode {
    StatusCode::OK
}
