use crate::subscription::SubscriptionState;
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Pipeline health shared between the subscription loop, message tasks and
/// the HTTP endpoints. Counters only grow.
#[derive(Debug)]
pub struct PipelineHealth {
    state: RwLock<SubscriptionState>,
    messages_received: AtomicU64,
    messages_archived: AtomicU64,
    messages_failed: AtomicU64,
    upload_retries: AtomicU64,
    broker_errors: AtomicU64,
    last_upload_error: Mutex<Option<String>>,
    last_broker_error: Mutex<Option<String>>,
}

/// Point-in-time copy of [`PipelineHealth`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub state: SubscriptionState,
    pub messages_received: u64,
    pub messages_archived: u64,
    pub messages_failed: u64,
    pub upload_retries: u64,
    pub broker_errors: u64,
    pub last_upload_error: Option<String>,
    pub last_broker_error: Option<String>,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SubscriptionState::Disconnected),
            messages_received: AtomicU64::new(0),
            messages_archived: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            upload_retries: AtomicU64::new(0),
            broker_errors: AtomicU64::new(0),
            last_upload_error: Mutex::new(None),
            last_broker_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: SubscriptionState) {
        *self.state.write() = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SubscriptionState::Subscribed
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("archiver.messages.received").increment(1);
    }

    pub fn record_archived(&self) {
        self.messages_archived.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("archiver.messages.archived").increment(1);
    }

    pub fn record_failed(&self, reason: &'static str, error: String) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
        *self.last_upload_error.lock() = Some(error);
        metrics::counter!("archiver.messages.failed", "reason" => reason).increment(1);
    }

    pub fn record_retry(&self) {
        self.upload_retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("archiver.upload.retries").increment(1);
    }

    pub fn record_broker_error(&self, error: String) {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
        *self.last_broker_error.lock() = Some(error);
        metrics::counter!("archiver.broker.errors").increment(1);
    }

    pub fn messages_archived(&self) -> u64 {
        self.messages_archived.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_archived: self.messages_archived.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            upload_retries: self.upload_retries.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
            last_upload_error: self.last_upload_error.lock().clone(),
            last_broker_error: self.last_broker_error.lock().clone(),
        }
    }
}

/// State shared across health handlers
#[derive(Clone)]
pub struct HealthState {
    pub health: Arc<PipelineHealth>,
    pub service_name: String,
}

/// Create the health router
pub fn create_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness endpoint
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
    }))
}

/// Readiness endpoint, ready once the subscription is active
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    let snapshot = state.health.snapshot();
    let status = if snapshot.state == SubscriptionState::Subscribed {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

/// Serve the health endpoints until `shutdown` is cancelled
pub async fn start_health_server(
    state: HealthState,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("0.0.0.0:{}", port);

    info!(address = %addr, "Starting health server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind health server address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Health server error")?;

    Ok(())
}
