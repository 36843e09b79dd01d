//! Gateway health: a two-value flag for external readiness probes.
//!
//! Only the orchestrator and the reload loop write it. It starts unhealthy,
//! turns healthy right before serving, and drops to unhealthy while a reload
//! rewrites the live sessions.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// Shared health flag. Clones observe and mutate the same state.
#[derive(Clone)]
pub struct HealthState {
    tx: Arc<watch::Sender<Health>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Health::Unhealthy);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_healthy(&self) {
        self.tx.send_replace(Health::Healthy);
    }

    pub fn set_unhealthy(&self) {
        self.tx.send_replace(Health::Unhealthy);
    }

    pub fn get(&self) -> Health {
        *self.tx.borrow()
    }

    pub fn is_healthy(&self) -> bool {
        self.get() == Health::Healthy
    }

    /// Receiver for probes that want to be woken on every transition.
    pub fn subscribe(&self) -> watch::Receiver<Health> {
        self.tx.subscribe()
    }

    /// Mark unhealthy until the returned guard is dropped.
    pub fn reload_bracket(&self) -> ReloadBracket {
        self.set_unhealthy();
        ReloadBracket {
            health: self.clone(),
        }
    }
}

/// Restores `Healthy` when the guarded publish ends, however it ends.
pub struct ReloadBracket {
    health: HealthState,
}

impl Drop for ReloadBracket {
    fn drop(&mut self) {
        self.health.set_healthy();
    }
}

/// `GET /health`: 200 when healthy, 503 otherwise.
pub async fn health_handler(State(health): State<HealthState>) -> impl IntoResponse {
    let (status, body) = match health.get() {
        Health::Healthy => (StatusCode::OK, "healthy"),
        Health::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };
    (status, Json(serde_json::json!({ "status": body })))
}
