//! Streamable HTTP: rmcp's `StreamableHttpService` nested at `/mcp`, with the
//! health probe next to it. rmcp calls the factory once per client session.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::health::{HealthState, health_handler};
use crate::server::ServerFactory;

pub fn router(factory: ServerFactory, health: HealthState, cancel: CancellationToken) -> Router {
    let config = StreamableHttpServerConfig {
        cancellation_token: cancel,
        ..Default::default()
    };
    let mcp_service = StreamableHttpService::new(
        move || Ok(factory.new_server()),
        Arc::new(LocalSessionManager::default()),
        config,
    );

    Router::new()
        .route("/health", get(health_handler))
        .with_state(health)
        .nest_service("/mcp", mcp_service)
}

pub async fn serve(
    listener: TcpListener,
    factory: ServerFactory,
    health: HealthState,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let app = router(factory, health, cancel.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| GatewayError::Transport("streaming".to_string(), e.to_string()))?;

    tracing::info!("streaming transport stopped");
    Ok(())
}
