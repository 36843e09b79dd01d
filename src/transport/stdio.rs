//! Newline-delimited JSON-RPC, either on the process's own stdin/stdout or on
//! each accepted TCP connection.

use std::time::Duration;

use rmcp::ServiceExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::server::ServerFactory;

/// Pause after a failed `accept` so persistent errors (EMFILE) don't spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Serve a single session on stdin/stdout.
pub async fn serve_stdio(factory: ServerFactory, cancel: CancellationToken) -> crate::Result<()> {
    let transport = (tokio::io::stdin(), tokio::io::stdout());
    let running = factory
        .new_server()
        .serve_with_ct(transport, cancel.clone())
        .await
        .map_err(|e| GatewayError::Transport("stdio".to_string(), e.to_string()))?;

    tracing::info!("stdio transport initialized, waiting for messages");

    tokio::select! {
        result = running.waiting() => {
            match result {
                Ok(reason) => tracing::info!(?reason, "stdio transport completed"),
                Err(e) => {
                    tracing::error!(error = %e, "stdio transport error");
                    return Err(GatewayError::Transport("stdio".to_string(), e.to_string()));
                }
            }
        }
        _ = cancel.cancelled() => {
            tracing::info!("stdio transport cancelled");
        }
    }
    Ok(())
}

/// Accept TCP clients and serve each as an independent stdio-framed session.
///
/// A session's registration is released as soon as its connection ends.
pub async fn serve_tcp(
    listener: TcpListener,
    factory: ServerFactory,
    cancel: CancellationToken,
) -> crate::Result<()> {
    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    if !accept_backoff(&cancel).await {
                        tracing::info!("stdio-over-tcp transport cancelled");
                        return Ok(());
                    }
                    continue;
                }
            },
            _ = cancel.cancelled() => {
                tracing::info!("stdio-over-tcp transport cancelled");
                return Ok(());
            }
        };

        let server = factory.new_server();
        let session = server.session().id();
        let session_cancel = cancel.child_token();
        tracing::debug!(session, peer = %addr, "accepted stdio connection");

        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            match server.serve_with_ct((reader, writer), session_cancel).await {
                Ok(running) => {
                    let reason = running.waiting().await;
                    tracing::debug!(session, ?reason, "stdio session ended");
                }
                Err(e) => {
                    tracing::warn!(session, peer = %addr, error = %e, "stdio session failed to initialize");
                }
            }
        });
    }
}

/// Wait out [`ACCEPT_RETRY_DELAY`]; `false` when cancelled first.
async fn accept_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
        _ = cancel.cancelled() => false,
    }
}
