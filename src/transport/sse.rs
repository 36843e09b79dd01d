//! Legacy HTTP+SSE transport.
//!
//! `GET /sse` opens a session: the first event is `endpoint`, naming the URL
//! the client must POST its JSON-RPC messages to
//! (`/message?sessionId=<uuid>`). Each POSTed message is written to the
//! session's in-memory duplex stream as one line; every line the server writes
//! back is pushed as a `message` event. Dropping the event stream cancels the
//! session and removes it from the table.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::extract::{Json, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use futures::{Stream, StreamExt};
use rmcp::ServiceExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::health::{HealthState, health_handler};
use crate::server::ServerFactory;

/// Buffer size of each session's duplex pipe.
const SESSION_BUFFER: usize = 64 * 1024;

type SessionWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;
type Sessions = Arc<Mutex<HashMap<String, SessionWriter>>>;

#[derive(Clone)]
struct SseState {
    factory: ServerFactory,
    sessions: Sessions,
    cancel: CancellationToken,
}

#[derive(Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Tears a session down when its event stream goes away.
struct SessionGuard {
    id: String,
    sessions: Sessions,
    cancel: CancellationToken,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&self.id);
        tracing::debug!(session = %self.id, open = sessions.len(), "sse session closed");
    }
}

async fn open_stream(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = uuid::Uuid::new_v4().to_string();
    let (gateway_io, server_io) = tokio::io::duplex(SESSION_BUFFER);
    let (reader, writer) = tokio::io::split(gateway_io);
    state
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id.clone(), Arc::new(tokio::sync::Mutex::new(writer)));

    let session_cancel = state.cancel.child_token();
    let server = state.factory.new_server();
    let token = session_cancel.clone();
    let session = id.clone();
    tokio::spawn(async move {
        match server.serve_with_ct(server_io, token).await {
            Ok(running) => {
                let reason = running.waiting().await;
                tracing::debug!(session = %session, ?reason, "sse session ended");
            }
            Err(e) => tracing::debug!(session = %session, error = %e, "sse session failed to initialize"),
        }
    });
    tracing::debug!(session = %id, "sse session opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={id}"));
    let guard = SessionGuard {
        id,
        sessions: state.sessions.clone(),
        cancel: session_cancel,
    };
    let lines = BufReader::new(reader).lines();
    let messages = futures::stream::unfold((lines, guard), |(mut lines, guard)| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((
                Ok(Event::default().event("message").data(line)),
                (lines, guard),
            )),
            _ => None,
        }
    });

    let stream = futures::stream::once(async move { Ok(endpoint) })
        .chain(messages)
        .take_until(state.cancel.clone().cancelled_owned());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn post_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    Json(message): Json<serde_json::Value>,
) -> StatusCode {
    let writer = state
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&query.session_id)
        .cloned();
    let Some(writer) = writer else {
        return StatusCode::NOT_FOUND;
    };

    let mut line = message.to_string();
    line.push('\n');
    if let Err(e) = writer.lock().await.write_all(line.as_bytes()).await {
        tracing::debug!(session = %query.session_id, error = %e, "sse session is gone");
        return StatusCode::GONE;
    }
    StatusCode::ACCEPTED
}

pub fn router(factory: ServerFactory, health: HealthState, cancel: CancellationToken) -> Router {
    let state = SseState {
        factory,
        sessions: Arc::new(Mutex::new(HashMap::new())),
        cancel,
    };
    Router::new()
        .route("/sse", get(open_stream))
        .route("/message", post(post_message))
        .with_state(state)
        .merge(
            Router::new()
                .route("/health", get(health_handler))
                .with_state(health),
        )
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
        .map_err(|e| GatewayError::Transport("sse".to_string(), e.to_string()))?;

    tracing::info!("sse transport stopped");
    Ok(())
}
