//! Transport launcher: picks exactly one serving mode and runs it until the
//! shared cancellation token fires or the transport fails.
//!
//! | name        | port | mode                                          |
//! |-------------|------|-----------------------------------------------|
//! | `stdio`     | 0    | one session on stdin/stdout                   |
//! | `stdio`     | set  | one newline-delimited session per TCP client  |
//! | `sse`       | set  | `GET /sse` + `POST /message`, plus `/health`  |
//! | `streaming` | set  | Streamable HTTP at `/mcp`, plus `/health`     |

pub mod sse;
pub mod stdio;
pub mod streaming;

use std::fmt;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::health::HealthState;
use crate::server::ServerFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    StdioOverTcp,
    Sse,
    Streaming,
}

impl TransportMode {
    /// Validate a transport name against the configured port.
    ///
    /// Names match case-insensitively. `sse` and `streaming` need a port.
    pub fn resolve(name: &str, port: u16) -> crate::Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "stdio" if port == 0 => Ok(Self::Stdio),
            "stdio" => Ok(Self::StdioOverTcp),
            "sse" if port == 0 => Err(GatewayError::MissingPort("sse".to_string())),
            "sse" => Ok(Self::Sse),
            "streaming" if port == 0 => Err(GatewayError::MissingPort("streaming".to_string())),
            "streaming" => Ok(Self::Streaming),
            _ => Err(GatewayError::UnknownTransport(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Stdio | Self::StdioOverTcp => "stdio",
            Self::Sse => "sse",
            Self::Streaming => "streaming",
        }
    }

    /// Whether this mode serves from a bound TCP listener.
    pub fn uses_listener(&self) -> bool {
        !matches!(self, Self::Stdio)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Serve `mode` until cancelled. Network modes take the listener bound at
/// startup; every session is built by `factory`.
pub async fn launch(
    mode: TransportMode,
    listener: Option<TcpListener>,
    factory: ServerFactory,
    health: HealthState,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let listener = match (mode.uses_listener(), listener) {
        (false, _) => None,
        (true, Some(listener)) => Some(listener),
        (true, None) => {
            return Err(GatewayError::Transport(
                mode.name().to_string(),
                "no listener was bound".to_string(),
            ));
        }
    };

    if let Some(addr) = listener.as_ref().and_then(|l| l.local_addr().ok()) {
        tracing::info!(transport = %mode, addr = %addr, "serving MCP");
    } else {
        tracing::info!(transport = %mode, "serving MCP on stdio");
    }

    match (mode, listener) {
        (TransportMode::Stdio, _) => stdio::serve_stdio(factory, cancel).await,
        (TransportMode::StdioOverTcp, Some(listener)) => {
            stdio::serve_tcp(listener, factory, cancel).await
        }
        (TransportMode::Sse, Some(listener)) => {
            sse::serve(listener, factory, health, cancel).await
        }
        (TransportMode::Streaming, Some(listener)) => {
            streaming::serve(listener, factory, health, cancel).await
        }
        (_, None) => Err(GatewayError::Transport(
            mode.name().to_string(),
            "no listener was bound".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::callbacks;
    use crate::registry::CapabilityRegistry;
    use crate::testing::make_capabilities;

    #[test]
    fn test_resolve_modes() {
        assert_eq!(TransportMode::resolve("stdio", 0).unwrap(), TransportMode::Stdio);
        assert_eq!(
            TransportMode::resolve("stdio", 8811).unwrap(),
            TransportMode::StdioOverTcp
        );
        assert_eq!(TransportMode::resolve("SSE", 8811).unwrap(), TransportMode::Sse);
        assert_eq!(
            TransportMode::resolve("Streaming", 8811).unwrap(),
            TransportMode::Streaming
        );
    }

    #[test]
    fn test_network_modes_need_port() {
        for name in ["sse", "streaming"] {
            let result = TransportMode::resolve(name, 0);
            assert!(
                matches!(&result, Err(GatewayError::MissingPort(t)) if t == name),
                "{name} without port should fail"
            );
        }
    }

    #[test]
    fn test_unknown_transport_named() {
        let err = TransportMode::resolve("websocket", 8811).unwrap_err();
        assert!(err.to_string().contains("websocket"));
    }

    #[tokio::test]
    async fn test_launch_without_listener_fails() {
        let factory = ServerFactory::new(
            CapabilityRegistry::new(make_capabilities(&[], &[])),
            callbacks(false, false, vec![]),
        );
        let result = launch(
            TransportMode::Sse,
            None,
            factory,
            HealthState::new(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Transport(t, _)) if t == "sse"));
    }
}
