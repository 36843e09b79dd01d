//! mcp-gateway: serve the enabled MCP servers behind one endpoint.
//!
//! Transports:
//! - `stdio` without `--port`: one session on stdin/stdout (Claude Desktop etc.)
//! - `stdio` with `--port`: newline-delimited sessions over TCP
//! - `sse`: legacy HTTP+SSE (`/sse`, `/message`, `/health`)
//! - `streaming`: streamable HTTP (`/mcp`, `/health`)

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use nimbus_gateway::{Gateway, GatewayOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// MCP gateway: aggregates downstream MCP servers with zero-downtime reload.
#[derive(Parser)]
#[command(name = "mcp-gateway", version, about)]
struct Cli {
    /// Transport to serve: stdio, sse or streaming
    #[arg(long, default_value = "stdio")]
    transport: String,
    /// TCP port; required by sse and streaming, turns stdio into stdio-over-TCP
    #[arg(short, long, default_value_t = 0)]
    port: u16,
    /// Bind address for network transports
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Path to gateway.toml [default: ./gateway.toml or ~/.config/mcp-gateway/gateway.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Servers to enable, overriding the catalog's `enabled` flags
    #[arg(long, value_delimiter = ',')]
    servers: Vec<String>,
    /// Skip image pulls and network discovery
    #[arg(long = "static")]
    static_mode: bool,
    /// Initialize everything, then exit without serving
    #[arg(long)]
    dry_run: bool,
    /// Log every tool call
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    log_calls: bool,
    /// Block tool calls whose request or response contains a secret
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    block_secrets: bool,
    /// Tool-call interceptor, `<before|after>:<exec|docker|http>:<argument>` (repeatable)
    #[arg(long = "interceptor")]
    interceptors: Vec<String>,
    /// Reload when the config file changes
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stderr only: stdout carries the stdio transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down gateway");
        cancel_for_signal.cancel();
    });

    let options = GatewayOptions {
        transport: cli.transport,
        host: cli.host,
        port: cli.port,
        static_mode: cli.static_mode,
        dry_run: cli.dry_run,
        log_calls: cli.log_calls,
        block_secrets: cli.block_secrets,
        interceptors: cli.interceptors,
        server_names: cli.servers,
        config_path: resolve_config(cli.config)?,
        watch: cli.watch,
        in_container: GatewayOptions::in_container_from_env(),
    };

    Gateway::with_defaults(options).run(cancel).await?;
    Ok(())
}

/// Resolve config file path: explicit flag → ./gateway.toml → ~/.config/mcp-gateway/gateway.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("gateway.toml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("mcp-gateway").join("gateway.toml");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No gateway.toml found. Searched ./gateway.toml and ~/.config/mcp-gateway/gateway.toml. \
         Use --config to specify a path."
    ))
}
