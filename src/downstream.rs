//! ClientPool: connects to each enabled downstream MCP server and lists what
//! it offers.
//!
//! Three launch sources:
//! - `image`: `docker run -i --rm --init` over stdio (joins the gateway's
//!   networks when running in a container)
//! - `command`: a local child process over stdio
//! - `url`: a remote Streamable HTTP server
//!
//! Every entry of the resulting bundle forwards to the connection it came from.
//! The connection is shared by those handlers, so it stays open exactly as long
//! as some session still serves a bundle that references it.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use rmcp::ErrorData as McpError;
use rmcp::model::{CallToolRequestParams, GetPromptRequestParams, ReadResourceRequestParams};
use rmcp::service::RunningService;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use tokio::process::Command;

use crate::capabilities::{
    Capabilities, CapabilityAggregator, PromptHandler, ResourceHandler, ServerPrompt,
    ServerResource, ServerResourceTemplate, ServerTool, ToolHandler,
};
use crate::config::{Configuration, LaunchSource, ServerConfig, resolve_env_vars};
use crate::error::GatewayError;

type DownstreamClient = RunningService<RoleClient, ()>;

/// Connection pool used to reach downstream servers.
#[derive(Default)]
pub struct ClientPool {
    networks: RwLock<Vec<String>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Build the `docker run` command for an image-backed server.
///
/// Env values are set on the docker process and forwarded by name (`-e KEY`)
/// so they never show up in the argument list.
pub fn docker_run_command(
    name: &str,
    image: &str,
    server: &ServerConfig,
    networks: &[String],
) -> Command {
    let mut cmd = Command::new("docker");
    cmd.args(["run", "-i", "--rm", "--init"]);
    let label = format!("mcp-gateway.server={}", name);
    cmd.args(["--label", label.as_str()]);
    for network in networks {
        cmd.args(["--network", network.as_str()]);
    }
    let env = resolve_env_vars(&server.env);
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    for key in keys {
        cmd.args(["-e", key.as_str()]);
    }
    cmd.envs(&env);
    cmd.arg(image);
    cmd.args(&server.args);
    cmd
}

fn process_command(command: &str, server: &ServerConfig) -> Command {
    let mut cmd = Command::new(command);
    cmd.args(&server.args);
    if !server.env.is_empty() {
        cmd.envs(resolve_env_vars(&server.env));
    }
    if let Some(ref cwd) = server.cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

/// Spawn or dial the server and complete the MCP handshake.
async fn connect(
    name: &str,
    server: &ServerConfig,
    networks: &[String],
) -> crate::Result<DownstreamClient> {
    let failed = |e: String| GatewayError::Connect(name.to_string(), e);

    let handshake = async {
        match server.launch_source() {
            Some(LaunchSource::Image(image)) => {
                let cmd = docker_run_command(name, image, server, networks);
                let transport = TokioChildProcess::new(cmd).map_err(|e| failed(e.to_string()))?;
                ().serve(transport).await.map_err(|e| failed(e.to_string()))
            }
            Some(LaunchSource::Command(command)) => {
                let transport = TokioChildProcess::new(process_command(command, server))
                    .map_err(|e| failed(e.to_string()))?;
                ().serve(transport).await.map_err(|e| failed(e.to_string()))
            }
            Some(LaunchSource::Remote(url)) => {
                let transport = StreamableHttpClientTransport::from_uri(url);
                ().serve(transport).await.map_err(|e| failed(e.to_string()))
            }
            None => Err(GatewayError::InvalidConfig(
                name.to_string(),
                "exactly one of 'image', 'command' or 'url' is required".to_string(),
            )),
        }
    };

    let timeout_secs = server.handshake_timeout_secs;
    tokio::time::timeout(Duration::from_secs(timeout_secs), handshake)
        .await
        .map_err(|_| failed(format!("MCP handshake timed out after {}s", timeout_secs)))?
}

fn forward_tool(client: Arc<DownstreamClient>) -> ToolHandler {
    Arc::new(move |params: CallToolRequestParams| {
        let client = client.clone();
        async move {
            client
                .peer()
                .call_tool(params)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
        .boxed()
    })
}

fn forward_prompt(client: Arc<DownstreamClient>) -> PromptHandler {
    Arc::new(move |params: GetPromptRequestParams| {
        let client = client.clone();
        async move {
            client
                .peer()
                .get_prompt(params)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
        .boxed()
    })
}

fn forward_resource(client: Arc<DownstreamClient>) -> ResourceHandler {
    Arc::new(move |params: ReadResourceRequestParams| {
        let client = client.clone();
        async move {
            client
                .peer()
                .read_resource(params)
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))
        }
        .boxed()
    })
}

/// Connect to one server and turn its listings into a bundle.
///
/// Tools are required; prompts, resources and templates are optional since
/// many servers do not offer them.
async fn list_server(
    name: &str,
    server: &ServerConfig,
    networks: &[String],
) -> crate::Result<Capabilities> {
    let client = Arc::new(connect(name, server, networks).await?);
    let peer = client.peer().clone();

    let tools = peer
        .list_all_tools()
        .await
        .map_err(|e| GatewayError::Connect(name.to_string(), e.to_string()))?;
    let prompts = peer.list_all_prompts().await.unwrap_or_else(|e| {
        tracing::debug!(server = %name, error = %e, "no prompts listed");
        Vec::new()
    });
    let resources = peer.list_all_resources().await.unwrap_or_else(|e| {
        tracing::debug!(server = %name, error = %e, "no resources listed");
        Vec::new()
    });
    let templates = peer.list_all_resource_templates().await.unwrap_or_else(|e| {
        tracing::debug!(server = %name, error = %e, "no resource templates listed");
        Vec::new()
    });

    let mut capabilities = Capabilities::new();
    for tool in tools {
        capabilities.push_tool(ServerTool {
            tool,
            handler: forward_tool(client.clone()),
        });
    }
    for prompt in prompts {
        capabilities.push_prompt(ServerPrompt {
            prompt,
            handler: forward_prompt(client.clone()),
        });
    }
    for resource in resources {
        capabilities.push_resource(ServerResource {
            resource,
            handler: forward_resource(client.clone()),
        });
    }
    for template in templates {
        capabilities.push_resource_template(ServerResourceTemplate {
            template,
            handler: forward_resource(client.clone()),
        });
    }

    tracing::info!(
        server = %name,
        tools = capabilities.tools.len(),
        prompts = capabilities.prompts.len(),
        resources = capabilities.resources.len(),
        "server capabilities listed"
    );
    Ok(capabilities)
}

#[async_trait]
impl CapabilityAggregator for ClientPool {
    async fn list_capabilities(
        &self,
        configuration: &Configuration,
        server_names: &[String],
    ) -> crate::Result<Capabilities> {
        let networks = self.networks();
        let start = Instant::now();

        let listings = server_names.iter().map(|name| {
            let networks = &networks;
            async move {
                let server = configuration.server(name).ok_or_else(|| {
                    GatewayError::InvalidConfig(name.clone(), "not in the catalog".to_string())
                })?;
                list_server(name, server, networks).await
            }
        });

        let mut capabilities = Capabilities::new();
        let mut failed = 0usize;
        for (name, listing) in server_names
            .iter()
            .zip(futures::future::join_all(listings).await)
        {
            match listing {
                Ok(server_capabilities) => capabilities.extend(server_capabilities),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(server = %name, error = %e, "cannot list server capabilities, skipping it");
                }
            }
        }

        tracing::debug!(
            servers = server_names.len(),
            failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "capabilities aggregated"
        );
        Ok(capabilities)
    }

    fn set_networks(&self, networks: Vec<String>) {
        *self.networks.write().unwrap_or_else(PoisonError::into_inner) = networks;
    }
}
