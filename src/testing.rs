//! Test doubles for the gateway's collaborators and small builders for
//! capability bundles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use rmcp::ErrorData as McpError;
use rmcp::model::{
    AnnotateAble, CallToolRequestParams, CallToolResult, Content, GetPromptRequestParams, Prompt,
    RawResource, ReadResourceRequestParams, Tool,
};

use crate::capabilities::{
    Capabilities, CapabilityAggregator, ServerPrompt, ServerResource, ServerTool, ToolHandler,
};
use crate::config::{ConfigFile, Configuration};
use crate::error::GatewayError;
use crate::runtime::ContainerRuntime;

/// A tool whose handler answers with its own name.
pub fn make_tool(name: &str) -> ServerTool {
    let schema = serde_json::json!({ "type": "object", "properties": {} });
    let reply = name.to_string();
    ServerTool {
        tool: Tool {
            name: name.to_string().into(),
            title: None,
            description: Some(format!("test tool {}", name).into()),
            input_schema: Arc::new(schema.as_object().cloned().unwrap_or_default()),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        },
        handler: Arc::new(move |_params: CallToolRequestParams| {
            let reply = reply.clone();
            async move { Ok(CallToolResult::success(vec![Content::text(reply)])) }.boxed()
        }),
    }
}

pub fn make_prompt(name: &str) -> ServerPrompt {
    ServerPrompt {
        prompt: Prompt::new(name, Some("test prompt"), None),
        handler: Arc::new(|params: GetPromptRequestParams| {
            async move {
                Err(McpError::internal_error(
                    format!("prompt {} has no body", params.name),
                    None,
                ))
            }
            .boxed()
        }),
    }
}

pub fn make_resource(uri: &str) -> ServerResource {
    ServerResource {
        resource: RawResource::new(uri, uri).no_annotation(),
        handler: Arc::new(|params: ReadResourceRequestParams| {
            async move {
                Err(McpError::internal_error(
                    format!("resource {} has no body", params.uri),
                    None,
                ))
            }
            .boxed()
        }),
    }
}

pub fn make_capabilities(tools: &[&str], prompts: &[&str]) -> Capabilities {
    let mut capabilities = Capabilities::new();
    for name in tools {
        capabilities.push_tool(make_tool(name));
    }
    for name in prompts {
        capabilities.push_prompt(make_prompt(name));
    }
    capabilities
}

pub fn tool_names(tools: &[ServerTool]) -> Vec<String> {
    tools.iter().map(|t| t.name().to_string()).collect()
}

/// A handler that answers with the `text` argument.
pub fn echo_handler() -> ToolHandler {
    Arc::new(|params: CallToolRequestParams| {
        async move {
            let text = params
                .arguments
                .as_ref()
                .and_then(|args| args.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(CallToolResult::success(vec![Content::text(text)]))
        }
        .boxed()
    })
}

/// Text of the first content block of a tool result.
pub fn text_of(result: &CallToolResult) -> String {
    let value = serde_json::to_value(result).expect("serialize tool result");
    value["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

/// A snapshot that enables `servers`, each launched by a placeholder command.
pub fn configuration(servers: &[&str]) -> Configuration {
    let body: String = servers
        .iter()
        .map(|name| format!("[servers.{name}]\ncommand = \"{name}\"\n"))
        .collect();
    let file: ConfigFile = toml::from_str(&body).expect("valid catalog");
    Configuration::new(file, &[]).expect("valid configuration")
}

/// Container runtime that records calls instead of talking to docker.
#[derive(Default)]
pub struct FakeRuntime {
    pub fail_pull: AtomicBool,
    pub fail_networks: AtomicBool,
    pub pulls: AtomicUsize,
    pub networks: Vec<String>,
}

impl FakeRuntime {
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_and_verify(&self, configuration: &Configuration) -> crate::Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pull.load(Ordering::SeqCst) {
            let name = configuration
                .server_names()
                .first()
                .cloned()
                .unwrap_or_default();
            return Err(GatewayError::PullVerify(name, "registry unreachable".to_string()));
        }
        Ok(())
    }

    async fn guess_networks(&self) -> crate::Result<Vec<String>> {
        if self.fail_networks.load(Ordering::SeqCst) {
            return Err(GatewayError::NetworkDiscovery("no such container".to_string()));
        }
        Ok(self.networks.clone())
    }
}

/// Aggregator serving a fixed server → tool-names table.
#[derive(Default)]
pub struct FakeAggregator {
    pub tools: HashMap<String, Vec<String>>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    pub networks: Mutex<Vec<String>>,
}

impl FakeAggregator {
    pub fn new(table: &[(&str, &[&str])]) -> Self {
        Self {
            tools: table
                .iter()
                .map(|(server, tools)| {
                    (
                        server.to_string(),
                        tools.iter().map(|t| t.to_string()).collect(),
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityAggregator for FakeAggregator {
    async fn list_capabilities(
        &self,
        _configuration: &Configuration,
        server_names: &[String],
    ) -> crate::Result<Capabilities> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::ListCapabilities("downstream offline".to_string()));
        }
        let mut capabilities = Capabilities::new();
        for server in server_names {
            for tool in self.tools.get(server).into_iter().flatten() {
                capabilities.push_tool(make_tool(tool));
            }
        }
        Ok(capabilities)
    }

    fn set_networks(&self, networks: Vec<String>) {
        *self.networks.lock().expect("networks lock") = networks;
    }
}
