//! The capability bundle served to every session, and the aggregator seam that
//! produces it.
//!
//! A `Capabilities` value is immutable once built. Each entry pairs the MCP
//! descriptor with the handler that answers it, so a bundle is self-contained:
//! the registry can hand it to any session without knowing where it came from.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rmcp::ErrorData as McpError;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult, Prompt,
    ReadResourceRequestParams, ReadResourceResult, Resource, ResourceTemplate, Tool,
};

use crate::config::Configuration;

/// Answers a `tools/call` for one tool.
pub type ToolHandler = Arc<
    dyn Fn(CallToolRequestParams) -> BoxFuture<'static, Result<CallToolResult, McpError>>
        + Send
        + Sync,
>;

/// Answers a `prompts/get` for one prompt.
pub type PromptHandler = Arc<
    dyn Fn(GetPromptRequestParams) -> BoxFuture<'static, Result<GetPromptResult, McpError>>
        + Send
        + Sync,
>;

/// Answers a `resources/read` for one resource or template.
pub type ResourceHandler = Arc<
    dyn Fn(ReadResourceRequestParams) -> BoxFuture<'static, Result<ReadResourceResult, McpError>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct ServerTool {
    pub tool: Tool,
    pub handler: ToolHandler,
}

impl ServerTool {
    pub fn name(&self) -> &str {
        self.tool.name.as_ref()
    }
}

#[derive(Clone)]
pub struct ServerPrompt {
    pub prompt: Prompt,
    pub handler: PromptHandler,
}

impl ServerPrompt {
    pub fn name(&self) -> &str {
        &self.prompt.name
    }
}

#[derive(Clone)]
pub struct ServerResource {
    pub resource: Resource,
    pub handler: ResourceHandler,
}

#[derive(Clone)]
pub struct ServerResourceTemplate {
    pub template: ResourceTemplate,
    pub handler: ResourceHandler,
}

/// Tools, prompts, resources and resource templates served together.
///
/// Tool and prompt names are unique within a bundle: pushing an entry whose
/// name is already present overwrites it in place.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub tools: Vec<ServerTool>,
    pub prompts: Vec<ServerPrompt>,
    pub resources: Vec<ServerResource>,
    pub resource_templates: Vec<ServerResourceTemplate>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tool(&mut self, tool: ServerTool) {
        match self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            Some(existing) => *existing = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn push_prompt(&mut self, prompt: ServerPrompt) {
        match self.prompts.iter_mut().find(|p| p.name() == prompt.name()) {
            Some(existing) => *existing = prompt,
            None => self.prompts.push(prompt),
        }
    }

    pub fn push_resource(&mut self, resource: ServerResource) {
        self.resources.push(resource);
    }

    pub fn push_resource_template(&mut self, template: ServerResourceTemplate) {
        self.resource_templates.push(template);
    }

    /// Merge another bundle into this one; later entries win on name clashes.
    pub fn extend(&mut self, other: Capabilities) {
        for tool in other.tools {
            self.push_tool(tool);
        }
        for prompt in other.prompts {
            self.push_prompt(prompt);
        }
        self.resources.extend(other.resources);
        self.resource_templates.extend(other.resource_templates);
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn prompt_names(&self) -> Vec<String> {
        self.prompts.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn tool(&self, name: &str) -> Option<&ServerTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn prompt(&self, name: &str) -> Option<&ServerPrompt> {
        self.prompts.iter().find(|p| p.name() == name)
    }

    /// Find the handler for a resource URI: exact resources first, then the
    /// first template whose pattern matches.
    pub fn resource_handler(&self, uri: &str) -> Option<ResourceHandler> {
        if let Some(resource) = self.resources.iter().find(|r| r.resource.raw.uri == uri) {
            return Some(resource.handler.clone());
        }
        self.resource_templates
            .iter()
            .find(|t| template_matches(&t.template.raw.uri_template, uri))
            .map(|t| t.handler.clone())
    }
}

/// Remove from `served` every name that `previous` contributed, then
/// add-or-overwrite everything in `next`, keeping first-seen order.
pub(crate) fn swap_entries<T: Clone>(
    served: &mut Vec<T>,
    previous: &[String],
    next: &[T],
    name: impl Fn(&T) -> &str,
) {
    let stale: HashSet<&str> = previous.iter().map(String::as_str).collect();
    served.retain(|entry| !stale.contains(name(entry)));
    for entry in next {
        match served.iter_mut().find(|s| name(s) == name(entry)) {
            Some(existing) => *existing = entry.clone(),
            None => served.push(entry.clone()),
        }
    }
}

/// Match a URI against an RFC 6570 level-1 template (`file:///{path}`).
///
/// Each `{var}` matches one or more characters; literal parts must match
/// exactly.
pub fn template_matches(template: &str, uri: &str) -> bool {
    let mut pattern = String::from("^");
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        pattern.push_str(&regex::escape(&rest[..open]));
        match rest[open..].find('}') {
            Some(close) => {
                pattern.push_str(".+?");
                rest = &rest[open + close + 1..];
            }
            None => {
                pattern.push_str(&regex::escape(&rest[open..]));
                rest = "";
            }
        }
    }
    pattern.push_str(&regex::escape(rest));
    pattern.push('$');
    regex::Regex::new(&pattern)
        .map(|re| re.is_match(uri))
        .unwrap_or(false)
}

/// Builds the capability bundle for a configuration snapshot by talking to the
/// enabled downstream servers.
///
/// Implementations must tolerate being called again while a bundle from a
/// previous call is still being served.
#[async_trait]
pub trait CapabilityAggregator: Send + Sync {
    async fn list_capabilities(
        &self,
        configuration: &Configuration,
        server_names: &[String],
    ) -> crate::Result<Capabilities>;

    /// Container networks downstream containers should join.
    fn set_networks(&self, _networks: Vec<String>) {}
}
