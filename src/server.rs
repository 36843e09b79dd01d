//! GatewayServer: the rmcp `ServerHandler` behind one client session.
//!
//! Every session owns a `SessionHandle` from the `CapabilityRegistry`. Listing
//! reads the handle's current view and calls dispatch to whatever handler the
//! view holds at that instant, so a reload takes effect on the next request
//! without the session noticing anything else. Tool calls run through the
//! shared interceptor middleware on every transport.

use std::sync::Arc;

use rmcp::ErrorData as McpError;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParams, ReadResourceRequestParams, ReadResourceResult, ServerCapabilities,
    ServerInfo,
};
use rmcp::service::{NotificationContext, RequestContext, RoleServer};

use crate::interceptors::Middleware;
use crate::registry::{CapabilityRegistry, SessionHandle};

/// Builds one `GatewayServer` per session, each registered with the registry.
#[derive(Clone)]
pub struct ServerFactory {
    registry: Arc<CapabilityRegistry>,
    middleware: Middleware,
}

impl ServerFactory {
    pub fn new(registry: Arc<CapabilityRegistry>, middleware: Middleware) -> Self {
        Self {
            registry,
            middleware,
        }
    }

    /// A fresh server seeded with the latest published capabilities.
    pub fn new_server(&self) -> GatewayServer {
        GatewayServer {
            session: Arc::new(self.registry.register()),
            middleware: self.middleware.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }
}

/// MCP server for a single session. Clones share the session; the session
/// leaves the registry when the last clone is dropped.
#[derive(Clone)]
pub struct GatewayServer {
    session: Arc<SessionHandle>,
    middleware: Middleware,
}

impl GatewayServer {
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Run a tool call through the middleware and the session's handler.
    pub async fn call(&self, request: CallToolRequestParams) -> Result<CallToolResult, McpError> {
        let Some(tool) = self.session.tool(&request.name) else {
            return Err(McpError::invalid_params(
                format!("unknown tool '{}'", request.name),
                None,
            ));
        };
        let handler = (self.middleware)(tool.handler);
        handler(request).await
    }

    pub async fn prompt(&self, request: GetPromptRequestParams) -> Result<GetPromptResult, McpError> {
        let Some(prompt) = self.session.prompt(&request.name) else {
            return Err(McpError::invalid_params(
                format!("unknown prompt '{}'", request.name),
                None,
            ));
        };
        (prompt.handler)(request).await
    }

    pub async fn read(
        &self,
        request: ReadResourceRequestParams,
    ) -> Result<ReadResourceResult, McpError> {
        let Some(handler) = self.session.resource_handler(&request.uri) else {
            return Err(McpError::resource_not_found(
                format!("unknown resource '{}'", request.uri),
                None,
            ));
        };
        handler(request).await
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: rmcp::model::Implementation {
                name: "mcp-gateway".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "MCP gateway: tools, prompts and resources aggregated from the enabled servers."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_prompts()
                .enable_prompts_list_changed()
                .enable_resources()
                .build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.session.tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(request).await
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult {
            prompts: self.session.prompts(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.prompt(request).await
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let seed = self.session.seed();
        Ok(ListResourcesResult {
            resources: seed.resources.iter().map(|r| r.resource.clone()).collect(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let seed = self.session.seed();
        Ok(ListResourceTemplatesResult {
            resource_templates: seed
                .resource_templates
                .iter()
                .map(|t| t.template.clone())
                .collect(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.read(request).await
    }

    /// Record the peer so list-changed notifications reach this session.
    async fn on_initialized(&self, context: NotificationContext<RoleServer>) {
        tracing::debug!(session = self.session.id(), "MCP client initialized");
        self.session.set_peer(context.peer.clone());
    }
}
