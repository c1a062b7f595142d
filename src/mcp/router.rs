//! Method dispatch and the built-in system methods.
//!
//! The [`MessageRouter`] answers the seven system methods itself. Registered
//! tools, resources and prompts are reachable only through `tools/call`,
//! `resources/read` and `prompts/get`, which look the target up in the
//! matching registry and re-wrap the request under an internal method tag
//! before delegating.
//!
//! Registries preserve registration order, so list responses are stable.
//! The registry lock is only held to clone entries out; matchers and
//! handlers always run without it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};

use crate::mcp::capabilities::CapabilityManager;
use crate::mcp::context::RequestContext;
use crate::mcp::handler::{
    ExactMatcher, MessageHandler, PromptHandler, PromptInfo, ResourceHandler, ResourceInfo,
    ToolHandler, ToolInfo, UriMatcher,
};
use crate::mcp::protocol::{
    ErrorCode, JsonRpcErrorData, JsonRpcRequest, JsonRpcResponse, SERVER_NAME,
};

/// Internal method tag for requests delegated to a [`ToolHandler`].
pub const TOOL_CALL_METHOD: &str = "tool_call";

/// Internal method tag for requests delegated to a [`ResourceHandler`].
pub const RESOURCE_READ_METHOD: &str = "resource_read";

/// Internal method tag for requests delegated to a [`PromptHandler`].
pub const PROMPT_GET_METHOD: &str = "prompt_get";

/// The built-in system methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemMethod {
    /// `initialize`
    Initialize,
    /// `tools/list`
    ToolsList,
    /// `tools/call`
    ToolsCall,
    /// `resources/list`
    ResourcesList,
    /// `resources/read`
    ResourcesRead,
    /// `prompts/list`
    PromptsList,
    /// `prompts/get`
    PromptsGet,
}

impl SystemMethod {
    /// All system methods.
    pub const ALL: [Self; 7] = [
        Self::Initialize,
        Self::ToolsList,
        Self::ToolsCall,
        Self::ResourcesList,
        Self::ResourcesRead,
        Self::PromptsList,
        Self::PromptsGet,
    ];

    /// Looks up a system method by wire name.
    #[must_use]
    pub fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == method)
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::ResourcesList => "resources/list",
            Self::ResourcesRead => "resources/read",
            Self::PromptsList => "prompts/list",
            Self::PromptsGet => "prompts/get",
        }
    }

    /// Human-readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Initialize => "Initialize MCP connection and negotiate capabilities",
            Self::ToolsList => "List available MCP tools",
            Self::ToolsCall => "Call a specific MCP tool",
            Self::ResourcesList => "List available MCP resources",
            Self::ResourcesRead => "Read a specific MCP resource",
            Self::PromptsList => "List available MCP prompts",
            Self::PromptsGet => "Get a specific MCP prompt",
        }
    }
}

impl fmt::Display for SystemMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server identity reported by `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Registered tools.
    pub registered_tools: usize,
    /// Registered resources.
    pub registered_resources: usize,
    /// Registered prompts.
    pub registered_prompts: usize,
    /// Built-in system methods.
    pub system_methods: usize,
}

struct Registries {
    tools: IndexMap<String, Arc<dyn ToolHandler>>,
    resources: IndexMap<String, Arc<dyn ResourceHandler>>,
    prompts: IndexMap<String, Arc<dyn PromptHandler>>,
    matcher: Arc<dyn UriMatcher>,
}

/// Routes requests to system methods and registered handlers.
pub struct MessageRouter {
    registries: RwLock<Registries>,
    capabilities: Arc<CapabilityManager>,
    server_info: ServerInfo,
}

impl MessageRouter {
    /// Creates a router whose `initialize` reports `capabilities`.
    #[must_use]
    pub fn new(capabilities: Arc<CapabilityManager>, server_info: ServerInfo) -> Self {
        Self {
            registries: RwLock::new(Registries {
                tools: IndexMap::new(),
                resources: IndexMap::new(),
                prompts: IndexMap::new(),
                matcher: Arc::new(ExactMatcher),
            }),
            capabilities,
            server_info,
        }
    }

    /// Registers a tool under `name`, replacing any previous one.
    pub fn register_tool(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        let name = name.into();
        tracing::debug!(tool_name = %name, "Registered tool handler");
        self.registries.write().tools.insert(name, handler);
    }

    /// Registers a resource under `uri_pattern`, replacing any previous one.
    pub fn register_resource(
        &self,
        uri_pattern: impl Into<String>,
        handler: Arc<dyn ResourceHandler>,
    ) {
        let uri_pattern = uri_pattern.into();
        tracing::debug!(uri_pattern = %uri_pattern, "Registered resource handler");
        self.registries.write().resources.insert(uri_pattern, handler);
    }

    /// Registers a prompt under `name`, replacing any previous one.
    pub fn register_prompt(&self, name: impl Into<String>, handler: Arc<dyn PromptHandler>) {
        let name = name.into();
        tracing::debug!(prompt_name = %name, "Registered prompt handler");
        self.registries.write().prompts.insert(name, handler);
    }

    /// Replaces the resource URI matching strategy.
    pub fn set_uri_matcher(&self, matcher: Arc<dyn UriMatcher>) {
        tracing::debug!(matcher = ?matcher, "Changed resource URI matcher");
        self.registries.write().matcher = matcher;
    }

    /// Looks up a tool by exact name.
    #[must_use]
    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.registries.read().tools.get(name).cloned()
    }

    /// Finds the first resource, in registration order, whose pattern
    /// matches `uri` and which accepts it.
    #[must_use]
    pub fn get_resource(&self, uri: &str) -> Option<Arc<dyn ResourceHandler>> {
        let (matcher, entries) = {
            let registries = self.registries.read();
            let entries: Vec<_> = registries
                .resources
                .iter()
                .map(|(pattern, handler)| (pattern.clone(), Arc::clone(handler)))
                .collect();
            (Arc::clone(&registries.matcher), entries)
        };

        entries
            .into_iter()
            .find(|(pattern, handler)| matcher.matches(pattern, uri) && handler.matches_uri(uri))
            .map(|(_, handler)| handler)
    }

    /// Looks up a prompt by exact name.
    #[must_use]
    pub fn get_prompt(&self, name: &str) -> Option<Arc<dyn PromptHandler>> {
        self.registries.read().prompts.get(name).cloned()
    }

    /// Descriptors of all tools, in registration order.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let handlers: Vec<_> = self.registries.read().tools.values().cloned().collect();
        handlers.iter().map(|h| h.describe()).collect()
    }

    /// Descriptors of all resources, in registration order.
    #[must_use]
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let handlers: Vec<_> = self.registries.read().resources.values().cloned().collect();
        handlers.iter().map(|h| h.describe()).collect()
    }

    /// Descriptors of all prompts, in registration order.
    #[must_use]
    pub fn list_prompts(&self) -> Vec<PromptInfo> {
        let handlers: Vec<_> = self.registries.read().prompts.values().cloned().collect();
        handlers.iter().map(|h| h.describe()).collect()
    }

    /// Wire names of the system methods.
    #[must_use]
    pub fn supported_methods(&self) -> Vec<String> {
        SystemMethod::ALL
            .iter()
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Returns router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let registries = self.registries.read();
        RouterStats {
            registered_tools: registries.tools.len(),
            registered_resources: registries.resources.len(),
            registered_prompts: registries.prompts.len(),
            system_methods: SystemMethod::ALL.len(),
        }
    }

    /// Dispatches a request to a system method.
    ///
    /// Unknown methods get MethodNotFound.
    pub async fn route(&self, ctx: &RequestContext, request: JsonRpcRequest) -> JsonRpcResponse {
        tracing::debug!(method = %request.method, client_id = ctx.client_id(), "Routing message");

        let Some(method) = SystemMethod::from_method(&request.method) else {
            return JsonRpcResponse::method_not_found(request.id, &request.method);
        };

        match method {
            SystemMethod::Initialize => self.handle_initialize(ctx, &request),
            SystemMethod::ToolsList => {
                JsonRpcResponse::success(request.id, json!({ "tools": self.list_tools() }))
            }
            SystemMethod::ToolsCall => self.handle_tools_call(ctx, request).await,
            SystemMethod::ResourcesList => {
                JsonRpcResponse::success(request.id, json!({ "resources": self.list_resources() }))
            }
            SystemMethod::ResourcesRead => self.handle_resources_read(ctx, request).await,
            SystemMethod::PromptsList => {
                JsonRpcResponse::success(request.id, json!({ "prompts": self.list_prompts() }))
            }
            SystemMethod::PromptsGet => self.handle_prompts_get(ctx, request).await,
        }
    }

    /// Answers with the client's negotiated version, or the server's
    /// preferred one if the client never negotiated.
    fn handle_initialize(&self, ctx: &RequestContext, request: &JsonRpcRequest) -> JsonRpcResponse {
        let client_info = request.params.as_ref().and_then(|p| p.get("clientInfo"));
        let field = |key: &str| {
            client_info
                .and_then(|c| c.get(key))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
        };
        tracing::info!(
            client_name = field("name"),
            client_version = field("version"),
            "MCP client initialized"
        );

        let server = self.capabilities.server_capabilities();
        let protocol_version = self
            .capabilities
            .negotiated(ctx.client_id())
            .map_or_else(
                || server.protocol.preferred_version().to_string(),
                |n| n.protocol_version,
            );
        JsonRpcResponse::success(
            request.id.clone(),
            json!({
                "protocolVersion": protocol_version,
                "capabilities": server.initialize_summary(),
                "serverInfo": self.server_info,
            }),
        )
    }

    async fn handle_tools_call(
        &self,
        ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        let Some(name) = required_str(&request, "name") else {
            return JsonRpcResponse::invalid_params(
                request.id,
                "Missing required parameter 'name'",
            );
        };
        let Some(tool) = self.get_tool(&name) else {
            return not_found(request, "Tool not found", name);
        };

        let arguments = argument_field(&request);
        if let Err(error) = tool.validate_params(arguments.as_ref()) {
            tracing::debug!(tool_name = %name, error = %error, "Tool arguments rejected");
            return JsonRpcResponse::error(request.id, error);
        }

        tracing::debug!(tool_name = %name, "Delegating to tool handler");
        tool.handle_tool(ctx, request.redirect(TOOL_CALL_METHOD, arguments))
            .await
    }

    async fn handle_resources_read(
        &self,
        ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        let Some(uri) = required_str(&request, "uri") else {
            return JsonRpcResponse::invalid_params(
                request.id,
                "Missing required parameter 'uri'",
            );
        };
        let Some(resource) = self.get_resource(&uri) else {
            return not_found(request, "Resource not found", uri);
        };

        tracing::debug!(uri = %uri, "Delegating to resource handler");
        let params = request.params.clone();
        resource
            .handle_resource(ctx, request.redirect(RESOURCE_READ_METHOD, params))
            .await
    }

    async fn handle_prompts_get(
        &self,
        ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        let Some(name) = required_str(&request, "name") else {
            return JsonRpcResponse::invalid_params(
                request.id,
                "Missing required parameter 'name'",
            );
        };
        let Some(prompt) = self.get_prompt(&name) else {
            return not_found(request, "Prompt not found", name);
        };

        let arguments = argument_field(&request);
        if let Err(error) = prompt.validate_params(arguments.as_ref()) {
            tracing::debug!(prompt_name = %name, error = %error, "Prompt arguments rejected");
            return JsonRpcResponse::error(request.id, error);
        }

        tracing::debug!(prompt_name = %name, "Delegating to prompt handler");
        prompt
            .handle_prompt(ctx, request.redirect(PROMPT_GET_METHOD, arguments))
            .await
    }
}

#[async_trait]
impl MessageHandler for MessageRouter {
    async fn handle_request(
        &self,
        ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        self.route(ctx, request).await
    }

    fn supported_methods(&self) -> Vec<String> {
        Self::supported_methods(self)
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("stats", &self.stats())
            .field("server_info", &self.server_info)
            .finish_non_exhaustive()
    }
}

/// A non-empty string parameter.
fn required_str(request: &JsonRpcRequest, key: &str) -> Option<String> {
    request
        .params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn argument_field(request: &JsonRpcRequest) -> Option<Value> {
    request
        .params
        .as_ref()
        .and_then(|p| p.get("arguments"))
        .cloned()
}

fn not_found(request: JsonRpcRequest, message: &str, name: String) -> JsonRpcResponse {
    JsonRpcResponse::error(
        request.id,
        JsonRpcErrorData::with_message(ErrorCode::InvalidParams, message).with_data(name),
    )
}
