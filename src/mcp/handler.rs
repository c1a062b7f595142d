//! Handler traits for the engine's external collaborators.
//!
//! Business logic lives outside the engine. Tools, resources and prompts
//! each plug in through their own trait and are stored in separate typed
//! registries by the [`MessageRouter`](crate::mcp::router::MessageRouter).
//! Every handler can describe itself, validate its input and execute.
//!
//! [`MessageHandler`] is the generic method-level trait used for handlers
//! registered directly on the [`ProtocolCore`](crate::mcp::core::ProtocolCore).

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::context::RequestContext;
use crate::mcp::protocol::{JsonRpcErrorData, JsonRpcRequest, JsonRpcResponse};

/// Metadata about a tool, returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Metadata about a resource, returned by `resources/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Resource URI (or URI pattern).
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the resource content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Metadata about a prompt, returned by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptInfo {
    /// Unique prompt name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Declared arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// A prompt argument declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

/// A tool implementation, reached through `tools/call`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Describes the tool for `tools/list`.
    fn describe(&self) -> ToolInfo;

    /// Validates the `arguments` of a call before execution.
    ///
    /// # Errors
    ///
    /// Returns the error to send back (normally InvalidParams).
    fn validate_params(&self, _arguments: Option<&Value>) -> Result<(), JsonRpcErrorData> {
        Ok(())
    }

    /// Executes the tool. `request.params` holds the call's `arguments`.
    async fn handle_tool(&self, ctx: &RequestContext, request: JsonRpcRequest) -> JsonRpcResponse;
}

/// A resource implementation, reached through `resources/read`.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Describes the resource for `resources/list`.
    fn describe(&self) -> ResourceInfo;

    /// Returns `false` to refuse a URI its registry pattern matched.
    fn matches_uri(&self, _uri: &str) -> bool {
        true
    }

    /// Reads the resource. `request.params` holds the original params,
    /// including `uri`.
    async fn handle_resource(
        &self,
        ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse;
}

/// A prompt implementation, reached through `prompts/get`.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Describes the prompt for `prompts/list`.
    fn describe(&self) -> PromptInfo;

    /// Validates the `arguments` of a get before execution.
    ///
    /// # Errors
    ///
    /// Returns the error to send back (normally InvalidParams).
    fn validate_params(&self, _arguments: Option<&Value>) -> Result<(), JsonRpcErrorData> {
        Ok(())
    }

    /// Renders the prompt. `request.params` holds the get's `arguments`.
    async fn handle_prompt(&self, ctx: &RequestContext, request: JsonRpcRequest)
        -> JsonRpcResponse;
}

/// A handler for whole JSON-RPC methods.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles a request for one of [`Self::supported_methods`].
    async fn handle_request(
        &self,
        ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse;

    /// Methods this handler answers.
    fn supported_methods(&self) -> Vec<String>;
}

/// Strategy deciding whether a registered URI pattern matches a requested URI.
pub trait UriMatcher: Send + Sync + fmt::Debug {
    /// Returns `true` if `uri` is served by the entry registered as `pattern`.
    fn matches(&self, pattern: &str, uri: &str) -> bool;
}

/// Exact string equality. The default strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactMatcher;

impl UriMatcher for ExactMatcher {
    fn matches(&self, pattern: &str, uri: &str) -> bool {
        pattern == uri
    }
}

/// Shell-style globs (`variant://*`, `evidence://?/summary`).
///
/// Invalid patterns fall back to exact comparison.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobMatcher;

impl UriMatcher for GlobMatcher {
    fn matches(&self, pattern: &str, uri: &str) -> bool {
        glob::Pattern::new(pattern).map_or_else(|_| pattern == uri, |p| p.matches(uri))
    }
}

/// URI templates with `{name}` placeholders (`variant://{id}/summary`).
///
/// A placeholder matches one non-empty path segment (no `/`). Each pattern
/// is compiled once; a pattern that does not compile is compared literally.
#[derive(Debug, Default)]
pub struct TemplateMatcher {
    compiled: RwLock<HashMap<String, Option<Regex>>>,
}

impl TemplateMatcher {
    /// Creates a matcher with an empty pattern cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles a URI template into an anchored regex.
    fn compile(template: &str) -> Option<Regex> {
        let mut expr = String::from("^");
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let close = open + rest[open..].find('}')?;
            expr.push_str(&regex::escape(&rest[..open]));
            expr.push_str("[^/]+");
            rest = &rest[close + 1..];
        }
        expr.push_str(&regex::escape(rest));
        expr.push('$');

        Regex::new(&expr).ok()
    }
}

impl UriMatcher for TemplateMatcher {
    fn matches(&self, pattern: &str, uri: &str) -> bool {
        if let Some(compiled) = self.compiled.read().get(pattern) {
            return compiled.as_ref().map_or(pattern == uri, |re| re.is_match(uri));
        }

        let compiled = Self::compile(pattern);
        let matched = compiled.as_ref().map_or(pattern == uri, |re| re.is_match(uri));
        self.compiled.write().insert(pattern.to_string(), compiled);
        matched
    }
}
