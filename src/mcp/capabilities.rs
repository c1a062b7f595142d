//! Capability negotiation.
//!
//! The [`CapabilityManager`] holds the server's capability descriptors and
//! the ordered list of supported protocol versions, and negotiates them
//! against each client's declared capabilities.
//!
//! Negotiation runs four steps:
//!
//! 1. protocol version: the only step that can fail
//! 2. tool acknowledgement (schema support, list-change notifications)
//! 3. resource acknowledgement (subscriptions)
//! 4. prompt acknowledgement (schema support)
//!
//! A client is recorded only once all four steps have run, so a failed
//! negotiation leaves no trace. Negotiation never mutates the server
//! descriptors.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::mcp::error::NegotiationError;

/// Default protocol versions, most preferred first.
pub const DEFAULT_PROTOCOL_VERSIONS: [&str; 3] = ["2025-01-01", "2024-11-05", "2024-09-25"];

/// A server capability domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityDomain {
    /// Protocol versions.
    Protocol,
    /// Tool calls.
    Tools,
    /// Resource reads and subscriptions.
    Resources,
    /// Prompt templates.
    Prompts,
    /// Structured logging.
    Logging,
    /// LLM sampling.
    Sampling,
    /// Experimental features.
    Experimental,
}

impl CapabilityDomain {
    /// Wire name of the domain.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Tools => "tools",
            Self::Resources => "resources",
            Self::Prompts => "prompts",
            Self::Logging => "logging",
            Self::Sampling => "sampling",
            Self::Experimental => "experimental",
        }
    }
}

impl fmt::Display for CapabilityDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-version descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolDescriptor {
    /// Supported versions, most preferred first. Never empty.
    pub supported_versions: Vec<String>,
}

impl ProtocolDescriptor {
    /// The most preferred version.
    #[must_use]
    pub fn preferred_version(&self) -> &str {
        self.supported_versions
            .first()
            .map_or(DEFAULT_PROTOCOL_VERSIONS[0], String::as_str)
    }
}

/// Server capability descriptors, one per domain.
///
/// Apart from `protocol`, descriptors are free-form JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerCapabilities {
    /// Supported protocol versions.
    pub protocol: ProtocolDescriptor,
    /// Tool descriptor.
    pub tools: Value,
    /// Resource descriptor.
    pub resources: Value,
    /// Prompt descriptor.
    pub prompts: Value,
    /// Logging descriptor.
    pub logging: Value,
    /// Sampling descriptor.
    pub sampling: Value,
    /// Experimental descriptor.
    pub experimental: Value,
}

impl ServerCapabilities {
    /// Default descriptors advertising the given protocol versions.
    #[must_use]
    pub fn new(supported_versions: Vec<String>) -> Self {
        Self {
            protocol: ProtocolDescriptor { supported_versions },
            tools: json!({ "listChanged": true, "supportsSchema": true }),
            resources: json!({ "subscribe": true, "listChanged": true, "supportsSchema": true }),
            prompts: json!({ "listChanged": true, "supportsSchema": true }),
            logging: json!({ "enabled": true }),
            sampling: json!({ "enabled": false }),
            experimental: json!({}),
        }
    }

    /// Returns the descriptor of one domain as JSON.
    #[must_use]
    pub fn descriptor(&self, domain: CapabilityDomain) -> Value {
        match domain {
            CapabilityDomain::Protocol => json!({
                "supportedVersions": self.protocol.supported_versions,
                "preferredVersion": self.protocol.preferred_version(),
            }),
            CapabilityDomain::Tools => self.tools.clone(),
            CapabilityDomain::Resources => self.resources.clone(),
            CapabilityDomain::Prompts => self.prompts.clone(),
            CapabilityDomain::Logging => self.logging.clone(),
            CapabilityDomain::Sampling => self.sampling.clone(),
            CapabilityDomain::Experimental => self.experimental.clone(),
        }
    }

    /// The capability summary sent in the `initialize` result.
    #[must_use]
    pub fn initialize_summary(&self) -> Value {
        json!({
            "tools": { "listChanged": flag(&self.tools, "listChanged") },
            "resources": {
                "subscribe": flag(&self.resources, "subscribe"),
                "listChanged": flag(&self.resources, "listChanged"),
            },
            "prompts": { "listChanged": flag(&self.prompts, "listChanged") },
            "logging": {},
        })
    }
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROTOCOL_VERSIONS
                .iter()
                .map(ToString::to_string)
                .collect(),
        )
    }
}

/// Outcome of a successful negotiation.
///
/// Only the fields the negotiation steps inspect are parsed; the complete
/// declaration is kept in `raw`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedCapabilities {
    /// Agreed protocol version.
    pub protocol_version: String,
    /// `true` when the client declared no versions and the preferred one was assumed.
    pub version_defaulted: bool,
    /// Client validates tool input schemas.
    pub tool_schema_support: bool,
    /// Client handles tool list-change notifications.
    pub tool_list_changed: bool,
    /// Client subscribes to resources.
    pub resource_subscribe: bool,
    /// Client validates prompt argument schemas.
    pub prompt_schema_support: bool,
    /// The capabilities exactly as declared.
    pub raw: Value,
}

/// Capability manager statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityStats {
    /// Clients with a completed negotiation.
    pub negotiated_clients: usize,
    /// Supported protocol versions, most preferred first.
    pub supported_versions: Vec<String>,
    /// Most preferred protocol version.
    pub preferred_version: String,
}

#[derive(Debug)]
struct CapabilityState {
    server: ServerCapabilities,
    clients: HashMap<String, NegotiatedCapabilities>,
}

/// Holds server capabilities and negotiated client capabilities.
#[derive(Debug)]
pub struct CapabilityManager {
    state: RwLock<CapabilityState>,
}

impl CapabilityManager {
    /// Creates a manager advertising `server` capabilities.
    #[must_use]
    pub fn new(server: ServerCapabilities) -> Self {
        Self {
            state: RwLock::new(CapabilityState {
                server,
                clients: HashMap::new(),
            }),
        }
    }

    /// Negotiates with a client and records the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::InvalidFormat`] if the declaration or its
    /// `protocol` section has the wrong shape, and
    /// [`NegotiationError::NoCompatibleVersion`] if the client lists only
    /// unsupported versions. Nothing is recorded on error.
    pub fn negotiate_capabilities(
        &self,
        client_id: &str,
        client_capabilities: &Value,
    ) -> Result<NegotiatedCapabilities, NegotiationError> {
        tracing::info!(client_id, "Starting capability negotiation");

        let empty = Map::new();
        let sections = match client_capabilities {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(NegotiationError::InvalidFormat {
                    section: "capabilities",
                })
            }
        };

        let supported = self.state.read().server.protocol.supported_versions.clone();
        let (protocol_version, version_defaulted) =
            negotiate_version(client_id, &supported, sections.get("protocol"))?;

        let tools = section(client_id, sections, "tools");
        let resources = section(client_id, sections, "resources");
        let prompts = section(client_id, sections, "prompts");

        let negotiated = NegotiatedCapabilities {
            protocol_version,
            version_defaulted,
            tool_schema_support: tools.is_some_and(|t| flag(t, "supportsSchema")),
            tool_list_changed: tools.is_some_and(|t| flag(t, "listChanged")),
            resource_subscribe: resources.is_some_and(|r| flag(r, "subscribe")),
            prompt_schema_support: prompts.is_some_and(|p| flag(p, "supportsSchema")),
            raw: client_capabilities.clone(),
        };

        tracing::debug!(
            client_id,
            tool_schema_support = negotiated.tool_schema_support,
            tool_list_changed = negotiated.tool_list_changed,
            resource_subscribe = negotiated.resource_subscribe,
            prompt_schema_support = negotiated.prompt_schema_support,
            "Client capabilities acknowledged"
        );

        self.state
            .write()
            .clients
            .insert(client_id.to_string(), negotiated.clone());

        tracing::info!(
            client_id,
            protocol_version = %negotiated.protocol_version,
            "Capability negotiation completed"
        );
        Ok(negotiated)
    }

    /// Returns a copy of the server capabilities.
    #[must_use]
    pub fn server_capabilities(&self) -> ServerCapabilities {
        self.state.read().server.clone()
    }

    /// Returns the capabilities a client declared, as declared.
    #[must_use]
    pub fn get_client_capabilities(&self, client_id: &str) -> Option<Value> {
        self.state
            .read()
            .clients
            .get(client_id)
            .map(|n| n.raw.clone())
    }

    /// Returns the full negotiation outcome for a client.
    #[must_use]
    pub fn negotiated(&self, client_id: &str) -> Option<NegotiatedCapabilities> {
        self.state.read().clients.get(client_id).cloned()
    }

    /// Forgets a client. Unknown ids are ignored.
    pub fn remove_client(&self, client_id: &str) {
        if self.state.write().clients.remove(client_id).is_some() {
            tracing::debug!(client_id, "Removed client capability information");
        }
    }

    /// Replaces the descriptor of one domain.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::InvalidFormat`] if a `protocol` descriptor
    /// lacks a non-empty `supportedVersions` list.
    pub fn update_server_capability(
        &self,
        domain: CapabilityDomain,
        descriptor: Value,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.write();
        match domain {
            CapabilityDomain::Protocol => {
                let protocol: ProtocolDescriptor = serde_json::from_value(descriptor)
                    .ok()
                    .filter(|p: &ProtocolDescriptor| !p.supported_versions.is_empty())
                    .ok_or(NegotiationError::InvalidFormat { section: "protocol" })?;
                state.server.protocol = protocol;
            }
            CapabilityDomain::Tools => state.server.tools = descriptor,
            CapabilityDomain::Resources => state.server.resources = descriptor,
            CapabilityDomain::Prompts => state.server.prompts = descriptor,
            CapabilityDomain::Logging => state.server.logging = descriptor,
            CapabilityDomain::Sampling => state.server.sampling = descriptor,
            CapabilityDomain::Experimental => state.server.experimental = descriptor,
        }
        drop(state);

        tracing::debug!(capability = %domain, "Updated server capability");
        Ok(())
    }

    /// Returns capability statistics.
    #[must_use]
    pub fn stats(&self) -> CapabilityStats {
        let state = self.state.read();
        CapabilityStats {
            negotiated_clients: state.clients.len(),
            supported_versions: state.server.protocol.supported_versions.clone(),
            preferred_version: state.server.protocol.preferred_version().to_string(),
        }
    }
}

impl Default for CapabilityManager {
    fn default() -> Self {
        Self::new(ServerCapabilities::default())
    }
}

/// Picks the first server version the client also lists.
fn negotiate_version(
    client_id: &str,
    supported: &[String],
    protocol: Option<&Value>,
) -> Result<(String, bool), NegotiationError> {
    let preferred = || {
        supported
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSIONS[0].to_string())
    };

    let Some(protocol) = protocol else {
        tracing::warn!(client_id, "Client did not specify protocol capabilities, using default");
        return Ok((preferred(), true));
    };
    let Value::Object(protocol) = protocol else {
        return Err(NegotiationError::InvalidFormat { section: "protocol" });
    };

    let client_versions: Vec<String> =
        match (protocol.get("supportedVersions"), protocol.get("version")) {
            (Some(Value::Array(versions)), _) => versions
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect(),
            (None, Some(Value::String(version))) => vec![version.clone()],
            (None, None) => {
                tracing::warn!(
                    client_id,
                    "Client did not specify protocol versions, using default"
                );
                return Ok((preferred(), true));
            }
            _ => return Err(NegotiationError::InvalidFormat { section: "protocol" }),
        };

    supported
        .iter()
        .find(|v| client_versions.contains(v))
        .map(|v| {
            tracing::info!(client_id, negotiated_version = %v, "Protocol version negotiated");
            (v.clone(), false)
        })
        .ok_or_else(|| NegotiationError::NoCompatibleVersion {
            server: supported.to_vec(),
            client: client_versions,
        })
}

/// Returns an advisory section as an object, logging when it is absent or malformed.
fn section<'a>(client_id: &str, sections: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    match sections.get(name) {
        None => {
            tracing::debug!(client_id, section = name, "Client does not specify capabilities");
            None
        }
        Some(value) if value.is_object() => Some(value),
        Some(_) => {
            tracing::warn!(client_id, section = name, "Ignoring malformed capability section");
            None
        }
    }
}

fn flag(object: &Value, key: &str) -> bool {
    object.get(key).and_then(Value::as_bool).unwrap_or(false)
}
