//! JSON-RPC 2.0 message types for the MCP protocol engine.
//!
//! This module defines the wire shapes exchanged with clients. All messages
//! follow the JSON-RPC 2.0 specification with MCP-specific error codes.
//!
//! # Message Types
//!
//! - **Request**: a call carrying `method`, optional `params` and an `id`.
//!   A request without `id` (or with `id: null`) is a notification; the
//!   engine still produces a response for it, keyed by `null`.
//! - **Response**: exactly one of `result` or `error`, echoing the `id`.
//!
//! No batching: one JSON object per message.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The JSON-RPC version string every message must carry.
pub const JSONRPC_VERSION: &str = "2.0";

/// Server name reported by `initialize`.
pub const SERVER_NAME: &str = "acmg-mcp-engine";

/// A JSON-RPC 2.0 request ID.
///
/// Numbers are kept as [`serde_json::Number`] so that whatever the client
/// sent (integer or float) is echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(serde_json::Number),
    /// String request ID.
    String(String),
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be "2.0". [`decode_request`] rejects anything else, including
    /// a missing or non-string value, as an invalid request.
    #[serde(default)]
    pub jsonrpc: String,

    /// The method to invoke.
    #[serde(default)]
    pub method: String,

    /// Optional parameters for the method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Request identifier; `None` marks a notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl JsonRpcRequest {
    /// Creates a request with the current JSON-RPC version.
    #[must_use]
    pub fn new(id: Option<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Returns `true` when the request carries no `id`.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Re-targets this request at an internal dispatch tag, keeping the `id`.
    #[must_use]
    pub fn redirect(&self, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: self.jsonrpc.clone(),
            method: method.to_string(),
            params,
            id: self.id.clone(),
        }
    }
}

/// Standard JSON-RPC 2.0 and MCP error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the server.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// The client is not authenticated.
    Unauthorized,
    /// The client exceeded its rate limit or is blocked.
    RateLimited,
    /// A resource handler failed.
    ResourceError,
    /// A tool handler failed.
    ToolError,
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::Unauthorized => -32000,
            Self::RateLimited => -32001,
            Self::ResourceError => -32002,
            Self::ToolError => -32003,
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::Unauthorized => "Unauthorized",
            Self::RateLimited => "Rate limit exceeded",
            Self::ResourceError => "Resource error",
            Self::ToolError => "Tool error",
        }
    }

    /// Maps a numeric code back to a known error code.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(Self::ParseError),
            -32600 => Some(Self::InvalidRequest),
            -32601 => Some(Self::MethodNotFound),
            -32602 => Some(Self::InvalidParams),
            -32603 => Some(Self::InternalError),
            -32000 => Some(Self::Unauthorized),
            -32001 => Some(Self::RateLimited),
            -32002 => Some(Self::ResourceError),
            -32003 => Some(Self::ToolError),
            _ => None,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Adds additional data to the error.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Returns the known error code, if any.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl fmt::Display for JsonRpcErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// A JSON-RPC 2.0 response.
///
/// Constructors guarantee exactly one of `result` / `error`. Responses
/// produced by external handlers are checked with [`Self::is_well_formed`]
/// before they leave the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always "2.0" once stamped by the engine.
    pub jsonrpc: String,

    /// The result of the method call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// The error details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorData>,

    /// The request ID this response corresponds to; serialised as `null`
    /// when unknown.
    pub id: Option<RequestId>,
}

impl JsonRpcResponse {
    /// Creates a new success response.
    #[must_use]
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Creates a new error response.
    #[must_use]
    pub fn error(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Creates a parse error response (ID cannot be determined).
    #[must_use]
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::error(
            None,
            JsonRpcErrorData::from_code(ErrorCode::ParseError).with_data(detail.into()),
        )
    }

    /// Creates an invalid request error response.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>, detail: impl Into<String>) -> Self {
        Self::error(
            id,
            JsonRpcErrorData::from_code(ErrorCode::InvalidRequest).with_data(detail.into()),
        )
    }

    /// Creates a method not found error response.
    #[must_use]
    pub fn method_not_found(id: Option<RequestId>, method: &str) -> Self {
        Self::error(
            id,
            JsonRpcErrorData::from_code(ErrorCode::MethodNotFound)
                .with_data(format!("Method '{method}' not found")),
        )
    }

    /// Creates an invalid params error response.
    #[must_use]
    pub fn invalid_params(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::error(
            id,
            JsonRpcErrorData::with_message(ErrorCode::InvalidParams, message),
        )
    }

    /// Creates an internal error response.
    #[must_use]
    pub fn internal_error(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::error(
            id,
            JsonRpcErrorData::with_message(ErrorCode::InternalError, message),
        )
    }

    /// Returns `true` if exactly one of `result` and `error` is present.
    #[must_use]
    pub const fn is_well_formed(&self) -> bool {
        self.result.is_some() != self.error.is_some()
    }

    /// Returns `true` if this response carries an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Overwrites the version and `id` with the engine's values.
    #[must_use]
    pub fn stamped(mut self, id: Option<RequestId>) -> Self {
        JSONRPC_VERSION.clone_into(&mut self.jsonrpc);
        self.id = id;
        self
    }
}

/// Why an inbound message was rejected before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeFailure {
    /// Not valid JSON or not a request-shaped object.
    Parse(String),
    /// Decoded, but `jsonrpc` is not the string "2.0".
    Version {
        /// The request's id, echoed in the error response.
        id: Option<RequestId>,
        /// What the client sent: the string itself, empty when missing or
        /// null, otherwise the JSON text.
        found: String,
    },
    /// Decoded, but `method` is not a string.
    Method {
        /// The request's id, echoed in the error response.
        id: Option<RequestId>,
    },
}

impl DecodeFailure {
    /// Converts the failure into its wire response.
    #[must_use]
    pub fn into_response(self) -> JsonRpcResponse {
        match self {
            Self::Parse(detail) => JsonRpcResponse::parse_error(detail),
            Self::Version { id, .. } => {
                JsonRpcResponse::invalid_request(id, "JSON-RPC version must be 2.0")
            }
            Self::Method { id } => JsonRpcResponse::invalid_request(id, "method must be a string"),
        }
    }
}

/// A request as it arrives, before `jsonrpc` and `method` are type-checked.
#[derive(Deserialize)]
struct RawRequest {
    #[serde(default)]
    jsonrpc: Value,
    #[serde(default)]
    method: Value,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    id: Option<RequestId>,
}

/// Decodes raw bytes into a request and enforces the JSON-RPC version.
///
/// A `jsonrpc` or `method` of the wrong JSON type is an invalid request, not
/// a parse error, so the id is still echoed. A missing or null `method`
/// decodes as an empty string.
///
/// # Errors
///
/// Returns [`DecodeFailure::Parse`] if the bytes are not a request-shaped
/// JSON object, [`DecodeFailure::Version`] if `jsonrpc` is not "2.0", and
/// [`DecodeFailure::Method`] if `method` is not a string.
pub fn decode_request(raw: &[u8]) -> Result<JsonRpcRequest, DecodeFailure> {
    let RawRequest {
        jsonrpc,
        method,
        params,
        id,
    } = serde_json::from_slice(raw).map_err(|e| DecodeFailure::Parse(e.to_string()))?;

    if jsonrpc.as_str() != Some(JSONRPC_VERSION) {
        let found = match jsonrpc {
            Value::String(found) => found,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        return Err(DecodeFailure::Version { id, found });
    }

    let method = match method {
        Value::String(method) => method,
        Value::Null => String::new(),
        _ => return Err(DecodeFailure::Method { id }),
    };

    Ok(JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method,
        params,
        id,
    })
}

/// Encodes a response as compact JSON bytes.
///
/// # Errors
///
/// Returns an error if serialisation fails.
pub fn encode_response(response: &JsonRpcResponse) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(response)
}
