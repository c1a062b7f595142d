//! Per-request execution context handed to every handler.
//!
//! The context carries the caller's cancellation token through to the
//! handler. The engine never enforces a timeout itself: a handler that
//! awaits external collaborators should race its work against
//! [`RequestContext::cancelled`] and return promptly with an error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::mcp::protocol::{ErrorCode, JsonRpcErrorData, JsonRpcResponse, RequestId};

/// Resilience-layer hook that classifies or enriches a handler error
/// before it is embedded in a response.
pub trait ErrorReporter: Send + Sync {
    /// Returns the error to embed. Implementations may rewrite `message`
    /// or attach `data`, but must return a complete error object.
    fn report(&self, ctx: &RequestContext, error: JsonRpcErrorData) -> JsonRpcErrorData;
}

/// Reporter that returns errors unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughReporter;

impl ErrorReporter for PassthroughReporter {
    fn report(&self, _ctx: &RequestContext, error: JsonRpcErrorData) -> JsonRpcErrorData {
        error
    }
}

/// Context information for one inbound message.
#[derive(Clone)]
pub struct RequestContext {
    /// Engine-assigned identifier, unique per processed message.
    trace_id: Uuid,
    /// Client that sent the message.
    client_id: String,
    /// The JSON-RPC id of the request, if any.
    request_id: Option<RequestId>,
    /// Time when dispatch started.
    started_at: Instant,
    /// Cooperative cancellation signal from the caller.
    cancellation: CancellationToken,
    /// Error classification collaborator.
    reporter: Arc<dyn ErrorReporter>,
}

impl RequestContext {
    /// Creates a context for `client_id` with a passthrough reporter.
    #[must_use]
    pub fn new(client_id: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            client_id: client_id.into(),
            request_id: None,
            started_at: Instant::now(),
            cancellation,
            reporter: Arc::new(PassthroughReporter),
        }
    }

    /// Sets the JSON-RPC id of the request being processed.
    #[must_use]
    pub fn with_request_id(mut self, id: Option<RequestId>) -> Self {
        self.request_id = id;
        self
    }

    /// Sets the error reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Engine-assigned trace identifier.
    #[must_use]
    pub const fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Client that sent the message.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// JSON-RPC id of the request.
    #[must_use]
    pub const fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// Time spent since dispatch started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns `true` once the caller has cancelled the request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when the caller cancels the request.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// The underlying token, for handlers that spawn their own work.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Passes `error` through the configured reporter.
    #[must_use]
    pub fn report_error(&self, error: JsonRpcErrorData) -> JsonRpcErrorData {
        self.reporter.report(self, error)
    }

    /// Builds an error response for this request, routed through the reporter.
    #[must_use]
    pub fn error_response(&self, code: ErrorCode, message: impl Into<String>) -> JsonRpcResponse {
        let error = self.report_error(JsonRpcErrorData::with_message(code, message));
        JsonRpcResponse::error(self.request_id.clone(), error)
    }

    /// Error response for a request abandoned because of cancellation.
    #[must_use]
    pub fn cancelled_response(&self) -> JsonRpcResponse {
        self.error_response(ErrorCode::InternalError, "Request cancelled")
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("trace_id", &self.trace_id)
            .field("client_id", &self.client_id)
            .field("request_id", &self.request_id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
