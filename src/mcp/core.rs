//! The protocol engine façade.
//!
//! [`ProtocolCore::process_message`] takes raw bytes from one client and
//! returns the encoded response:
//!
//! ```text
//! bytes ─▶ decode ─▶ version ─▶ rate limit ─▶ activity ─▶ auth gate
//!                                                              │
//!   bytes ◀─ encode ◀─ stamp id ◀─ handler / MessageRouter ◀───┘
//! ```
//!
//! Admission and bookkeeping run inline in the caller's task, so requests
//! from one client are rate-checked in call order. An `initialize` request
//! passes the same decode, version and rate checks before
//! [`ProtocolCore::process_initialize`] creates the session it carries. Handler execution runs on
//! its own task, which contains panics; concurrent requests may complete in
//! any order.
//!
//! Each component (sessions, rate limiter, capabilities, router) guards its
//! state with its own lock. The core never holds one while calling another.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SessionConfig};
use crate::mcp::capabilities::{
    CapabilityManager, CapabilityStats, NegotiatedCapabilities, ServerCapabilities,
};
use crate::mcp::context::{ErrorReporter, PassthroughReporter, RequestContext};
use crate::mcp::error::{InitializeError, ProtocolError};
use crate::mcp::handler::MessageHandler;
use crate::mcp::protocol::{
    decode_request, encode_response, ErrorCode, JsonRpcErrorData, JsonRpcRequest, JsonRpcResponse,
};
use crate::mcp::rate_limit::{RateLimitStats, RateLimiter};
use crate::mcp::router::{MessageRouter, RouterStats, ServerInfo, SystemMethod};
use crate::mcp::session::{
    Authenticator, ClientSession, DefaultAuthenticator, SessionManager, SessionStats,
};

/// Aggregated engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolStats {
    /// Session manager statistics.
    pub sessions: SessionStats,
    /// Rate limiter statistics.
    pub rate_limit: RateLimitStats,
    /// Capability manager statistics.
    pub capabilities: CapabilityStats,
    /// Router statistics.
    pub router: RouterStats,
    /// Methods with a directly registered handler.
    pub registered_handlers: usize,
}

/// A processed message, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMessage {
    /// The response.
    pub response: JsonRpcResponse,
    /// `true` if the inbound message was a well-formed notification.
    pub notification: bool,
}

/// Result of [`ProtocolCore::process_initialize`].
#[derive(Debug, Clone, PartialEq)]
pub struct InitializeOutcome {
    /// The processed message.
    pub processed: ProcessedMessage,
    /// `true` if the message created the client's session.
    pub initialized: bool,
}

/// A decoded request that passed the version and rate checks, or the
/// answer to a message that did not.
enum Intake {
    Admitted(JsonRpcRequest),
    Rejected(ProcessedMessage),
}

/// Builds the capability declaration for
/// [`ProtocolCore::initialize_client`] from `initialize` params.
///
/// `capabilities` is taken as-is, `clientInfo` is copied to `client`, and
/// `protocolVersion` becomes `protocol.version` unless the client already
/// declared a `protocol` section.
#[must_use]
pub fn capabilities_from_initialize(params: Option<&Value>) -> Value {
    let mut declared = params
        .and_then(|p| p.get("capabilities"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);

    if let Some(info) = params.and_then(|p| p.get("clientInfo")) {
        declared.insert("client".to_string(), info.clone());
    }

    if let Some(version) = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
    {
        declared
            .entry("protocol")
            .or_insert_with(|| json!({ "version": version }));
    }

    Value::Object(declared)
}

/// Entry point of the protocol engine.
pub struct ProtocolCore {
    sessions: SessionManager,
    rate_limiter: RateLimiter,
    capabilities: Arc<CapabilityManager>,
    router: Arc<MessageRouter>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    reporter: Arc<dyn ErrorReporter>,
    session_config: SessionConfig,
    expose_internal_errors: bool,
}

impl ProtocolCore {
    /// Creates an engine from configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_authenticator(config, Arc::new(DefaultAuthenticator))
    }

    /// Creates an engine that checks credentials with `authenticator`.
    #[must_use]
    pub fn with_authenticator(config: &Config, authenticator: Arc<dyn Authenticator>) -> Self {
        let capabilities = Arc::new(CapabilityManager::new(ServerCapabilities::new(
            config.protocol.supported_versions.clone(),
        )));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&capabilities),
            ServerInfo::default(),
        ));

        Self {
            sessions: SessionManager::with_authenticator(config.auth.clone(), authenticator),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            capabilities,
            router,
            handlers: RwLock::new(HashMap::new()),
            reporter: Arc::new(PassthroughReporter),
            session_config: config.session.clone(),
            expose_internal_errors: config.protocol.expose_internal_errors,
        }
    }

    /// Sets the error reporter handed to every handler.
    #[must_use]
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Registers a handler for one method. It takes precedence over the
    /// router's system methods.
    pub fn register_handler(&self, method: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let method = method.into();
        tracing::debug!(method = %method, "Registered message handler");
        self.handlers.write().insert(method, handler);
    }

    /// Registers a handler for every method it reports as supported.
    pub fn register_message_handler(&self, handler: &Arc<dyn MessageHandler>) {
        for method in handler.supported_methods() {
            self.register_handler(method, Arc::clone(handler));
        }
    }

    /// The router holding tool, resource and prompt registries.
    #[must_use]
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// The session manager.
    #[must_use]
    pub const fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The rate limiter.
    #[must_use]
    pub const fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// The capability manager.
    #[must_use]
    pub fn capabilities(&self) -> &CapabilityManager {
        &self.capabilities
    }

    /// Returns a copy of a client's session.
    #[must_use]
    pub fn get_session(&self, client_id: &str) -> Option<ClientSession> {
        self.sessions.get_session(client_id)
    }

    /// Returns the capabilities a client declared.
    #[must_use]
    pub fn get_client_capabilities(&self, client_id: &str) -> Option<Value> {
        self.capabilities.get_client_capabilities(client_id)
    }

    /// Creates a session, starts rate limiting and negotiates capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`InitializeError::Session`] if the client already has a
    /// session, and [`InitializeError::Negotiation`] if negotiation fails.
    /// In the latter case the session is removed before returning, along
    /// with rate-limit state only if this call created it.
    pub fn initialize_client(
        &self,
        client_id: &str,
        capabilities: &Value,
    ) -> Result<NegotiatedCapabilities, InitializeError> {
        self.sessions.create_session(client_id, capabilities)?;
        let newly_tracked = self.rate_limiter.initialize_client(client_id);

        match self.capabilities.negotiate_capabilities(client_id, capabilities) {
            Ok(negotiated) => {
                tracing::info!(
                    client_id,
                    protocol_version = %negotiated.protocol_version,
                    "Client initialized"
                );
                Ok(negotiated)
            }
            Err(e) => {
                self.sessions.remove_session(client_id);
                if newly_tracked {
                    self.rate_limiter.remove_client(client_id);
                }
                tracing::warn!(
                    client_id,
                    error = %e,
                    "Capability negotiation failed, session rolled back"
                );
                Err(e.into())
            }
        }
    }

    /// Removes all state for a client. Unknown clients are ignored.
    pub fn cleanup_client(&self, client_id: &str) {
        let had_session = self.sessions.remove_session(client_id);
        self.rate_limiter.remove_client(client_id);
        self.capabilities.remove_client(client_id);
        if had_session {
            tracing::info!(client_id, "Cleaned up client");
        }
    }

    /// Processes one raw message and returns the encoded response.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if the response cannot be encoded.
    pub async fn process_message(
        &self,
        client_id: &str,
        raw: &[u8],
        cancellation: CancellationToken,
    ) -> Result<Vec<u8>, ProtocolError> {
        let processed = self.process(client_id, raw, cancellation).await;
        encode_response(&processed.response).map_err(ProtocolError::Encode)
    }

    /// Processes one raw message and returns the response unencoded.
    pub async fn process(
        &self,
        client_id: &str,
        raw: &[u8],
        cancellation: CancellationToken,
    ) -> ProcessedMessage {
        match self.admit(client_id, raw) {
            Intake::Admitted(request) => self.respond(client_id, request, cancellation).await,
            Intake::Rejected(processed) => processed,
        }
    }

    /// Processes one raw message from a client that has no session yet.
    ///
    /// The message is admitted exactly as by [`ProtocolCore::process`]. An
    /// admitted `initialize` request then creates the session from its
    /// params (see [`capabilities_from_initialize`]) before it is answered;
    /// if that fails the answer is `InvalidParams` with the reason as data.
    /// Any other method is processed normally.
    pub async fn process_initialize(
        &self,
        client_id: &str,
        raw: &[u8],
        cancellation: CancellationToken,
    ) -> InitializeOutcome {
        let request = match self.admit(client_id, raw) {
            Intake::Admitted(request) => request,
            Intake::Rejected(processed) => {
                return InitializeOutcome {
                    processed,
                    initialized: false,
                };
            }
        };

        if request.method != SystemMethod::Initialize.as_str() {
            return InitializeOutcome {
                processed: self.respond(client_id, request, cancellation).await,
                initialized: false,
            };
        }

        let declared = capabilities_from_initialize(request.params.as_ref());
        if let Err(e) = self.initialize_client(client_id, &declared) {
            tracing::warn!(client_id, error = %e, "Client initialisation failed");
            let error = JsonRpcErrorData::with_message(
                ErrorCode::InvalidParams,
                "Initialization failed",
            )
            .with_data(e.to_string());
            let notification = request.is_notification();
            return InitializeOutcome {
                processed: ProcessedMessage {
                    response: JsonRpcResponse::error(request.id, error),
                    notification,
                },
                initialized: false,
            };
        }

        InitializeOutcome {
            processed: self.respond(client_id, request, cancellation).await,
            initialized: true,
        }
    }

    /// Decodes, version-checks and rate-checks one message.
    fn admit(&self, client_id: &str, raw: &[u8]) -> Intake {
        let request = match decode_request(raw) {
            Ok(request) => request,
            Err(failure) => {
                tracing::debug!(client_id, failure = ?failure, "Rejected malformed message");
                return Intake::Rejected(ProcessedMessage {
                    response: failure.into_response(),
                    notification: false,
                });
            }
        };

        let admission = self.rate_limiter.allow_request(client_id);
        if !admission.is_allowed() {
            tracing::warn!(
                client_id,
                method = %request.method,
                reason = %admission,
                "Request rate limited"
            );
            let error =
                JsonRpcErrorData::from_code(ErrorCode::RateLimited).with_data(admission.as_str());
            let notification = request.is_notification();
            return Intake::Rejected(ProcessedMessage {
                response: JsonRpcResponse::error(request.id, error),
                notification,
            });
        }

        self.sessions.update_client_activity(client_id);
        Intake::Admitted(request)
    }

    /// Runs the auth gate and the handler for an admitted request.
    async fn respond(
        &self,
        client_id: &str,
        request: JsonRpcRequest,
        cancellation: CancellationToken,
    ) -> ProcessedMessage {
        let id = request.id.clone();
        let notification = request.is_notification();

        let response = if self.requires_authentication(client_id, &request.method) {
            tracing::warn!(
                client_id,
                method = %request.method,
                "Rejected unauthenticated request"
            );
            JsonRpcResponse::error(
                id.clone(),
                JsonRpcErrorData::with_message(ErrorCode::Unauthorized, "Authentication required"),
            )
        } else {
            let ctx = RequestContext::new(client_id, cancellation)
                .with_request_id(id.clone())
                .with_reporter(Arc::clone(&self.reporter));
            self.dispatch(ctx, request).await
        };

        let response = response.stamped(id);
        if response.is_error() {
            self.sessions.record_error(client_id);
        }

        ProcessedMessage {
            response,
            notification,
        }
    }

    fn requires_authentication(&self, client_id: &str, method: &str) -> bool {
        method != SystemMethod::Initialize.as_str()
            && self.sessions.auth_required()
            && !self.sessions.is_authenticated(client_id)
    }

    /// Runs the handler on its own task and sanitises the outcome.
    async fn dispatch(&self, ctx: RequestContext, request: JsonRpcRequest) -> JsonRpcResponse {
        let handler = self.handlers.read().get(&request.method).cloned();
        let router = Arc::clone(&self.router);
        let id = request.id.clone();
        let method = request.method.clone();
        let client_id = ctx.client_id().to_string();

        let task = tokio::spawn(async move {
            match handler {
                Some(handler) => handler.handle_request(&ctx, request).await,
                None => router.route(&ctx, request).await,
            }
        });

        match task.await {
            Ok(response) if response.is_well_formed() => response,
            Ok(_) => {
                tracing::error!(
                    client_id = %client_id,
                    method = %method,
                    "Handler returned a malformed response"
                );
                JsonRpcResponse::internal_error(id, ErrorCode::InternalError.default_message())
            }
            Err(e) if e.is_panic() => {
                let detail = panic_message(&*e.into_panic());
                tracing::error!(
                    client_id = %client_id,
                    method = %method,
                    panic = %detail,
                    "Handler panicked"
                );
                let message = if self.expose_internal_errors {
                    format!("Handler panicked: {detail}")
                } else {
                    ErrorCode::InternalError.default_message().to_string()
                };
                JsonRpcResponse::internal_error(id, message)
            }
            Err(_) => {
                tracing::warn!(client_id = %client_id, method = %method, "Handler task cancelled");
                JsonRpcResponse::internal_error(id, "Request cancelled")
            }
        }
    }

    /// Evicts idle sessions and forgets their negotiated capabilities.
    /// Returns the evicted client ids.
    pub fn sweep_idle_sessions(&self) -> Vec<String> {
        let expired = self
            .sessions
            .cleanup_expired_sessions(self.session_config.idle_timeout());
        for client_id in &expired {
            self.capabilities.remove_client(client_id);
        }
        expired
    }

    /// Spawns the periodic idle-session and inactive-client sweeps. The task
    /// ends when `shutdown` is cancelled.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let core = Arc::clone(self);
        let session_period = self.session_config.cleanup_interval();
        let rate_period = self.rate_limiter.config().cleanup_interval();

        tokio::spawn(async move {
            let start = Instant::now();
            let mut session_tick = interval_at(start + session_period, session_period);
            let mut rate_tick = interval_at(start + rate_period, rate_period);
            session_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            rate_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!(
                session_interval_secs = session_period.as_secs(),
                rate_interval_secs = rate_period.as_secs(),
                "Maintenance task started"
            );

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = session_tick.tick() => {
                        core.sweep_idle_sessions();
                    }
                    _ = rate_tick.tick() => {
                        core.rate_limiter.cleanup_inactive_clients();
                    }
                }
            }

            tracing::debug!("Maintenance task stopped");
        })
    }

    /// Returns aggregated statistics.
    #[must_use]
    pub fn stats(&self) -> ProtocolStats {
        ProtocolStats {
            sessions: self.sessions.stats(),
            rate_limit: self.rate_limiter.stats(),
            capabilities: self.capabilities.stats(),
            router: self.router.stats(),
            registered_handlers: self.handlers.read().len(),
        }
    }
}

impl fmt::Debug for ProtocolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolCore")
            .field("sessions", &self.sessions)
            .field("rate_limiter", &self.rate_limiter)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, RateLimitConfig};
    use crate::mcp::protocol::RequestId;
    use async_trait::async_trait;
    use std::time::Duration;

    struct PanickingHandler;

    #[async_trait]
    impl MessageHandler for PanickingHandler {
        async fn handle_request(
            &self,
            _ctx: &RequestContext,
            _request: JsonRpcRequest,
        ) -> JsonRpcResponse {
            panic!("secret path /var/lib/db");
        }

        fn supported_methods(&self) -> Vec<String> {
            vec!["explode".to_string()]
        }
    }

    struct MalformedHandler;

    #[async_trait]
    impl MessageHandler for MalformedHandler {
        async fn handle_request(
            &self,
            _ctx: &RequestContext,
            request: JsonRpcRequest,
        ) -> JsonRpcResponse {
            let mut response = JsonRpcResponse::success(request.id, json!(1));
            response.error = Some(JsonRpcErrorData::from_code(ErrorCode::ToolError));
            response
        }

        fn supported_methods(&self) -> Vec<String> {
            vec!["broken".to_string()]
        }
    }

    struct BusinessErrorHandler;

    #[async_trait]
    impl MessageHandler for BusinessErrorHandler {
        async fn handle_request(
            &self,
            ctx: &RequestContext,
            _request: JsonRpcRequest,
        ) -> JsonRpcResponse {
            let error = JsonRpcErrorData::with_message(ErrorCode::ToolError, "classifier offline")
                .with_data(json!({"retry": true}));
            // Wrong id on purpose: the engine stamps the request's.
            JsonRpcResponse::error(Some(RequestId::from(999)), ctx.report_error(error))
        }

        fn supported_methods(&self) -> Vec<String> {
            vec!["business".to_string()]
        }
    }

    async fn send(core: &ProtocolCore, client_id: &str, raw: &str) -> JsonRpcResponse {
        core.process(client_id, raw.as_bytes(), CancellationToken::new())
            .await
            .response
    }

    fn code(response: &JsonRpcResponse) -> i32 {
        response.error.as_ref().unwrap().code
    }

    #[tokio::test]
    async fn panics_become_opaque_internal_errors() {
        let core = ProtocolCore::new(&Config::default());
        core.register_message_handler(&(Arc::new(PanickingHandler) as Arc<dyn MessageHandler>));

        let response = send(&core, "c1", r#"{"jsonrpc":"2.0","method":"explode","id":3}"#).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, -32603);
        assert_eq!(error.message, "Internal error");
        assert_eq!(response.id, Some(RequestId::from(3)));
    }

    #[tokio::test]
    async fn panic_detail_exposed_when_enabled() {
        let mut config = Config::default();
        config.protocol.expose_internal_errors = true;
        let core = ProtocolCore::new(&config);
        core.register_handler("explode", Arc::new(PanickingHandler));

        let response = send(&core, "c1", r#"{"jsonrpc":"2.0","method":"explode","id":3}"#).await;
        assert!(response.error.unwrap().message.contains("/var/lib/db"));
    }

    #[tokio::test]
    async fn malformed_handler_output_is_replaced() {
        let core = ProtocolCore::new(&Config::default());
        core.register_handler("broken", Arc::new(MalformedHandler));

        let response = send(&core, "c1", r#"{"jsonrpc":"2.0","method":"broken","id":"b"}"#).await;
        assert!(response.is_well_formed());
        assert_eq!(code(&response), -32603);
    }

    #[tokio::test]
    async fn business_errors_pass_through_with_stamped_id() {
        let core = ProtocolCore::new(&Config::default());
        core.initialize_client("c1", &json!({})).unwrap();
        core.register_handler("business", Arc::new(BusinessErrorHandler));

        let response = send(&core, "c1", r#"{"jsonrpc":"2.0","method":"business","id":4}"#).await;
        assert_eq!(response.id, Some(RequestId::from(4)));
        let error = response.error.unwrap();
        assert_eq!(error.code, -32003);
        assert_eq!(error.message, "classifier offline");
        assert_eq!(error.data, Some(json!({"retry": true})));
        assert_eq!(core.get_session("c1").unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn registered_handler_shadows_router() {
        let core = ProtocolCore::new(&Config::default());
        core.register_handler("tools/list", Arc::new(BusinessErrorHandler));
        let response = send(&core, "c1", r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#).await;
        assert_eq!(code(&response), -32003);
        assert_eq!(core.stats().registered_handlers, 1);
    }

    #[tokio::test]
    async fn notification_is_flagged() {
        let core = ProtocolCore::new(&Config::default());
        let processed = core
            .process("c1", br#"{"jsonrpc":"2.0","method":"tools/list"}"#, CancellationToken::new())
            .await;
        assert!(processed.notification);
        assert_eq!(processed.response.id, None);

        let processed = core.process("c1", b"{", CancellationToken::new()).await;
        assert!(!processed.notification);
    }

    #[tokio::test]
    async fn required_auth_gates_requests() {
        let mut config = Config::default();
        config.auth = AuthConfig {
            enabled: true,
            required: true,
            methods: vec!["api_key".to_string()],
            api_keys: vec!["k".to_string()],
        };
        let core = ProtocolCore::new(&config);
        core.initialize_client("c1", &json!({})).unwrap();

        let response = send(&core, "c1", r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#).await;
        assert_eq!(code(&response), -32000);

        let response = send(&core, "c1", r#"{"jsonrpc":"2.0","method":"initialize","id":2}"#).await;
        assert!(response.result.is_some());

        core.sessions().authenticate_client("c1", "api_key", "k").unwrap();
        let response = send(&core, "c1", r#"{"jsonrpc":"2.0","method":"tools/list","id":3}"#).await;
        assert!(response.result.is_some());
    }

    #[tokio::test]
    async fn failed_initialize_rolls_back_rate_state() {
        let core = ProtocolCore::new(&Config::default());
        let caps = json!({"protocol": {"supportedVersions": ["0.1"]}});
        assert!(matches!(
            core.initialize_client("c1", &caps),
            Err(InitializeError::Negotiation(_))
        ));
        assert!(core.rate_limiter().client_stats("c1").is_none());
        assert_eq!(core.stats().capabilities.negotiated_clients, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initialize_keeps_existing_block() {
        let mut config = Config::default();
        config.rate_limit = RateLimitConfig {
            burst_limit: 1,
            max_violations: 1,
            block_secs: 3600,
            ..RateLimitConfig::default()
        };
        let core = ProtocolCore::new(&config);
        assert!(core.rate_limiter().allow_request("c1").is_allowed());
        assert!(!core.rate_limiter().allow_request("c1").is_allowed());

        let caps = json!({"protocol": {"supportedVersions": ["0.1"]}});
        assert!(core.initialize_client("c1", &caps).is_err());

        let snapshot = core.rate_limiter().client_stats("c1").unwrap();
        assert!(snapshot.blocked);
        assert_eq!(snapshot.violation_count, 1);
    }

    fn tight_limits() -> Config {
        let mut config = Config::default();
        config.rate_limit = RateLimitConfig {
            requests_per_window: 1,
            burst_limit: 1,
            max_violations: 10,
            ..RateLimitConfig::default()
        };
        config
    }

    #[tokio::test]
    async fn process_initialize_creates_session() {
        let core = ProtocolCore::new(&Config::default());
        let raw = br#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","clientInfo":{"name":"t"}}}"#;

        let outcome = core
            .process_initialize("c1", raw, CancellationToken::new())
            .await;
        assert!(outcome.initialized);
        assert_eq!(
            outcome.processed.response.result.unwrap()["protocolVersion"],
            json!("2024-11-05")
        );
        assert_eq!(core.get_client_capabilities("c1").unwrap()["client"]["name"], json!("t"));
        assert_eq!(core.rate_limiter().client_stats("c1").unwrap().window_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn process_initialize_is_rate_limited() {
        let core = ProtocolCore::new(&tight_limits());
        let raw = br#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"1999"}}"#;

        let first = core
            .process_initialize("c1", raw, CancellationToken::new())
            .await;
        assert!(!first.initialized);
        assert_eq!(code(&first.processed.response), -32602);

        for _ in 0..4 {
            let next = core
                .process_initialize("c1", raw, CancellationToken::new())
                .await;
            assert!(!next.initialized);
            assert_eq!(code(&next.processed.response), -32001);
            assert_eq!(next.processed.response.id, Some(RequestId::from(1)));
        }
        assert_eq!(core.rate_limiter().client_stats("c1").unwrap().violation_count, 4);
    }

    #[tokio::test]
    async fn process_initialize_checks_version_first() {
        let core = ProtocolCore::new(&Config::default());
        let raw = br#"{"jsonrpc":"1.0","id":7,"method":"initialize","params":{}}"#;

        let outcome = core
            .process_initialize("c1", raw, CancellationToken::new())
            .await;
        assert!(!outcome.initialized);
        assert_eq!(code(&outcome.processed.response), -32600);
        assert_eq!(outcome.processed.response.id, Some(RequestId::from(7)));
        assert!(core.get_session("c1").is_none());
    }

    #[tokio::test]
    async fn process_initialize_passes_other_methods_through() {
        let core = ProtocolCore::new(&Config::default());
        let raw = br#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#;

        let outcome = core
            .process_initialize("c1", raw, CancellationToken::new())
            .await;
        assert!(!outcome.initialized);
        assert!(outcome.processed.response.result.is_some());
        assert!(core.get_session("c1").is_none());
    }

    #[test]
    fn builds_capabilities_from_initialize_params() {
        let params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": true}},
            "clientInfo": {"name": "curator", "version": "1.0"}
        });
        let declared = capabilities_from_initialize(Some(&params));
        assert_eq!(declared["protocol"], json!({"version": "2024-11-05"}));
        assert_eq!(declared["client"]["name"], json!("curator"));
        assert_eq!(declared["tools"]["listChanged"], json!(true));

        assert_eq!(capabilities_from_initialize(None), json!({}));
    }

    #[test]
    fn explicit_protocol_section_wins() {
        let params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"protocol": {"supportedVersions": ["2025-01-01"]}}
        });
        let declared = capabilities_from_initialize(Some(&params));
        assert_eq!(declared["protocol"]["supportedVersions"], json!(["2025-01-01"]));
    }

    #[tokio::test]
    async fn duplicate_initialize_is_rejected() {
        let core = ProtocolCore::new(&Config::default());
        core.initialize_client("c1", &json!({})).unwrap();
        assert!(matches!(
            core.initialize_client("c1", &json!({})),
            Err(InitializeError::Session(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_evicts_idle_sessions() {
        let mut config = Config::default();
        config.session.idle_timeout_secs = 60;
        config.session.cleanup_interval_secs = 30;
        config.rate_limit = RateLimitConfig {
            cleanup_interval_secs: 30,
            inactive_client_secs: 60,
            ..RateLimitConfig::default()
        };
        let core = Arc::new(ProtocolCore::new(&config));
        core.initialize_client("c1", &json!({})).unwrap();

        let shutdown = CancellationToken::new();
        let task = core.spawn_maintenance(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(core.get_session("c1").is_none());
        assert!(core.get_client_capabilities("c1").is_none());
        assert!(core.rate_limiter().client_stats("c1").is_none());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[test]
    fn panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
