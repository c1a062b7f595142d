//! Model Context Protocol (MCP) engine.
//!
//! This module implements a JSON-RPC 2.0 protocol engine that routes client
//! calls to pluggable tool, resource and prompt handlers. Clients negotiate
//! capabilities, are admitted by a per-client rate limiter and are tracked in
//! sessions until they disconnect or go idle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ProtocolCore                         │
//! │                                                              │
//! │   bytes ──▶ decode ──▶ RateLimiter ──▶ SessionManager        │
//! │                                             │                │
//! │                                             ▼                │
//! │            registered handlers ◀── or ──▶ MessageRouter      │
//! │                                             │                │
//! │                  ┌──────────────┬───────────┴──┐             │
//! │                  ▼              ▼              ▼             │
//! │                Tools        Resources       Prompts          │
//! │                                                              │
//! │   CapabilityManager: negotiated once per client              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each manager owns one map behind one lock. No lock is held while another
//! component is called or while a handler runs.

pub mod capabilities;
pub mod context;
pub mod core;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

pub use capabilities::{CapabilityManager, NegotiatedCapabilities, ServerCapabilities};
pub use context::{ErrorReporter, RequestContext};
pub use self::core::{InitializeOutcome, ProcessedMessage, ProtocolCore, ProtocolStats};
pub use error::{AuthError, InitializeError, NegotiationError, ProtocolError, SessionError};
pub use handler::{MessageHandler, PromptHandler, ResourceHandler, ToolHandler, UriMatcher};
pub use protocol::{ErrorCode, JsonRpcErrorData, JsonRpcRequest, JsonRpcResponse, RequestId};
pub use rate_limit::{Admission, ClientState, RateLimiter};
pub use router::MessageRouter;
pub use server::StdioServer;
pub use session::{Authenticator, ClientSession, SessionManager};
pub use transport::{LineReader, LineWriter};
