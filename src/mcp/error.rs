//! Error types for the protocol engine's lifecycle operations.
//!
//! These never travel on the wire directly. Dispatch and admission failures
//! are expressed as [`JsonRpcErrorData`](crate::mcp::protocol::JsonRpcErrorData)
//! inside a response; the errors here are returned to the embedding code
//! (transport layer, binary) from session, authentication and negotiation
//! calls.

use thiserror::Error;

/// Errors from [`SessionManager`](crate::mcp::session::SessionManager).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A session is already registered for this client.
    #[error("session already exists for client {client_id}")]
    AlreadyExists {
        /// The duplicate client id.
        client_id: String,
    },

    /// No session is registered for this client.
    #[error("session not found for client {client_id}")]
    NotFound {
        /// The unknown client id.
        client_id: String,
    },

    /// Authentication failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Authentication failures.
///
/// Credentials are never included in the message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The method is not in the configured whitelist.
    #[error("unsupported authentication method: {method}")]
    UnsupportedMethod {
        /// The rejected method.
        method: String,
    },

    /// The method is whitelisted but the authenticator has no check for it.
    #[error("authentication method {method} not implemented")]
    NotImplemented {
        /// The method without an implementation.
        method: String,
    },

    /// The method is not configured (e.g. no API keys).
    #[error("{method} authentication not configured")]
    NotConfigured {
        /// The unconfigured method.
        method: String,
    },

    /// The supplied credentials were rejected.
    #[error("{method} authentication failed")]
    InvalidCredentials {
        /// The method that rejected the credentials.
        method: String,
    },
}

/// Capability negotiation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// A capability section has the wrong shape.
    #[error("invalid {section} capability format")]
    InvalidFormat {
        /// The offending section (`protocol`, ...).
        section: &'static str,
    },

    /// None of the client's versions is supported.
    #[error("no compatible protocol version found. Server supports: {server:?}, Client supports: {client:?}")]
    NoCompatibleVersion {
        /// Versions the server supports.
        server: Vec<String>,
        /// Versions the client declared.
        client: Vec<String>,
    },
}

/// Failures of [`ProtocolCore::initialize_client`](crate::mcp::core::ProtocolCore::initialize_client).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InitializeError {
    /// The session could not be created.
    #[error("failed to create client session: {0}")]
    Session(#[from] SessionError),

    /// Capability negotiation failed; the session was rolled back.
    #[error("capability negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
}

/// Failures of [`ProtocolCore::process_message`](crate::mcp::core::ProtocolCore::process_message).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The response could not be encoded.
    #[error("failed to encode response")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_display() {
        let error = SessionError::AlreadyExists {
            client_id: "c1".to_string(),
        };
        assert_eq!(error.to_string(), "session already exists for client c1");
    }

    #[test]
    fn auth_error_never_mentions_credentials() {
        let error = AuthError::InvalidCredentials {
            method: "api_key".to_string(),
        };
        assert_eq!(error.to_string(), "api_key authentication failed");
    }

    #[test]
    fn initialize_error_wraps_negotiation() {
        let error = InitializeError::from(NegotiationError::NoCompatibleVersion {
            server: vec!["2025-01-01".to_string()],
            client: vec!["1.0.0".to_string()],
        });
        let msg = error.to_string();
        assert!(msg.starts_with("capability negotiation failed"));
        assert!(msg.contains("1.0.0"));
    }
}
