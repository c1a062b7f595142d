//! Client session management and authentication.
//!
//! The [`SessionManager`] is the only owner of [`ClientSession`] records.
//! Other components refer to sessions by client id and receive copies.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::AuthConfig;
use crate::mcp::error::{AuthError, SessionError};

/// Placeholder for a client that did not identify itself.
const UNKNOWN_CLIENT: &str = "unknown";

/// Authentication method that accepts any client.
pub const AUTH_METHOD_NONE: &str = "none";

/// Authentication method checked against the configured API keys.
pub const AUTH_METHOD_API_KEY: &str = "api_key";

/// A live client session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSession {
    /// Client id, unique per connection.
    pub id: String,
    /// Declared client name.
    pub client_name: String,
    /// Declared client version.
    pub client_version: String,
    /// Capabilities supplied at initialisation.
    pub capabilities: Value,
    /// Whether the client is authenticated.
    pub authenticated: bool,
    /// Method used to authenticate, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    /// Wall-clock creation time.
    pub connected_at: DateTime<Utc>,
    /// Monotonic time of the last admitted message.
    #[serde(skip)]
    pub last_activity: Instant,
    /// Admitted messages.
    pub request_count: u64,
    /// Admitted messages answered with an error.
    pub error_count: u64,
}

impl ClientSession {
    /// Time since the last admitted message.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Pluggable credential check for one authentication method.
pub trait Authenticator: Send + Sync {
    /// Checks `credentials` for a whitelisted `method`.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] describing the failure. Implementations
    /// must not echo the credentials.
    fn authenticate(
        &self,
        method: &str,
        credentials: &str,
        config: &AuthConfig,
    ) -> Result<(), AuthError>;
}

/// Handles `none` and `api_key`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAuthenticator;

impl Authenticator for DefaultAuthenticator {
    fn authenticate(
        &self,
        method: &str,
        credentials: &str,
        config: &AuthConfig,
    ) -> Result<(), AuthError> {
        match method {
            AUTH_METHOD_NONE => Ok(()),
            AUTH_METHOD_API_KEY => {
                if config.api_keys.is_empty() {
                    return Err(AuthError::NotConfigured {
                        method: method.to_string(),
                    });
                }
                if credentials.is_empty() || !config.api_keys.iter().any(|k| k == credentials) {
                    return Err(AuthError::InvalidCredentials {
                        method: method.to_string(),
                    });
                }
                Ok(())
            }
            other => Err(AuthError::NotImplemented {
                method: other.to_string(),
            }),
        }
    }
}

/// Session manager statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Live sessions.
    pub active_sessions: usize,
    /// Live authenticated sessions.
    pub authenticated_sessions: usize,
    /// Admitted messages across live sessions.
    pub total_requests: u64,
    /// Error responses across live sessions.
    pub total_errors: u64,
    /// Whether authentication is enabled.
    pub auth_enabled: bool,
    /// Whether authentication is required.
    pub auth_required: bool,
}

struct SessionState {
    sessions: HashMap<String, ClientSession>,
    auth: AuthConfig,
}

/// Owns all client sessions.
pub struct SessionManager {
    state: RwLock<SessionState>,
    authenticator: Arc<dyn Authenticator>,
}

impl SessionManager {
    /// Creates a manager with the default authenticator.
    #[must_use]
    pub fn new(auth: AuthConfig) -> Self {
        Self::with_authenticator(auth, Arc::new(DefaultAuthenticator))
    }

    /// Creates a manager with a custom authenticator.
    #[must_use]
    pub fn with_authenticator(auth: AuthConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            state: RwLock::new(SessionState {
                sessions: HashMap::new(),
                auth,
            }),
            authenticator,
        }
    }

    /// Creates a session for `client_id`.
    ///
    /// Name and version are read from `capabilities.client` (or
    /// `capabilities.clientInfo`). With authentication disabled, or enabled
    /// but not required, the session starts authenticated with method `none`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyExists`] if the id is taken.
    pub fn create_session(
        &self,
        client_id: &str,
        capabilities: &Value,
    ) -> Result<(), SessionError> {
        let info = capabilities
            .get("client")
            .or_else(|| capabilities.get("clientInfo"));
        let field = |key: &str| {
            info.and_then(|i| i.get(key))
                .and_then(Value::as_str)
                .unwrap_or(UNKNOWN_CLIENT)
                .to_string()
        };
        let client_name = field("name");
        let client_version = field("version");

        let mut state = self.state.write();
        if state.sessions.contains_key(client_id) {
            return Err(SessionError::AlreadyExists {
                client_id: client_id.to_string(),
            });
        }

        let authenticated = !(state.auth.enabled && state.auth.required);
        let session = ClientSession {
            id: client_id.to_string(),
            client_name,
            client_version,
            capabilities: capabilities.clone(),
            authenticated,
            auth_method: authenticated.then(|| AUTH_METHOD_NONE.to_string()),
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            request_count: 0,
            error_count: 0,
        };

        tracing::info!(
            client_id,
            client_name = %session.client_name,
            client_version = %session.client_version,
            authenticated,
            "Created client session"
        );
        state.sessions.insert(client_id.to_string(), session);
        Ok(())
    }

    /// Returns a copy of a session.
    #[must_use]
    pub fn get_session(&self, client_id: &str) -> Option<ClientSession> {
        self.state.read().sessions.get(client_id).cloned()
    }

    /// Bumps the activity timestamp and request counter. Unknown ids are ignored.
    pub fn update_client_activity(&self, client_id: &str) {
        if let Some(session) = self.state.write().sessions.get_mut(client_id) {
            session.last_activity = Instant::now();
            session.request_count += 1;
        }
    }

    /// Increments the error counter. Unknown ids are ignored.
    pub fn record_error(&self, client_id: &str) {
        if let Some(session) = self.state.write().sessions.get_mut(client_id) {
            session.error_count += 1;
        }
    }

    /// Returns whether the client's session is authenticated.
    #[must_use]
    pub fn is_authenticated(&self, client_id: &str) -> bool {
        self.state
            .read()
            .sessions
            .get(client_id)
            .is_some_and(|s| s.authenticated)
    }

    /// Returns whether unauthenticated sessions must be refused.
    #[must_use]
    pub fn auth_required(&self) -> bool {
        let state = self.state.read();
        state.auth.enabled && state.auth.required
    }

    /// Authenticates a client.
    ///
    /// With authentication disabled the client is marked authenticated with
    /// method `none` whatever it sent.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] for an unknown client, and
    /// [`SessionError::Auth`] if the method is not whitelisted or the
    /// authenticator rejects the credentials.
    pub fn authenticate_client(
        &self,
        client_id: &str,
        method: &str,
        credentials: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.state.write();
        let SessionState { sessions, auth } = &mut *state;

        let session = sessions
            .get_mut(client_id)
            .ok_or_else(|| SessionError::NotFound {
                client_id: client_id.to_string(),
            })?;

        if !auth.enabled {
            session.authenticated = true;
            session.auth_method = Some(AUTH_METHOD_NONE.to_string());
            tracing::debug!(client_id, "Authentication disabled, marking client as authenticated");
            return Ok(());
        }

        if !auth.methods.iter().any(|m| m == method) {
            return Err(AuthError::UnsupportedMethod {
                method: method.to_string(),
            }
            .into());
        }

        if let Err(e) = self.authenticator.authenticate(method, credentials, auth) {
            tracing::warn!(client_id, auth_method = method, error = %e, "Authentication failed");
            return Err(e.into());
        }

        session.authenticated = true;
        session.auth_method = Some(method.to_string());
        tracing::info!(client_id, auth_method = method, "Client authenticated");
        Ok(())
    }

    /// Removes a session. Returns `true` if one existed.
    pub fn remove_session(&self, client_id: &str) -> bool {
        let Some(session) = self.state.write().sessions.remove(client_id) else {
            return false;
        };

        tracing::info!(
            client_id,
            duration_secs = (Utc::now() - session.connected_at).num_seconds(),
            request_count = session.request_count,
            error_count = session.error_count,
            "Removed client session"
        );
        true
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.read().sessions.len()
    }

    /// Copies of all live sessions.
    #[must_use]
    pub fn all_sessions(&self) -> Vec<ClientSession> {
        self.state.read().sessions.values().cloned().collect()
    }

    /// Evicts sessions idle for longer than `max_idle` and returns their ids.
    pub fn cleanup_expired_sessions(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.state.write();

        let expired: Vec<String> = state
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity) > max_idle)
            .map(|s| s.id.clone())
            .collect();

        for client_id in &expired {
            state.sessions.remove(client_id);
        }
        drop(state);

        for client_id in &expired {
            tracing::info!(client_id = %client_id, "Removed expired client session");
        }
        if !expired.is_empty() {
            tracing::info!(expired_count = expired.len(), "Cleaned up expired sessions");
        }
        expired
    }

    /// Replaces the authentication configuration. Existing sessions keep
    /// their state.
    pub fn update_auth_config(&self, auth: AuthConfig) {
        tracing::info!(
            auth_enabled = auth.enabled,
            auth_required = auth.required,
            auth_methods = ?auth.methods,
            "Updated authentication configuration"
        );
        self.state.write().auth = auth;
    }

    /// Returns session statistics.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let state = self.state.read();
        SessionStats {
            active_sessions: state.sessions.len(),
            authenticated_sessions: state.sessions.values().filter(|s| s.authenticated).count(),
            total_requests: state.sessions.values().map(|s| s.request_count).sum(),
            total_errors: state.sessions.values().map(|s| s.error_count).sum(),
            auth_enabled: state.auth.enabled,
            auth_required: state.auth.required,
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(AuthConfig::default())
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api_key_auth(required: bool) -> AuthConfig {
        AuthConfig {
            enabled: true,
            required,
            methods: vec!["api_key".to_string()],
            api_keys: vec!["k-1".to_string()],
        }
    }

    #[test]
    fn create_extracts_client_info() {
        let m = SessionManager::default();
        m.create_session("c1", &json!({"client": {"name": "curator", "version": "2.1"}}))
            .unwrap();

        let s = m.get_session("c1").unwrap();
        assert_eq!(s.client_name, "curator");
        assert_eq!(s.client_version, "2.1");
        assert!(s.authenticated);
        assert_eq!(s.auth_method.as_deref(), Some("none"));
    }

    #[test]
    fn create_defaults_unknown_client() {
        let m = SessionManager::default();
        m.create_session("c1", &json!(null)).unwrap();
        let s = m.get_session("c1").unwrap();
        assert_eq!(s.client_name, "unknown");
        assert_eq!(s.client_version, "unknown");
    }

    #[test]
    fn duplicate_session_is_rejected() {
        let m = SessionManager::default();
        m.create_session("c1", &json!({})).unwrap();
        assert_eq!(
            m.create_session("c1", &json!({})),
            Err(SessionError::AlreadyExists {
                client_id: "c1".to_string()
            })
        );
        assert_eq!(m.session_count(), 1);
    }

    #[test]
    fn activity_and_errors_are_counted() {
        let m = SessionManager::default();
        m.create_session("c1", &json!({})).unwrap();
        m.update_client_activity("c1");
        m.update_client_activity("c1");
        m.record_error("c1");
        m.update_client_activity("ghost");

        let stats = m.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_errors, 1);
    }

    #[test]
    fn returned_sessions_are_copies() {
        let m = SessionManager::default();
        m.create_session("c1", &json!({})).unwrap();
        let mut copy = m.get_session("c1").unwrap();
        copy.request_count = 99;
        assert_eq!(m.get_session("c1").unwrap().request_count, 0);
    }

    #[test]
    fn required_auth_starts_unauthenticated() {
        let m = SessionManager::new(api_key_auth(true));
        m.create_session("c1", &json!({})).unwrap();
        assert!(!m.is_authenticated("c1"));
        assert!(m.auth_required());
        assert_eq!(m.get_session("c1").unwrap().auth_method, None);
    }

    #[test]
    fn api_key_authentication() {
        let m = SessionManager::new(api_key_auth(true));
        m.create_session("c1", &json!({})).unwrap();

        let err = m.authenticate_client("c1", "api_key", "wrong").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Auth(AuthError::InvalidCredentials { .. })
        ));
        assert!(!m.is_authenticated("c1"));

        m.authenticate_client("c1", "api_key", "k-1").unwrap();
        let s = m.get_session("c1").unwrap();
        assert!(s.authenticated);
        assert_eq!(s.auth_method.as_deref(), Some("api_key"));
    }

    #[test]
    fn method_must_be_whitelisted() {
        let m = SessionManager::new(api_key_auth(false));
        m.create_session("c1", &json!({})).unwrap();
        let err = m.authenticate_client("c1", "oauth", "t").unwrap_err();
        assert!(matches!(
            err,
            SessionError::Auth(AuthError::UnsupportedMethod { .. })
        ));
    }

    #[test]
    fn disabled_auth_accepts_anything() {
        let m = SessionManager::default();
        m.create_session("c1", &json!({})).unwrap();
        m.authenticate_client("c1", "oauth", "").unwrap();
        assert_eq!(
            m.get_session("c1").unwrap().auth_method.as_deref(),
            Some("none")
        );
    }

    #[test]
    fn authenticate_unknown_client() {
        let m = SessionManager::default();
        assert!(matches!(
            m.authenticate_client("ghost", "none", ""),
            Err(SessionError::NotFound { .. })
        ));
    }

    #[test]
    fn update_auth_config_changes_policy() {
        let m = SessionManager::default();
        assert!(!m.stats().auth_enabled);
        m.update_auth_config(api_key_auth(true));
        let stats = m.stats();
        assert!(stats.auth_enabled);
        assert!(stats.auth_required);
    }

    #[test]
    fn remove_is_idempotent() {
        let m = SessionManager::default();
        m.create_session("c1", &json!({})).unwrap();
        assert!(m.remove_session("c1"));
        assert!(!m.remove_session("c1"));
        assert_eq!(m.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_evicted() {
        let m = SessionManager::default();
        m.create_session("idle", &json!({})).unwrap();
        m.create_session("busy", &json!({})).unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        m.update_client_activity("busy");
        tokio::time::advance(Duration::from_secs(15)).await;

        let expired = m.cleanup_expired_sessions(Duration::from_secs(30));
        assert_eq!(expired, vec!["idle".to_string()]);
        assert!(m.get_session("busy").is_some());
        assert_eq!(m.all_sessions().len(), 1);
    }
}
