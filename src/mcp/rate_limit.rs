//! Per-client admission control.
//!
//! Each client has a token bucket (short bursts), a fixed window that resets
//! once it is `window` old (sustained rate), and a violation counter. Every
//! denial by the bucket or the window is a violation; reaching
//! `max_violations` blocks the client for `block_duration`.
//!
//! ```text
//!            max_violations reached
//!   Active ─────────────────────────▶ Blocked { until }
//!      ▲                                   │
//!      └──────── now >= until ─────────────┘
//! ```
//!
//! The violation counter is not reset on unblock, so a client that keeps
//! misbehaving is re-blocked on its next violation.
//!
//! All timestamps are [`tokio::time::Instant`], so tests can drive the
//! limiter with a paused clock.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Admission state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Requests are evaluated normally.
    Active,
    /// Every request is denied until the deadline.
    Blocked {
        /// When the block expires.
        until: Instant,
    },
}

/// Outcome of [`RateLimiter::allow_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed.
    Allowed,
    /// The client is blocked.
    Blocked,
    /// The token bucket is empty.
    BurstExceeded,
    /// The window's request limit is reached.
    WindowExceeded,
}

impl Admission {
    /// Returns `true` for [`Admission::Allowed`].
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Short reason string for denials.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Blocked => "client blocked",
            Self::BurstExceeded => "burst limit exceeded",
            Self::WindowExceeded => "request limit exceeded",
        }
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct ClientRateState {
    tokens: u32,
    last_refill: Instant,
    window_count: u32,
    window_start: Instant,
    violations: u32,
    state: ClientState,
    last_seen: Instant,
}

impl ClientRateState {
    fn new(burst_limit: u32, now: Instant) -> Self {
        Self {
            tokens: burst_limit,
            last_refill: now,
            window_count: 0,
            window_start: now,
            violations: 0,
            state: ClientState::Active,
            last_seen: now,
        }
    }

    fn is_blocked_at(&self, now: Instant) -> bool {
        matches!(self.state, ClientState::Blocked { until } if now < until)
    }

    /// Adds `elapsed * burst / window` tokens, truncated, capped at `burst`.
    ///
    /// `last_refill` only moves when at least one token is added, so partial
    /// intervals accumulate.
    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let window = config.window().as_nanos();
        if window == 0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let added = elapsed * u128::from(config.burst_limit) / window;
        if added > 0 {
            let total = u128::from(self.tokens) + added;
            self.tokens = u32::try_from(total.min(u128::from(config.burst_limit)))
                .unwrap_or(config.burst_limit);
            self.last_refill = now;
        }
    }

    fn record_violation(&mut self, client_id: &str, config: &RateLimitConfig, now: Instant) {
        self.violations = self.violations.saturating_add(1);
        if self.violations >= config.max_violations {
            let until = now + config.block_duration();
            self.state = ClientState::Blocked { until };
            tracing::warn!(
                client_id,
                violation_count = self.violations,
                block_secs = config.block_secs,
                "Client blocked due to excessive rate limit violations"
            );
        }
    }
}

/// Rate-limit view of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientRateSnapshot {
    /// Client id.
    pub client_id: String,
    /// Requests admitted in the current window.
    pub window_requests: u32,
    /// Tokens left in the bucket.
    pub tokens_remaining: u32,
    /// Violations recorded so far.
    pub violation_count: u32,
    /// Whether the client is currently blocked.
    pub blocked: bool,
    /// Milliseconds until the window resets.
    pub window_reset_in_ms: u64,
    /// Milliseconds until the block expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unblock_in_ms: Option<u64>,
}

/// Rate limiter statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    /// Whether limiting is enforced.
    pub enabled: bool,
    /// Tracked clients.
    pub total_clients: usize,
    /// Clients currently blocked.
    pub blocked_clients: usize,
    /// Violations across tracked clients.
    pub total_violations: u64,
    /// Requests admitted in the current windows.
    pub window_requests: u64,
    /// Configured requests per window.
    pub requests_per_window: u32,
    /// Configured bucket capacity.
    pub burst_limit: u32,
    /// Configured window, in seconds.
    pub window_secs: u64,
    /// Configured block duration, in seconds.
    pub block_secs: u64,
    /// Configured violation threshold.
    pub max_violations: u32,
}

struct LimiterState {
    config: RateLimitConfig,
    clients: HashMap<String, ClientRateState>,
}

/// Token bucket plus fixed window with violation-driven blocking.
pub struct RateLimiter {
    state: RwLock<LimiterState>,
}

impl RateLimiter {
    /// Creates a limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: RwLock::new(LimiterState {
                config,
                clients: HashMap::new(),
            }),
        }
    }

    /// Starts tracking a client with a full bucket.
    ///
    /// A client that is already tracked keeps its bucket, window, violations
    /// and any block. Returns `true` if tracking started with this call.
    pub fn initialize_client(&self, client_id: &str) -> bool {
        let mut guard = self.state.write();
        let LimiterState { config, clients } = &mut *guard;
        if clients.contains_key(client_id) {
            tracing::debug!(client_id, "Rate limiter already tracks client");
            return false;
        }

        let fresh = ClientRateState::new(config.burst_limit, Instant::now());
        clients.insert(client_id.to_string(), fresh);
        tracing::debug!(
            client_id,
            requests_per_window = config.requests_per_window,
            burst_limit = config.burst_limit,
            "Initialized rate limiter for client"
        );
        true
    }

    /// Decides whether a request from `client_id` is admitted.
    ///
    /// Unknown clients are tracked from their first request. The checks run
    /// in a fixed order: block, unblock, refill, bucket, window reset, window
    /// limit, consume.
    pub fn allow_request(&self, client_id: &str) -> Admission {
        let mut guard = self.state.write();
        let LimiterState { config, clients } = &mut *guard;
        if !config.enabled {
            return Admission::Allowed;
        }

        let now = Instant::now();
        let client = clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientRateState::new(config.burst_limit, now));
        client.last_seen = now;

        if let ClientState::Blocked { until } = client.state {
            if now < until {
                tracing::debug!(client_id, "Request denied: client is blocked");
                return Admission::Blocked;
            }
            client.state = ClientState::Active;
            tracing::info!(client_id, "Client unblocked after timeout");
        }

        client.refill(config, now);

        if client.tokens == 0 {
            client.record_violation(client_id, config, now);
            tracing::warn!(
                client_id,
                violation_count = client.violations,
                "Request denied: token bucket empty"
            );
            return Admission::BurstExceeded;
        }

        if now.saturating_duration_since(client.window_start) >= config.window() {
            client.window_count = 0;
            client.window_start = now;
        }

        if client.window_count >= config.requests_per_window {
            client.record_violation(client_id, config, now);
            tracing::warn!(
                client_id,
                request_count = client.window_count,
                limit = config.requests_per_window,
                violation_count = client.violations,
                "Request denied: rate limit exceeded"
            );
            return Admission::WindowExceeded;
        }

        client.window_count += 1;
        client.tokens -= 1;
        tracing::trace!(
            client_id,
            request_count = client.window_count,
            tokens_remaining = client.tokens,
            "Request allowed"
        );
        Admission::Allowed
    }

    /// Stops tracking a client. Returns `true` if it was tracked.
    pub fn remove_client(&self, client_id: &str) -> bool {
        let removed = self.state.write().clients.remove(client_id).is_some();
        if removed {
            tracing::debug!(client_id, "Removed rate limiter data for client");
        }
        removed
    }

    /// Returns the current state of a client, if tracked.
    #[must_use]
    pub fn client_state(&self, client_id: &str) -> Option<ClientState> {
        self.state.read().clients.get(client_id).map(|c| c.state)
    }

    /// Returns a snapshot of one client.
    #[must_use]
    pub fn client_stats(&self, client_id: &str) -> Option<ClientRateSnapshot> {
        let state = self.state.read();
        let client = state.clients.get(client_id)?;
        let now = Instant::now();

        let window_end = client.window_start + state.config.window();
        let unblock_in = match client.state {
            ClientState::Blocked { until } if now < until => Some(until - now),
            _ => None,
        };

        Some(ClientRateSnapshot {
            client_id: client_id.to_string(),
            window_requests: client.window_count,
            tokens_remaining: client.tokens,
            violation_count: client.violations,
            blocked: unblock_in.is_some(),
            window_reset_in_ms: millis(window_end.saturating_duration_since(now)),
            unblock_in_ms: unblock_in.map(millis),
        })
    }

    /// Returns limiter statistics.
    #[must_use]
    pub fn stats(&self) -> RateLimitStats {
        let state = self.state.read();
        let now = Instant::now();
        let config = &state.config;

        RateLimitStats {
            enabled: config.enabled,
            total_clients: state.clients.len(),
            blocked_clients: state.clients.values().filter(|c| c.is_blocked_at(now)).count(),
            total_violations: state.clients.values().map(|c| u64::from(c.violations)).sum(),
            window_requests: state.clients.values().map(|c| u64::from(c.window_count)).sum(),
            requests_per_window: config.requests_per_window,
            burst_limit: config.burst_limit,
            window_secs: config.window_secs,
            block_secs: config.block_secs,
            max_violations: config.max_violations,
        }
    }

    /// Returns a copy of the active configuration.
    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.state.read().config.clone()
    }

    /// Replaces the configuration. Tracked clients adopt the new limits and
    /// their buckets are capped at the new burst limit.
    pub fn update_config(&self, config: RateLimitConfig) {
        let mut state = self.state.write();
        for client in state.clients.values_mut() {
            client.tokens = client.tokens.min(config.burst_limit);
        }
        tracing::info!(
            enabled = config.enabled,
            requests_per_window = config.requests_per_window,
            burst_limit = config.burst_limit,
            max_violations = config.max_violations,
            "Updated rate limiting configuration"
        );
        state.config = config;
    }

    /// Drops clients unseen for longer than the inactivity threshold,
    /// keeping blocked ones. Returns how many were dropped.
    pub fn cleanup_inactive_clients(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.write();
        let threshold = state.config.inactive_threshold();

        let before = state.clients.len();
        state.clients.retain(|_, c| {
            c.is_blocked_at(now) || now.saturating_duration_since(c.last_seen) <= threshold
        });
        let removed = before - state.clients.len();
        drop(state);

        if removed > 0 {
            tracing::info!(cleaned_count = removed, "Cleaned up inactive rate limiter data");
        }
        removed
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("RateLimiter")
            .field("config", &state.config)
            .field("clients", &state.clients.len())
            .finish()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(requests_per_window: u32, burst_limit: u32, max_violations: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_window,
            burst_limit,
            max_violations,
            window_secs: 60,
            block_secs: 300,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let limiter = RateLimiter::new(config(100, 3, 10));
        for _ in 0..3 {
            assert!(limiter.allow_request("c1").is_allowed());
        }
        assert_eq!(limiter.allow_request("c1"), Admission::BurstExceeded);

        // 20s at 3 tokens per 60s adds one token.
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(limiter.allow_request("c1").is_allowed());
        assert_eq!(limiter.allow_request("c1"), Admission::BurstExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_refill_accumulates() {
        let limiter = RateLimiter::new(config(100, 1, 10));
        assert!(limiter.allow_request("c1").is_allowed());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(limiter.allow_request("c1"), Admission::BurstExceeded);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.allow_request("c1").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn window_limit_caps_sustained_rate() {
        let limiter = RateLimiter::new(config(2, 10, 10));
        assert!(limiter.allow_request("c1").is_allowed());
        assert!(limiter.allow_request("c1").is_allowed());
        assert_eq!(limiter.allow_request("c1"), Admission::WindowExceeded);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.allow_request("c1").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn violations_escalate_to_block() {
        let limiter = RateLimiter::new(config(100, 1, 2));
        assert!(limiter.allow_request("c1").is_allowed());
        assert_eq!(limiter.allow_request("c1"), Admission::BurstExceeded);
        assert_eq!(limiter.allow_request("c1"), Admission::BurstExceeded);
        assert!(matches!(
            limiter.client_state("c1"),
            Some(ClientState::Blocked { .. })
        ));

        // Plenty of tokens by now, still blocked.
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(limiter.allow_request("c1"), Admission::Blocked);
        assert!(limiter.client_stats("c1").unwrap().blocked);

        tokio::time::advance(Duration::from_secs(180)).await;
        assert!(limiter.allow_request("c1").is_allowed());
        assert_eq!(limiter.client_state("c1"), Some(ClientState::Active));
        assert_eq!(limiter.client_stats("c1").unwrap().violation_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_denials_are_not_violations() {
        let limiter = RateLimiter::new(config(100, 1, 1));
        assert!(limiter.allow_request("c1").is_allowed());
        assert_eq!(limiter.allow_request("c1"), Admission::BurstExceeded);
        assert_eq!(limiter.allow_request("c1"), Admission::Blocked);
        assert_eq!(limiter.stats().total_violations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_keeps_existing_state() {
        let limiter = RateLimiter::new(RateLimitConfig {
            block_secs: 3600,
            ..config(100, 1, 1)
        });
        assert!(limiter.initialize_client("fresh"));
        assert!(!limiter.initialize_client("fresh"));

        assert!(limiter.allow_request("c1").is_allowed());
        assert_eq!(limiter.allow_request("c1"), Admission::BurstExceeded);
        assert!(!limiter.initialize_client("c1"));

        assert_eq!(limiter.allow_request("c1"), Admission::Blocked);
        let snapshot = limiter.client_stats("c1").unwrap();
        assert_eq!(snapshot.violation_count, 1);
        assert_eq!(snapshot.tokens_remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            ..config(1, 1, 1)
        });
        for _ in 0..50 {
            assert!(limiter.allow_request("c1").is_allowed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn update_config_caps_buckets() {
        let limiter = RateLimiter::new(config(100, 10, 10));
        limiter.initialize_client("c1");
        limiter.update_config(config(100, 2, 10));

        assert_eq!(limiter.client_stats("c1").unwrap().tokens_remaining, 2);
        assert!(limiter.allow_request("c1").is_allowed());
        assert!(limiter.allow_request("c1").is_allowed());
        assert_eq!(limiter.allow_request("c1"), Admission::BurstExceeded);
        assert_eq!(limiter.stats().burst_limit, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_clients_are_swept_but_blocked_ones_kept() {
        let limiter = RateLimiter::new(RateLimitConfig {
            block_secs: 7200,
            ..config(100, 1, 1)
        });
        limiter.initialize_client("idle");
        assert!(limiter.allow_request("abuser").is_allowed());
        assert_eq!(limiter.allow_request("abuser"), Admission::BurstExceeded);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(limiter.cleanup_inactive_clients(), 1);
        assert!(limiter.client_stats("idle").is_none());
        assert!(limiter.client_stats("abuser").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_count_clients() {
        let limiter = RateLimiter::default();
        limiter.allow_request("a");
        limiter.allow_request("b");
        let stats = limiter.stats();
        assert_eq!(stats.total_clients, 2);
        assert_eq!(stats.window_requests, 2);
        assert_eq!(stats.blocked_clients, 0);

        assert!(limiter.remove_client("a"));
        assert!(!limiter.remove_client("a"));
    }
}
