//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{DEFAULT_ACK_TIMEOUT_MS, DEFAULT_HTTP_PORT, DEFAULT_MAX_RETRIES};

use crate::delivery::{Backoff, RetryPolicy};

/// When a conversation counts as blocked for send, edit, remove and read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPolicy {
    /// Blocked as soon as one participant has blocked it.
    AnyParticipant,
    /// Blocked only once both participants have blocked it.
    BothParticipants,
}

impl BlockPolicy {
    pub fn is_blocked(self, blocked_by: usize) -> bool {
        match self {
            BlockPolicy::AnyParticipant => blocked_by > 0,
            BlockPolicy::BothParticipants => blocked_by > 1,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "any" => Some(BlockPolicy::AnyParticipant),
            "both" => Some(BlockPolicy::BothParticipants),
            _ => None,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Shared presence store. Without it presence lives in this process only.
    /// Env: `REDIS_URL`
    pub redis_url: Option<String>,

    /// Push acknowledgment timeout, attempt count and backoff.
    /// Env: `ACK_TIMEOUT_MS`, `MAX_RETRIES`, `RETRY_BACKOFF_MS`,
    /// `RETRY_BACKOFF_MAX_MS`
    pub retry: RetryPolicy,

    /// Env: `BLOCK_POLICY` (`any` / `both`)
    /// Default: `any`
    pub block_policy: BlockPolicy,

    /// Optional liveness lease on presence entries.
    /// Env: `PRESENCE_TTL_SECS`
    pub presence_ttl: Option<Duration>,

    /// Header set by the authenticating proxy with the caller's identity.
    /// Env: `IDENTITY_HEADER`
    /// Default: `x-user-id`
    pub identity_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            redis_url: None,
            retry: RetryPolicy {
                max_attempts: DEFAULT_MAX_RETRIES,
                ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
                backoff: Backoff::None,
            },
            block_policy: BlockPolicy::AnyParticipant,
            presence_ttl: None,
            identity_header: "x-user-id".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(url) = var("REDIS_URL") {
            if !url.is_empty() {
                config.redis_url = Some(url);
            }
        }

        if let Some(ms) = parse_number::<u64>(&var, "ACK_TIMEOUT_MS") {
            if ms > 0 {
                config.retry.ack_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(n) = parse_number::<u32>(&var, "MAX_RETRIES") {
            config.retry.max_attempts = n.max(1);
        }

        let backoff_ms = parse_number::<u64>(&var, "RETRY_BACKOFF_MS").unwrap_or(0);
        let backoff_max_ms = parse_number::<u64>(&var, "RETRY_BACKOFF_MAX_MS").unwrap_or(0);
        config.retry.backoff = match (backoff_ms, backoff_max_ms) {
            (0, _) => Backoff::None,
            (initial, max) if max > initial => Backoff::Exponential {
                initial: Duration::from_millis(initial),
                max: Duration::from_millis(max),
            },
            (delay, _) => Backoff::Fixed(Duration::from_millis(delay)),
        };

        if let Some(raw) = var("BLOCK_POLICY") {
            match BlockPolicy::parse(&raw) {
                Some(policy) => config.block_policy = policy,
                None => tracing::warn!(value = %raw, "Invalid BLOCK_POLICY, using default"),
            }
        }

        if let Some(secs) = parse_number::<u64>(&var, "PRESENCE_TTL_SECS") {
            if secs > 0 {
                config.presence_ttl = Some(Duration::from_secs(secs));
            }
        }

        if let Some(header) = var("IDENTITY_HEADER") {
            if !header.is_empty() {
                config.identity_header = header.to_ascii_lowercase();
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_number<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}
