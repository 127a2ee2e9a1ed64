use std::{str::FromStr, time::Duration};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub public_url: String,
    pub db_connection_string: String,
    pub auth_secret: String,
    pub token_ttl: Duration,
    pub sync: SyncConfig,
}

/// Tuning for the connection hub, the pumps and the conflict policy.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// What a broadcast does when a target's queue is full.
    pub slow_consumer_policy: SlowConsumerPolicy,
    /// Updates landing this close to the stored one are treated as concurrent.
    pub recency_window: Duration,
    pub write_timeout: Duration,
    /// Refreshed on every received frame, pongs included.
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    pub max_message_bytes: usize,
    pub broadcast_offline_merge: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            slow_consumer_policy: SlowConsumerPolicy::Evict,
            recency_window: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            max_message_bytes: 4096,
            broadcast_offline_merge: false,
        }
    }
}

/// Contract applied by `Broadcast` when a target connection cannot keep up.
///
/// The hub loop never blocks on a target queue under either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowConsumerPolicy {
    /// Unregister the connection, closing its queue and socket.
    Evict,
    /// Keep the connection and drop this message for it.
    DropMessage,
}

impl FromStr for SlowConsumerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evict" => Ok(SlowConsumerPolicy::Evict),
            "drop-message" | "drop" => Ok(SlowConsumerPolicy::DropMessage),
            other => Err(format!("unknown slow consumer policy: {}", other)),
        }
    }
}

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_PUBLIC_URL: &str = "http://localhost:3000";
const DEFAULT_DB_CONNECTION_STRING: &str = "sqlite://db.sqlite?mode=rwc";
const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Connection string selecting the in-memory store.
pub const MEMORY_STORE: &str = "memory";

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid {}: {}", key, raw)),
        _ => Ok(default),
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            queue_capacity: env_or("SYNC_QUEUE_CAPACITY", defaults.queue_capacity)?,
            slow_consumer_policy: env_or(
                "SYNC_SLOW_CONSUMER_POLICY",
                defaults.slow_consumer_policy,
            )?,
            recency_window: Duration::from_millis(env_or("SYNC_RECENCY_WINDOW_MS", 5_000)?),
            write_timeout: Duration::from_secs(env_or("SYNC_WRITE_TIMEOUT_SECS", 10)?),
            read_timeout: Duration::from_secs(env_or("SYNC_READ_TIMEOUT_SECS", 60)?),
            ping_interval: Duration::from_secs(env_or("SYNC_PING_INTERVAL_SECS", 54)?),
            max_message_bytes: env_or("SYNC_MAX_MESSAGE_BYTES", defaults.max_message_bytes)?,
            broadcast_offline_merge: env_or(
                "SYNC_BROADCAST_OFFLINE_MERGE",
                defaults.broadcast_offline_merge,
            )?,
        };
        Ok(Config {
            bind_addr: env_or("BIND_ADDR", DEFAULT_BIND_ADDR.to_string())?,
            public_url: env_or("PUBLIC_URL", DEFAULT_PUBLIC_URL.to_string())?,
            db_connection_string: env_or(
                "DB_CONNECTION_STRING",
                DEFAULT_DB_CONNECTION_STRING.to_string(),
            )?,
            auth_secret: std::env::var("AUTH_SECRET").unwrap_or_default(),
            token_ttl: Duration::from_secs(env_or("AUTH_TOKEN_TTL_SECS", DEFAULT_TOKEN_TTL_SECS)?),
            sync,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.auth_secret.is_empty() {
            return Err("AUTH_SECRET is missing".into());
        }
        if self.token_ttl.is_zero() {
            return Err("AUTH_TOKEN_TTL_SECS must be positive".into());
        }
        self.sync.validate()
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("SYNC_QUEUE_CAPACITY must be positive".into());
        }
        if self.write_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err("socket timeouts must be positive".into());
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.read_timeout {
            return Err("SYNC_PING_INTERVAL_SECS must be positive and shorter than the read timeout".into());
        }
        if self.max_message_bytes == 0 {
            return Err("SYNC_MAX_MESSAGE_BYTES must be positive".into());
        }
        Ok(())
    }
}
