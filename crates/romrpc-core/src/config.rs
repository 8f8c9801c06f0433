//! Centralized configuration for the RPC substrate.
//!
//! Constant namespaces hold protocol-level values and defaults. The
//! `*Options` builders carry the values a caller may tune at runtime.

use std::time::Duration;

/// Wire-protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const JSONRPC_VERSION: &'static str = "2.0";
    /// Synthetic member carrying the session id inside `params`/`result`.
    pub const SESSION_ID_PROPERTY: &'static str = "sessionId";
    /// Wrapper member used when a non-object payload needs a session id.
    pub const VALUE_PROPERTY: &'static str = "value";
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Prefix of provisional references handed out inside a transaction.
    pub const PROVISIONAL_REF_PREFIX: &'static str = "newref:";
}

/// Client session defaults.
pub struct SessionConfig;

impl SessionConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    /// Retries for transient negotiation failures inside one connect attempt.
    pub const HANDSHAKE_RETRY_ATTEMPTS: u32 = 3;
    pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(200);
}

/// Server-side defaults.
pub struct ServerConfig;

impl ServerConfig {
    pub const MAX_CONNECTIONS: usize = 256;
    /// A session with no traffic for this long is closed by the sweeper.
    pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
    /// How long a `poll` request is parked waiting for server messages.
    pub const LONG_POLL_WAIT: Duration = Duration::from_secs(20);
    pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;
}

/// RPC-socket pool defaults.
pub struct PoolConfig;

impl PoolConfig {
    pub const MAX_IDLE_CONNECTIONS: usize = 8;
}

/// Runtime options for a client [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bounded wait for a response to one request.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Keep-alive period; `None` disables the keep-alive loop.
    pub keepalive_interval: Option<Duration>,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub handshake_retry_attempts: u32,
    pub handshake_retry_delay: Duration,
    /// Human label prefixed to log lines.
    pub label: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: SessionConfig::REQUEST_TIMEOUT,
            connect_timeout: SessionConfig::CONNECT_TIMEOUT,
            keepalive_interval: Some(SessionConfig::KEEPALIVE_INTERVAL),
            reconnect_delay: SessionConfig::RECONNECT_DELAY,
            max_reconnect_attempts: SessionConfig::MAX_RECONNECT_ATTEMPTS,
            handshake_retry_attempts: SessionConfig::HANDSHAKE_RETRY_ATTEMPTS,
            handshake_retry_delay: SessionConfig::HANDSHAKE_RETRY_DELAY,
            label: String::from("session"),
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_handshake_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.handshake_retry_attempts = attempts;
        self.handshake_retry_delay = delay;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Runtime options for the JSON-RPC server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_connections: usize,
    pub session_idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub long_poll_wait: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: ServerConfig::MAX_CONNECTIONS,
            session_idle_timeout: ServerConfig::SESSION_IDLE_TIMEOUT,
            sweep_interval: ServerConfig::SWEEP_INTERVAL,
            long_poll_wait: ServerConfig::LONG_POLL_WAIT,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_long_poll_wait(mut self, wait: Duration) -> Self {
        self.long_poll_wait = wait;
        self
    }
}

/// Runtime options for the RPC-socket pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_idle: usize,
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_idle: PoolConfig::MAX_IDLE_CONNECTIONS,
            connect_timeout: SessionConfig::CONNECT_TIMEOUT,
        }
    }
}

impl PoolOptions {
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(SessionConfig::REQUEST_TIMEOUT > Duration::ZERO);
        assert!(ServerConfig::SESSION_IDLE_TIMEOUT > SessionConfig::KEEPALIVE_INTERVAL);
        assert!(ServerConfig::LONG_POLL_WAIT < SessionConfig::REQUEST_TIMEOUT * 2);
    }

    #[test]
    fn test_session_options_builder() {
        let opts = SessionOptions::new()
            .with_request_timeout(Duration::from_millis(250))
            .with_keepalive(None)
            .with_max_reconnect_attempts(2);
        assert_eq!(opts.request_timeout, Duration::from_millis(250));
        assert!(opts.keepalive_interval.is_none());
        assert_eq!(opts.max_reconnect_attempts, 2);
    }
}
