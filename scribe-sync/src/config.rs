//! Client and relay configuration.
//!
//! Plain structs with sensible defaults. The client can also be configured
//! from `SCRIBE_*` environment variables.

use std::time::Duration;

use crate::transport::TransportOptions;

pub const ENV_URL: &str = "SCRIBE_URL";
pub const ENV_SESSION: &str = "SCRIBE_SESSION";
pub const ENV_TOKEN: &str = "SCRIBE_TOKEN";
pub const ENV_RECONNECT: &str = "SCRIBE_RECONNECT";
pub const ENV_RECONNECT_MS: &str = "SCRIBE_RECONNECT_MS";
pub const ENV_STAGE: &str = "SCRIBE_STAGE";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Endpoint URL must start with ws:// or wss://, got {0:?}")]
    InvalidUrl(String),
    #[error("Session name must not be empty")]
    EmptySession,
    #[error("Session name {0:?} may only contain letters, digits, '-' and '_'")]
    InvalidSession(String),
    #[error("Token must not be empty")]
    InvalidToken,
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} must be true or false, got {value:?}")]
    InvalidFlag { var: &'static str, value: String },
}

/// Deployment stage, chosen by `SCRIBE_STAGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    Bench,
    #[default]
    Testing,
    Staging,
    Production,
}

impl Stage {
    /// Case-insensitive. Unknown names fall back to `Testing`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "bench" => Stage::Bench,
            "staging" => Stage::Staging,
            "production" => Stage::Production,
            _ => Stage::Testing,
        }
    }

    /// Stage from `SCRIBE_STAGE`, `Testing` when unset.
    pub fn from_env() -> Self {
        std::env::var(ENV_STAGE)
            .map(|s| Self::parse(&s))
            .unwrap_or_default()
    }

    /// Log filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Stage::Production => "error",
            _ => "info",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Bench => "bench",
            Stage::Testing => "testing",
            Stage::Staging => "staging",
            Stage::Production => "production",
        }
    }
}

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Collaboration server, e.g. `ws://localhost:9001`
    pub base_url: String,
    /// Session (document) to join
    pub session: String,
    /// Authentication token, passed through as a query parameter
    pub token: Option<String>,
    /// Dial again after the connection drops
    pub reconnect: bool,
    /// Fixed delay between reconnection attempts
    pub reconnect_interval: Duration,
    /// Inbound event buffer between transport and engine
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:9001".to_string(),
            session: "sandbox".to_string(),
            token: None,
            reconnect: true,
            reconnect_interval: Duration::from_millis(3000),
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Defaults with the given server and session.
    pub fn new(base_url: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            session: session.into(),
            ..Self::default()
        }
    }

    /// Set the auth token. Any characters are allowed; reserved ones are
    /// percent-encoded in [`ClientConfig::endpoint_url`].
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool, interval: Duration) -> Self {
        self.reconnect = reconnect;
        self.reconnect_interval = interval;
        self
    }

    /// Defaults overridden by any `SCRIBE_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_URL) {
            config.base_url = url;
        }
        if let Some(session) = lookup(ENV_SESSION) {
            config.session = session;
        }
        config.token = lookup(ENV_TOKEN).filter(|t| !t.is_empty());
        if let Some(value) = lookup(ENV_RECONNECT) {
            config.reconnect = parse_flag(ENV_RECONNECT, &value)?;
        }
        if let Some(value) = lookup(ENV_RECONNECT_MS) {
            let ms = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: ENV_RECONNECT_MS,
                    value: value.clone(),
                })?;
            config.reconnect_interval = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the URL scheme, session name and token.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("ws://") || self.base_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.base_url.clone()));
        }
        if self.session.is_empty() {
            return Err(ConfigError::EmptySession);
        }
        if !self
            .session
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidSession(self.session.clone()));
        }
        if let Some(token) = &self.token {
            if token.is_empty() {
                return Err(ConfigError::InvalidToken);
            }
        }
        Ok(())
    }

    /// `{base}/ws/document/{session}`, plus a percent-encoded `?token=`
    /// when a token is set.
    pub fn endpoint_url(&self) -> Result<String, ConfigError> {
        self.validate()?;
        let base = self.base_url.trim_end_matches('/');
        let mut url = format!("{base}/ws/document/{}", self.session);
        if let Some(token) = &self.token {
            url.push_str("?token=");
            url.push_str(&percent_encode(token));
        }
        Ok(url)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            reconnect: self.reconnect,
            reconnect_interval: self.reconnect_interval,
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frame buffer per connected peer
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9001".to_string(),
            channel_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            var,
            value: value.to_string(),
        }),
    }
}

/// Encode a query value, keeping only RFC 3986 unreserved bytes as-is.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
