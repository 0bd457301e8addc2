// ABOUTME: Configuration for the middleware client
//
// Defines ClientConfig with every tunable of the transport:
// - Endpoint and credentials
// - Handshake, call and keepalive timing
// - Reconnect backoff
// - Queue capacities and job polling interval
//
// Loaded from TOML (default: <config_dir>/midclt/config.toml), then
// overridden by command line flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::client::ClientError;

/// Login credentials used right after every successful handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// `auth.login [username, password]`
    Password { username: String, password: String },
    /// `auth.login_with_api_key [key]`
    ApiKey { key: String },
}

impl Credentials {
    /// Login method name and parameters.
    #[must_use]
    pub fn login_call(&self) -> (&'static str, Vec<serde_json::Value>) {
        match self {
            Self::Password { username, password } => (
                "auth.login",
                vec![username.clone().into(), password.clone().into()],
            ),
            Self::ApiKey { key } => ("auth.login_with_api_key", vec![key.clone().into()]),
        }
    }
}

/// Configuration for one client connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint (ws:// or wss://)
    pub url: String,

    /// Optional login performed after each connect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,

    // === Timeouts ===
    /// Maximum wait for the `connected` reply
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Applied to calls whose context carries no deadline
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,

    /// WebSocket ping interval
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,

    // === Reconnect ===
    /// Initial reconnect delay (exponential backoff base)
    #[serde(with = "duration_ms")]
    pub reconnect_backoff_base: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    #[serde(with = "duration_ms")]
    pub reconnect_backoff_max: Duration,

    /// Re-issue subscriptions on the new connection
    pub resubscribe_on_reconnect: bool,

    // === Queues ===
    /// Outbound envelopes waiting for the write pump
    pub outbound_queue_size: usize,

    /// Non-fatal read errors waiting for a caller
    pub error_queue_size: usize,

    /// Updates waiting for one subscription's handler
    pub subscription_queue_size: usize,

    // === Jobs ===
    /// Interval between job status queries
    #[serde(with = "duration_ms")]
    pub job_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1/websocket".to_string(),
            credentials: None,

            handshake_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(30),

            reconnect_backoff_base: Duration::from_millis(100),
            reconnect_backoff_max: Duration::from_secs(10),
            resubscribe_on_reconnect: true,

            outbound_queue_size: 64,
            error_queue_size: 16,
            subscription_queue_size: 256,

            job_poll_interval: Duration::from_millis(500),
        }
    }
}

impl ClientConfig {
    /// Config for `url` with every other field at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Set login credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Default config file location: `<config_dir>/midclt/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("midclt").join("config.toml"))
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))
    }

    /// Load from `path` if given, else the default location if it exists,
    /// else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ClientError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Check the endpoint and queue sizes.
    pub fn validate(&self) -> Result<Url, ClientError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ClientError::Config(format!("invalid url {:?}: {e}", self.url)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::Config(format!(
                "url scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.outbound_queue_size == 0 || self.error_queue_size == 0 {
            return Err(ClientError::Config("queue sizes must be non-zero".to_string()));
        }
        if self.keepalive_interval.is_zero() || self.job_poll_interval.is_zero() {
            return Err(ClientError::Config("intervals must be non-zero".to_string()));
        }

        Ok(url)
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
