//! Client configuration.
//!
//! Values are layered: built-in defaults, then the TOML file
//! (`$XDG_CONFIG_HOME/sessmon/config.toml` or an explicit path), then
//! environment overrides. Command-line flags are applied by the binary on top.
//!
//! ```toml
//! base_url = "https://api.example.com"
//! framing = "event_stream"
//! max_reconnect_attempts = 8
//! command_ack_timeout_ms = 5000
//! request_timeout_ms = 10000
//! idle_timeout_secs = 60
//!
//! [retry]
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! multiplier = 2.0
//!
//! [stream]
//! path = "/analysis/{session_id}/stream"
//! method = "post"
//! body = { depth = "full" }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use sessmon_protocol::Framing;

use crate::error::{ClientError, Result};

/// Environment variable overriding [`ClientConfig::base_url`].
pub const ENV_URL: &str = "SESSMON_URL";

/// Placeholder substituted with the session id in stream paths.
pub const SESSION_ID_PLACEHOLDER: &str = "{session_id}";

// ============================================================================
// Stream Endpoint
// ============================================================================

/// HTTP method used to open the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMethod {
    #[default]
    Get,
    /// Analysis flows open the stream with a JSON request body.
    Post,
}

/// Where and how the event stream is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEndpoint {
    /// Path template relative to the base URL, containing `{session_id}`.
    pub path: String,
    pub method: StreamMethod,
    /// JSON body sent with `POST` streams.
    pub body: Option<serde_json::Value>,
}

impl Default for StreamEndpoint {
    fn default() -> Self {
        Self {
            path: format!("/stream/{SESSION_ID_PLACEHOLDER}"),
            method: StreamMethod::Get,
            body: None,
        }
    }
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration for the streaming controller and its transport.
///
/// # Example
///
/// ```rust
/// use sessmon_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     base_url: "http://localhost:9000".to_string(),
///     retry_initial_delay: Duration::from_millis(200),
///     ..Default::default()
/// };
/// assert_eq!(config.max_reconnect_attempts, 8);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Scheme and authority, without trailing slash.
    pub base_url: String,

    pub stream: StreamEndpoint,

    pub framing: Framing,

    /// Initial delay before the first reconnect attempt.
    pub retry_initial_delay: Duration,

    /// Maximum delay between reconnect attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,

    /// Consecutive failed reconnects before the session is failed.
    pub max_reconnect_attempts: u32,

    /// How long `issue_command` waits for a confirming event.
    pub command_ack_timeout: Duration,

    /// HTTP timeout for delivering a command request.
    pub request_timeout: Duration,

    /// A connected stream silent for this long is treated as dropped.
    /// `None` disables the check.
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            stream: StreamEndpoint::default(),
            framing: Framing::DataLines,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
            max_reconnect_attempts: 8,
            command_ack_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl ClientConfig {
    /// Default config file location, if a config directory exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sessmon").join("config.toml"))
    }

    /// Loads defaults, the config file and environment overrides.
    ///
    /// An explicit `path` must exist. The default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Reads a TOML config file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ClientError::Config(format!("Failed to read {}: {err}", path.display()))
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml_str(&raw).map_err(|err| match err {
            ClientError::Config(reason) => {
                ClientError::Config(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }

    /// Parses TOML on top of the defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(raw).map_err(|err| ClientError::Config(err.to_string()))?;
        let mut config = Self::default();
        file.merge_into(&mut config)?;
        Ok(config)
    }

    /// Applies environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_URL).filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().trim_end_matches('/').to_string();
        }
    }

    /// Next reconnect delay after `delay`, capped at `retry_max_delay`.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let next_delay_ms = (delay.as_millis() as f64 * self.retry_multiplier) as u64;
        Duration::from_millis(next_delay_ms).min(self.retry_max_delay)
    }
}

// ============================================================================
// File Representation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    base_url: Option<String>,
    framing: Option<Framing>,
    max_reconnect_attempts: Option<u32>,
    command_ack_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    /// `0` disables the idle check.
    idle_timeout_secs: Option<u64>,
    retry: Option<FileRetry>,
    stream: Option<FileStream>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRetry {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStream {
    path: Option<String>,
    method: Option<StreamMethod>,
    body: Option<serde_json::Value>,
}

impl FileConfig {
    fn merge_into(self, config: &mut ClientConfig) -> Result<()> {
        if let Some(url) = self.base_url {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = self.command_ack_timeout_ms {
            config.command_ack_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(retry) = self.retry {
            if let Some(ms) = retry.initial_delay_ms {
                config.retry_initial_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = retry.max_delay_ms {
                config.retry_max_delay = Duration::from_millis(ms);
            }
            if let Some(multiplier) = retry.multiplier {
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(ClientError::Config(format!(
                        "retry.multiplier must be >= 1.0, got {multiplier}"
                    )));
                }
                config.retry_multiplier = multiplier;
            }
        }

        if let Some(stream) = self.stream {
            if let Some(path) = stream.path {
                if !path.contains(SESSION_ID_PLACEHOLDER) {
                    return Err(ClientError::Config(format!(
                        "stream.path must contain {SESSION_ID_PLACEHOLDER}, got {path}"
                    )));
                }
                config.stream.path = path;
            }
            if let Some(method) = stream.method {
                config.stream.method = method;
            }
            if stream.body.is_some() {
                config.stream.body = stream.body;
            }
        }

        Ok(())
    }
}
