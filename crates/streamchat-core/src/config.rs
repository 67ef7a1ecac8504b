//! Client configuration.
//!
//! One `ClientConfig` is built per running client and handed to the health
//! monitor and the pipeline at construction. Every field has a default so a
//! partial JSON file is enough.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Request/response dialect spoken by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Separate health and chat paths; chat body carries the full history.
    #[default]
    #[serde(rename = "openai", alias = "open_ai")]
    OpenAi,
    /// One endpoint; body is `{type: "health"}` or `{type: "chat", message}`.
    SingleEndpoint,
}

/// Wire shape used to carry the chat stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Bodied streaming HTTP response.
    #[default]
    HttpStream,
    /// Message-oriented WebSocket connection.
    Websocket,
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Backend API settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Default generation parameters.
    #[serde(default)]
    pub defaults: GenerationDefaults,

    /// View behavior.
    #[serde(default)]
    pub ui: UiConfig,

    /// Where the conversation is persisted. `None` uses the platform data dir.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

/// Backend API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the backend (e.g. the public tunnel URL).
    #[serde(default = "ApiConfig::default_base_url")]
    pub base_url: String,

    /// Health probe path.
    #[serde(default = "ApiConfig::default_health_path")]
    pub health_path: String,

    /// Chat path.
    #[serde(default = "ApiConfig::default_chat_path")]
    pub chat_path: String,

    /// Path used by the single-endpoint dialect.
    #[serde(default = "ApiConfig::default_endpoint_path")]
    pub endpoint_path: String,

    /// Backend dialect.
    #[serde(default)]
    pub dialect: Dialect,

    /// Chat stream transport.
    #[serde(default)]
    pub transport: TransportKind,

    /// Per-request timeout in milliseconds.
    #[serde(default = "ApiConfig::default_timeout_ms")]
    pub timeout_ms: u64,

    /// Probe attempts per health cycle.
    #[serde(default = "ApiConfig::default_retry_count")]
    pub retry_count: u32,

    /// Linear backoff unit between probe attempts, in milliseconds.
    #[serde(default = "ApiConfig::default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Query parameter that asks the tunnel to skip its interstitial page.
    #[serde(default = "ApiConfig::default_interstitial_param")]
    pub interstitial_param: String,

    /// User agent sent with probes.
    #[serde(default = "ApiConfig::default_user_agent")]
    pub user_agent: String,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ApiConfig {
    fn default_base_url() -> String {
        "http://localhost:3000".to_string()
    }

    fn default_health_path() -> String {
        "/api/health".to_string()
    }

    fn default_chat_path() -> String {
        "/api/chat".to_string()
    }

    fn default_endpoint_path() -> String {
        "/api/stream".to_string()
    }

    const fn default_timeout_ms() -> u64 {
        30_000
    }

    const fn default_retry_count() -> u32 {
        3
    }

    const fn default_retry_base_delay_ms() -> u64 {
        1_000
    }

    fn default_interstitial_param() -> String {
        "skip_zrok_interstitial".to_string()
    }

    fn default_user_agent() -> String {
        format!("streamchat/{}", env!("CARGO_PKG_VERSION"))
    }

    /// Base URL without a trailing slash.
    #[must_use]
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Full URL of the health probe (or the single endpoint).
    #[must_use]
    pub fn health_url(&self) -> String {
        match self.dialect {
            Dialect::OpenAi => format!("{}{}", self.base(), self.health_path),
            Dialect::SingleEndpoint => format!("{}{}", self.base(), self.endpoint_path),
        }
    }

    /// Full URL of the chat request (or the single endpoint).
    #[must_use]
    pub fn chat_url(&self) -> String {
        match self.dialect {
            Dialect::OpenAi => format!("{}{}", self.base(), self.chat_path),
            Dialect::SingleEndpoint => format!("{}{}", self.base(), self.endpoint_path),
        }
    }

    /// Append the interstitial-skip parameter to a URL.
    #[must_use]
    pub fn with_skip_param(&self, url: &str) -> String {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}{}=true", self.interstitial_param)
    }

    /// Page the user opens to get past the tunnel interstitial.
    #[must_use]
    pub fn bypass_url(&self) -> String {
        self.with_skip_param(self.base())
    }

    /// Request timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff unit as a `Duration`.
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            health_path: Self::default_health_path(),
            chat_path: Self::default_chat_path(),
            endpoint_path: Self::default_endpoint_path(),
            dialect: Dialect::default(),
            transport: TransportKind::default(),
            timeout_ms: Self::default_timeout_ms(),
            retry_count: Self::default_retry_count(),
            retry_base_delay_ms: Self::default_retry_base_delay_ms(),
            interstitial_param: Self::default_interstitial_param(),
            user_agent: Self::default_user_agent(),
            headers: BTreeMap::new(),
        }
    }
}

/// Default generation parameters sent with each chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationDefaults {
    /// Maximum tokens to generate.
    #[serde(default = "GenerationDefaults::default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature.
    #[serde(default = "GenerationDefaults::default_temperature")]
    pub temperature: f32,

    /// System prompt used when none has been set.
    #[serde(default = "GenerationDefaults::default_system_prompt")]
    pub system_prompt: String,
}

impl GenerationDefaults {
    const fn default_max_tokens() -> u32 {
        2048
    }

    const fn default_temperature() -> f32 {
        0.7
    }

    fn default_system_prompt() -> String {
        "You are a helpful AI assistant. You must format your responses using Markdown."
            .to_string()
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: Self::default_max_tokens(),
            temperature: Self::default_temperature(),
            system_prompt: Self::default_system_prompt(),
        }
    }
}

/// View and timer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    /// Distance from the bottom, in rows, that still counts as "at the bottom".
    #[serde(default = "UiConfig::default_scroll_threshold")]
    pub scroll_threshold: u32,

    /// Interval between periodic health probes, in milliseconds.
    #[serde(default = "UiConfig::default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Delay before re-probing after the bypass link is opened, in milliseconds.
    #[serde(default = "UiConfig::default_bypass_reprobe_delay_ms")]
    pub bypass_reprobe_delay_ms: u64,

    /// How long transient errors stay visible, in milliseconds.
    #[serde(default = "UiConfig::default_error_display_ms")]
    pub error_display_ms: u64,
}

impl UiConfig {
    const fn default_scroll_threshold() -> u32 {
        3
    }

    const fn default_health_check_interval_ms() -> u64 {
        30_000
    }

    const fn default_bypass_reprobe_delay_ms() -> u64 {
        3_000
    }

    const fn default_error_display_ms() -> u64 {
        5_000
    }

    /// Health-check interval as a `Duration`.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Bypass re-probe delay as a `Duration`.
    #[must_use]
    pub fn bypass_reprobe_delay(&self) -> Duration {
        Duration::from_millis(self.bypass_reprobe_delay_ms)
    }

    /// Error display time as a `Duration`.
    #[must_use]
    pub fn error_display(&self) -> Duration {
        Duration::from_millis(self.error_display_ms)
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            scroll_threshold: Self::default_scroll_threshold(),
            health_check_interval_ms: Self::default_health_check_interval_ms(),
            bypass_reprobe_delay_ms: Self::default_bypass_reprobe_delay_ms(),
            error_display_ms: Self::default_error_display_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            defaults: GenerationDefaults::default(),
            ui: UiConfig::default(),
            storage_path: None,
        }
    }
}

impl ClientConfig {
    /// Load a config file, returning defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Default config file location under the platform config dir.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("streamchat").join("config.json"))
    }

    /// Check that values are usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api.base_url is empty".to_string()));
        }
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "api.base_url must be http(s): {}",
                self.api.base_url
            )));
        }
        if self.api.retry_count == 0 {
            return Err(ConfigError::Invalid("api.retry_count must be at least 1".to_string()));
        }
        if self.defaults.max_tokens == 0 {
            return Err(ConfigError::Invalid("defaults.max_tokens must be positive".to_string()));
        }
        if !(0.0..=2.0).contains(&self.defaults.temperature) {
            return Err(ConfigError::Invalid(format!(
                "defaults.temperature out of range: {}",
                self.defaults.temperature
            )));
        }
        Ok(())
    }
}
