use crate::credentials::INSECURE_DEFAULT_SECRET;
use crate::rate_limit::{DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_SECONDS};
use crate::token_cache::DEFAULT_TTL_SECONDS;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

/// Prefix for environment overrides (e.g. `AGENTLINK_CONSUMER_KEY`)
pub const ENV_PREFIX: &str = "AGENTLINK_";

/// Upper bound for the token TTL and the limiter window (one year).
pub const MAX_PERIOD_SECONDS: i64 = 365 * 24 * 60 * 60;

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub token_cache: TokenCacheConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Configuration errors. All of them abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("platform consumer key and consumer secret are required (set AGENTLINK_CONSUMER_KEY and AGENTLINK_CONSUMER_SECRET)")]
    MissingConsumerCredentials,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Deployment environment. Only affects how loudly insecure settings are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }
}

/// HTTP server and storage
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Where the callback endpoint sends the browser when the flow ends
    #[serde(default = "default_app_redirect_url")]
    pub app_redirect_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_path() -> String {
    "credentials.db".to_string()
}

fn default_app_redirect_url() -> String {
    "http://localhost:3000/dashboard/agents".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            app_redirect_url: default_app_redirect_url(),
        }
    }
}

/// OAuth 1.0a endpoints and consumer credentials of the social platform
#[derive(Clone, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
    #[serde(default = "default_request_token_url")]
    pub request_token_url: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_access_token_url")]
    pub access_token_url: String,
    /// Public base URL of this service; the platform redirects back to it
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_token_url() -> String {
    "https://api.twitter.com/oauth/request_token".to_string()
}

fn default_authorize_url() -> String {
    "https://api.twitter.com/oauth/authorize".to_string()
}

fn default_access_token_url() -> String {
    "https://api.twitter.com/oauth/access_token".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            request_token_url: default_request_token_url(),
            authorize_url: default_authorize_url(),
            access_token_url: default_access_token_url(),
            callback_base_url: default_callback_base_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("request_token_url", &self.request_token_url)
            .field("authorize_url", &self.authorize_url)
            .field("access_token_url", &self.access_token_url)
            .field("callback_base_url", &self.callback_base_url)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

/// Secret-at-rest encryption
#[derive(Clone, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_master_secret")]
    pub master_secret: String,
    #[serde(default)]
    pub environment: Environment,
}

fn default_master_secret() -> String {
    INSECURE_DEFAULT_SECRET.to_string()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            master_secret: default_master_secret(),
            environment: Environment::default(),
        }
    }
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("master_secret", &"<redacted>")
            .field("environment", &self.environment)
            .finish()
    }
}

/// Flow-initiation rate limit
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: i64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_window_seconds() -> i64 {
    DEFAULT_WINDOW_SECONDS
}

fn default_max_requests() -> u32 {
    DEFAULT_MAX_REQUESTS
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            max_requests: default_max_requests(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Request-token cache
#[derive(Debug, Clone, Deserialize)]
pub struct TokenCacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_ttl_seconds() -> i64 {
    DEFAULT_TTL_SECONDS
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Bearer tokens accepted on the management endpoints, mapped to caller identities
#[derive(Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("tokens", &format!("<{} entries>", self.tokens.len()))
            .finish()
    }
}

impl AppConfig {
    /// Applies `AGENTLINK_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok());
    }

    /// Applies overrides from `lookup`, keyed by the variable name without prefix.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("DATABASE_PATH") {
            self.server.database_path = v;
        }
        if let Some(v) = lookup("APP_REDIRECT_URL") {
            self.server.app_redirect_url = v;
        }
        if let Some(v) = lookup("CONSUMER_KEY") {
            self.platform.consumer_key = v;
        }
        if let Some(v) = lookup("CONSUMER_SECRET") {
            self.platform.consumer_secret = v;
        }
        if let Some(v) = lookup("CALLBACK_BASE_URL") {
            self.platform.callback_base_url = v;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.platform.request_timeout_seconds = n;
            }
        }
        if let Some(v) = lookup("MASTER_SECRET") {
            self.encryption.master_secret = v;
        }
        if let Some(v) = lookup("ENVIRONMENT") {
            if let Some(env) = Environment::parse(&v) {
                self.encryption.environment = env;
            }
        }
        if let Some(v) = lookup("RATE_LIMIT_WINDOW_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.rate_limit.window_seconds = n;
            }
        }
        if let Some(v) = lookup("RATE_LIMIT_MAX_REQUESTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.rate_limit.max_requests = n;
            }
        }
        if let Some(v) = lookup("TOKEN_CACHE_TTL_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.token_cache.ttl_seconds = n;
            }
        }
    }

    /// Checks the settings startup depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.platform.consumer_key.trim().is_empty()
            || self.platform.consumer_secret.trim().is_empty()
        {
            return Err(ConfigError::MissingConsumerCredentials);
        }
        if self.encryption.master_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "encryption.master_secret must not be empty".to_string(),
            ));
        }
        if self.rate_limit.window_seconds <= 0 || self.rate_limit.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_seconds and rate_limit.max_requests must be positive"
                    .to_string(),
            ));
        }
        if self.rate_limit.window_seconds > MAX_PERIOD_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.window_seconds must not exceed {}",
                MAX_PERIOD_SECONDS
            )));
        }
        if self.token_cache.ttl_seconds <= 0 {
            return Err(ConfigError::Invalid(
                "token_cache.ttl_seconds must be positive".to_string(),
            ));
        }
        if self.token_cache.ttl_seconds > MAX_PERIOD_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "token_cache.ttl_seconds must not exceed {}",
                MAX_PERIOD_SECONDS
            )));
        }
        if self.platform.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "platform.request_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.rate_limit.sweep_interval_seconds == 0
            || self.token_cache.sweep_interval_seconds == 0
        {
            return Err(ConfigError::Invalid(
                "sweep intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Loads the file if it exists, applies environment overrides and validates.
pub fn load(path: &str) -> Result<AppConfig, ConfigError> {
    let mut config = if std::path::Path::new(path).exists() {
        load_config(path)?
    } else {
        AppConfig::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
