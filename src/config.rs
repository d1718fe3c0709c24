//! Configuration loading and validation.
//!
//! Loads `./courier.toml` (or `$COURIER_CONFIG`), then applies `COURIER_*`
//! environment overrides. A `.env` file in the working directory is read
//! into the environment first.
//!
//! Precedence: env vars > config file > defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::backend::BackendConfig;
use crate::pipeline::queue::QueueConfig;
use crate::pipeline::retry::RetryPolicy;
use crate::protocol::bot_api::BotApiConfig;
use crate::types::AccountCredential;

/// Environment variable naming the config file.
pub const CONFIG_PATH_VAR: &str = "COURIER_CONFIG";

/// Config file used when [`CONFIG_PATH_VAR`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "courier.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend endpoints.
    pub backend: BackendSection,
    /// Administrative HTTP surface.
    pub admin: AdminSection,
    /// Delivery queue tunables.
    pub queue: QueueSection,
    /// Retry and timeout tunables.
    pub retry: RetrySection,
    /// Connection supervisor tunables.
    pub supervisor: SupervisorSection,
    /// Media deduplication.
    pub media: MediaSection,
    /// Avatar cache.
    pub photos: PhotosSection,
    /// Telegram Bot API client.
    pub telegram: TelegramSection,
    /// Environment account pool.
    pub accounts: AccountsSection,
    /// Log output.
    pub logging: LoggingSection,
}

impl Config {
    /// Load configuration from `.env`, the TOML file and the environment,
    /// then validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// mandatory setting is missing or invalid.
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using a custom env resolver (for testing).
    ///
    /// # Errors
    ///
    /// As [`Config::load`].
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = config_path_with(&env);
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(&env);
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Parse a TOML string into config, without overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests never touch the process
    /// environment. Unparseable numeric values are logged and ignored.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("COURIER_BACKEND_URL") {
            self.backend.base_url = v;
        }
        if let Some(v) = env("COURIER_BACKEND_API_KEY") {
            self.backend.api_key = Some(v).filter(|k| !k.is_empty());
        }
        if let Some(v) = env("COURIER_ADMIN_BIND") {
            self.admin.bind = v;
        }
        if let Some(v) = env("COURIER_ADMIN_SECRET") {
            self.admin.secret = v;
        }
        if let Some(v) = env("COURIER_BOT_TOKENS") {
            self.accounts.bot_tokens = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(v) = env("COURIER_LOG_DIR") {
            self.logging.dir = PathBuf::from(v);
        }
        if let Some(v) = env("COURIER_TELEGRAM_API_BASE") {
            self.telegram.api_base = v;
        }

        override_parsed(&env, "COURIER_MAX_CONCURRENT", &mut self.queue.max_concurrent);
        override_parsed(&env, "COURIER_MAX_QUEUE_SIZE", &mut self.queue.max_queue_size);
        override_parsed(&env, "COURIER_MAX_RETRIES", &mut self.retry.max_retries);
        override_parsed(&env, "COURIER_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms);
        override_parsed(&env, "COURIER_RETRY_MULTIPLIER", &mut self.retry.multiplier);
        override_parsed(&env, "COURIER_RETRY_MAX_DELAY_MS", &mut self.retry.max_delay_ms);
        override_parsed(
            &env,
            "COURIER_PROBE_INTERVAL_SECS",
            &mut self.supervisor.probe_interval_secs,
        );
    }

    /// Check mandatory settings and tunable ranges.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.backend.base_url.trim().is_empty() {
            bail!("backend base URL is required (set COURIER_BACKEND_URL or [backend] base_url)");
        }
        let url = url::Url::parse(&self.backend.base_url)
            .with_context(|| format!("invalid backend base URL: {}", self.backend.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("backend base URL must use http or https, got {}", url.scheme());
        }
        if self.admin.secret.trim().is_empty() {
            bail!("admin secret is required (set COURIER_ADMIN_SECRET or [admin] secret)");
        }
        self.admin_addr()?;
        if self.queue.max_concurrent == 0 {
            bail!("queue.max_concurrent must be at least 1");
        }
        if self.queue.max_queue_size == 0 {
            bail!("queue.max_queue_size must be at least 1");
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be at least 1.0");
        }
        if self.retry.call_timeout_secs == 0 {
            bail!("retry.call_timeout_secs must be at least 1");
        }
        if self.supervisor.probe_interval_secs == 0 {
            bail!("supervisor.probe_interval_secs must be at least 1");
        }
        Ok(())
    }

    /// Parsed admin bind address.
    ///
    /// # Errors
    ///
    /// Returns an error if `admin.bind` is not a socket address.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        self.admin
            .bind
            .parse()
            .with_context(|| format!("invalid admin bind address: {}", self.admin.bind))
    }

    /// Queue settings for [`crate::pipeline::queue::DeliveryQueue`].
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.queue.max_concurrent,
            max_queue_size: self.queue.max_queue_size,
            dispatch_delay: Duration::from_millis(self.queue.dispatch_delay_ms),
            shutdown_grace: Duration::from_secs(self.queue.shutdown_grace_secs),
        }
    }

    /// Backoff settings for [`crate::pipeline::retry::RetryExecutor`].
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            call_timeout: Duration::from_secs(self.retry.call_timeout_secs),
        }
    }

    /// Endpoint settings for [`crate::backend::BackendClient`].
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            base_url: self.backend.base_url.clone(),
            api_key: self.backend.api_key.clone(),
            ingest_path: self.backend.ingest_path.clone(),
            assets_path: self.backend.assets_path.clone(),
            roster_path: self.backend.roster_path.clone(),
            request_timeout: Duration::from_secs(self.retry.call_timeout_secs),
        }
    }

    /// Settings for [`crate::protocol::bot_api::BotApiFactory`].
    pub fn bot_api_config(&self) -> BotApiConfig {
        BotApiConfig {
            api_base: self.telegram.api_base.clone(),
            poll_timeout_secs: self.telegram.poll_timeout_secs,
        }
    }

    /// Credentials of the environment account pool. Malformed tokens are
    /// logged and skipped.
    pub fn env_accounts(&self) -> Vec<AccountCredential> {
        self.accounts
            .bot_tokens
            .iter()
            .filter_map(|token| {
                let credential = AccountCredential::from_token(token);
                if credential.is_none() {
                    tracing::warn!("ignoring malformed bot token in account pool");
                }
                credential
            })
            .collect()
    }
}

/// Resolve the config file path using a custom env resolver.
fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    env(CONFIG_PATH_VAR)
        .filter(|p| !p.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
}

fn override_parsed<T: FromStr>(env: impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(v) = env(key) {
        match v.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

// ── Sections ────────────────────────────────────────────────────

/// Backend endpoints (`[backend]`).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    /// Base URL of the backend. Required.
    pub base_url: String,
    /// Bearer token for backend requests.
    pub api_key: Option<String>,
    /// Ingestion endpoint path.
    pub ingest_path: String,
    /// Asset endpoint path.
    pub assets_path: String,
    /// Roster endpoint path.
    pub roster_path: String,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            ingest_path: "/api/telegram/ingest".to_owned(),
            assets_path: "/api/telegram/assets".to_owned(),
            roster_path: "/api/telegram/accounts".to_owned(),
        }
    }
}

impl std::fmt::Debug for BackendSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSection")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("ingest_path", &self.ingest_path)
            .field("assets_path", &self.assets_path)
            .field("roster_path", &self.roster_path)
            .finish()
    }
}

/// Administrative surface (`[admin]`).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    /// Listen address.
    pub bind: String,
    /// Shared secret expected in the `x-admin-secret` header. Required.
    pub secret: String,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_owned(),
            secret: String::new(),
        }
    }
}

impl std::fmt::Debug for AdminSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSection")
            .field("bind", &self.bind)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Delivery queue (`[queue]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Ceiling on simultaneous deliveries.
    pub max_concurrent: usize,
    /// Pending buffer capacity.
    pub max_queue_size: usize,
    /// Pause between dispatch cycles, in milliseconds.
    pub dispatch_delay_ms: u64,
    /// Grace period for in-flight deliveries at shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 1000,
            dispatch_delay_ms: 100,
            shutdown_grace_secs: 10,
        }
    }
}

/// Retry executor (`[retry]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff growth factor.
    pub multiplier: f64,
    /// Backoff ceiling, in milliseconds.
    pub max_delay_ms: u64,
    /// Timeout per backend call, in seconds.
    pub call_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            call_timeout_secs: 30,
        }
    }
}

/// Connection supervisor (`[supervisor]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Seconds between probe cycles.
    pub probe_interval_secs: u64,
    /// Pause between account connects during bulk startup, in milliseconds.
    pub connect_spacing_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            connect_spacing_ms: 1000,
        }
    }
}

/// Media deduplication (`[media]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaSection {
    /// Whether attached media is downloaded and uploaded.
    pub enabled: bool,
    /// Largest media accepted, in bytes.
    pub max_bytes: u64,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: crate::pipeline::media::DEFAULT_MAX_BYTES,
        }
    }
}

/// Avatar cache (`[photos]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhotosSection {
    /// Whether chat avatars are attached to messages.
    pub enabled: bool,
    /// Freshness window, in seconds.
    pub ttl_secs: u64,
}

impl Default for PhotosSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
        }
    }
}

/// Telegram Bot API (`[telegram]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    /// API base URL.
    pub api_base: String,
    /// Long-poll timeout, in seconds.
    pub poll_timeout_secs: u32,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            api_base: crate::protocol::bot_api::DEFAULT_API_BASE.to_owned(),
            poll_timeout_secs: 30,
        }
    }
}

/// Environment account pool (`[accounts]`).
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountsSection {
    /// Bot tokens, merged with the backend roster.
    pub bot_tokens: Vec<String>,
}

impl std::fmt::Debug for AccountsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountsSection")
            .field("bot_tokens", &format!("[{} REDACTED]", self.bot_tokens.len()))
            .finish()
    }
}

/// Log output (`[logging]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for rotated JSON logs.
    pub dir: PathBuf,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
        }
    }
}
