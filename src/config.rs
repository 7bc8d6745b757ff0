//! Hub configuration loading.
//!
//! Reads `hub.yaml` and resolves environment variables. Every section is
//! optional; missing values take the defaults below. Components receive
//! their section explicitly at construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::mcp_client::{ErrorKind, HealthPolicy};

/// Env var that points at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCPHUB_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("invalid config value '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::ReadFailed { .. } => ErrorKind::Internal,
            ConfigError::ParseFailed { .. } | ConfigError::InvalidValue { .. } => {
                ErrorKind::Validation
            }
        }
    }
}

// ─── Sections ────────────────────────────────────────────────────────────────

/// HTTP transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Bounds the `initialize` handshake.
    pub connect_timeout_secs: u64,
    /// Bounds a whole call, streaming included.
    pub call_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    /// Sent as `clientInfo.name`.
    pub client_name: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            call_timeout_secs: 60,
            pool_max_idle_per_host: 5,
            client_name: "mcphub".to_string(),
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Health defaults inherited by new servers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub probe_timeout_secs: u64,
    pub failure_threshold: u32,
    pub soft_recovery_successes: u32,
    pub full_recovery_successes: u32,
    pub ema_alpha: f64,
    pub default_interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        let policy = HealthPolicy::default();
        Self {
            probe_timeout_secs: policy.timeout_seconds,
            failure_threshold: policy.failure_threshold,
            soft_recovery_successes: policy.soft_recovery_successes,
            full_recovery_successes: policy.full_recovery_successes,
            ema_alpha: policy.ema_alpha,
            default_interval_secs: policy.interval_seconds,
        }
    }
}

impl HealthSettings {
    /// Policy for a server that only chose `enabled` and an interval.
    pub fn policy(&self, enabled: bool, interval_seconds: Option<u64>) -> HealthPolicy {
        HealthPolicy {
            enabled,
            interval_seconds: interval_seconds.unwrap_or(self.default_interval_secs),
            timeout_seconds: self.probe_timeout_secs,
            failure_threshold: self.failure_threshold,
            soft_recovery_successes: self.soft_recovery_successes,
            full_recovery_successes: self.full_recovery_successes,
            ema_alpha: self.ema_alpha,
        }
    }
}

/// Task registry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// How long a signalled operation may keep running before it is aborted.
    pub cancel_grace_secs: u64,
    /// Terminal tasks kept in memory.
    pub max_history: usize,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            cancel_grace_secs: 5,
            max_history: 200,
        }
    }
}

/// OAuth settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Tokens expiring within this window are refreshed before use.
    pub refresh_margin_secs: u64,
    /// How long to wait for the out-of-band authorization callback.
    pub authorization_timeout_secs: u64,
    pub redirect_uri: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 300,
            authorization_timeout_secs: 300,
            redirect_uri: "http://127.0.0.1:8765/oauth/callback".to_string(),
        }
    }
}

impl AuthSettings {
    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_margin_secs as i64)
    }

    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_secs(self.authorization_timeout_secs)
    }
}

/// Top-level config (mirrors `hub.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub transport: TransportSettings,
    pub health: HealthSettings,
    pub tasks: TaskSettings,
    pub auth: AuthSettings,
    pub database_path: Option<String>,
}

impl HubConfig {
    /// Reject values the components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("transport.connect_timeout_secs", self.transport.connect_timeout_secs),
            ("transport.call_timeout_secs", self.transport.call_timeout_secs),
            ("health.probe_timeout_secs", self.health.probe_timeout_secs),
            ("health.default_interval_secs", self.health.default_interval_secs),
            ("auth.authorization_timeout_secs", self.auth.authorization_timeout_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be positive"));
            }
        }
        self.health
            .policy(true, None)
            .validate()
            .map_err(|e| invalid("health", &e.to_string()))?;
        url::Url::parse(&self.auth.redirect_uri)
            .map_err(|e| invalid("auth.redirect_uri", &e.to_string()))?;
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config file location.
///
/// `MCPHUB_CONFIG` wins; otherwise `<data_dir>/hub.yaml`. Returns `None` when
/// neither exists.
pub fn find_config_path(data_dir: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }
    let candidate = data_dir.join("hub.yaml");
    candidate.exists().then_some(candidate)
}

/// Load and parse a config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<HubConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse config text. An empty document yields the defaults.
pub fn parse_config(raw: &str) -> Result<HubConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(HubConfig::default());
    }

    let mut config: HubConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?;
    config.database_path = config.database_path.map(|p| expand_tilde(&p));
    config.validate()?;
    Ok(config)
}

/// Config from the resolved path, or defaults when there is no file.
pub fn load_or_default(data_dir: &Path) -> Result<HubConfig, ConfigError> {
    match find_config_path(data_dir) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading hub config");
            load_config(&path)
        }
        None => {
            tracing::info!("no hub config found, using defaults");
            Ok(HubConfig::default())
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
