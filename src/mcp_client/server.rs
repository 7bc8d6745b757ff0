//! Remote server definitions: identity, endpoint, credentials, health policy.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::errors::{McpError, McpResult};
use super::health::HealthStatus;
use super::types::{Implementation, ServerCapabilities};
use crate::events::Versioned;

// ─── Identity ────────────────────────────────────────────────────────────────

/// Opaque, stable server identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ─── Credentials ─────────────────────────────────────────────────────────────

/// How requests to a server are authenticated.
///
/// Secret-bearing variants never appear in `Debug` output.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AuthConfig {
    None,
    Bearer {
        token: String,
    },
    ApiKey {
        header_name: String,
        value: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        authorization_endpoint: String,
        token_endpoint: String,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        #[serde(default)]
        scopes: Vec<String>,
        #[serde(default = "default_true")]
        uses_pkce: bool,
    },
    CustomHeaders {
        headers: BTreeMap<String, String>,
    },
}

fn default_true() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::None
    }
}

impl AuthConfig {
    /// Short label for logs and status views.
    pub fn auth_type(&self) -> &'static str {
        match self {
            AuthConfig::None => "none",
            AuthConfig::Bearer { .. } => "bearer",
            AuthConfig::ApiKey { .. } => "api_key",
            AuthConfig::OAuth2 { .. } => "oauth2",
            AuthConfig::CustomHeaders { .. } => "custom_headers",
        }
    }

    /// Shape checks only; no network I/O.
    pub fn validate(&self) -> McpResult<()> {
        match self {
            AuthConfig::None => Ok(()),
            AuthConfig::Bearer { token } => {
                if token.trim().is_empty() {
                    return Err(McpError::invalid("auth.token", "bearer token is empty"));
                }
                Ok(())
            }
            AuthConfig::ApiKey { header_name, value } => {
                validate_header_name("auth.headerName", header_name)?;
                if value.is_empty() {
                    return Err(McpError::invalid("auth.value", "api key is empty"));
                }
                Ok(())
            }
            AuthConfig::OAuth2 {
                authorization_endpoint,
                token_endpoint,
                client_id,
                ..
            } => {
                validate_https("auth.authorizationEndpoint", authorization_endpoint)?;
                validate_https("auth.tokenEndpoint", token_endpoint)?;
                if client_id.trim().is_empty() {
                    return Err(McpError::invalid("auth.clientId", "client id is empty"));
                }
                Ok(())
            }
            AuthConfig::CustomHeaders { headers } => {
                if headers.is_empty() {
                    return Err(McpError::invalid("auth.headers", "no headers given"));
                }
                for name in headers.keys() {
                    validate_header_name("auth.headers", name)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::None => f.write_str("None"),
            AuthConfig::Bearer { .. } => f.debug_struct("Bearer").field("token", &"<redacted>").finish(),
            AuthConfig::ApiKey { header_name, .. } => f
                .debug_struct("ApiKey")
                .field("header_name", header_name)
                .field("value", &"<redacted>")
                .finish(),
            AuthConfig::OAuth2 {
                authorization_endpoint,
                token_endpoint,
                client_id,
                client_secret,
                scopes,
                uses_pkce,
            } => f
                .debug_struct("OAuth2")
                .field("authorization_endpoint", authorization_endpoint)
                .field("token_endpoint", token_endpoint)
                .field("client_id", client_id)
                .field("client_secret", &client_secret.as_ref().map(|_| "<redacted>"))
                .field("scopes", scopes)
                .field("uses_pkce", uses_pkce)
                .finish(),
            AuthConfig::CustomHeaders { headers } => f
                .debug_struct("CustomHeaders")
                .field("headers", &headers.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

fn validate_header_name(field: &str, name: &str) -> McpResult<()> {
    reqwest::header::HeaderName::from_bytes(name.as_bytes())
        .map(|_| ())
        .map_err(|_| McpError::invalid(field, format!("'{name}' is not a valid header name")))
}

// ─── Health policy ───────────────────────────────────────────────────────────

/// Per-server probing and classification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthPolicy {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    /// Consecutive failures before a server is unhealthy.
    pub failure_threshold: u32,
    /// Successes that lift an unhealthy server to degraded.
    pub soft_recovery_successes: u32,
    /// Consecutive successes that lift a degraded server to healthy.
    pub full_recovery_successes: u32,
    /// Smoothing factor for the latency moving average, in (0, 1].
    pub ema_alpha: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            timeout_seconds: 5,
            failure_threshold: 3,
            soft_recovery_successes: 1,
            full_recovery_successes: 2,
            ema_alpha: 0.3,
        }
    }
}

impl HealthPolicy {
    pub fn validate(&self) -> McpResult<()> {
        if self.interval_seconds == 0 {
            return Err(McpError::invalid("healthPolicy.intervalSeconds", "must be positive"));
        }
        if self.timeout_seconds == 0 {
            return Err(McpError::invalid("healthPolicy.timeoutSeconds", "must be positive"));
        }
        if self.failure_threshold == 0 {
            return Err(McpError::invalid("healthPolicy.failureThreshold", "must be positive"));
        }
        if self.soft_recovery_successes == 0 || self.full_recovery_successes == 0 {
            return Err(McpError::invalid("healthPolicy.recovery", "must be positive"));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(McpError::invalid("healthPolicy.emaAlpha", "must be in (0, 1]"));
        }
        Ok(())
    }
}

// ─── Server definition ───────────────────────────────────────────────────────

/// A registered remote MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServer {
    pub id: ServerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub endpoint: String,
    pub auth: AuthConfig,
    pub health_policy: HealthPolicy,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ServerCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bus revision of the last mutation.
    pub version: u64,
}

impl Versioned for RemoteServer {
    type Key = ServerId;

    fn key(&self) -> ServerId {
        self.id.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Negotiated connection state for one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Absent when the server runs stateless.
    pub session_id: Option<String>,
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    pub established_at: DateTime<Utc>,
}

/// Input for registering a server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServer {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub endpoint: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub health_policy: HealthPolicy,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NewServer {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            endpoint: endpoint.into(),
            auth: AuthConfig::None,
            health_policy: HealthPolicy::default(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.health_policy = policy;
        self
    }

    pub fn validate(&self) -> McpResult<()> {
        validate_name(&self.name)?;
        validate_https("endpoint", &self.endpoint)?;
        self.auth.validate()?;
        self.health_policy.validate()
    }
}

/// Partial edit of a registered server. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub endpoint: Option<String>,
    pub auth: Option<AuthConfig>,
    pub health_policy: Option<HealthPolicy>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ServerUpdate {
    pub fn validate(&self) -> McpResult<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(endpoint) = &self.endpoint {
            validate_https("endpoint", endpoint)?;
        }
        if let Some(auth) = &self.auth {
            auth.validate()?;
        }
        if let Some(policy) = &self.health_policy {
            policy.validate()?;
        }
        Ok(())
    }

    /// Whether applying this edit invalidates an established session.
    pub fn touches_connection(&self, current: &RemoteServer) -> bool {
        self.endpoint.as_ref().is_some_and(|e| *e != current.endpoint)
            || self.auth.as_ref().is_some_and(|a| *a != current.auth)
    }
}

fn validate_name(name: &str) -> McpResult<()> {
    if name.trim().is_empty() {
        return Err(McpError::invalid("name", "must not be empty"));
    }
    Ok(())
}

/// Endpoints must be absolute https URLs.
pub fn validate_https(field: &str, raw: &str) -> McpResult<Url> {
    let url = Url::parse(raw).map_err(|e| McpError::invalid(field, format!("not a valid URL: {e}")))?;
    if url.scheme() != "https" {
        return Err(McpError::invalid(field, "scheme must be https"));
    }
    if url.host_str().is_none() {
        return Err(McpError::invalid(field, "missing host"));
    }
    Ok(url)
}
