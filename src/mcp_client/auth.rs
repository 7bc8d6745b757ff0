//! Per-request credentials.
//!
//! Static strategies (bearer, API key, custom headers) only set headers.
//! OAuth2 keeps a token set per server, refreshes it shortly before expiry
//! and falls back to an interactive authorization-code flow with PKCE when
//! no refresh is possible. Refresh and authorization are single-flighted per
//! server.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use reqwest::RequestBuilder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use url::Url;

use super::errors::{McpError, McpResult};
use super::server::{AuthConfig, RemoteServer, ServerId};
use super::single_flight::SingleFlight;
use crate::config::AuthSettings;

const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

// ─── Authorizer seam ─────────────────────────────────────────────────────────

/// An out-of-band authorization the user has to complete.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub server_id: ServerId,
    pub server_name: String,
    pub authorization_url: Url,
    pub state: String,
}

/// Opens the authorization URL somewhere a user can act on it.
///
/// The resulting code comes back through
/// [`AuthProvider::complete_authorization`].
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn request_authorization(&self, request: &AuthorizationRequest) -> Result<(), String>;
}

/// Headless default: logs the URL for an operator to open.
pub struct LoggingAuthorizer;

#[async_trait]
impl Authorizer for LoggingAuthorizer {
    async fn request_authorization(&self, request: &AuthorizationRequest) -> Result<(), String> {
        tracing::info!(
            server = %request.server_id,
            name = %request.server_name,
            url = %request.authorization_url,
            "authorization required, open this URL to continue"
        );
        Ok(())
    }
}

/// Refuses every interactive flow.
pub struct NoopAuthorizer;

#[async_trait]
impl Authorizer for NoopAuthorizer {
    async fn request_authorization(&self, _request: &AuthorizationRequest) -> Result<(), String> {
        Err("interactive authorization is not available".to_string())
    }
}

// ─── Tokens ──────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq)]
pub struct OAuthTokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl OAuthTokenSet {
    /// Whether the token expires within `margin` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at - margin <= now
    }

    fn from_response(
        response: TokenResponse,
        now: DateTime<Utc>,
        previous_refresh: Option<String>,
        requested_scopes: &[String],
    ) -> Self {
        let expires_in = response
            .expires_in
            .map(|s| s as i64)
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let scopes = match response.scope {
            Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
            None => requested_scopes.to_vec(),
        };
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh),
            expires_at: now + chrono::Duration::seconds(expires_in),
            scopes,
        }
    }
}

impl fmt::Debug for OAuthTokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// The OAuth2 fields of an [`AuthConfig`], borrowed.
struct OAuthParams<'a> {
    authorization_endpoint: &'a str,
    token_endpoint: &'a str,
    client_id: &'a str,
    client_secret: Option<&'a str>,
    scopes: &'a [String],
    uses_pkce: bool,
}

impl<'a> OAuthParams<'a> {
    fn from_config(auth: &'a AuthConfig) -> Option<Self> {
        match auth {
            AuthConfig::OAuth2 {
                authorization_endpoint,
                token_endpoint,
                client_id,
                client_secret,
                scopes,
                uses_pkce,
            } => Some(Self {
                authorization_endpoint,
                token_endpoint,
                client_id,
                client_secret: client_secret.as_deref(),
                scopes,
                uses_pkce: *uses_pkce,
            }),
            _ => None,
        }
    }
}

// ─── PKCE ────────────────────────────────────────────────────────────────────

/// Random URL-safe token of `bytes` bytes of entropy.
fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// S256 code challenge for `verifier`.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

// ─── Provider ────────────────────────────────────────────────────────────────

type PendingKey = (ServerId, String);

pub struct AuthProvider {
    http: reqwest::Client,
    settings: AuthSettings,
    tokens: Mutex<HashMap<ServerId, OAuthTokenSet>>,
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<String>>>,
    flights: SingleFlight<ServerId, McpResult<OAuthTokenSet>>,
    authorizer: Arc<dyn Authorizer>,
}

impl AuthProvider {
    pub fn new(settings: AuthSettings, authorizer: Arc<dyn Authorizer>) -> McpResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| McpError::ConnectionFailed {
                server: "*".into(),
                reason: format!("failed to build token client: {e}"),
            })?;
        Ok(Self {
            http,
            settings,
            tokens: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            flights: SingleFlight::new(),
            authorizer,
        })
    }

    /// Add credentials for `server` to `request`, refreshing or authorizing
    /// first when an OAuth2 token is missing or about to expire.
    pub async fn attach(
        self: &Arc<Self>,
        server: &RemoteServer,
        request: RequestBuilder,
    ) -> McpResult<RequestBuilder> {
        if OAuthParams::from_config(&server.auth).is_none() {
            return Ok(apply_static(&server.auth, request));
        }
        let tokens = self.access_token(server).await?;
        Ok(request.bearer_auth(tokens.access_token))
    }

    /// Make sure `server` holds usable credentials, refreshing or running
    /// the interactive flow when needed. Static auth needs nothing.
    pub async fn prepare(self: &Arc<Self>, server: &RemoteServer) -> McpResult<()> {
        if OAuthParams::from_config(&server.auth).is_some() {
            self.access_token(server).await?;
        }
        Ok(())
    }

    /// Like [`attach`](Self::attach) but never refreshes or prompts. OAuth2
    /// servers get the cached token if it is still valid, otherwise nothing.
    pub fn attach_cached(&self, server: &RemoteServer, request: RequestBuilder) -> RequestBuilder {
        if OAuthParams::from_config(&server.auth).is_none() {
            return apply_static(&server.auth, request);
        }
        match self.cached(&server.id) {
            Some(tokens) if tokens.expires_at > Utc::now() => request.bearer_auth(tokens.access_token),
            _ => request,
        }
    }

    async fn access_token(self: &Arc<Self>, server: &RemoteServer) -> McpResult<OAuthTokenSet> {
        if let Some(tokens) = self.cached(&server.id) {
            if !tokens.needs_refresh(Utc::now(), self.settings.refresh_margin()) {
                return Ok(tokens);
            }
        }
        self.refresh(server).await
    }

    /// Obtain a fresh token set. Concurrent callers for the same server share
    /// one attempt.
    pub async fn refresh(self: &Arc<Self>, server: &RemoteServer) -> McpResult<OAuthTokenSet> {
        let this = Arc::clone(self);
        let server = server.clone();
        self.flights
            .run(server.id.clone(), move || async move { this.obtain(&server).await })
            .await
    }

    async fn obtain(&self, server: &RemoteServer) -> McpResult<OAuthTokenSet> {
        let params = OAuthParams::from_config(&server.auth).ok_or_else(|| McpError::AuthFailed {
            server: server.id.to_string(),
            reason: "server is not configured for OAuth2".into(),
        })?;

        let previous = self.cached(&server.id);
        if let Some(tokens) = &previous {
            if !tokens.needs_refresh(Utc::now(), self.settings.refresh_margin()) {
                return Ok(tokens.clone());
            }
        }

        if let Some(refresh_token) = previous.and_then(|t| t.refresh_token) {
            match self.refresh_grant(server, &params, refresh_token).await {
                Ok(tokens) => {
                    tracing::info!(server = %server.id, expires_at = %tokens.expires_at, "oauth token refreshed");
                    self.store(&server.id, tokens.clone());
                    return Ok(tokens);
                }
                Err(e) => {
                    tracing::warn!(server = %server.id, error = %e, "token refresh failed, starting authorization");
                }
            }
        }

        let tokens = self.authorize_interactive(server, &params).await?;
        tracing::info!(server = %server.id, expires_at = %tokens.expires_at, "oauth authorization completed");
        self.store(&server.id, tokens.clone());
        Ok(tokens)
    }

    async fn refresh_grant(
        &self,
        server: &RemoteServer,
        params: &OAuthParams<'_>,
        refresh_token: String,
    ) -> McpResult<OAuthTokenSet> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", params.client_id.to_string()),
        ];
        if let Some(secret) = params.client_secret {
            form.push(("client_secret", secret.to_string()));
        }
        if !params.scopes.is_empty() {
            form.push(("scope", params.scopes.join(" ")));
        }
        let response = self.token_request(server, params.token_endpoint, &form).await?;
        Ok(OAuthTokenSet::from_response(
            response,
            Utc::now(),
            Some(refresh_token),
            params.scopes,
        ))
    }

    async fn authorize_interactive(
        &self,
        server: &RemoteServer,
        params: &OAuthParams<'_>,
    ) -> McpResult<OAuthTokenSet> {
        let state = random_token(24);
        let verifier = params.uses_pkce.then(|| random_token(64));
        let url = self.authorization_url(server, params, &state, verifier.as_deref())?;

        let key = (server.id.clone(), state.clone());
        let (tx, rx) = oneshot::channel();
        self.pending_lock().insert(key.clone(), tx);

        let request = AuthorizationRequest {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            authorization_url: url,
            state,
        };
        tracing::debug!(server = %server.id, "requesting interactive authorization");
        if let Err(reason) = self.authorizer.request_authorization(&request).await {
            self.pending_lock().remove(&key);
            return Err(McpError::AuthFailed {
                server: server.id.to_string(),
                reason,
            });
        }

        let timeout = self.settings.authorization_timeout();
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.pending_lock().remove(&key);
        let code = match outcome {
            Ok(Ok(code)) => code,
            Ok(Err(_)) => {
                return Err(McpError::AuthFailed {
                    server: server.id.to_string(),
                    reason: "authorization was abandoned".into(),
                })
            }
            Err(_) => {
                return Err(McpError::AuthorizationTimeout {
                    server: server.id.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        };

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", self.settings.redirect_uri.clone()),
            ("client_id", params.client_id.to_string()),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier", verifier));
        }
        if let Some(secret) = params.client_secret {
            form.push(("client_secret", secret.to_string()));
        }
        let response = self.token_request(server, params.token_endpoint, &form).await?;
        Ok(OAuthTokenSet::from_response(response, Utc::now(), None, params.scopes))
    }

    fn authorization_url(
        &self,
        server: &RemoteServer,
        params: &OAuthParams<'_>,
        state: &str,
        verifier: Option<&str>,
    ) -> McpResult<Url> {
        let mut url = Url::parse(params.authorization_endpoint).map_err(|e| McpError::AuthFailed {
            server: server.id.to_string(),
            reason: format!("invalid authorization endpoint: {e}"),
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", params.client_id)
                .append_pair("redirect_uri", &self.settings.redirect_uri)
                .append_pair("state", state);
            if !params.scopes.is_empty() {
                query.append_pair("scope", &params.scopes.join(" "));
            }
            if let Some(verifier) = verifier {
                query
                    .append_pair("code_challenge", &pkce_challenge(verifier))
                    .append_pair("code_challenge_method", "S256");
            }
        }
        Ok(url)
    }

    async fn token_request(
        &self,
        server: &RemoteServer,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> McpResult<TokenResponse> {
        let auth_failed = |reason: String| McpError::AuthFailed {
            server: server.id.to_string(),
            reason,
        };

        let response = self
            .http
            .post(endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| auth_failed(format!("token endpoint unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error = response
                .json::<TokenErrorResponse>()
                .await
                .map(|e| e.error)
                .unwrap_or_else(|_| "unknown_error".into());
            return Err(auth_failed(format!("token endpoint returned HTTP {}: {error}", status.as_u16())));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| auth_failed(format!("malformed token response: {e}")))
    }

    /// Deliver the authorization code for a pending flow.
    pub fn complete_authorization(&self, server_id: &ServerId, state: &str, code: String) -> McpResult<()> {
        let sender = self
            .pending_lock()
            .remove(&(server_id.clone(), state.to_string()))
            .ok_or_else(|| McpError::AuthFailed {
                server: server_id.to_string(),
                reason: "no pending authorization matches this state".into(),
            })?;
        sender.send(code).map_err(|_| McpError::AuthFailed {
            server: server_id.to_string(),
            reason: "authorization is no longer awaited".into(),
        })
    }

    /// Whether an interactive flow is waiting for a code.
    pub fn has_pending_authorization(&self, server_id: &ServerId) -> bool {
        self.pending_lock().keys().any(|(id, _)| id == server_id)
    }

    /// Drop the cached token after the server rejected it.
    pub fn invalidate(&self, server_id: &ServerId) {
        if self.tokens_lock().remove(server_id).is_some() {
            tracing::debug!(server = %server_id, "oauth token invalidated");
        }
    }

    /// Drop everything held for a removed server.
    pub fn forget(&self, server_id: &ServerId) {
        self.tokens_lock().remove(server_id);
        self.pending_lock().retain(|(id, _), _| id != server_id);
    }

    fn cached(&self, server_id: &ServerId) -> Option<OAuthTokenSet> {
        self.tokens_lock().get(server_id).cloned()
    }

    fn store(&self, server_id: &ServerId, tokens: OAuthTokenSet) {
        self.tokens_lock().insert(server_id.clone(), tokens);
    }

    #[cfg(test)]
    pub(crate) fn seed_token(&self, server_id: &ServerId, tokens: OAuthTokenSet) {
        self.store(server_id, tokens);
    }

    fn tokens_lock(&self) -> std::sync::MutexGuard<'_, HashMap<ServerId, OAuthTokenSet>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<PendingKey, oneshot::Sender<String>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_static(auth: &AuthConfig, request: RequestBuilder) -> RequestBuilder {
    match auth {
        AuthConfig::None | AuthConfig::OAuth2 { .. } => request,
        AuthConfig::Bearer { token } => request.bearer_auth(token),
        AuthConfig::ApiKey { header_name, value } => request.header(header_name.as_str(), value.as_str()),
        AuthConfig::CustomHeaders { headers } => headers
            .iter()
            .fold(request, |r, (name, value)| r.header(name.as_str(), value.as_str())),
    }
}
