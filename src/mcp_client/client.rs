//! MCP client: JSON-RPC over streamable HTTP.
//!
//! Owns the per-server handshake, tool calls in unary and streaming mode,
//! cancellation of in-flight calls, and discovery (`tools/list`,
//! `resources/list`, `prompts/list`). Session state lives in the
//! [`ServerRegistry`]; credentials come from the [`AuthProvider`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::auth::AuthProvider;
use super::errors::{McpError, McpResult};
use super::registry::ServerRegistry;
use super::server::{RemoteServer, ServerId, Session};
use super::single_flight::SingleFlight;
use super::sse::json_frames;
use super::types::{
    CallToolParams, ClientNotification, ClientRequest, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Prompt, PromptsPage, RequestMeta,
    Resource, ResourcesPage, ServerMessage, ServerNotification, Tool, ToolCallResult, ToolsPage,
    PROTOCOL_VERSION_HEADER, SESSION_HEADER, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::config::TransportSettings;

// ─── Constants ───────────────────────────────────────────────────────────────

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Upper bound on `nextCursor` pages for a single listing.
const MAX_PAGES: usize = 64;

/// How much of an error body is kept in error messages.
const ERROR_BODY_LIMIT: usize = 512;

// ─── Call options ────────────────────────────────────────────────────────────

/// A `notifications/progress` frame addressed to one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub call_id: u64,
    pub progress: f64,
    pub total: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
pub enum CallMode {
    /// Wait for the single terminal result.
    #[default]
    Unary,
    /// Forward progress frames to the sender, in arrival order.
    Streaming(mpsc::UnboundedSender<ProgressUpdate>),
}

#[derive(Debug, Default)]
pub struct CallOptions {
    pub mode: CallMode,
    /// Cancelling this token cancels the call.
    pub cancel: Option<CancellationToken>,
    /// Overrides the configured call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn streaming(progress: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self {
            mode: CallMode::Streaming(progress),
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A tool call that has been assigned an id but not yet awaited.
pub struct PendingCall {
    call_id: u64,
    future: BoxFuture<'static, McpResult<ToolCallResult>>,
}

impl PendingCall {
    /// Id usable with [`McpClient::cancel_call`]. Also the JSON-RPC request id.
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub async fn wait(self) -> McpResult<ToolCallResult> {
        self.future.await
    }
}

struct ProgressSink {
    call_id: u64,
    token: Value,
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSink {
    fn forward(&self, progress_token: &Value, progress: f64, total: Option<f64>, message: Option<String>) {
        if *progress_token != self.token {
            return;
        }
        let _ = self.tx.send(ProgressUpdate {
            call_id: self.call_id,
            progress,
            total,
            message,
        });
    }
}

struct ActiveCall {
    server_id: ServerId,
    cancel: CancellationToken,
}

enum PostOutcome {
    Accepted(reqwest::Response),
    /// 404 for a request that carried a session id.
    SessionExpired,
}

enum Interrupted {
    Cancelled,
    TimedOut,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

struct Inner {
    http: reqwest::Client,
    settings: TransportSettings,
    servers: Arc<ServerRegistry>,
    auth: Arc<AuthProvider>,
    next_id: AtomicU64,
    handshakes: SingleFlight<ServerId, McpResult<Session>>,
    calls: Mutex<HashMap<u64, ActiveCall>>,
}

/// Transport client shared by every caller. Cheap to clone.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<Inner>,
}

/// Removes a call from the active set however its future ends.
struct CallGuard {
    client: McpClient,
    call_id: u64,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.client.calls().remove(&self.call_id);
    }
}

impl McpClient {
    pub fn new(
        settings: TransportSettings,
        servers: Arc<ServerRegistry>,
        auth: Arc<AuthProvider>,
    ) -> McpResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .build()
            .map_err(|e| McpError::ConnectionFailed {
                server: "*".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                settings,
                servers,
                auth,
                next_id: AtomicU64::new(1),
                handshakes: SingleFlight::new(),
                calls: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.inner.servers
    }

    fn next_request_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<u64, ActiveCall>> {
        self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Sessions ────────────────────────────────────────────────────────

    /// Ensure a session with `server_id`, performing the handshake if none
    /// is held. Concurrent callers share one handshake.
    pub async fn connect(&self, server_id: &ServerId) -> McpResult<Session> {
        if let Some(session) = self.inner.servers.session(server_id) {
            return Ok(session);
        }
        let client = self.clone();
        let id = server_id.clone();
        self.inner
            .handshakes
            .run(server_id.clone(), move || async move { client.handshake(&id).await })
            .await
    }

    async fn handshake(&self, server_id: &ServerId) -> McpResult<Session> {
        if let Some(session) = self.inner.servers.session(server_id) {
            return Ok(session);
        }
        let (server, generation) = self.inner.servers.get_with_generation(server_id)?;
        // Authorization has its own deadline; the connect timeout covers network I/O only.
        self.inner.auth.prepare(&server).await?;
        let timeout = self.inner.settings.connect_timeout();

        let session = match tokio::time::timeout(timeout, self.initialize(&server)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(McpError::Timeout {
                    server: server_id.to_string(),
                    operation: "initialize".into(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        if !self.inner.servers.set_session(server_id, generation, session.clone())? {
            return Err(McpError::ConnectionFailed {
                server: server_id.to_string(),
                reason: "server configuration changed during the handshake".into(),
            });
        }
        tracing::info!(
            server = %server_id,
            protocol = %session.protocol_version,
            stateful = session.session_id.is_some(),
            remote = %session.server_info.name,
            "session established"
        );
        Ok(session)
    }

    async fn initialize(&self, server: &RemoteServer) -> McpResult<Session> {
        let request_id = self.next_request_id();
        let request = ClientRequest::Initialize(InitializeParams::new(&self.inner.settings.client_name));
        let envelope = envelope(server, request_id, &request)?;

        let response = match self.post(server, None, &envelope, request.method()).await? {
            PostOutcome::Accepted(response) => response,
            PostOutcome::SessionExpired => {
                return Err(McpError::protocol(server.id.as_str(), "initialize rejected with 404"));
            }
        };
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let rpc = self.read_response(server, response, request_id, None).await?;
        let result: InitializeResult = decode_result(server, into_result(rpc)?)?;
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(McpError::UnsupportedProtocolVersion {
                server: server.id.to_string(),
                version: result.protocol_version,
            });
        }
        if let Some(instructions) = &result.instructions {
            tracing::debug!(server = %server.id, len = instructions.len(), "server sent instructions");
        }

        let session = Session {
            session_id,
            protocol_version: result.protocol_version,
            capabilities: result.capabilities,
            server_info: result.server_info,
            established_at: Utc::now(),
        };

        let initialized = JsonRpcNotification::from(&ClientNotification::Initialized);
        match self
            .post(server, Some(&session), &initialized, "notifications/initialized")
            .await?
        {
            PostOutcome::Accepted(_) => Ok(session),
            PostOutcome::SessionExpired => Err(McpError::protocol(
                server.id.as_str(),
                "session rejected right after initialize",
            )),
        }
    }

    /// Terminate the session: cancel in-flight calls, send a best-effort
    /// DELETE and forget the session.
    pub async fn close(&self, server_id: &ServerId) -> McpResult<()> {
        let server = self.inner.servers.get(server_id)?;

        let cancelled: Vec<CancellationToken> = self
            .calls()
            .values()
            .filter(|c| c.server_id == *server_id)
            .map(|c| c.cancel.clone())
            .collect();
        for token in &cancelled {
            token.cancel();
        }

        if let Some(session) = self.inner.servers.session(server_id) {
            if let Some(session_id) = &session.session_id {
                let request = self
                    .inner
                    .http
                    .delete(&server.endpoint)
                    .header(SESSION_HEADER, session_id)
                    .header(PROTOCOL_VERSION_HEADER, &session.protocol_version)
                    .timeout(self.inner.settings.connect_timeout());
                let request = self.inner.auth.attach_cached(&server, request);
                match request.send().await {
                    Ok(response) => {
                        tracing::debug!(server = %server_id, status = response.status().as_u16(), "session deleted")
                    }
                    Err(e) => tracing::debug!(server = %server_id, error = %e, "session delete failed"),
                }
            }
        }

        self.inner.servers.clear_session(server_id);
        tracing::info!(server = %server_id, cancelled_calls = cancelled.len(), "session closed");
        Ok(())
    }

    // ─── Tool calls ──────────────────────────────────────────────────────

    /// Assign an id to a `tools/call` and return it with the call future.
    ///
    /// Nothing is sent until the future is awaited.
    pub fn begin_call(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Option<Value>,
        options: CallOptions,
    ) -> PendingCall {
        let call_id = self.next_request_id();
        let cancel = options.cancel.unwrap_or_default();
        let timeout = options.timeout.unwrap_or_else(|| self.inner.settings.call_timeout());
        self.calls().insert(
            call_id,
            ActiveCall {
                server_id: server_id.clone(),
                cancel: cancel.clone(),
            },
        );

        let guard = CallGuard {
            client: self.clone(),
            call_id,
        };
        let server_id = server_id.clone();
        let tool = tool.to_string();
        let mode = options.mode;
        let future = async move {
            let client = guard.client.clone();
            let outcome = client
                .drive_call(&server_id, call_id, tool, arguments, mode, cancel, timeout)
                .await;
            drop(guard);
            outcome
        }
        .boxed();

        PendingCall { call_id, future }
    }

    /// Start and await a tool call.
    pub async fn call_tool(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Option<Value>,
        options: CallOptions,
    ) -> McpResult<ToolCallResult> {
        self.begin_call(server_id, tool, arguments, options).wait().await
    }

    /// Cancel an in-flight call. The call resolves with `Cancelled`.
    pub fn cancel_call(&self, call_id: u64) -> McpResult<()> {
        let calls = self.calls();
        let call = calls.get(&call_id).ok_or(McpError::CallNotFound { call_id })?;
        call.cancel.cancel();
        Ok(())
    }

    pub fn active_call_count(&self) -> usize {
        self.calls().len()
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_call(
        &self,
        server_id: &ServerId,
        call_id: u64,
        tool: String,
        arguments: Option<Value>,
        mode: CallMode,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> McpResult<ToolCallResult> {
        let sink = match mode {
            CallMode::Unary => None,
            CallMode::Streaming(tx) => Some(ProgressSink {
                call_id,
                token: Value::from(call_id),
                tx,
            }),
        };
        let request = ClientRequest::CallTool(CallToolParams {
            name: tool.clone(),
            arguments,
            meta: sink.as_ref().map(|s| RequestMeta {
                progress_token: s.token.clone(),
            }),
        });

        let start = Instant::now();
        let mut work = Box::pin(self.request(server_id, call_id, &request, sink.as_ref()));
        let interrupted = tokio::select! {
            result = &mut work => {
                let duration_ms = start.elapsed().as_millis() as u64;
                return match result {
                    Ok(value) => {
                        let result: ToolCallResult = serde_json::from_value(value).map_err(|e| {
                            McpError::protocol(server_id.as_str(), format!("malformed tools/call result: {e}"))
                        })?;
                        tracing::info!(
                            server = %server_id,
                            call_id,
                            tool = %tool,
                            duration_ms,
                            is_error = result.is_error,
                            "tool call finished"
                        );
                        Ok(result)
                    }
                    Err(e) => {
                        tracing::warn!(server = %server_id, call_id, tool = %tool, duration_ms, error = %e, "tool call failed");
                        Err(e)
                    }
                };
            }
            _ = cancel.cancelled() => Interrupted::Cancelled,
            _ = tokio::time::sleep(timeout) => Interrupted::TimedOut,
        };

        let reason = match interrupted {
            Interrupted::Cancelled => "cancelled by client",
            Interrupted::TimedOut => "timed out",
        };
        self.send_cancelled(server_id, call_id, reason).await;
        drop(work);

        tracing::info!(server = %server_id, call_id, tool = %tool, reason, "tool call interrupted");
        Err(match interrupted {
            Interrupted::Cancelled => McpError::Cancelled { call_id },
            Interrupted::TimedOut => McpError::Timeout {
                server: server_id.to_string(),
                operation: "tools/call".into(),
                timeout_ms: timeout.as_millis() as u64,
            },
        })
    }

    async fn send_cancelled(&self, server_id: &ServerId, call_id: u64, reason: &str) {
        let Ok(server) = self.inner.servers.get(server_id) else {
            return;
        };
        let session = self.inner.servers.session(server_id);
        let notification = JsonRpcNotification::from(&ClientNotification::Cancelled {
            request_id: call_id,
            reason: reason.to_string(),
        });
        let send = self.post(&server, session.as_ref(), &notification, "notifications/cancelled");
        match tokio::time::timeout(self.inner.settings.connect_timeout(), send).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(server = %server_id, call_id, error = %e, "cancel notification failed"),
            Err(_) => tracing::debug!(server = %server_id, call_id, "cancel notification timed out"),
        }
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// Tool list, served from the registry cache when present.
    pub async fn list_tools(&self, server_id: &ServerId) -> McpResult<Vec<Tool>> {
        if let Some(tools) = self.inner.servers.tools(server_id) {
            return Ok(tools);
        }
        self.refresh_tools(server_id).await
    }

    /// Fetch every `tools/list` page and replace the cache.
    pub async fn refresh_tools(&self, server_id: &ServerId) -> McpResult<Vec<Tool>> {
        self.connect(server_id).await?;
        let (_, generation) = self.inner.servers.get_with_generation(server_id)?;
        let tools = self
            .paginate(
                server_id,
                |cursor| ClientRequest::ListTools { cursor },
                |page: ToolsPage| (page.tools, page.next_cursor),
            )
            .await?;
        tracing::debug!(server = %server_id, count = tools.len(), "tools listed");
        self.inner.servers.set_tools(server_id, generation, tools.clone());
        Ok(tools)
    }

    pub async fn list_resources(&self, server_id: &ServerId) -> McpResult<Vec<Resource>> {
        self.paginate(
            server_id,
            |cursor| ClientRequest::ListResources { cursor },
            |page: ResourcesPage| (page.resources, page.next_cursor),
        )
        .await
    }

    pub async fn list_prompts(&self, server_id: &ServerId) -> McpResult<Vec<Prompt>> {
        self.paginate(
            server_id,
            |cursor| ClientRequest::ListPrompts { cursor },
            |page: PromptsPage| (page.prompts, page.next_cursor),
        )
        .await
    }

    /// Round-trip a `ping` and report the elapsed time.
    pub async fn ping(&self, server_id: &ServerId) -> McpResult<Duration> {
        let start = Instant::now();
        let request_id = self.next_request_id();
        self.bounded(server_id, "ping", self.request(server_id, request_id, &ClientRequest::Ping, None))
            .await?;
        Ok(start.elapsed())
    }

    async fn paginate<P, T>(
        &self,
        server_id: &ServerId,
        request: impl Fn(Option<String>) -> ClientRequest,
        split: impl Fn(P) -> (Vec<T>, Option<String>),
    ) -> McpResult<Vec<T>>
    where
        P: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_PAGES {
            let req = request(cursor.take());
            let request_id = self.next_request_id();
            let value = self
                .bounded(server_id, req.method(), self.request(server_id, request_id, &req, None))
                .await?;
            let page: P = serde_json::from_value(value).map_err(|e| {
                McpError::protocol(server_id.as_str(), format!("malformed {} result: {e}", req.method()))
            })?;
            let (batch, next) = split(page);
            items.extend(batch);
            match next {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }
        Err(McpError::protocol(
            server_id.as_str(),
            format!("pagination did not finish after {MAX_PAGES} pages"),
        ))
    }

    async fn bounded<F>(&self, server_id: &ServerId, operation: &str, work: F) -> McpResult<Value>
    where
        F: Future<Output = McpResult<Value>>,
    {
        let timeout = self.inner.settings.call_timeout();
        tokio::time::timeout(timeout, work)
            .await
            .unwrap_or_else(|_| {
                Err(McpError::Timeout {
                    server: server_id.to_string(),
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            })
    }

    // ─── Wire ────────────────────────────────────────────────────────────

    /// Send one request over the current session and return its `result`.
    ///
    /// A 404 on a session request means the server dropped the session: it is
    /// cleared, re-established, and the request is retried once.
    async fn request(
        &self,
        server_id: &ServerId,
        request_id: u64,
        request: &ClientRequest,
        progress: Option<&ProgressSink>,
    ) -> McpResult<Value> {
        let mut retried = false;
        loop {
            let session = self.connect(server_id).await?;
            let server = self.inner.servers.get(server_id)?;
            let body = envelope(&server, request_id, request)?;

            match self.post(&server, Some(&session), &body, request.method()).await? {
                PostOutcome::Accepted(response) => {
                    let rpc = self.read_response(&server, response, request_id, progress).await?;
                    return into_result(rpc);
                }
                PostOutcome::SessionExpired if !retried => {
                    tracing::warn!(server = %server_id, method = request.method(), "session expired, reconnecting");
                    self.inner.servers.clear_session(server_id);
                    retried = true;
                }
                PostOutcome::SessionExpired => {
                    return Err(McpError::protocol(
                        server_id.as_str(),
                        "session expired again after re-handshake",
                    ));
                }
            }
        }
    }

    async fn post<B: Serialize>(
        &self,
        server: &RemoteServer,
        session: Option<&Session>,
        body: &B,
        operation: &str,
    ) -> McpResult<PostOutcome> {
        let mut request = self
            .inner
            .http
            .post(&server.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        let mut has_session = false;
        if let Some(session) = session {
            if let Some(session_id) = &session.session_id {
                request = request.header(SESSION_HEADER, session_id);
                has_session = true;
            }
            request = request.header(PROTOCOL_VERSION_HEADER, &session.protocol_version);
        }
        let request = self.inner.auth.attach(server, request).await?;

        let connect_ms = self.inner.settings.connect_timeout().as_millis() as u64;
        let response = request
            .send()
            .await
            .map_err(|e| McpError::from_reqwest(server.id.as_str(), operation, connect_ms, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(PostOutcome::Accepted(response));
        }
        match status {
            StatusCode::NOT_FOUND if has_session => Ok(PostOutcome::SessionExpired),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.inner.auth.invalidate(&server.id);
                Err(McpError::AuthFailed {
                    server: server.id.to_string(),
                    reason: format!("{operation} rejected with HTTP {}", status.as_u16()),
                })
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                Err(McpError::RateLimited {
                    server: server.id.to_string(),
                    retry_after_secs,
                })
            }
            StatusCode::BAD_REQUEST => {
                let body = error_body(response).await;
                Err(McpError::protocol(server.id.as_str(), format!("{operation} rejected: {body}")))
            }
            _ => Err(McpError::HttpError {
                server: server.id.to_string(),
                status: status.as_u16(),
                body: error_body(response).await,
            }),
        }
    }

    /// Read the response to `request_id`, either a plain JSON body or an SSE
    /// stream of frames ending with it.
    async fn read_response(
        &self,
        server: &RemoteServer,
        response: reqwest::Response,
        request_id: u64,
        progress: Option<&ProgressSink>,
    ) -> McpResult<JsonRpcResponse> {
        let server_id = server.id.as_str();
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        if !is_stream {
            let value: Value = response
                .json()
                .await
                .map_err(|e| McpError::from_reqwest(server_id, "read response", 0, e))?;
            return match ServerMessage::parse(value).map_err(|r| McpError::protocol(server_id, r))? {
                ServerMessage::Response(rpc) if rpc.answers(request_id) => Ok(rpc),
                _ => Err(McpError::protocol(server_id, "body is not the response to this request")),
            };
        }

        let mut frames = json_frames(server_id.to_string(), Box::pin(response.bytes_stream())).boxed();
        while let Some(frame) = frames.next().await {
            let message = ServerMessage::parse(frame?).map_err(|r| McpError::protocol(server_id, r))?;
            match message {
                ServerMessage::Response(rpc) if rpc.answers(request_id) => return Ok(rpc),
                ServerMessage::Response(rpc) => {
                    tracing::debug!(server = %server.id, id = %rpc.id, "ignoring response for another request");
                }
                ServerMessage::Notification(ServerNotification::Progress(p)) => {
                    if let Some(sink) = progress {
                        sink.forward(&p.progress_token, p.progress, p.total, p.message);
                    }
                }
                ServerMessage::Notification(ServerNotification::Message { level, data }) => {
                    tracing::debug!(server = %server.id, level = %level, data = %data, "server log message");
                }
                ServerMessage::Notification(ServerNotification::Other { method }) => {
                    tracing::trace!(server = %server.id, method = %method, "unhandled notification");
                }
                ServerMessage::Request { method, .. } => {
                    tracing::debug!(server = %server.id, method = %method, "ignoring server request");
                }
            }
        }
        Err(McpError::protocol(server_id, "stream ended before the response arrived"))
    }
}

fn envelope(server: &RemoteServer, request_id: u64, request: &ClientRequest) -> McpResult<JsonRpcRequest> {
    JsonRpcRequest::new(request_id, request)
        .map_err(|e| McpError::protocol(server.id.as_str(), format!("failed to encode request: {e}")))
}

fn into_result(rpc: JsonRpcResponse) -> McpResult<Value> {
    if let Some(error) = rpc.error {
        return Err(McpError::ServerError {
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }
    Ok(rpc.result.unwrap_or(Value::Null))
}

fn decode_result<T: DeserializeOwned>(server: &RemoteServer, value: Value) -> McpResult<T> {
    serde_json::from_value(value)
        .map_err(|e| McpError::protocol(server.id.as_str(), format!("unexpected handshake response: {e}")))
}

async fn error_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthSettings;
    use crate::events::EventBus;
    use crate::mcp_client::auth::{LoggingAuthorizer, NoopAuthorizer};
    use crate::mcp_client::server::{AuthConfig, ServerUpdate};
    use crate::mcp_client::ErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn setup(uri: &str) -> (McpClient, ServerId) {
        let bus = Arc::new(EventBus::new());
        let servers = Arc::new(ServerRegistry::new(bus));
        let id = servers.insert_unchecked("mock", uri);
        let auth = Arc::new(AuthProvider::new(AuthSettings::default(), Arc::new(NoopAuthorizer)).unwrap());
        let client = McpClient::new(TransportSettings::default(), servers, auth).unwrap();
        (client, id)
    }

    fn request_id(req: &Request) -> Value {
        req.body_json::<Value>().unwrap()["id"].clone()
    }

    fn rpc_result(req: &Request, result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": request_id(req), "result": result
        }))
    }

    fn sse(frames: &[Value]) -> ResponseTemplate {
        let body: String = frames.iter().map(|f| format!("data: {f}\n\n")).collect();
        ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream")
    }

    /// Mount `initialize` and `notifications/initialized` handlers.
    async fn mount_handshake(mock: &MockServer, session: Option<&'static str>, version: &'static str) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(move |req: &Request| {
                let template = rpc_result(
                    req,
                    json!({
                        "protocolVersion": version,
                        "capabilities": {"tools": {"listChanged": true}},
                        "serverInfo": {"name": "mock-mcp", "version": "0.1"}
                    }),
                );
                match session {
                    Some(id) => template.insert_header("Mcp-Session-Id", id),
                    None => template,
                }
            })
            .mount(mock)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(mock)
            .await;
    }

    fn tool_result(req: &Request) -> ResponseTemplate {
        rpc_result(req, json!({"content": [{"type": "text", "text": "42"}]}))
    }

    #[tokio::test]
    async fn test_handshake_is_single_flighted() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(|req: &Request| {
                rpc_result(
                    req,
                    json!({"protocolVersion": "2025-06-18", "capabilities": {}, "serverInfo": {"name": "m"}}),
                )
                .insert_header("Mcp-Session-Id", "sess-1")
                .set_delay(Duration::from_millis(100))
            })
            .expect(1)
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .and(header("Mcp-Session-Id", "sess-1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let attempts: Vec<_> = (0..5)
            .map(|_| {
                let client = client.clone();
                let id = id.clone();
                tokio::spawn(async move { client.connect(&id).await })
            })
            .collect();
        for attempt in attempts {
            let session = attempt.await.unwrap().unwrap();
            assert_eq!(session.session_id.as_deref(), Some("sess-1"));
        }
        let server = client.servers().get(&id).unwrap();
        assert_eq!(server.session_id.as_deref(), Some("sess-1"));
        assert_eq!(server.protocol_version.as_deref(), Some("2025-06-18"));
    }

    #[tokio::test]
    async fn test_unsupported_protocol_version() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, None, "2023-01-01").await;
        let (client, id) = setup(&mock.uri());
        let err = client.connect(&id).await.unwrap_err();
        assert!(matches!(err, McpError::UnsupportedProtocolVersion { .. }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(client.servers().session(&id).is_none());
    }

    #[tokio::test]
    async fn test_authorization_outlives_connect_timeout() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock)
            .await;

        let bus = Arc::new(EventBus::new());
        let servers = Arc::new(ServerRegistry::new(bus));
        let id = servers.insert_unchecked("mock", &mock.uri());
        servers
            .update(
                &id,
                ServerUpdate {
                    auth: Some(AuthConfig::OAuth2 {
                        authorization_endpoint: "https://auth.example.com/authorize".into(),
                        token_endpoint: "https://auth.example.com/token".into(),
                        client_id: "hub-client".into(),
                        client_secret: None,
                        scopes: vec![],
                        uses_pkce: true,
                    }),
                    ..ServerUpdate::default()
                },
            )
            .unwrap();
        let settings = AuthSettings {
            authorization_timeout_secs: 2,
            ..AuthSettings::default()
        };
        // Accepts the request and never delivers a code.
        let auth = Arc::new(AuthProvider::new(settings, Arc::new(LoggingAuthorizer)).unwrap());
        let transport = TransportSettings {
            connect_timeout_secs: 1,
            ..TransportSettings::default()
        };
        let client = McpClient::new(transport, servers, Arc::clone(&auth)).unwrap();

        let started = Instant::now();
        let err = client.connect(&id).await.unwrap_err();
        assert!(matches!(err, McpError::AuthorizationTimeout { timeout_secs: 2, .. }), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(!auth.has_pending_authorization(&id));
        assert!(client.servers().session(&id).is_none());
    }

    #[tokio::test]
    async fn test_unary_call_sends_session_headers() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, Some("sess-9"), "2025-11-25").await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call", "params": {"name": "add"}})))
            .and(header("Mcp-Session-Id", "sess-9"))
            .and(header("MCP-Protocol-Version", "2025-11-25"))
            .respond_with(tool_result)
            .expect(1)
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let result = client
            .call_tool(&id, "add", Some(json!({"a": 40, "b": 2})), CallOptions::default())
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "42");
        assert_eq!(client.active_call_count(), 0);
    }

    #[tokio::test]
    async fn test_streaming_call_forwards_progress_in_order() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, Some("s"), "2025-06-18").await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(|req: &Request| {
                let body: Value = req.body_json().unwrap();
                let token = body["params"]["_meta"]["progressToken"].clone();
                let progress = |n: u64| {
                    json!({"jsonrpc": "2.0", "method": "notifications/progress",
                           "params": {"progressToken": token, "progress": n, "total": 3}})
                };
                sse(&[
                    progress(1),
                    json!({"jsonrpc": "2.0", "method": "notifications/message",
                           "params": {"level": "info", "data": "working"}}),
                    progress(2),
                    progress(3),
                    json!({"jsonrpc": "2.0", "id": body["id"],
                           "result": {"content": [{"type": "text", "text": "done"}]}}),
                ])
            })
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = client.begin_call(&id, "index", None, CallOptions::streaming(tx));
        let call_id = pending.call_id();
        let result = pending.wait().await.unwrap();
        assert_eq!(result.text(), "done");

        let mut seen = Vec::new();
        while let Ok(update) = rx.try_recv() {
            assert_eq!(update.call_id, call_id);
            seen.push(update.progress);
        }
        assert_eq!(seen, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_tool_error_result_is_not_a_transport_error() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, None, "2025-06-18").await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(|req: &Request| {
                rpc_result(req, json!({"content": [{"type": "text", "text": "no such file"}], "isError": true}))
            })
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let result = client.call_tool(&id, "read", None, CallOptions::default()).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "no such file");
    }

    #[tokio::test]
    async fn test_jsonrpc_error_maps_to_remote() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, None, "2025-06-18").await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(|req: &Request| {
                ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0", "id": request_id(req),
                    "error": {"code": -32602, "message": "unknown tool"}
                }))
            })
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let err = client.call_tool(&id, "nope", None, CallOptions::default()).await.unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32602, .. }));
        assert_eq!(err.kind(), ErrorKind::Remote);
    }

    #[tokio::test]
    async fn test_http_status_mapping() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, None, "2025-06-18").await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": {"name": "locked"}})))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": {"name": "busy"}})))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": {"name": "broken"}})))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let call = |tool: &'static str| client.call_tool(&id, tool, None, CallOptions::default());

        assert_eq!(call("locked").await.unwrap_err().kind(), ErrorKind::Auth);
        assert!(matches!(
            call("busy").await.unwrap_err(),
            McpError::RateLimited { retry_after_secs: Some(7), .. }
        ));
        let err = call("broken").await.unwrap_err();
        assert!(matches!(err, McpError::HttpError { status: 502, .. }));
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_expired_session_rehandshakes_once() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(|req: &Request| {
                rpc_result(
                    req,
                    json!({"protocolVersion": "2025-06-18", "capabilities": {}, "serverInfo": {"name": "m"}}),
                )
                .insert_header("Mcp-Session-Id", "sess")
            })
            .expect(2)
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(tool_result)
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let result = client.call_tool(&id, "add", None, CallOptions::default()).await.unwrap();
        assert_eq!(result.text(), "42");
    }

    #[tokio::test]
    async fn test_cancel_sends_notification_and_resolves_cancelled() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, Some("s"), "2025-06-18").await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(|req: &Request| tool_result(req).set_delay(Duration::from_secs(5)))
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let pending = client.begin_call(&id, "slow", None, CallOptions::default());
        let call_id = pending.call_id();
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "notifications/cancelled", "params": {"requestId": call_id}
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock)
            .await;

        let handle = tokio::spawn(pending.wait());
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.cancel_call(call_id).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Cancelled { call_id: c } if c == call_id));
        assert!(matches!(client.cancel_call(call_id), Err(McpError::CallNotFound { .. })));
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, None, "2025-06-18").await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(|req: &Request| tool_result(req).set_delay(Duration::from_secs(5)))
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let options = CallOptions::default().with_timeout(Duration::from_millis(150));
        let err = client.call_tool(&id, "slow", None, options).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_malformed_frame_and_truncated_stream() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, None, "2025-06-18").await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": {"name": "garbled"}})))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(b"data: {not json\n\n".to_vec(), "text/event-stream"),
            )
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": {"name": "truncated"}})))
            .respond_with(|_: &Request| {
                sse(&[json!({"jsonrpc": "2.0", "method": "notifications/progress",
                             "params": {"progressToken": 1, "progress": 1}})])
            })
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        for tool in ["garbled", "truncated"] {
            let err = client.call_tool(&id, tool, None, CallOptions::default()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol, "{tool}: {err}");
        }
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor_and_caches() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, None, "2025-06-18").await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(|req: &Request| {
                let body: Value = req.body_json().unwrap();
                match body["params"]["cursor"].as_str() {
                    None => rpc_result(
                        req,
                        json!({"tools": [{"name": "a", "inputSchema": {}}], "nextCursor": "p2"}),
                    ),
                    Some(_) => rpc_result(req, json!({"tools": [{"name": "b", "inputSchema": {}}]})),
                }
            })
            .expect(2)
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        let names: Vec<String> = client
            .list_tools(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(client.list_tools(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_close_deletes_session() {
        let mock = MockServer::start().await;
        mount_handshake(&mock, Some("sess-del"), "2025-06-18").await;
        Mock::given(method("DELETE"))
            .and(header("Mcp-Session-Id", "sess-del"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock)
            .await;

        let (client, id) = setup(&mock.uri());
        client.connect(&id).await.unwrap();
        client.close(&id).await.unwrap();
        assert!(client.servers().session(&id).is_none());
        assert!(client.servers().get(&id).unwrap().session_id.is_none());
    }
}
