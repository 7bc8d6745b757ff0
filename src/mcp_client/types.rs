//! Wire types for the MCP streamable-HTTP protocol.
//!
//! Outbound traffic is modelled as tagged unions (`ClientRequest`,
//! `ClientNotification`); inbound JSON is classified into a `ServerMessage`
//! before anything else looks at it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Protocol constants ──────────────────────────────────────────────────────

/// JSON-RPC envelope version.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version offered in `initialize`.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

/// Versions this client accepts back from a server.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-11-25", "2025-06-18", "2025-03-26"];

/// Header carrying the server-issued session identifier.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Header carrying the negotiated protocol version after the handshake.
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

// ─── JSON-RPC 2.0 ────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Wrap a typed request in an envelope with the given id.
    pub fn new(id: u64, request: &ClientRequest) -> Result<Self, serde_json::Error> {
        Ok(Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: request.method(),
            params: request.params()?,
        })
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl From<&ClientNotification> for JsonRpcNotification {
    fn from(notification: &ClientNotification) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: notification.method(),
            params: notification.params(),
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Whether this response answers the request with `id`.
    pub fn answers(&self, id: u64) -> bool {
        self.id.as_u64() == Some(id) || self.id.as_str() == Some(id.to_string().as_str())
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

// ─── Outbound ────────────────────────────────────────────────────────────────

/// Every request method this client sends.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Initialize(InitializeParams),
    Ping,
    ListTools { cursor: Option<String> },
    CallTool(CallToolParams),
    ListResources { cursor: Option<String> },
    ListPrompts { cursor: Option<String> },
}

impl ClientRequest {
    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::Initialize(_) => "initialize",
            ClientRequest::Ping => "ping",
            ClientRequest::ListTools { .. } => "tools/list",
            ClientRequest::CallTool(_) => "tools/call",
            ClientRequest::ListResources { .. } => "resources/list",
            ClientRequest::ListPrompts { .. } => "prompts/list",
        }
    }

    fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(match self {
            ClientRequest::Initialize(p) => Some(serde_json::to_value(p)?),
            ClientRequest::Ping => None,
            ClientRequest::CallTool(p) => Some(serde_json::to_value(p)?),
            ClientRequest::ListTools { cursor }
            | ClientRequest::ListResources { cursor }
            | ClientRequest::ListPrompts { cursor } => cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c })),
        })
    }
}

/// Notifications this client sends.
#[derive(Debug, Clone)]
pub enum ClientNotification {
    Initialized,
    Cancelled { request_id: u64, reason: String },
}

impl ClientNotification {
    pub fn method(&self) -> &'static str {
        match self {
            ClientNotification::Initialized => "notifications/initialized",
            ClientNotification::Cancelled { .. } => "notifications/cancelled",
        }
    }

    fn params(&self) -> Option<Value> {
        match self {
            ClientNotification::Initialized => None,
            ClientNotification::Cancelled { request_id, reason } => Some(serde_json::json!({
                "requestId": request_id,
                "reason": reason,
            })),
        }
    }
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

impl InitializeParams {
    pub fn new(client_name: &str) -> Self {
        Self {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: client_name.to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        }
    }
}

/// Capability flags advertised by this client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientCapabilities {
    pub roots: Value,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            roots: serde_json::json!({ "listChanged": false }),
        }
    }
}

/// Name/version pair used for both `clientInfo` and `serverInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `tools/call` parameters.
#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

/// Request metadata; carries the progress token for streamed calls.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    pub progress_token: Value,
}

// ─── Inbound ─────────────────────────────────────────────────────────────────

/// A JSON message received from a server, classified by shape.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Response(JsonRpcResponse),
    Notification(ServerNotification),
    /// Server-to-client request (sampling, roots, ping). Not serviced here.
    Request { id: Value, method: String },
}

impl ServerMessage {
    /// Validate and classify a decoded JSON value.
    pub fn parse(value: Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "message is not a JSON object".to_string())?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => return Err(format!("unsupported jsonrpc version '{other}'")),
            None => return Err("missing jsonrpc version".to_string()),
        }

        if let Some(method) = obj.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| "method is not a string".to_string())?
                .to_string();
            return match obj.get("id") {
                Some(id) => Ok(ServerMessage::Request {
                    id: id.clone(),
                    method,
                }),
                None => Ok(ServerMessage::Notification(ServerNotification::from_parts(
                    method,
                    obj.get("params").cloned(),
                )?)),
            };
        }

        if !obj.contains_key("id") {
            return Err("message has neither method nor id".to_string());
        }
        if !obj.contains_key("result") && !obj.contains_key("error") {
            return Err("response has neither result nor error".to_string());
        }

        serde_json::from_value(value)
            .map(ServerMessage::Response)
            .map_err(|e| format!("malformed response: {e}"))
    }
}

/// Notifications a server may interleave with a streamed response.
#[derive(Debug, Clone)]
pub enum ServerNotification {
    Progress(ProgressParams),
    Message { level: String, data: Value },
    Other { method: String },
}

impl ServerNotification {
    fn from_parts(method: String, params: Option<Value>) -> Result<Self, String> {
        match method.as_str() {
            "notifications/progress" => {
                let params = params.ok_or_else(|| "progress notification without params".to_string())?;
                serde_json::from_value(params)
                    .map(ServerNotification::Progress)
                    .map_err(|e| format!("malformed progress notification: {e}"))
            }
            "notifications/message" => {
                let params = params.unwrap_or(Value::Null);
                Ok(ServerNotification::Message {
                    level: params
                        .get("level")
                        .and_then(Value::as_str)
                        .unwrap_or("info")
                        .to_string(),
                    data: params.get("data").cloned().unwrap_or(Value::Null),
                })
            }
            _ => Ok(ServerNotification::Other { method }),
        }
    }
}

/// `notifications/progress` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: Value,
    pub progress: f64,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

// ─── MCP result payloads ─────────────────────────────────────────────────────

/// `initialize` result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Capability flags advertised by the server. Each present key is enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

/// Tool definition from `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// One page of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsPage {
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Resource definition from `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesPage {
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Prompt definition from `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsPage {
    pub prompts: Vec<Prompt>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl ToolCallResult {
    /// Concatenated text content, used as the error description of failed calls.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content block in a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource { resource: Value },
    #[serde(other)]
    Unsupported,
}

// ─── Standard JSON-RPC error codes ───────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_envelope() {
        let req = JsonRpcRequest::new(1, &ClientRequest::Initialize(InitializeParams::new("mcphub")))
            .unwrap();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "initialize");
        assert_eq!(json["params"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert_eq!(json["params"]["clientInfo"]["name"], "mcphub");
    }

    #[test]
    fn test_ping_omits_params() {
        let req = JsonRpcRequest::new(7, &ClientRequest::Ping).unwrap();
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"method\":\"ping\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_call_tool_carries_progress_token() {
        let req = JsonRpcRequest::new(
            9,
            &ClientRequest::CallTool(CallToolParams {
                name: "deploy".into(),
                arguments: Some(serde_json::json!({"env": "prod"})),
                meta: Some(RequestMeta {
                    progress_token: serde_json::json!(9),
                }),
            }),
        )
        .unwrap();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "tools/call");
        assert_eq!(json["params"]["arguments"]["env"], "prod");
        assert_eq!(json["params"]["_meta"]["progressToken"], 9);
    }

    #[test]
    fn test_cancelled_notification() {
        let n = JsonRpcNotification::from(&ClientNotification::Cancelled {
            request_id: 12,
            reason: "timeout".into(),
        });
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["method"], "notifications/cancelled");
        assert_eq!(json["params"]["requestId"], 12);
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_parse_response() {
        let msg = ServerMessage::parse(serde_json::json!({
            "jsonrpc": "2.0", "id": 3, "result": {"ok": true}
        }))
        .unwrap();
        match msg {
            ServerMessage::Response(r) => {
                assert!(r.answers(3));
                assert!(!r.answers(4));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_progress_notification() {
        let msg = ServerMessage::parse(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {"progressToken": 3, "progress": 2, "total": 4, "message": "halfway"}
        }))
        .unwrap();
        match msg {
            ServerMessage::Notification(ServerNotification::Progress(p)) => {
                assert_eq!(p.progress, 2.0);
                assert_eq!(p.total, Some(4.0));
                assert_eq!(p.message.as_deref(), Some("halfway"));
            }
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_malformed_messages() {
        assert!(ServerMessage::parse(serde_json::json!([1, 2])).is_err());
        assert!(ServerMessage::parse(serde_json::json!({"id": 1, "result": {}})).is_err());
        assert!(ServerMessage::parse(serde_json::json!({"jsonrpc": "1.0", "id": 1, "result": {}})).is_err());
        assert!(ServerMessage::parse(serde_json::json!({"jsonrpc": "2.0", "id": 1})).is_err());
        assert!(ServerMessage::parse(serde_json::json!({
            "jsonrpc": "2.0", "method": "notifications/progress", "params": {"progress": "x"}
        }))
        .is_err());
    }

    #[test]
    fn test_server_request_is_classified() {
        let msg = ServerMessage::parse(serde_json::json!({
            "jsonrpc": "2.0", "id": "srv-1", "method": "sampling/createMessage"
        }))
        .unwrap();
        assert!(matches!(msg, ServerMessage::Request { .. }));
    }

    #[test]
    fn test_tool_call_result_text_and_unknown_content() {
        let result: ToolCallResult = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "disk full"},
                {"type": "audio", "data": "..."}
            ],
            "isError": true
        }))
        .unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "disk full");
        assert!(matches!(result.content[1], ToolContent::Unsupported));
    }
}
