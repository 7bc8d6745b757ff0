//! MCP Client error types.

use serde::Serialize;
use thiserror::Error;

/// Coarse error classification shared by every subsystem.
///
/// The presentation layer switches on this rather than on concrete variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    Protocol,
    Network,
    NotFound,
    Conflict,
    RateLimit,
    /// The remote server answered with a JSON-RPC error object.
    Remote,
    /// The caller (or a timeout acting for it) cancelled the call.
    Cancelled,
    /// Persistence or serialization failure inside the process.
    Internal,
}

/// Errors that can occur while talking to remote MCP servers.
///
/// `Clone` so a single in-flight handshake or token refresh can hand the same
/// failure to every waiter.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server definition failed shape validation before any network I/O.
    #[error("invalid {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    /// Missing or rejected credential, or a failed token refresh.
    #[error("authentication failed for server '{server}': {reason}")]
    AuthFailed {
        server: String,
        reason: String,
    },

    /// The out-of-band authorization flow never called back.
    #[error("authorization for server '{server}' timed out after {timeout_secs}s")]
    AuthorizationTimeout {
        server: String,
        timeout_secs: u64,
    },

    /// Malformed frame, unexpected handshake response, bad envelope.
    #[error("protocol error from server '{server}': {reason}")]
    ProtocolError {
        server: String,
        reason: String,
    },

    /// The server negotiated a protocol version this client cannot speak.
    #[error("server '{server}' negotiated unsupported protocol version '{version}'")]
    UnsupportedProtocolVersion {
        server: String,
        version: String,
    },

    /// Connection refused, DNS failure, broken stream.
    #[error("connection to server '{server}' failed: {reason}")]
    ConnectionFailed {
        server: String,
        reason: String,
    },

    /// A handshake, call or probe exceeded its deadline.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Non-2xx HTTP status that has no more specific mapping.
    #[error("server '{server}' returned HTTP {status}: {body}")]
    HttpError {
        server: String,
        status: u16,
        body: String,
    },

    /// The server signalled throttling (HTTP 429).
    #[error("server '{server}' is rate limiting requests")]
    RateLimited {
        server: String,
        retry_after_secs: Option<u64>,
    },

    /// No server with this id is registered.
    #[error("unknown server: '{id}'")]
    ServerNotFound {
        id: String,
    },

    /// No in-flight call with this id.
    #[error("unknown call: {call_id}")]
    CallNotFound {
        call_id: u64,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The call was cancelled before a terminal frame arrived.
    #[error("call {call_id} was cancelled")]
    Cancelled {
        call_id: u64,
    },
}

impl McpError {
    /// Map this error onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::InvalidConfig { .. } => ErrorKind::Validation,
            McpError::AuthFailed { .. } | McpError::AuthorizationTimeout { .. } => {
                ErrorKind::Auth
            }
            McpError::ProtocolError { .. } | McpError::UnsupportedProtocolVersion { .. } => {
                ErrorKind::Protocol
            }
            McpError::ConnectionFailed { .. }
            | McpError::Timeout { .. }
            | McpError::HttpError { .. } => ErrorKind::Network,
            McpError::RateLimited { .. } => ErrorKind::RateLimit,
            McpError::ServerNotFound { .. } | McpError::CallNotFound { .. } => {
                ErrorKind::NotFound
            }
            McpError::ServerError { .. } => ErrorKind::Remote,
            McpError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Shorthand for a validation failure on `field`.
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        McpError::InvalidConfig {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a protocol violation by `server`.
    pub fn protocol(server: &str, reason: impl Into<String>) -> Self {
        McpError::ProtocolError {
            server: server.to_string(),
            reason: reason.into(),
        }
    }

    /// Classify a `reqwest` failure for `server`.
    ///
    /// `operation` and `timeout_ms` only matter when the failure is a timeout.
    pub fn from_reqwest(server: &str, operation: &str, timeout_ms: u64, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            McpError::Timeout {
                server: server.to_string(),
                operation: operation.to_string(),
                timeout_ms,
            }
        } else if e.is_decode() {
            McpError::protocol(server, format!("failed to decode response: {e}"))
        } else {
            McpError::ConnectionFailed {
                server: server.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Result alias for MCP client operations.
pub type McpResult<T> = Result<T, McpError>;
