//! Persistence boundary.
//!
//! The registries are authoritative in memory; this layer only mirrors server
//! definitions, terminal task history and a call audit trail so a restarted
//! daemon can restore its servers.

pub mod database;
pub mod errors;

pub use database::HubDatabase;
pub use errors::StoreError;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::mcp_client::{RemoteServer, ServerId};
use crate::tasks::Task;

/// Storage collaborator used by the hub.
pub trait Persistence: Send + Sync {
    fn save_server(&self, server: &RemoteServer) -> Result<(), StoreError>;
    fn delete_server(&self, id: &ServerId) -> Result<(), StoreError>;
    fn load_servers(&self) -> Result<Vec<RemoteServer>, StoreError>;

    fn record_task(&self, task: &Task) -> Result<(), StoreError>;
    fn task_history(&self, limit: usize) -> Result<Vec<Task>, StoreError>;

    fn record_call(&self, entry: &CallAuditEntry) -> Result<(), StoreError>;
}

/// Outcome column of the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    ToolError,
    Failed,
    Cancelled,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::ToolError => "tool_error",
            CallStatus::Failed => "failed",
            CallStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => CallStatus::Success,
            "tool_error" => CallStatus::ToolError,
            "cancelled" => CallStatus::Cancelled,
            _ => CallStatus::Failed,
        }
    }
}

/// One tool invocation, without its arguments or result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAuditEntry {
    pub server_id: ServerId,
    pub tool_name: String,
    /// Hex SHA-256 of the serialized arguments.
    pub arguments_digest: String,
    pub status: CallStatus,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl CallAuditEntry {
    pub fn new(
        server_id: ServerId,
        tool_name: impl Into<String>,
        arguments: Option<&Value>,
        status: CallStatus,
        duration_ms: u64,
    ) -> Self {
        Self {
            server_id,
            tool_name: tool_name.into(),
            arguments_digest: digest_arguments(arguments),
            status,
            duration_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Digest of tool arguments for the audit trail.
pub fn digest_arguments(arguments: Option<&Value>) -> String {
    let bytes = arguments.map(|v| v.to_string()).unwrap_or_default();
    let hash = Sha256::digest(bytes.as_bytes());
    hash.iter().map(|b| format!("{b:02x}")).collect()
}
