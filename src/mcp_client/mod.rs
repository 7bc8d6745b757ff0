//! MCP client: JSON-RPC over streamable HTTP for remote MCP servers.
//!
//! This module handles:
//! - Server definitions and the registry that owns them (`server`, `registry`)
//! - Session handshakes, tool calls and discovery (`client`)
//! - SSE framing of streamed responses (`sse`)
//! - Per-request credentials and OAuth2 refresh (`auth`)
//! - Periodic health probing and classification (`health`)
//!
//! Concurrent handshakes and token refreshes for one server are collapsed by
//! `single_flight`.

pub mod auth;
pub mod client;
pub mod errors;
pub mod health;
pub mod registry;
pub mod server;
pub mod single_flight;
pub mod sse;
pub mod types;

// Re-exports for convenience
pub use auth::{AuthProvider, AuthorizationRequest, Authorizer, LoggingAuthorizer, NoopAuthorizer, OAuthTokenSet};
pub use client::{CallMode, CallOptions, McpClient, PendingCall, ProgressUpdate};
pub use errors::{ErrorKind, McpError, McpResult};
pub use health::{HealthMonitor, HealthRecord, HealthStatus, ProbeOutcome};
pub use registry::ServerRegistry;
pub use server::{AuthConfig, HealthPolicy, NewServer, RemoteServer, ServerId, ServerUpdate, Session};
pub use types::{Prompt, Resource, Tool, ToolCallResult, ToolContent};
