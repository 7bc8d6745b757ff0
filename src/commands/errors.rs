//! Errors returned across the command boundary.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::config::ConfigError;
use crate::mcp_client::{ErrorKind, McpError};
use crate::store::StoreError;
use crate::tasks::TaskError;

#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Mcp(e) => e.kind(),
            HubError::Task(e) => e.kind(),
            HubError::Store(e) => e.kind(),
            HubError::Config(e) => e.kind(),
        }
    }
}

/// Serialized as `{ "kind": ..., "message": ... }` for the presentation layer.
impl Serialize for HubError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("HubError", 2)?;
        s.serialize_field("kind", &self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}
