//! Event fan-out.
//!
//! Registries publish a `HubEvent` for every mutation while still holding
//! their own lock, so events for one entity reach each subscriber in commit
//! order. Every event carries the bus revision at which the mutation
//! committed; entity snapshots carry the same number as their `version`.
//!
//! Consumers treat events as idempotent snapshots and fold them into a
//! [`ReconcilingView`], which also merges periodic polls so the two sources
//! can never permanently disagree.

pub mod bus;
pub mod view;

pub use bus::{EventBus, Subscription, UnsubscribeHandle};
pub use view::{ReconcilingView, Snapshot, Versioned};

use serde::Serialize;

use crate::mcp_client::{HealthRecord, HealthStatus, RemoteServer, ServerId};
use crate::tasks::{Task, TaskId};

/// What crossing a health boundary means for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTransition {
    /// The failure threshold was just reached.
    Unreachable,
    /// An unhealthy server answered a probe again.
    Recovered,
}

/// A change to one entity.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        task: Task,
    },
    TaskRemoved {
        task_id: TaskId,
        revision: u64,
    },
    ServerAdded {
        server: RemoteServer,
    },
    ServerUpdated {
        server: RemoteServer,
    },
    ServerRemoved {
        server_id: ServerId,
        revision: u64,
    },
    HealthChanged {
        record: HealthRecord,
        previous: HealthStatus,
        status_changed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        transition: Option<HealthTransition>,
    },
}

/// Which entity an event is about. Ordering is guaranteed per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Task(TaskId),
    Server(ServerId),
    Health(ServerId),
}

impl HubEvent {
    pub fn entity(&self) -> EntityKey {
        match self {
            HubEvent::TaskCreated { task } | HubEvent::TaskUpdated { task } => {
                EntityKey::Task(task.id.clone())
            }
            HubEvent::TaskRemoved { task_id, .. } => EntityKey::Task(task_id.clone()),
            HubEvent::ServerAdded { server } | HubEvent::ServerUpdated { server } => {
                EntityKey::Server(server.id.clone())
            }
            HubEvent::ServerRemoved { server_id, .. } => EntityKey::Server(server_id.clone()),
            HubEvent::HealthChanged { record, .. } => EntityKey::Health(record.server_id.clone()),
        }
    }

    /// Bus revision at which the mutation committed.
    pub fn revision(&self) -> u64 {
        match self {
            HubEvent::TaskCreated { task } | HubEvent::TaskUpdated { task } => task.version,
            HubEvent::ServerAdded { server } | HubEvent::ServerUpdated { server } => server.version,
            HubEvent::HealthChanged { record, .. } => record.version,
            HubEvent::TaskRemoved { revision, .. } | HubEvent::ServerRemoved { revision, .. } => {
                *revision
            }
        }
    }

    pub fn is_task_event(&self) -> bool {
        matches!(self.entity(), EntityKey::Task(_))
    }

    pub fn is_server_event(&self) -> bool {
        matches!(self.entity(), EntityKey::Server(_))
    }

    pub fn is_health_event(&self) -> bool {
        matches!(self.entity(), EntityKey::Health(_))
    }
}
