//! Consumer-facing commands.
//!
//! [`Hub`] owns one of each component and is the only boundary the
//! presentation layer calls into. Server commands live in `servers`, task
//! and tool-call commands in `tasks`. Every command returns [`HubError`],
//! which serializes as `{ kind, message }`.

pub mod errors;
pub mod servers;
pub mod tasks;

pub use errors::HubError;
pub use tasks::ToolCallHandle;

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use crate::config::HubConfig;
use crate::events::{EventBus, HubEvent, Snapshot, Subscription};
use crate::mcp_client::{
    AuthProvider, Authorizer, HealthMonitor, HealthPolicy, HealthRecord, McpClient, RemoteServer,
    ServerId, ServerRegistry,
};
use crate::store::Persistence;
use crate::tasks::{Task, TaskRegistry, TaskSupervisor};

/// The process root. Construct once and share by reference.
pub struct Hub {
    config: HubConfig,
    bus: Arc<EventBus>,
    servers: Arc<ServerRegistry>,
    auth: Arc<AuthProvider>,
    client: McpClient,
    monitor: Arc<HealthMonitor>,
    tasks: Arc<TaskRegistry>,
    supervisor: TaskSupervisor,
    store: Arc<dyn Persistence>,
    monitoring: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Wire every component from `config`. No network I/O happens here.
    pub fn new(
        config: HubConfig,
        store: Arc<dyn Persistence>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, HubError> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let servers = Arc::new(ServerRegistry::new(Arc::clone(&bus)));
        let auth = Arc::new(AuthProvider::new(config.auth.clone(), authorizer)?);
        let client = McpClient::new(
            config.transport.clone(),
            Arc::clone(&servers),
            Arc::clone(&auth),
        )?;
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&servers),
            Arc::clone(&auth),
            Arc::clone(&bus),
        )?);
        let tasks = Arc::new(
            TaskRegistry::new(Arc::clone(&bus), &config.tasks).with_store(Arc::clone(&store)),
        );
        let supervisor = TaskSupervisor::new(Arc::clone(&tasks), &config.tasks);

        Ok(Self {
            config,
            bus,
            servers,
            auth,
            client,
            monitor,
            tasks,
            supervisor,
            store,
            monitoring: Mutex::new(None),
        })
    }

    /// Load persisted server definitions into the registry.
    ///
    /// Rows that no longer validate are skipped with a warning. Returns the
    /// number restored.
    pub fn restore(&self) -> Result<usize, HubError> {
        let mut restored = 0;
        for server in self.store.load_servers()? {
            let id = server.id.clone();
            match self.servers.restore(server) {
                Ok(_) => restored += 1,
                Err(e) => tracing::warn!(server = %id, error = %e, "skipping invalid stored server"),
            }
        }
        tracing::info!(restored, "restored servers from store");
        Ok(restored)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Health policy new servers get when the caller does not choose one.
    pub fn default_health_policy(&self) -> HealthPolicy {
        self.config.health.policy(true, None)
    }

    // ─── Events ─────────────────────────────────────────────────────────────

    /// Subscribe to hub events accepted by `filter`.
    pub fn subscribe<F>(&self, filter: F) -> Subscription
    where
        F: Fn(&HubEvent) -> bool + Send + Sync + 'static,
    {
        self.bus.subscribe(filter)
    }

    pub fn task_snapshot(&self) -> Snapshot<Task> {
        self.tasks.snapshot()
    }

    pub fn server_snapshot(&self) -> Snapshot<RemoteServer> {
        self.servers.snapshot()
    }

    pub fn health_snapshot(&self) -> Snapshot<HealthRecord> {
        self.servers.health_snapshot()
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Start probe loops for every registered server and follow registry
    /// changes. Idempotent.
    pub fn start_monitoring(&self) {
        let mut slot = self.monitoring.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *slot = Some(self.monitor.start_monitoring());
    }

    /// Feed the result of an out-of-band OAuth2 authorization back in.
    pub fn complete_authorization(
        &self,
        server_id: &ServerId,
        state: &str,
        code: String,
    ) -> Result<(), HubError> {
        Ok(self.auth.complete_authorization(server_id, state, code)?)
    }

    /// Stop probing, cancel running tasks and close every open session.
    pub async fn shutdown(&self) {
        tracing::info!(
            servers = self.servers.len(),
            running_tasks = self.supervisor.running_count(),
            "hub shutting down"
        );
        self.monitor.shutdown();
        if let Some(handle) = self
            .monitoring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.supervisor.shutdown();

        for server in self.servers.list() {
            if server.session_id.is_none() && self.servers.session(&server.id).is_none() {
                continue;
            }
            if let Err(e) = self.client.close(&server.id).await {
                tracing::debug!(server = %server.id, error = %e, "close during shutdown failed");
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
