//! Server commands: registration, edits, discovery and health checks.

use std::time::Instant;

use crate::mcp_client::{
    HealthPolicy, HealthRecord, NewServer, Prompt, RemoteServer, Resource, ServerId, ServerUpdate,
    Session, Tool,
};
use crate::tasks::TaskFilter;

use super::{Hub, HubError};

impl Hub {
    // ─── Definitions ────────────────────────────────────────────────────────

    /// Register a server. Validation happens before anything is stored or
    /// sent; an invalid definition leaves no trace.
    pub fn add_server(&self, mut new: NewServer) -> Result<RemoteServer, HubError> {
        new.health_policy = self.inherit_health_defaults(new.health_policy);
        let server = self.servers.add(new)?;
        if let Err(e) = self.store.save_server(&server) {
            let _ = self.servers.remove(&server.id);
            return Err(e.into());
        }
        tracing::info!(server = %server.id, name = %server.name, "server added");
        Ok(server)
    }

    /// Edit a server. Endpoint or auth changes close the current session
    /// first so nothing keeps talking to the old configuration.
    ///
    /// The edit is stored before it takes effect; a store failure leaves
    /// the previous definition in place.
    pub async fn update_server(
        &self,
        id: &ServerId,
        update: ServerUpdate,
    ) -> Result<RemoteServer, HubError> {
        update.validate()?;
        let current = self.servers.get(id)?;
        if update.touches_connection(&current) {
            if let Err(e) = self.client.close(id).await {
                tracing::debug!(server = %id, error = %e, "best-effort close before reconfigure failed");
            }
            self.auth.invalidate(id);
        }
        self.servers.update_with(id, update, |staged| {
            self.store.save_server(staged).map_err(HubError::from)
        })
    }

    /// Remove a server, cancelling its tasks and closing its session.
    ///
    /// The stored row goes first; if that fails nothing else is touched.
    pub async fn remove_server(&self, id: &ServerId) -> Result<(), HubError> {
        self.servers.get(id)?;
        self.store.delete_server(id)?;

        let filter = TaskFilter {
            server_id: Some(id.clone()),
            active_only: true,
            ..TaskFilter::default()
        };
        for task in self.tasks.list(&filter) {
            if task.cancellable {
                if let Err(e) = self.supervisor.cancel(&task.id) {
                    tracing::debug!(task = %task.id, error = %e, "cancel during server removal failed");
                }
            }
        }

        if let Err(e) = self.client.close(id).await {
            tracing::debug!(server = %id, error = %e, "best-effort close before removal failed");
        }
        self.servers.remove(id)?;
        self.auth.forget(id);
        tracing::info!(server = %id, "server removed");
        Ok(())
    }

    /// Replace untouched classification fields with the configured defaults.
    ///
    /// `enabled` and `interval_seconds` are always the caller's.
    fn inherit_health_defaults(&self, policy: HealthPolicy) -> HealthPolicy {
        let builtin = HealthPolicy {
            enabled: policy.enabled,
            interval_seconds: policy.interval_seconds,
            ..HealthPolicy::default()
        };
        if policy != builtin {
            return policy;
        }
        let interval = (policy.interval_seconds != HealthPolicy::default().interval_seconds)
            .then_some(policy.interval_seconds);
        self.config.health.policy(policy.enabled, interval)
    }

    pub fn list_servers(&self) -> Vec<RemoteServer> {
        self.servers.list()
    }

    pub fn get_server(&self, id: &ServerId) -> Result<RemoteServer, HubError> {
        Ok(self.servers.get(id)?)
    }

    // ─── Connection ─────────────────────────────────────────────────────────

    /// Probe the server now and return its updated health record.
    ///
    /// Probe failures are folded into the record, never returned as errors.
    pub async fn test_connection(&self, id: &ServerId) -> Result<HealthRecord, HubError> {
        let started = Instant::now();
        let record = self.monitor.check_now(id).await?;
        tracing::info!(
            server = %id,
            status = ?record.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connection test finished"
        );
        Ok(record)
    }

    /// Establish (or reuse) a session without calling anything.
    pub async fn connect_server(&self, id: &ServerId) -> Result<Session, HubError> {
        Ok(self.client.connect(id).await?)
    }

    /// Close the session, if any. The next call re-handshakes.
    pub async fn disconnect_server(&self, id: &ServerId) -> Result<(), HubError> {
        Ok(self.client.close(id).await?)
    }

    // ─── Discovery ──────────────────────────────────────────────────────────

    /// Tools served by `id`, from cache when a session has already listed them.
    pub async fn list_tools(&self, id: &ServerId) -> Result<Vec<Tool>, HubError> {
        Ok(self.client.list_tools(id).await?)
    }

    pub async fn refresh_tools(&self, id: &ServerId) -> Result<Vec<Tool>, HubError> {
        Ok(self.client.refresh_tools(id).await?)
    }

    pub async fn list_resources(&self, id: &ServerId) -> Result<Vec<Resource>, HubError> {
        Ok(self.client.list_resources(id).await?)
    }

    pub async fn list_prompts(&self, id: &ServerId) -> Result<Vec<Prompt>, HubError> {
        Ok(self.client.list_prompts(id).await?)
    }

    // ─── Health ─────────────────────────────────────────────────────────────

    pub fn server_health(&self, id: &ServerId) -> Result<HealthRecord, HubError> {
        Ok(self.servers.health(id)?)
    }
}
