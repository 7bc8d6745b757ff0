//! Server registry: the single owner of server definitions, sessions,
//! health records and cached tool lists.
//!
//! Every mutation is applied under one lock and published on the event bus
//! before the lock is released. A per-server `generation` counter is bumped
//! whenever the connection-relevant fields change, so a handshake that
//! started against the old endpoint cannot install its session afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use super::errors::{McpError, McpResult};
use super::health::{HealthRecord, HealthStatus, ProbeOutcome};
use super::server::{NewServer, RemoteServer, ServerId, ServerUpdate, Session};
use super::types::Tool;
use crate::events::{EventBus, HubEvent, Snapshot};

struct Entry {
    server: RemoteServer,
    session: Option<Session>,
    health: HealthRecord,
    tools: Option<Vec<Tool>>,
    generation: u64,
}

impl Entry {
    fn new(server: RemoteServer) -> Self {
        let health = HealthRecord::new(server.id.clone());
        Self {
            server,
            session: None,
            health,
            tools: None,
            generation: 0,
        }
    }

    fn drop_connection(&mut self) {
        self.session = None;
        self.tools = None;
        self.server.session_id = None;
        self.server.protocol_version = None;
        self.server.capabilities = None;
        self.server.server_info = None;
        self.generation += 1;
    }
}

/// In-memory registry of remote servers.
pub struct ServerRegistry {
    servers: Mutex<HashMap<ServerId, Entry>>,
    bus: Arc<EventBus>,
}

impl ServerRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServerId, Entry>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // ─── Definitions ────────────────────────────────────────────────────

    /// Validate and register a new server.
    pub fn add(&self, new: NewServer) -> McpResult<RemoteServer> {
        new.validate()?;
        let now = Utc::now();
        let mut servers = self.lock();
        let server = RemoteServer {
            id: ServerId::generate(),
            name: new.name,
            description: new.description,
            endpoint: new.endpoint,
            auth: new.auth,
            health_policy: new.health_policy,
            status: HealthStatus::Unknown,
            session_id: None,
            protocol_version: None,
            capabilities: None,
            server_info: None,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
            version: self.bus.next_revision(),
        };
        tracing::info!(
            server = %server.id,
            name = %server.name,
            endpoint = %server.endpoint,
            auth = server.auth.auth_type(),
            "server registered"
        );
        self.bus.publish(HubEvent::ServerAdded {
            server: server.clone(),
        });
        servers.insert(server.id.clone(), Entry::new(server.clone()));
        Ok(server)
    }

    /// Re-register a persisted definition. Connection state starts empty.
    pub fn restore(&self, mut server: RemoteServer) -> McpResult<RemoteServer> {
        super::server::validate_https("endpoint", &server.endpoint)?;
        server.auth.validate()?;
        server.health_policy.validate()?;
        Ok(self.insert(server))
    }

    fn insert(&self, mut server: RemoteServer) -> RemoteServer {
        let mut servers = self.lock();
        server.status = HealthStatus::Unknown;
        server.session_id = None;
        server.protocol_version = None;
        server.capabilities = None;
        server.server_info = None;
        server.version = self.bus.next_revision();
        self.bus.publish(HubEvent::ServerAdded {
            server: server.clone(),
        });
        servers.insert(server.id.clone(), Entry::new(server.clone()));
        server
    }

    /// Register a plain-http endpoint, bypassing validation. Tests only.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, name: &str, endpoint: &str) -> ServerId {
        let now = Utc::now();
        let server = RemoteServer {
            id: ServerId::generate(),
            name: name.to_string(),
            description: None,
            endpoint: endpoint.to_string(),
            auth: Default::default(),
            health_policy: Default::default(),
            status: HealthStatus::Unknown,
            session_id: None,
            protocol_version: None,
            capabilities: None,
            server_info: None,
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        self.insert(server).id
    }

    /// Apply a partial edit. Changing the endpoint or credentials drops the
    /// session so the next call re-handshakes.
    pub fn update(&self, id: &ServerId, update: ServerUpdate) -> McpResult<RemoteServer> {
        self.update_with(id, update, |_| Ok::<(), McpError>(()))
    }

    /// Like [`update`](Self::update), but `persist` sees the edited
    /// definition first. Nothing changes in memory unless it succeeds.
    pub fn update_with<E, F>(&self, id: &ServerId, update: ServerUpdate, persist: F) -> Result<RemoteServer, E>
    where
        E: From<McpError>,
        F: FnOnce(&RemoteServer) -> Result<(), E>,
    {
        update.validate()?;
        let mut servers = self.lock();
        let entry = servers.get_mut(id).ok_or_else(|| not_found(id))?;

        let drops_session = update.touches_connection(&entry.server);
        let mut server = entry.server.clone();
        if let Some(name) = update.name {
            server.name = name;
        }
        if let Some(description) = update.description {
            server.description = Some(description);
        }
        if let Some(endpoint) = update.endpoint {
            server.endpoint = endpoint;
        }
        if let Some(auth) = update.auth {
            server.auth = auth;
        }
        if let Some(policy) = update.health_policy {
            server.health_policy = policy;
        }
        if let Some(metadata) = update.metadata {
            server.metadata = metadata;
        }
        server.updated_at = Utc::now();
        persist(&server)?;

        entry.server = server;
        if drops_session {
            tracing::info!(server = %id, "connection settings changed, dropping session");
            entry.drop_connection();
        }
        entry.server.version = self.bus.next_revision();
        let server = entry.server.clone();
        self.bus.publish(HubEvent::ServerUpdated {
            server: server.clone(),
        });
        Ok(server)
    }

    pub fn remove(&self, id: &ServerId) -> McpResult<RemoteServer> {
        let mut servers = self.lock();
        let entry = servers.remove(id).ok_or_else(|| not_found(id))?;
        tracing::info!(server = %id, name = %entry.server.name, "server removed");
        self.bus.publish(HubEvent::ServerRemoved {
            server_id: id.clone(),
            revision: self.bus.next_revision(),
        });
        Ok(entry.server)
    }

    pub fn get(&self, id: &ServerId) -> McpResult<RemoteServer> {
        self.lock()
            .get(id)
            .map(|e| e.server.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Definition plus the generation it was read at.
    pub fn get_with_generation(&self, id: &ServerId) -> McpResult<(RemoteServer, u64)> {
        self.lock()
            .get(id)
            .map(|e| (e.server.clone(), e.generation))
            .ok_or_else(|| not_found(id))
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.lock().contains_key(id)
    }

    /// All servers, oldest first.
    pub fn list(&self) -> Vec<RemoteServer> {
        let mut servers: Vec<RemoteServer> = self.lock().values().map(|e| e.server.clone()).collect();
        servers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        servers
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Snapshot<RemoteServer> {
        let servers = self.lock();
        Snapshot {
            items: servers.values().map(|e| e.server.clone()).collect(),
            watermark: self.bus.current_revision(),
        }
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    pub fn session(&self, id: &ServerId) -> Option<Session> {
        self.lock().get(id).and_then(|e| e.session.clone())
    }

    /// Install a session negotiated against `generation`.
    ///
    /// Returns `false` (and installs nothing) when the definition changed
    /// while the handshake was in flight.
    pub fn set_session(&self, id: &ServerId, generation: u64, session: Session) -> McpResult<bool> {
        let mut servers = self.lock();
        let entry = servers.get_mut(id).ok_or_else(|| not_found(id))?;
        if entry.generation != generation {
            tracing::debug!(server = %id, "discarding session from a stale handshake");
            return Ok(false);
        }

        let server = &mut entry.server;
        server.session_id = session.session_id.clone();
        server.protocol_version = Some(session.protocol_version.clone());
        server.capabilities = Some(session.capabilities.clone());
        server.server_info = Some(session.server_info.clone());
        server.updated_at = Utc::now();
        server.version = self.bus.next_revision();
        entry.session = Some(session);

        self.bus.publish(HubEvent::ServerUpdated {
            server: server.clone(),
        });
        Ok(true)
    }

    /// Forget the session. Returns whether one was held.
    pub fn clear_session(&self, id: &ServerId) -> bool {
        let mut servers = self.lock();
        let Some(entry) = servers.get_mut(id) else {
            return false;
        };
        if entry.session.is_none() {
            return false;
        }
        entry.drop_connection();
        entry.server.updated_at = Utc::now();
        entry.server.version = self.bus.next_revision();
        self.bus.publish(HubEvent::ServerUpdated {
            server: entry.server.clone(),
        });
        true
    }

    // ─── Tool cache ─────────────────────────────────────────────────────

    /// Cache a tool list fetched under `generation`.
    pub fn set_tools(&self, id: &ServerId, generation: u64, tools: Vec<Tool>) {
        if let Some(entry) = self.lock().get_mut(id) {
            if entry.generation == generation {
                entry.tools = Some(tools);
            }
        }
    }

    pub fn tools(&self, id: &ServerId) -> Option<Vec<Tool>> {
        self.lock().get(id).and_then(|e| e.tools.clone())
    }

    // ─── Health ─────────────────────────────────────────────────────────

    /// Fold a probe outcome into the server's record and publish it.
    ///
    /// The server definition is republished only when the status changed.
    pub fn record_health(&self, id: &ServerId, outcome: &ProbeOutcome) -> McpResult<HealthRecord> {
        let mut servers = self.lock();
        let entry = servers.get_mut(id).ok_or_else(|| not_found(id))?;

        let change = entry
            .health
            .apply(outcome, &entry.server.health_policy, Utc::now());
        entry.health.version = self.bus.next_revision();
        let record = entry.health.clone();

        if let Some(transition) = change.transition {
            tracing::warn!(
                server = %id,
                from = ?change.previous,
                to = ?change.current,
                ?transition,
                error = record.last_error.as_deref().unwrap_or(""),
                "server health transition"
            );
        }

        self.bus.publish(HubEvent::HealthChanged {
            record: record.clone(),
            previous: change.previous,
            status_changed: change.status_changed(),
            transition: change.transition,
        });

        if change.status_changed() {
            entry.server.status = change.current;
            entry.server.version = self.bus.next_revision();
            self.bus.publish(HubEvent::ServerUpdated {
                server: entry.server.clone(),
            });
        }
        Ok(record)
    }

    pub fn health(&self, id: &ServerId) -> McpResult<HealthRecord> {
        self.lock()
            .get(id)
            .map(|e| e.health.clone())
            .ok_or_else(|| not_found(id))
    }

    pub fn health_snapshot(&self) -> Snapshot<HealthRecord> {
        let servers = self.lock();
        Snapshot {
            items: servers.values().map(|e| e.health.clone()).collect(),
            watermark: self.bus.current_revision(),
        }
    }
}

fn not_found(id: &ServerId) -> McpError {
    McpError::ServerNotFound { id: id.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::server::AuthConfig;
    use crate::mcp_client::types::{Implementation, ServerCapabilities};

    fn registry() -> (Arc<EventBus>, ServerRegistry) {
        let bus = Arc::new(EventBus::new());
        (Arc::clone(&bus), ServerRegistry::new(bus))
    }

    fn session(id: &str) -> Session {
        Session {
            session_id: Some(id.to_string()),
            protocol_version: "2025-06-18".into(),
            capabilities: ServerCapabilities::default(),
            server_info: Implementation {
                name: "remote".into(),
                version: Some("1.0".into()),
            },
            established_at: Utc::now(),
        }
    }

    #[test]
    fn test_add_validates_and_publishes() {
        let (bus, reg) = registry();
        let mut events = bus.subscribe(HubEvent::is_server_event);

        assert!(matches!(
            reg.add(NewServer::new("x", "http://insecure.example.com")),
            Err(McpError::InvalidConfig { .. })
        ));
        assert!(reg.is_empty());

        let server = reg.add(NewServer::new("docs", "https://mcp.example.com/mcp")).unwrap();
        assert_eq!(server.status, HealthStatus::Unknown);
        match events.try_recv() {
            Some(HubEvent::ServerAdded { server: s }) => assert_eq!(s.id, server.id),
            other => panic!("expected ServerAdded, got {other:?}"),
        }
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn test_update_bumps_version_and_drops_session_on_endpoint_change() {
        let (_bus, reg) = registry();
        let server = reg.add(NewServer::new("docs", "https://a.example.com")).unwrap();
        let (_, generation) = reg.get_with_generation(&server.id).unwrap();
        assert!(reg.set_session(&server.id, generation, session("s-1")).unwrap());
        assert_eq!(reg.get(&server.id).unwrap().session_id.as_deref(), Some("s-1"));

        let renamed = reg
            .update(
                &server.id,
                ServerUpdate {
                    name: Some("docs-2".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(renamed.version > server.version);
        assert!(reg.session(&server.id).is_some());

        let moved = reg
            .update(
                &server.id,
                ServerUpdate {
                    endpoint: Some("https://b.example.com".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(moved.session_id.is_none());
        assert!(reg.session(&server.id).is_none());
    }

    #[test]
    fn test_stale_handshake_is_discarded() {
        let (_bus, reg) = registry();
        let server = reg.add(NewServer::new("docs", "https://a.example.com")).unwrap();
        let (_, generation) = reg.get_with_generation(&server.id).unwrap();

        reg.update(
            &server.id,
            ServerUpdate {
                auth: Some(AuthConfig::Bearer {
                    token: "new".into(),
                }),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(!reg.set_session(&server.id, generation, session("old")).unwrap());
        assert!(reg.session(&server.id).is_none());
    }

    #[test]
    fn test_update_rejects_invalid_edit() {
        let (_bus, reg) = registry();
        let server = reg.add(NewServer::new("docs", "https://a.example.com")).unwrap();
        let err = reg
            .update(
                &server.id,
                ServerUpdate {
                    endpoint: Some("ftp://a.example.com".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig { .. }));
        assert_eq!(reg.get(&server.id).unwrap().endpoint, "https://a.example.com");
    }

    #[test]
    fn test_update_with_failed_persist_keeps_definition_and_session() {
        let (bus, reg) = registry();
        let server = reg.add(NewServer::new("docs", "https://a.example.com")).unwrap();
        let (_, generation) = reg.get_with_generation(&server.id).unwrap();
        assert!(reg.set_session(&server.id, generation, session("s-1")).unwrap());
        let before = reg.get(&server.id).unwrap();
        let mut events = bus.subscribe(HubEvent::is_server_event);

        let err = reg
            .update_with(
                &server.id,
                ServerUpdate {
                    endpoint: Some("https://b.example.com".into()),
                    ..Default::default()
                },
                |staged| {
                    assert_eq!(staged.endpoint, "https://b.example.com");
                    Err(McpError::protocol("docs", "disk full"))
                },
            )
            .unwrap_err();
        assert!(matches!(err, McpError::ProtocolError { .. }));
        let after = reg.get(&server.id).unwrap();
        assert_eq!(after.endpoint, before.endpoint);
        assert_eq!(after.version, before.version);
        assert_eq!(after.session_id.as_deref(), Some("s-1"));
        assert!(reg.session(&server.id).is_some());
        assert_eq!(reg.get_with_generation(&server.id).unwrap().1, generation);
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn test_remove_and_not_found() {
        let (bus, reg) = registry();
        let server = reg.add(NewServer::new("docs", "https://a.example.com")).unwrap();
        let mut events = bus.subscribe(HubEvent::is_server_event);

        reg.remove(&server.id).unwrap();
        match events.try_recv() {
            Some(HubEvent::ServerRemoved { server_id, revision }) => {
                assert_eq!(server_id, server.id);
                assert!(revision > server.version);
            }
            other => panic!("expected ServerRemoved, got {other:?}"),
        }
        assert!(matches!(reg.get(&server.id), Err(McpError::ServerNotFound { .. })));
        assert!(matches!(reg.remove(&server.id), Err(McpError::ServerNotFound { .. })));
    }

    #[test]
    fn test_record_health_republishes_on_status_change_only() {
        let (bus, reg) = registry();
        let server = reg.add(NewServer::new("docs", "https://a.example.com")).unwrap();
        let mut events = bus.subscribe(|_| true);

        reg.record_health(&server.id, &ProbeOutcome::Success { latency_ms: 12 })
            .unwrap();
        assert!(matches!(events.try_recv(), Some(HubEvent::HealthChanged { status_changed: true, .. })));
        assert!(matches!(events.try_recv(), Some(HubEvent::ServerUpdated { .. })));

        reg.record_health(&server.id, &ProbeOutcome::Success { latency_ms: 14 })
            .unwrap();
        assert!(matches!(events.try_recv(), Some(HubEvent::HealthChanged { status_changed: false, .. })));
        assert!(events.try_recv().is_none());

        assert_eq!(reg.get(&server.id).unwrap().status, HealthStatus::Healthy);
        assert_eq!(reg.health(&server.id).unwrap().consecutive_successes, 2);
    }

    #[test]
    fn test_snapshot_watermark_covers_items() {
        let (_bus, reg) = registry();
        reg.add(NewServer::new("a", "https://a.example.com")).unwrap();
        reg.add(NewServer::new("b", "https://b.example.com")).unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap.items.len(), 2);
        assert!(snap.items.iter().all(|s| s.version <= snap.watermark));
        assert_eq!(reg.list()[0].name, "a");
    }

    #[test]
    fn test_tool_cache_generation_guard() {
        let (_bus, reg) = registry();
        let server = reg.add(NewServer::new("docs", "https://a.example.com")).unwrap();
        let (_, generation) = reg.get_with_generation(&server.id).unwrap();
        let tool: Tool = serde_json::from_value(serde_json::json!({
            "name": "search", "inputSchema": {"type": "object"}
        }))
        .unwrap();

        reg.set_tools(&server.id, generation + 1, vec![tool.clone()]);
        assert!(reg.tools(&server.id).is_none());
        reg.set_tools(&server.id, generation, vec![tool]);
        assert_eq!(reg.tools(&server.id).unwrap().len(), 1);
    }
}
