//! SQLite persistence for server definitions, task history and the call audit.
//!
//! Uses `rusqlite` synchronously behind a mutex; every statement is short.
//! WAL mode is enabled so readers never wait on the writer.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::errors::StoreError;
use super::{CallAuditEntry, CallStatus, Persistence};
use crate::mcp_client::{HealthStatus, RemoteServer, ServerId};
use crate::tasks::Task;

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database handle for the hub.
pub struct HubDatabase {
    conn: Mutex<Connection>,
}

impl HubDatabase {
    /// Open (or create) the hub database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS remote_servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                endpoint TEXT NOT NULL,
                auth_type TEXT NOT NULL,
                auth_config TEXT NOT NULL,
                health_policy TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_history (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                server_id TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER,
                error TEXT,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_task_history_completed
                ON task_history(completed_at);

            CREATE TABLE IF NOT EXISTS call_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                arguments_sha256 TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_call_audit_server
                ON call_audit(server_id, id);
            ",
        )?;
        Ok(())
    }

    // ─── Servers ────────────────────────────────────────────────────────

    /// Look up one stored server definition.
    pub fn get_server(&self, id: &ServerId) -> Result<Option<RemoteServer>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, name, description, endpoint, auth_config, health_policy, metadata,
                        created_at, updated_at
                 FROM remote_servers WHERE id = ?1",
                params![id.as_str()],
                read_server_row,
            )
            .optional()?;
        row.map(ServerRow::into_server).transpose()
    }

    // ─── Audit ──────────────────────────────────────────────────────────

    /// Most recent audit entries for a server, newest first.
    pub fn call_audit(&self, server_id: &ServerId, limit: usize) -> Result<Vec<CallAuditEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT server_id, tool_name, arguments_sha256, status, duration_ms, timestamp
             FROM call_audit WHERE server_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![server_id.as_str(), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (server_id, tool_name, digest, status, duration_ms, timestamp) = row?;
            entries.push(CallAuditEntry {
                server_id: ServerId::from(server_id),
                tool_name,
                arguments_digest: digest,
                status: CallStatus::parse(&status),
                duration_ms: duration_ms.max(0) as u64,
                timestamp: parse_time(&timestamp)?,
            });
        }
        Ok(entries)
    }
}

impl Persistence for HubDatabase {
    fn save_server(&self, server: &RemoteServer) -> Result<(), StoreError> {
        let auth = serde_json::to_string(&server.auth)?;
        let policy = serde_json::to_string(&server.health_policy)?;
        let metadata = serde_json::to_string(&server.metadata)?;
        self.conn().execute(
            "INSERT INTO remote_servers
                (id, name, description, endpoint, auth_type, auth_config, health_policy,
                 metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                endpoint = excluded.endpoint,
                auth_type = excluded.auth_type,
                auth_config = excluded.auth_config,
                health_policy = excluded.health_policy,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![
                server.id.as_str(),
                server.name,
                server.description,
                server.endpoint,
                server.auth.auth_type(),
                auth,
                policy,
                metadata,
                server.created_at.to_rfc3339(),
                server.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_server(&self, id: &ServerId) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM remote_servers WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn load_servers(&self) -> Result<Vec<RemoteServer>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, endpoint, auth_config, health_policy, metadata,
                    created_at, updated_at
             FROM remote_servers ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], read_server_row)?;

        let mut servers = Vec::new();
        for row in rows {
            servers.push(row?.into_server()?);
        }
        Ok(servers)
    }

    fn record_task(&self, task: &Task) -> Result<(), StoreError> {
        let body = serde_json::to_string(task)?;
        let kind = serde_json::to_value(task.kind)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO task_history
                (id, kind, name, status, server_id, created_at, completed_at, duration_ms,
                 error, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id.as_str(),
                kind.as_str().unwrap_or_default(),
                task.name,
                task.status.as_str(),
                task.server_id.as_ref().map(ServerId::as_str),
                task.created_at.to_rfc3339(),
                task.completed_at.map(|t| t.to_rfc3339()),
                task.duration_ms.map(|d| d as i64),
                task.error,
                body,
            ],
        )?;
        Ok(())
    }

    fn task_history(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT body FROM task_history ORDER BY completed_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut tasks = Vec::new();
        for body in rows {
            tasks.push(serde_json::from_str(&body?)?);
        }
        Ok(tasks)
    }

    fn record_call(&self, entry: &CallAuditEntry) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO call_audit
                (server_id, tool_name, arguments_sha256, status, duration_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.server_id.as_str(),
                entry.tool_name,
                entry.arguments_digest,
                entry.status.as_str(),
                entry.duration_ms as i64,
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

struct ServerRow {
    id: String,
    name: String,
    description: Option<String>,
    endpoint: String,
    auth: String,
    policy: String,
    metadata: String,
    created_at: String,
    updated_at: String,
}

fn read_server_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServerRow> {
    Ok(ServerRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        endpoint: row.get(3)?,
        auth: row.get(4)?,
        policy: row.get(5)?,
        metadata: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl ServerRow {
    /// Restored servers start with no session and unknown health.
    fn into_server(self) -> Result<RemoteServer, StoreError> {
        Ok(RemoteServer {
            id: ServerId::from(self.id),
            name: self.name,
            description: self.description,
            endpoint: self.endpoint,
            auth: serde_json::from_str(&self.auth)?,
            health_policy: serde_json::from_str(&self.policy)?,
            status: HealthStatus::Unknown,
            session_id: None,
            protocol_version: None,
            capabilities: None,
            server_info: None,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            version: 0,
        })
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::SerializationError {
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::{AuthConfig, HealthPolicy};
    use crate::tasks::{TaskKind, TaskSpec, TaskStatus};
    use std::collections::BTreeMap;

    fn test_db() -> HubDatabase {
        HubDatabase::open(":memory:").unwrap()
    }

    fn server(id: &str) -> RemoteServer {
        let now = Utc::now();
        RemoteServer {
            id: ServerId::from(id),
            name: "vps-1".into(),
            description: Some("primary".into()),
            endpoint: "https://example.com/mcp".into(),
            auth: AuthConfig::Bearer {
                token: "tok".into(),
            },
            health_policy: HealthPolicy::default(),
            status: HealthStatus::Healthy,
            session_id: Some("sess-1".into()),
            protocol_version: None,
            capabilities: None,
            server_info: None,
            metadata: BTreeMap::from([("region".to_string(), "eu".to_string())]),
            created_at: now,
            updated_at: now,
            version: 12,
        }
    }

    #[test]
    fn test_server_roundtrip_resets_runtime_state() {
        let db = test_db();
        db.save_server(&server("s1")).unwrap();

        let loaded = db.load_servers().unwrap();
        assert_eq!(loaded.len(), 1);
        let s = &loaded[0];
        assert_eq!(s.name, "vps-1");
        assert_eq!(s.metadata.get("region").map(String::as_str), Some("eu"));
        assert_eq!(s.status, HealthStatus::Unknown);
        assert!(s.session_id.is_none());
        assert!(matches!(s.auth, AuthConfig::Bearer { .. }));
    }

    #[test]
    fn test_save_server_upserts() {
        let db = test_db();
        let mut s = server("s1");
        db.save_server(&s).unwrap();
        s.name = "vps-renamed".into();
        db.save_server(&s).unwrap();

        assert_eq!(db.load_servers().unwrap().len(), 1);
        assert_eq!(
            db.get_server(&ServerId::from("s1")).unwrap().unwrap().name,
            "vps-renamed"
        );
    }

    #[test]
    fn test_delete_server() {
        let db = test_db();
        db.save_server(&server("s1")).unwrap();
        db.delete_server(&ServerId::from("s1")).unwrap();
        assert!(db.get_server(&ServerId::from("s1")).unwrap().is_none());
    }

    #[test]
    fn test_task_history() {
        let db = test_db();
        let mut task = Task::new(TaskSpec::new(TaskKind::RemoteToolCall, "search"), 3);
        task.finish(TaskStatus::Failed);
        task.error = Some("boom".into());
        db.record_task(&task).unwrap();

        let history = db.task_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, task.id);
        assert_eq!(history[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_call_audit_stores_digest_only() {
        let db = test_db();
        let args = serde_json::json!({"token": "secret-value"});
        let entry = CallAuditEntry::new(
            ServerId::from("s1"),
            "deploy",
            Some(&args),
            CallStatus::Success,
            42,
        );
        db.record_call(&entry).unwrap();

        let entries = db.call_audit(&ServerId::from("s1"), 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool_name, "deploy");
        assert_eq!(entries[0].duration_ms, 42);
        assert!(!entries[0].arguments_digest.contains("secret"));
    }

    #[test]
    fn test_file_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.db");
        let path = path.to_str().unwrap();
        {
            let db = HubDatabase::open(path).unwrap();
            db.save_server(&server("s1")).unwrap();
        }
        let db = HubDatabase::open(path).unwrap();
        assert_eq!(db.load_servers().unwrap().len(), 1);
    }
}
