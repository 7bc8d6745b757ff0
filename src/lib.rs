pub mod commands;
pub mod config;
pub mod events;
pub mod mcp_client;
pub mod store;
pub mod tasks;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use commands::Hub;
use mcp_client::LoggingAuthorizer;
use store::HubDatabase;

/// Return the platform-standard data directory for mcphub.
///
/// - macOS: `~/Library/Application Support/mcphub/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcphub\`
/// - Linux: `$XDG_DATA_HOME/mcphub/` (fallback `~/.local/share/mcphub/`)
///
/// Falls back to `~/.mcphub/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcphub");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcphub")
}

/// Initialize the tracing subscriber, writing to `hub.log` in the data dir.
///
/// On each startup:
/// 1. Rotates existing logs (hub.log → hub.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh hub.log with a line-flushing writer.
/// 3. Logs a startup banner with the data directory path.
pub fn init_tracing(log_dir: &Path) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join("hub.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcphub=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcphub starting ==="
    );
    Ok(())
}

/// Rotate log files: `hub.log` → `hub.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so a
/// crash never loses the last log lines.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolve the SQLite database path: the configured one, else `hub.db` in
/// the data directory.
fn resolve_db_path(configured: Option<&str>, data_dir: &Path) -> String {
    match configured {
        Some(path) => path.to_string(),
        None => data_dir.join("hub.db").to_string_lossy().into_owned(),
    }
}

/// Run the hub as a headless daemon until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let dir = data_dir();
    init_tracing(&dir)?;

    let config = config::load_or_default(&dir).context("failed to load hub config")?;

    let db_path = resolve_db_path(config.database_path.as_deref(), &dir);
    let db = HubDatabase::open(&db_path)
        .with_context(|| format!("failed to open hub database at {db_path}"))?;
    tracing::info!(db_path = %db_path, "hub database initialized");

    let hub = Hub::new(config, Arc::new(db), Arc::new(LoggingAuthorizer))?;
    hub.restore()?;
    hub.start_monitoring();
    tracing::info!(servers = hub.list_servers().len(), "hub ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    hub.shutdown().await;
    tracing::info!("=== mcphub stopped ===");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_keeps_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("hub.log");
        for generation in 0..5 {
            std::fs::write(&base, format!("run {generation}")).unwrap();
            rotate_log_file(&base, 3);
        }
        assert!(!base.exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("hub.log.1")).unwrap(), "run 4");
        assert_eq!(std::fs::read_to_string(dir.path().join("hub.log.3")).unwrap(), "run 2");
        assert!(!dir.path().join("hub.log.4").exists());
    }

    #[test]
    fn test_db_path_prefers_config() {
        let dir = Path::new("/data");
        assert_eq!(resolve_db_path(Some("/tmp/x.db"), dir), "/tmp/x.db");
        assert!(resolve_db_path(None, dir).ends_with("hub.db"));
    }
}
