pub mod config;
pub mod orchestration;
pub mod storage;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::{Path, PathBuf};

use config::{ConfigError, OrchestratorConfig};
use orchestration::OrchestrationAdapter;
use storage::{BridgeDatabase, SharedDatabase, StoreError};

/// Return the platform-standard data directory for toolbridge.
///
/// - macOS: `~/Library/Application Support/toolbridge/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolbridge\`
/// - Linux: `$XDG_DATA_HOME/toolbridge/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolbridge/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolbridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolbridge")
}

/// `json` switches the log file to one JSON object per line.
pub const LOG_FORMAT_ENV: &str = "TOOLBRIDGE_LOG_FORMAT";

fn wants_json_logs(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}

/// Initialize the tracing subscriber, writing structured logs to `log_dir`.
///
/// 1. Rotates existing logs (toolbridge.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh toolbridge.log with a line-flushing writer, plain text
///    or JSON lines depending on `TOOLBRIDGE_LOG_FORMAT`.
/// 3. Logs a startup banner with the log path.
///
/// Returns the log file path. A subscriber installed earlier by the host
/// stays in place.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("toolbridge.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolbridge=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    let json = wants_json_logs(std::env::var(LOG_FORMAT_ENV).ok().as_deref());
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolbridge starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `toolbridge.log` → `.1` → `.2` → … → `.{keep}`.
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

/// A writer that wraps `std::fs::File` and flushes after every write.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
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

// ─── Startup ─────────────────────────────────────────────────────────────────

/// Open the SQLite store named by the configuration, creating its directory.
pub fn open_store(config: &OrchestratorConfig) -> Result<SharedDatabase, StoreError> {
    let path = config.resolved_database_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    BridgeDatabase::open_shared(&path.to_string_lossy())
}

/// Build an adapter from a loaded configuration and run the first discovery
/// pass. Backends stored in the database override file entries by id.
pub async fn start_orchestrator(
    mut config: OrchestratorConfig,
) -> Result<OrchestrationAdapter, ConfigError> {
    let db = open_store(&config)?;
    config.merge_database_backends(&storage::database::lock(&db))?;

    let adapter = OrchestrationAdapter::from_config(&config, db);
    let report = adapter.refresh_tools().await;
    tracing::info!(
        tools = report.registry.len(),
        failed_backends = report.failures.len() + adapter.config_failures().len(),
        "orchestrator ready"
    );
    Ok(adapter)
}

/// Load configuration starting from `start` and bring the orchestrator up.
pub async fn bootstrap(start: &Path) -> Result<OrchestrationAdapter, ConfigError> {
    let config = config::load_config(start)?;
    start_orchestrator(config).await
}
