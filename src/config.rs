//! Orchestrator configuration loading.
//!
//! Reads `toolbridge.yaml` (or JSON), resolves environment variables and
//! applies overrides from the environment and the `backend_servers` table.
//! Backends keep file order; an override with a known id replaces that entry
//! in place, an unknown id is appended.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{BridgeDatabase, StoreError};
use crate::transport::types::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SIMULATED_LATENCY,
    DEFAULT_STARTUP_TIMEOUT,
};
use crate::transport::{BackendDescriptor, TransportSettings};

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "toolbridge.yaml";

/// Explicit config file path.
pub const CONFIG_ENV: &str = "TOOLBRIDGE_CONFIG";

/// JSON array of backend descriptors merged over the file's list.
pub const BACKENDS_ENV: &str = "TOOLBRIDGE_BACKENDS";

/// `1`/`true` turns on the consent override.
pub const ALLOW_ALL_CONSENT_ENV: &str = "TOOLBRIDGE_ALLOW_ALL_CONSENT";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {reason}")]
    NotFound { reason: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid value in {var}: {reason}")]
    Env { var: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ─── Public Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Backends in priority order. Earlier backends win name collisions.
    pub backends: Vec<BackendDescriptor>,
    /// Optional allowlist of backend ids to build.
    pub enabled_backends: Option<Vec<String>>,
    /// Optional allowlist of public tool names to expose after discovery.
    pub enabled_tools: Option<Vec<String>>,
    /// Skip consent lookups entirely. Local development only.
    pub allow_all_consent: bool,
    pub call_timeout_ms: u64,
    /// Stream backends only.
    pub connect_timeout_ms: u64,
    /// Pipe backends only.
    pub startup_timeout_ms: u64,
    pub simulated_latency_ms: u64,
    pub database_path: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            enabled_backends: None,
            enabled_tools: None,
            allow_all_consent: false,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT.as_millis() as u64,
            simulated_latency_ms: DEFAULT_SIMULATED_LATENCY.as_millis() as u64,
            database_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Parse configuration text after `${VAR}` interpolation.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        let mut config: Self =
            serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
                path: "<inline>".into(),
                reason: e.to_string(),
            })?;
        config.expand_paths();
        Ok(config)
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            simulated_latency: Duration::from_millis(self.simulated_latency_ms),
        }
    }

    /// Backends that pass the `enabled_backends` allowlist, in order.
    pub fn active_backends(&self) -> Vec<&BackendDescriptor> {
        let Some(enabled) = &self.enabled_backends else {
            return self.backends.iter().collect();
        };
        let allowlist: HashSet<&str> = enabled.iter().map(String::as_str).collect();
        let active: Vec<_> = self
            .backends
            .iter()
            .filter(|d| allowlist.contains(d.id.as_str()))
            .collect();

        tracing::info!(
            before = self.backends.len(),
            after = active.len(),
            enabled = ?allowlist,
            "filtered backends by enabled_backends allowlist"
        );
        active
    }

    /// Merge descriptors over the configured list by id.
    pub fn merge_backends(&mut self, overrides: Vec<BackendDescriptor>) {
        for descriptor in overrides {
            match self.backends.iter_mut().find(|d| d.id == descriptor.id) {
                Some(existing) => *existing = descriptor,
                None => self.backends.push(descriptor),
            }
        }
    }

    /// Merge enabled descriptors from the `backend_servers` table.
    pub fn merge_database_backends(&mut self, db: &BridgeDatabase) -> Result<(), ConfigError> {
        let stored = db.list_backend_servers()?;
        if !stored.is_empty() {
            tracing::info!(count = stored.len(), "merging backends from database");
        }
        self.merge_backends(stored);
        Ok(())
    }

    /// Apply `TOOLBRIDGE_BACKENDS` and `TOOLBRIDGE_ALLOW_ALL_CONSENT`.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let backends = std::env::var(BACKENDS_ENV).ok();
        let allow_all = std::env::var(ALLOW_ALL_CONSENT_ENV).ok();
        self.apply_overrides(backends.as_deref(), allow_all.as_deref())
    }

    fn apply_overrides(
        &mut self,
        backends_json: Option<&str>,
        allow_all: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = backends_json.filter(|s| !s.trim().is_empty()) {
            let overrides: Vec<BackendDescriptor> =
                serde_json::from_str(raw).map_err(|e| ConfigError::Env {
                    var: BACKENDS_ENV.into(),
                    reason: e.to_string(),
                })?;
            tracing::info!(count = overrides.len(), "merging backends from {BACKENDS_ENV}");
            self.merge_backends(overrides);
        }

        if let Some(flag) = allow_all {
            self.allow_all_consent = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        Ok(())
    }

    /// Where the SQLite store lives. Defaults to the platform data directory.
    pub fn resolved_database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => PathBuf::from(path),
            None => crate::data_dir().join("toolbridge.db"),
        }
    }

    fn expand_paths(&mut self) {
        if let Some(path) = &self.database_path {
            self.database_path = Some(expand_tilde(path));
        }
        for descriptor in &mut self.backends {
            if let Some(cwd) = &descriptor.cwd {
                descriptor.cwd = Some(expand_tilde(cwd));
            }
            if let Some(command) = &descriptor.command {
                descriptor.command = Some(expand_tilde(command));
            }
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `TOOLBRIDGE_CONFIG` first, then walks upward from `start` looking
/// for `toolbridge.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(ConfigError::NotFound {
            reason: format!("{CONFIG_ENV} points to missing file {}", candidate.display()),
        });
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound {
        reason: format!("no {CONFIG_FILE_NAME} above {}", start.display()),
    })
}

/// Read and parse one config file. `.json` files are parsed as JSON.
pub fn load_config_file(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let interpolated = interpolate_env_vars(&raw);

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let parsed = if is_json {
        serde_json::from_str::<OrchestratorConfig>(&interpolated).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str::<OrchestratorConfig>(&interpolated).map_err(|e| e.to_string())
    };
    let mut config = parsed.map_err(|reason| ConfigError::Parse {
        path: path.display().to_string(),
        reason,
    })?;
    config.expand_paths();

    tracing::info!(
        path = %path.display(),
        backends = config.backends.len(),
        "loaded orchestrator config"
    );
    Ok(config)
}

/// Full configuration: file (if any) plus environment overrides.
///
/// A missing file is not an error; the environment alone can describe every
/// backend.
pub fn load_config(start: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let mut config = match find_config_path(start) {
        Ok(path) => load_config_file(&path)?,
        Err(ConfigError::NotFound { reason }) if std::env::var(CONFIG_ENV).is_err() => {
            tracing::info!(reason = %reason, "no config file, using defaults");
            OrchestratorConfig::default()
        }
        Err(e) => return Err(e),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
backends:
  - id: srv1
    transportKind: pipe
    command: node
    args: ["server.js"]
    env:
      LOG_LEVEL: debug
  - id: search
    type: sse
    url: "${__TOOLBRIDGE_TEST_URL__:-http://localhost:8080/sse}"
    apiKey: secret
  - id: sim
    transportKind: simulated
    latencyMs: 0
enabled_tools: ["srv1_calculator"]
call_timeout_ms: 5000
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        std::env::remove_var("__TOOLBRIDGE_TEST_URL__");
        let config = OrchestratorConfig::from_yaml_str(SAMPLE).unwrap();

        assert_eq!(config.backends.len(), 3);
        assert_eq!(config.backends[0].env["LOG_LEVEL"], "debug");
        assert_eq!(config.backends[1].transport_kind, "sse");
        assert_eq!(
            config.backends[1].url.as_deref(),
            Some("http://localhost:8080/sse")
        );
        assert_eq!(config.backends[2].latency_ms, Some(0));
        assert!(!config.allow_all_consent);

        let settings = config.transport_settings();
        assert_eq!(settings.call_timeout, Duration::from_millis(5000));
        assert_eq!(settings.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_interpolation_uses_env_value() {
        std::env::set_var("__TOOLBRIDGE_TEST_KEY__", "from-env");
        let result = interpolate_env_vars("key: ${__TOOLBRIDGE_TEST_KEY__:-fallback}");
        assert_eq!(result, "key: from-env");
        std::env::remove_var("__TOOLBRIDGE_TEST_KEY__");

        assert_eq!(interpolate_env_vars("plain text"), "plain text");
        assert_eq!(interpolate_env_vars("${__TOOLBRIDGE_UNSET__}"), "");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/data/toolbridge.db");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/data/toolbridge.db"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn test_find_config_walks_upward() {
        if std::env::var(CONFIG_ENV).is_ok() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE_NAME), SAMPLE).unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, tmp.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_load_json_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("toolbridge.json");
        std::fs::write(
            &path,
            r#"{"backends":[{"id":"sim","transportKind":"simulated"}],"allow_all_consent":true}"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.backends[0].id, "sim");
        assert!(config.allow_all_consent);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "backends: [ {id: ").unwrap();
        assert!(matches!(
            load_config_file(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            load_config_file(&tmp.path().join("missing.yaml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides_replace_by_id_and_append() {
        let mut config = OrchestratorConfig::from_yaml_str(SAMPLE).unwrap();
        config
            .apply_overrides(
                Some(r#"[{"id":"search","transportKind":"simulated"},{"id":"extra","transportKind":"simulated"}]"#),
                Some("TRUE"),
            )
            .unwrap();

        let ids: Vec<_> = config.backends.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["srv1", "search", "sim", "extra"]);
        assert_eq!(config.backends[1].transport_kind, "simulated");
        assert!(config.allow_all_consent);

        let err = config.apply_overrides(Some("not json"), None).unwrap_err();
        assert!(err.to_string().contains(BACKENDS_ENV));
    }

    #[test]
    fn test_database_backends_override_file_entries() {
        let db = BridgeDatabase::open(":memory:").unwrap();
        let mut stored = BackendDescriptor::new("srv1", "simulated");
        stored.latency_ms = Some(5);
        db.upsert_backend_server(&stored, true).unwrap();

        let mut config = OrchestratorConfig::from_yaml_str(SAMPLE).unwrap();
        config.merge_database_backends(&db).unwrap();

        assert_eq!(config.backends.len(), 3);
        assert_eq!(config.backends[0].transport_kind, "simulated");
        assert_eq!(config.backends[0].latency_ms, Some(5));
    }

    #[test]
    fn test_enabled_backends_filter() {
        let mut config = OrchestratorConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.active_backends().len(), 3);

        config.enabled_backends = Some(vec!["sim".into(), "unknown".into()]);
        let active = config.active_backends();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "sim");
    }
}
