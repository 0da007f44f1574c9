//! SQLite database for consent records, execution audit, the simulated
//! backend catalog and database-sourced backend descriptors.
//!
//! Uses `rusqlite` synchronously behind a `std::sync::Mutex`; every statement
//! is short and never held across an await.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use super::errors::StoreError;
use super::types::{
    ConsentRecord, ExecutionRecord, ExecutionStatus, SimulatedCall, SimulatedTool,
};
use crate::transport::types::BackendDescriptor;

/// Database handle shared between the adapter, the stores and simulated
/// clients.
pub type SharedDatabase = Arc<Mutex<BridgeDatabase>>;

/// Lock a shared database, recovering from a poisoned mutex.
pub fn lock(db: &SharedDatabase) -> MutexGuard<'_, BridgeDatabase> {
    db.lock().unwrap_or_else(|e| e.into_inner())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite handle for the orchestration layer.
pub struct BridgeDatabase {
    conn: Connection,
}

impl BridgeDatabase {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent readers from other processes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    /// Open and wrap for sharing.
    pub fn open_shared(path: &str) -> Result<SharedDatabase, StoreError> {
        Ok(Arc::new(Mutex::new(Self::open(path)?)))
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS consent_records (
                user_id TEXT NOT NULL DEFAULT '',
                backend_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                granted INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, backend_id, tool_name)
            );

            CREATE TABLE IF NOT EXISTS tool_executions (
                id TEXT PRIMARY KEY,
                call_id TEXT NOT NULL,
                backend_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                user_id TEXT,
                arguments TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                execution_time_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_executions_call
                ON tool_executions(call_id);

            CREATE INDEX IF NOT EXISTS idx_executions_status
                ON tool_executions(status);

            CREATE TABLE IF NOT EXISTS simulated_tools (
                backend_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                parameters TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (backend_id, name)
            );

            CREATE TABLE IF NOT EXISTS simulated_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backend_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backend_servers (
                id TEXT PRIMARY KEY,
                transport_kind TEXT NOT NULL,
                command TEXT,
                args TEXT NOT NULL DEFAULT '[]',
                url TEXT,
                api_key TEXT,
                env TEXT NOT NULL DEFAULT '{}',
                cwd TEXT,
                latency_ms INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1,
                position INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }

    // ─── Consent ────────────────────────────────────────────────────────

    /// Look up the consent record for an exact (user, backend, tool) key.
    pub fn get_consent(
        &self,
        user_id: &str,
        backend_id: &str,
        tool_name: &str,
    ) -> Result<Option<ConsentRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT user_id, backend_id, tool_name, granted, updated_at
                 FROM consent_records
                 WHERE user_id = ?1 AND backend_id = ?2 AND tool_name = ?3",
                params![user_id, backend_id, tool_name],
                |row| {
                    Ok(ConsentRecord {
                        user_id: row.get(0)?,
                        backend_id: row.get(1)?,
                        tool_name: row.get(2)?,
                        granted: row.get::<_, i32>(3)? != 0,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Insert or replace a consent decision.
    pub fn set_consent(
        &self,
        user_id: &str,
        backend_id: &str,
        tool_name: &str,
        granted: bool,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO consent_records (user_id, backend_id, tool_name, granted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, backend_id, tool_name)
             DO UPDATE SET granted = excluded.granted, updated_at = excluded.updated_at",
            params![user_id, backend_id, tool_name, granted as i32, now()],
        )?;
        Ok(())
    }

    /// All consent records for a user, ordered by backend then tool.
    pub fn list_consents(&self, user_id: &str) -> Result<Vec<ConsentRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, backend_id, tool_name, granted, updated_at
             FROM consent_records
             WHERE user_id = ?1
             ORDER BY backend_id, tool_name",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(ConsentRecord {
                user_id: row.get(0)?,
                backend_id: row.get(1)?,
                tool_name: row.get(2)?,
                granted: row.get::<_, i32>(3)? != 0,
                updated_at: row.get(4)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    // ─── Executions ─────────────────────────────────────────────────────

    /// Insert a new execution record.
    pub fn insert_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let args_json = serde_json::to_string(&record.arguments)?;
        let result_json = match &record.result {
            Some(r) => Some(serde_json::to_string(r)?),
            None => None,
        };

        self.conn.execute(
            "INSERT INTO tool_executions
             (id, call_id, backend_id, tool_name, user_id, arguments, status,
              result, error, started_at, completed_at, execution_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.call_id,
                record.backend_id,
                record.tool_name,
                record.user_id,
                args_json,
                record.status.as_str(),
                result_json,
                record.error,
                record.started_at,
                record.completed_at,
                record.execution_time_ms.map(|ms| ms as i64),
            ],
        )?;
        Ok(())
    }

    /// Move a pending record to a terminal status.
    ///
    /// Returns `false` when the record is missing or already terminal;
    /// arguments and start time are never touched.
    pub fn complete_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
        execution_time_ms: u64,
    ) -> Result<bool, StoreError> {
        let result_json = match result {
            Some(r) => Some(serde_json::to_string(r)?),
            None => None,
        };

        let updated = self.conn.execute(
            "UPDATE tool_executions
             SET status = ?2, result = ?3, error = ?4, completed_at = ?5,
                 execution_time_ms = ?6
             WHERE id = ?1 AND status = 'pending'",
            params![
                id,
                status.as_str(),
                result_json,
                error,
                now(),
                execution_time_ms as i64,
            ],
        )?;
        Ok(updated > 0)
    }

    /// Fetch one execution record.
    pub fn get_execution(&self, id: &str) -> Result<ExecutionRecord, StoreError> {
        self.conn
            .query_row(
                &format!("{EXECUTION_COLUMNS} WHERE id = ?1"),
                params![id],
                row_to_execution,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                what: format!("execution '{id}'"),
            })
    }

    /// All records written for a given tool call id, oldest first.
    pub fn executions_for_call(&self, call_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.query_executions(
            &format!("{EXECUTION_COLUMNS} WHERE call_id = ?1 ORDER BY started_at, rowid"),
            call_id,
        )
    }

    /// All records with the given status, oldest first.
    pub fn executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.query_executions(
            &format!("{EXECUTION_COLUMNS} WHERE status = ?1 ORDER BY started_at, rowid"),
            status.as_str(),
        )
    }

    fn query_executions(&self, sql: &str, key: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![key], row_to_execution)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    // ─── Simulated Backend ──────────────────────────────────────────────

    /// Tool catalog for a simulated backend, in insertion order.
    pub fn simulated_tools(&self, backend_id: &str) -> Result<Vec<SimulatedTool>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, description, parameters
             FROM simulated_tools
             WHERE backend_id = ?1
             ORDER BY position, name",
        )?;
        let rows = stmt.query_map(params![backend_id], |row| {
            Ok(SimulatedTool {
                name: row.get(0)?,
                description: row.get(1)?,
                parameters: json_column(row, 2)?,
            })
        })?;

        let mut tools = Vec::new();
        for row in rows {
            tools.push(row?);
        }
        Ok(tools)
    }

    /// Replace a simulated backend's catalog.
    pub fn replace_simulated_tools(
        &mut self,
        backend_id: &str,
        tools: &[SimulatedTool],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM simulated_tools WHERE backend_id = ?1",
            params![backend_id],
        )?;
        for (position, tool) in tools.iter().enumerate() {
            tx.execute(
                "INSERT INTO simulated_tools (backend_id, name, description, parameters, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    backend_id,
                    tool.name,
                    tool.description,
                    serde_json::to_string(&tool.parameters)?,
                    position as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Append a simulated call to the log.
    pub fn record_simulated_call(
        &self,
        backend_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
        outcome: Result<&serde_json::Value, &str>,
    ) -> Result<i64, StoreError> {
        let (result_json, error) = match outcome {
            Ok(value) => (Some(serde_json::to_string(value)?), None),
            Err(message) => (None, Some(message)),
        };
        self.conn.execute(
            "INSERT INTO simulated_calls (backend_id, tool_name, arguments, result, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                backend_id,
                tool_name,
                serde_json::to_string(arguments)?,
                result_json,
                error,
                now(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Logged calls for a simulated backend, oldest first.
    pub fn simulated_calls(&self, backend_id: &str) -> Result<Vec<SimulatedCall>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, backend_id, tool_name, arguments, result, error, created_at
             FROM simulated_calls
             WHERE backend_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![backend_id], |row| {
            Ok(SimulatedCall {
                id: row.get(0)?,
                backend_id: row.get(1)?,
                tool_name: row.get(2)?,
                arguments: json_column(row, 3)?,
                result: optional_json_column(row, 4)?,
                error: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    // ─── Backend Servers ────────────────────────────────────────────────

    /// Insert or replace a backend descriptor.
    pub fn upsert_backend_server(
        &self,
        descriptor: &BackendDescriptor,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let position: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM backend_servers",
            [],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO backend_servers
             (id, transport_kind, command, args, url, api_key, env, cwd, latency_ms, enabled, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                transport_kind = excluded.transport_kind,
                command = excluded.command,
                args = excluded.args,
                url = excluded.url,
                api_key = excluded.api_key,
                env = excluded.env,
                cwd = excluded.cwd,
                latency_ms = excluded.latency_ms,
                enabled = excluded.enabled",
            params![
                descriptor.id,
                descriptor.transport_kind,
                descriptor.command,
                serde_json::to_string(&descriptor.args)?,
                descriptor.url,
                descriptor.api_key,
                serde_json::to_string(&descriptor.env)?,
                descriptor.cwd,
                descriptor.latency_ms.map(|ms| ms as i64),
                enabled as i32,
                position,
            ],
        )?;
        Ok(())
    }

    /// Enabled backend descriptors in insertion order.
    pub fn list_backend_servers(&self) -> Result<Vec<BackendDescriptor>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, transport_kind, command, args, url, api_key, env, cwd, latency_ms
             FROM backend_servers
             WHERE enabled = 1
             ORDER BY position, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BackendDescriptor {
                id: row.get(0)?,
                transport_kind: row.get(1)?,
                command: row.get(2)?,
                args: json_column(row, 3)?,
                url: row.get(4)?,
                api_key: row.get(5)?,
                env: json_column(row, 6)?,
                cwd: row.get(7)?,
                latency_ms: row.get::<_, Option<i64>>(8)?.map(|ms| ms as u64),
            })
        })?;

        let mut servers = Vec::new();
        for row in rows {
            servers.push(row?);
        }
        Ok(servers)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

const EXECUTION_COLUMNS: &str = "SELECT id, call_id, backend_id, tool_name, user_id, arguments,
        status, result, error, started_at, completed_at, execution_time_ms
 FROM tool_executions";

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        call_id: row.get(1)?,
        backend_id: row.get(2)?,
        tool_name: row.get(3)?,
        user_id: row.get(4)?,
        arguments: json_column(row, 5)?,
        status: status_column(row, 6)?,
        result: optional_json_column(row, 7)?,
        error: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        execution_time_ms: row.get::<_, Option<i64>>(11)?.map(|ms| ms as u64),
    })
}

/// Decode a JSON text column. Corrupt content fails the row.
fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn optional_json_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<serde_json::Value>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => json_column(row, idx).map(Some),
        None => Ok(None),
    }
}

fn status_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<ExecutionStatus> {
    let raw: String = row.get(idx)?;
    ExecutionStatus::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown execution status '{raw}'").into(),
        )
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
