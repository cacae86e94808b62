//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::Result;

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_optional_datetime(s: Option<String>) -> Option<chrono::DateTime<Utc>> {
    s.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Escape SQL LIKE pattern special characters.
fn escape_like_pattern(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit.
const MAX_QUERY_LIMIT: usize = 1000;

const EXECUTION_COLUMNS: &str =
    "id, workflow_name, status, base_dir, node_count, started_at, finished_at, error";

const NODE_EXECUTION_COLUMNS: &str = "id, execution_id, node_id, interface, status, cached, hash, node_dir, inputs, outputs, started_at, finished_at, error";

/// SQLite-based run history.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(path)?;
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        // WAL must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_name TEXT NOT NULL,
                status TEXT NOT NULL,
                base_dir TEXT NOT NULL,
                node_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS node_executions (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                interface TEXT NOT NULL,
                status TEXT NOT NULL,
                cached INTEGER NOT NULL DEFAULT 0,
                hash TEXT,
                node_dir TEXT,
                inputs TEXT NOT NULL,
                outputs TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error TEXT,
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_executions_workflow_name ON executions(workflow_name);
            CREATE INDEX IF NOT EXISTS idx_executions_started ON executions(started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_node_executions_execution ON node_executions(execution_id);
            "#,
        )?;
        Ok(())
    }

    /// Report pragma settings and integrity.
    pub async fn check_health(&self) -> Result<DatabaseHealth> {
        let conn = self.conn.lock().await;

        let foreign_keys_enabled: i64 =
            conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let integrity_check: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let busy_timeout_ms: i64 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
        let orphaned_node_executions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM node_executions n
             LEFT JOIN executions e ON e.id = n.execution_id
             WHERE e.id IS NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseHealth {
            foreign_keys_enabled: foreign_keys_enabled == 1,
            integrity_check,
            journal_mode,
            busy_timeout_ms,
            orphaned_node_executions: orphaned_node_executions.max(0) as u64,
        })
    }

    // ========================================================================
    // Execution operations
    // ========================================================================

    pub async fn save_execution(&self, execution: &Execution) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO executions
             (id, workflow_name, status, base_dir, node_count, started_at, finished_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                workflow_name = excluded.workflow_name,
                status = excluded.status,
                base_dir = excluded.base_dir,
                node_count = excluded.node_count,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                error = excluded.error",
            params![
                execution.id,
                execution.workflow_name,
                execution.status.to_string(),
                execution.base_dir,
                execution.node_count,
                execution.started_at.to_rfc3339(),
                execution.finished_at.map(|t| t.to_rfc3339()),
                execution.error,
            ],
        )?;
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS);
        let execution = conn
            .query_row(&sql, [id], Self::row_to_execution)
            .optional()?;
        Ok(execution)
    }

    pub async fn list_executions(
        &self,
        workflow_name: &str,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        let query = ExecutionQuery {
            workflow_name: Some(workflow_name.to_string()),
            limit,
            ..ExecutionQuery::default()
        };
        self.query_executions(&query).await
    }

    pub async fn query_executions(&self, query: &ExecutionQuery) -> Result<Vec<Execution>> {
        let conn = self.conn.lock().await;

        let mut sql = format!("SELECT {} FROM executions WHERE 1=1", EXECUTION_COLUMNS);
        let mut bind: Vec<SqlValue> = Vec::new();

        if let Some(workflow_name) = &query.workflow_name {
            sql.push_str(" AND workflow_name = ?");
            bind.push(SqlValue::Text(workflow_name.clone()));
        }

        if let Some(status) = &query.status {
            sql.push_str(" AND status = ?");
            bind.push(SqlValue::Text(status.to_string()));
        }

        if let Some(started_after) = &query.started_after {
            sql.push_str(" AND started_at >= ?");
            bind.push(SqlValue::Text(started_after.to_rfc3339()));
        }

        if let Some(started_before) = &query.started_before {
            sql.push_str(" AND started_at <= ?");
            bind.push(SqlValue::Text(started_before.to_rfc3339()));
        }

        if let Some(search) = &query.search {
            sql.push_str(
                " AND (workflow_name LIKE ? ESCAPE '\\' OR COALESCE(error, '') LIKE ? ESCAPE '\\')",
            );
            let pattern = format!("%{}%", escape_like_pattern(search));
            bind.push(SqlValue::Text(pattern.clone()));
            bind.push(SqlValue::Text(pattern));
        }

        sql.push_str(" ORDER BY started_at DESC LIMIT ? OFFSET ?");
        let limit = if query.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            query.limit.min(MAX_QUERY_LIMIT)
        };
        bind.push(SqlValue::Integer(limit as i64));
        bind.push(SqlValue::Integer(query.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(executions)
    }

    pub async fn get_execution_trace(&self, execution_id: &str) -> Result<Option<ExecutionTrace>> {
        let execution = self.get_execution(execution_id).await?;
        let Some(execution) = execution else {
            return Ok(None);
        };

        let nodes = self.get_node_executions(execution_id).await?;
        Ok(Some(ExecutionTrace { execution, nodes }))
    }

    /// Delete an execution and its node records.
    pub async fn delete_execution(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM executions WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Node execution operations
    // ========================================================================

    pub async fn save_node_execution(&self, node_exec: &NodeExecution) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO node_executions
             (id, execution_id, node_id, interface, status, cached, hash, node_dir, inputs, outputs, started_at, finished_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                execution_id = excluded.execution_id,
                node_id = excluded.node_id,
                interface = excluded.interface,
                status = excluded.status,
                cached = excluded.cached,
                hash = excluded.hash,
                node_dir = excluded.node_dir,
                inputs = excluded.inputs,
                outputs = excluded.outputs,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                error = excluded.error",
            params![
                node_exec.id,
                node_exec.execution_id,
                node_exec.node_id,
                node_exec.interface,
                node_exec.status.to_string(),
                node_exec.cached,
                node_exec.hash,
                node_exec.node_dir,
                serde_json::to_string(&node_exec.inputs)?,
                node_exec
                    .outputs
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                node_exec.started_at.to_rfc3339(),
                node_exec.finished_at.map(|t| t.to_rfc3339()),
                node_exec.error,
            ],
        )?;
        Ok(())
    }

    pub async fn get_node_executions(&self, execution_id: &str) -> Result<Vec<NodeExecution>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM node_executions WHERE execution_id = ?1 ORDER BY started_at, node_id",
            NODE_EXECUTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let node_execs = stmt
            .query_map([execution_id], Self::row_to_node_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(node_execs)
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
        let status_str: String = row.get(2)?;
        let status = status_str.parse().unwrap_or(ExecutionStatus::Failed);

        Ok(Execution {
            id: row.get(0)?,
            workflow_name: row.get(1)?,
            status,
            base_dir: row.get(3)?,
            node_count: row.get(4)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            finished_at: parse_optional_datetime(row.get(6)?),
            error: row.get(7)?,
        })
    }

    fn row_to_node_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeExecution> {
        let status_str: String = row.get(4)?;
        let status = status_str.parse().unwrap_or(ExecutionStatus::Failed);
        let inputs_str: String = row.get(8)?;
        let outputs_str: Option<String> = row.get(9)?;

        Ok(NodeExecution {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            node_id: row.get(2)?,
            interface: row.get(3)?,
            status,
            cached: row.get(5)?,
            hash: row.get(6)?,
            node_dir: row.get(7)?,
            inputs: serde_json::from_str(&inputs_str).unwrap_or(serde_json::Value::Null),
            outputs: outputs_str.and_then(|s| serde_json::from_str(&s).ok()),
            started_at: parse_datetime_utc(&row.get::<_, String>(10)?)?,
            finished_at: parse_optional_datetime(row.get(11)?),
            error: row.get(12)?,
        })
    }
}
