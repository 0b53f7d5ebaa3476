//! Durable SQLite-backed audit storage for production deployments.
//!
//! Provisions its own schema on open. If the database or schema cannot be
//! provisioned the store degrades to local console logging (entries are
//! logged, queries return empty) and never surfaces an error: the audit
//! trail must not become a point of failure for execution.

use super::{AuditEventType, AuditLogEntry, AuditQuery, AuditStorage};
use crate::core_types::{BackendKind, ExecutionMetrics, Language};
use crate::errors::SandboxError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    event TEXT NOT NULL,
    execution_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    workflow_id TEXT,
    node_id TEXT NOT NULL,
    language TEXT NOT NULL,
    backend TEXT NOT NULL,
    code_hash TEXT NOT NULL,
    metrics TEXT,
    error TEXT,
    ts INTEGER NOT NULL,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log (ts);
CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log (user_id);
CREATE INDEX IF NOT EXISTS idx_audit_event ON audit_log (event);";

pub struct SqliteAuditStorage {
    conn: Option<Mutex<Connection>>,
}

impl SqliteAuditStorage {
    /// Open (or create) the database at `path`. Failure to provision the
    /// schema yields a degraded store, not an error.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        match Connection::open(path.as_ref()).and_then(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        }) {
            Ok(conn) => Self {
                conn: Some(Mutex::new(conn)),
            },
            Err(e) => {
                log::warn!(
                    "audit schema could not be provisioned at {:?}, degrading to console logging: {}",
                    path.as_ref(),
                    e
                );
                Self { conn: None }
            }
        }
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Self {
        match Connection::open_in_memory().and_then(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        }) {
            Ok(conn) => Self {
                conn: Some(Mutex::new(conn)),
            },
            Err(_) => Self { conn: None },
        }
    }

    fn build_where(query: &AuditQuery) -> (String, Vec<SqlParam>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();

        if let Some(execution_id) = &query.execution_id {
            clauses.push("execution_id = ?");
            params.push(SqlParam::Text(execution_id.clone()));
        }
        if let Some(user_id) = &query.user_id {
            clauses.push("user_id = ?");
            params.push(SqlParam::Text(user_id.clone()));
        }
        if let Some(workflow_id) = &query.workflow_id {
            clauses.push("workflow_id = ?");
            params.push(SqlParam::Text(workflow_id.clone()));
        }
        if let Some(node_id) = &query.node_id {
            clauses.push("node_id = ?");
            params.push(SqlParam::Text(node_id.clone()));
        }
        if let Some(event) = query.event {
            clauses.push("event = ?");
            params.push(SqlParam::Text(enum_str(&event)));
        }
        if let Some(language) = query.language {
            clauses.push("language = ?");
            params.push(SqlParam::Text(enum_str(&language)));
        }
        if let Some(backend) = query.backend {
            clauses.push("backend = ?");
            params.push(SqlParam::Text(enum_str(&backend)));
        }
        if let Some(since) = query.since {
            clauses.push("ts >= ?");
            params.push(SqlParam::Int(since.timestamp_micros()));
        }
        if let Some(until) = query.until {
            clauses.push("ts <= ?");
            params.push(SqlParam::Int(until.timestamp_micros()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (where_sql, params)
    }
}

enum SqlParam {
    Text(String),
    Int(i64),
}

impl rusqlite::ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => s.to_sql(),
            SqlParam::Int(i) => i.to_sql(),
        }
    }
}

fn enum_str<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn enum_parse<T: DeserializeOwned>(s: &str) -> Option<T> {
    serde_json::from_value(Value::String(s.to_string())).ok()
}

struct RawRow {
    id: String,
    event: String,
    execution_id: String,
    user_id: String,
    workflow_id: Option<String>,
    node_id: String,
    language: String,
    backend: String,
    code_hash: String,
    metrics: Option<String>,
    error: Option<String>,
    ts: i64,
    metadata: String,
}

fn row_to_entry(raw: RawRow) -> Option<AuditLogEntry> {
    let event: AuditEventType = enum_parse(&raw.event)?;
    let language: Language = enum_parse(&raw.language)?;
    let backend: BackendKind = enum_parse(&raw.backend)?;
    let timestamp: DateTime<Utc> = Utc.timestamp_micros(raw.ts).single()?;
    let metrics: Option<ExecutionMetrics> = raw
        .metrics
        .as_deref()
        .and_then(|m| serde_json::from_str(m).ok());
    let metadata: Value = serde_json::from_str(&raw.metadata).unwrap_or(Value::Null);
    Some(AuditLogEntry {
        id: raw.id,
        event,
        execution_id: raw.execution_id,
        user_id: raw.user_id,
        workflow_id: raw.workflow_id,
        node_id: raw.node_id,
        language,
        backend,
        code_hash: raw.code_hash,
        metrics,
        error: raw.error,
        timestamp,
        metadata,
    })
}

#[async_trait]
impl AuditStorage for SqliteAuditStorage {
    async fn save(&self, entry: AuditLogEntry) -> Result<(), SandboxError> {
        let Some(conn) = &self.conn else {
            // Degraded mode: the entry still reaches the local log stream.
            log::info!(
                "audit (degraded): {}",
                serde_json::to_string(&entry).unwrap_or_else(|_| entry.id.clone())
            );
            return Ok(());
        };
        let metrics_json = match &entry.metrics {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };
        let metadata_json = serde_json::to_string(&entry.metadata)?;
        let conn = conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO audit_log (id, event, execution_id, user_id, workflow_id, node_id, \
             language, backend, code_hash, metrics, error, ts, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                entry.id,
                enum_str(&entry.event),
                entry.execution_id,
                entry.user_id,
                entry.workflow_id,
                entry.node_id,
                enum_str(&entry.language),
                enum_str(&entry.backend),
                entry.code_hash,
                metrics_json,
                entry.error,
                entry.timestamp.timestamp_micros(),
                metadata_json,
            ],
        )
        .map_err(|e| SandboxError::AuditStorageError(e.to_string()))?;
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, SandboxError> {
        let Some(conn) = &self.conn else {
            return Ok(Vec::new());
        };
        let (where_sql, params) = Self::build_where(query);
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT id, event, execution_id, user_id, workflow_id, node_id, language, backend, \
             code_hash, metrics, error, ts, metadata FROM audit_log{} \
             ORDER BY ts DESC LIMIT {} OFFSET {}",
            where_sql, limit, query.offset
        );
        let conn = conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SandboxError::AuditStorageError(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    event: row.get(1)?,
                    execution_id: row.get(2)?,
                    user_id: row.get(3)?,
                    workflow_id: row.get(4)?,
                    node_id: row.get(5)?,
                    language: row.get(6)?,
                    backend: row.get(7)?,
                    code_hash: row.get(8)?,
                    metrics: row.get(9)?,
                    error: row.get(10)?,
                    ts: row.get(11)?,
                    metadata: row.get(12)?,
                })
            })
            .map_err(|e| SandboxError::AuditStorageError(e.to_string()))?;

        let mut entries = Vec::new();
        for raw in rows {
            let raw = raw.map_err(|e| SandboxError::AuditStorageError(e.to_string()))?;
            match row_to_entry(raw) {
                Some(entry) => entries.push(entry),
                None => log::warn!("skipping unparseable audit row"),
            }
        }
        Ok(entries)
    }

    async fn count(&self, query: &AuditQuery) -> Result<usize, SandboxError> {
        let Some(conn) = &self.conn else {
            return Ok(0);
        };
        let (where_sql, params) = Self::build_where(query);
        let sql = format!("SELECT COUNT(*) FROM audit_log{}", where_sql);
        let conn = conn.lock().unwrap_or_else(|p| p.into_inner());
        let count: i64 = conn
            .query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
                row.get(0)
            })
            .map_err(|e| SandboxError::AuditStorageError(e.to_string()))?;
        Ok(count as usize)
    }

    async fn delete(&self, query: &AuditQuery) -> Result<usize, SandboxError> {
        let Some(conn) = &self.conn else {
            return Ok(0);
        };
        let (where_sql, params) = Self::build_where(query);
        let sql = format!("DELETE FROM audit_log{}", where_sql);
        let conn = conn.lock().unwrap_or_else(|p| p.into_inner());
        let removed = conn
            .execute(&sql, rusqlite::params_from_iter(params.iter()))
            .map_err(|e| SandboxError::AuditStorageError(e.to_string()))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NewAuditEntry;

    fn entry(event: AuditEventType, user: &str, language: Language) -> AuditLogEntry {
        NewAuditEntry {
            event,
            execution_id: uuid::Uuid::new_v4().to_string(),
            user_id: user.to_string(),
            workflow_id: Some("wf-1".to_string()),
            node_id: "n1".to_string(),
            language,
            backend: BackendKind::Container,
            code_hash: "cafe".to_string(),
            metrics: None,
            error: None,
            metadata: serde_json::json!({"attempt": 1}),
        }
        .into_entry()
    }

    #[tokio::test]
    async fn round_trips_entries() {
        let storage = SqliteAuditStorage::open_in_memory();
        storage
            .save(entry(AuditEventType::Start, "u1", Language::Python))
            .await
            .unwrap();
        storage
            .save(entry(AuditEventType::Complete, "u1", Language::Python))
            .await
            .unwrap();

        let all = storage.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].user_id, "u1");
        assert_eq!(all[0].language, Language::Python);
        assert_eq!(all[0].backend, BackendKind::Container);
        assert_eq!(all[0].metadata["attempt"], 1);
    }

    #[tokio::test]
    async fn filters_translate_to_sql() {
        let storage = SqliteAuditStorage::open_in_memory();
        storage
            .save(entry(AuditEventType::Complete, "alice", Language::Sql))
            .await
            .unwrap();
        storage
            .save(entry(AuditEventType::Error, "bob", Language::Python))
            .await
            .unwrap();

        let query = AuditQuery {
            user_id: Some("alice".to_string()),
            language: Some(Language::Sql),
            ..Default::default()
        };
        assert_eq!(storage.count(&query).await.unwrap(), 1);
        let hits = storage.query(&query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, "alice");

        let removed = storage.delete(&query).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.count(&AuditQuery::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn entries_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let storage = SqliteAuditStorage::open(&path);
            storage
                .save(entry(AuditEventType::Complete, "u1", Language::Sql))
                .await
                .unwrap();
        }
        let reopened = SqliteAuditStorage::open(&path);
        let all = reopened.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_id, "u1");
    }

    #[tokio::test]
    async fn degraded_store_never_errors() {
        let storage = SqliteAuditStorage {
            conn: None,
        };
        storage
            .save(entry(AuditEventType::Complete, "u", Language::Sql))
            .await
            .unwrap();
        assert!(storage.query(&AuditQuery::default()).await.unwrap().is_empty());
        assert_eq!(storage.count(&AuditQuery::default()).await.unwrap(), 0);
    }
}
