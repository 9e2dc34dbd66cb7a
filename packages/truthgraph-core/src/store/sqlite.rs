//! SQLite Graph Store
//!
//! File-based or in-memory storage using SQLite. Default backend, used by
//! local deployments and the test suite.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{GraphStore, Row, Statement, Value};
use crate::error::{GraphError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vertices (
    vid INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    label TEXT NOT NULL,
    kind TEXT,
    name TEXT,
    value TEXT,
    props TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vertices_label_kind ON vertices(label, kind);
CREATE INDEX IF NOT EXISTS idx_vertices_label_name ON vertices(label, name);

CREATE TABLE IF NOT EXISTS edges (
    eid INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,
    src TEXT NOT NULL,
    dst TEXT NOT NULL,
    branch TEXT NOT NULL,
    branch_level INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    from_ts INTEGER NOT NULL,
    to_ts INTEGER
);

CREATE INDEX IF NOT EXISTS idx_edges_label_src ON edges(label, src);
CREATE INDEX IF NOT EXISTS idx_edges_label_dst ON edges(label, dst);
CREATE INDEX IF NOT EXISTS idx_edges_branch ON edges(branch);
";

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*b as i64)),
            Value::Int(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn read_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

/// SQLite-based GraphStore implementation
#[derive(Clone)]
pub struct SqliteGraphStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGraphStore {
    /// Open (or create) a graph database file
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn prepare_bound<'c>(
        conn: &'c Connection,
        stmt: &Statement,
    ) -> Result<rusqlite::Statement<'c>> {
        let mut prepared = conn.prepare(&stmt.text)?;
        for (name, value) in stmt.params.iter() {
            let key = format!("${}", name);
            match prepared.parameter_index(&key)? {
                Some(idx) => prepared.raw_bind_parameter(idx, value)?,
                None => {
                    return Err(GraphError::query(format!(
                        "parameter {} is not referenced by the statement",
                        key
                    )))
                }
            }
        }
        Ok(prepared)
    }

    fn run_write(conn: &Connection, stmt: &Statement) -> Result<u64> {
        let mut prepared = Self::prepare_bound(conn, stmt)?;
        Ok(prepared.raw_execute()? as u64)
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn initialize(&self) -> Result<()> {
        self.init_schema()
    }

    async fn fetch(&self, stmt: &Statement) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        let mut prepared = Self::prepare_bound(&conn, stmt)?;
        let width = stmt.columns.len().min(prepared.column_count());

        let mut rows = prepared.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(read_value(row.get_ref(idx)?));
            }
            out.push(values);
        }
        debug!(backend = "sqlite", rows = out.len(), "fetch");
        Ok(out)
    }

    async fn execute(&self, stmt: &Statement) -> Result<u64> {
        let conn = self.conn.lock();
        Self::run_write(&conn, stmt)
    }

    async fn execute_atomic(&self, stmts: &[Statement]) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut affected = 0;
        for stmt in stmts {
            affected += Self::run_write(&tx, stmt)?;
        }
        tx.commit()?;
        debug!(backend = "sqlite", statements = stmts.len(), affected, "atomic write committed");
        Ok(affected)
    }
}
