//! Durable queue for write operations issued while offline.
//!
//! A queued mutation survives process restarts and is removed only after the
//! sync engine has seen a 2xx acknowledgment for it. Failures of any kind
//! leave it queued for the next trigger.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::net::{Destination, NetworkRequest};

/// Current mutation store schema version, carried in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const OUTBOX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_mutations (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_timestamp
    ON pending_mutations(timestamp);
"#;

static MUTATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// A write operation waiting to be replayed against the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
  pub id: String,
  pub url: String,
  pub method: String,
  /// Request headers at enqueue time, bearer token included.
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub timestamp: DateTime<Utc>,
}

impl PendingMutation {
  /// Capture a failed write for later replay.
  pub fn new(
    url: &str,
    method: &str,
    headers: BTreeMap<String, String>,
    body: Option<Vec<u8>>,
  ) -> Self {
    // Millisecond precision, matching what the store persists.
    let now = Utc::now();
    let timestamp = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
    // Timestamp plus a process-local counter keeps ids unique even for
    // mutations enqueued within the same millisecond.
    let seq = MUTATION_SEQ.fetch_add(1, Ordering::Relaxed);
    let id = format!("{:x}-{:x}", timestamp.timestamp_millis(), seq);

    Self {
      id,
      url: url.to_string(),
      method: method.to_string(),
      headers,
      body,
      timestamp,
    }
  }

  /// The network request to issue when replaying this mutation.
  pub fn to_request(&self) -> NetworkRequest {
    NetworkRequest {
      url: self.url.clone(),
      method: self.method.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
      destination: Destination::Resource,
    }
  }
}

/// Trait for the durable mutation store.
pub trait MutationStore: Send + Sync {
  /// Persist a mutation.
  fn enqueue(&self, mutation: &PendingMutation) -> Result<()>;

  /// All pending mutations in timestamp order.
  fn read_all(&self) -> Result<Vec<PendingMutation>>;

  /// Remove a mutation after a confirmed successful replay.
  fn delete(&self, id: &str) -> Result<()>;

  /// Number of pending mutations.
  fn len(&self) -> Result<usize>;
}

/// SQLite-backed mutation store.
pub struct SqliteMutationStore {
  conn: Mutex<Connection>,
}

impl SqliteMutationStore {
  /// Open or create the store at `path`, provisioning the schema on first
  /// open or on a version upgrade.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create outbox directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open outbox database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// An in-memory store for tests.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory outbox database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let version: i32 = conn
      .pragma_query_value(None, "user_version", |row| row.get(0))
      .map_err(|e| eyre!("Failed to read outbox schema version: {}", e))?;

    if version < SCHEMA_VERSION {
      conn
        .execute_batch(OUTBOX_SCHEMA)
        .map_err(|e| eyre!("Failed to run outbox migrations: {}", e))?;
      conn
        .pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| eyre!("Failed to record outbox schema version: {}", e))?;
    }

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl MutationStore for SqliteMutationStore {
  fn enqueue(&self, mutation: &PendingMutation) -> Result<()> {
    let conn = self.lock()?;

    let headers = serde_json::to_string(&mutation.headers)
      .map_err(|e| eyre!("Failed to serialize mutation headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO pending_mutations
           (id, url, method, headers, body, timestamp)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          mutation.id,
          mutation.url,
          mutation.method,
          headers,
          mutation.body,
          mutation.timestamp.timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation {}: {}", mutation.id, e))?;

    Ok(())
  }

  fn read_all(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, timestamp
         FROM pending_mutations ORDER BY timestamp, id",
      )
      .map_err(|e| eyre!("Failed to prepare outbox query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        let id: String = row.get(0)?;
        let url: String = row.get(1)?;
        let method: String = row.get(2)?;
        let headers: String = row.get(3)?;
        let body: Option<Vec<u8>> = row.get(4)?;
        let timestamp: i64 = row.get(5)?;
        Ok((id, url, method, headers, body, timestamp))
      })
      .map_err(|e| eyre!("Failed to read outbox: {}", e))?;

    let mut mutations = Vec::new();
    for row in rows {
      let (id, url, method, headers, body, millis) =
        row.map_err(|e| eyre!("Failed to read outbox row: {}", e))?;

      let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
        .map_err(|e| eyre!("Corrupt headers for mutation {}: {}", id, e))?;
      let timestamp = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| eyre!("Corrupt timestamp for mutation {}: {}", id, millis))?;

      mutations.push(PendingMutation {
        id,
        url,
        method,
        headers,
        body,
        timestamp,
      });
    }

    Ok(mutations)
  }

  fn delete(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM pending_mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete mutation {}: {}", id, e))?;

    Ok(())
  }

  fn len(&self) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count mutations: {}", e))?;

    Ok(count as usize)
  }
}
