//! SQLite implementation of the versioned cache store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CacheEntry, CacheStore, Fingerprint, GenerationState};

/// Schema for the generation and entry tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_generation
    ON cache_entries(generation);
"#;

/// SQLite-backed cache store.
///
/// The connection is serialized through a mutex; each logical operation runs
/// in its own transaction, so concurrent callers see atomic operations but no
/// cross-operation ordering.
pub struct SqliteCacheStore {
  conn: Mutex<Connection>,
}

impl SqliteCacheStore {
  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// An in-memory store for tests.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStore for SqliteCacheStore {
  fn ensure_generation(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name, state) VALUES (?, ?)",
        params![name, GenerationState::Installing.as_str()],
      )
      .map_err(|e| eyre!("Failed to create generation {}: {}", name, e))?;

    Ok(())
  }

  fn set_generation_state(&self, name: &str, state: GenerationState) -> Result<()> {
    let mut conn = self.lock()?;

    // The transaction rolls back on drop unless committed, so every error
    // return below leaves the connection clean.
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Only one generation may be active.
    if state == GenerationState::Active {
      tx.execute(
        "UPDATE generations SET state = ? WHERE state = ? AND name != ?",
        params![
          GenerationState::Superseded.as_str(),
          GenerationState::Active.as_str(),
          name
        ],
      )
      .map_err(|e| eyre!("Failed to supersede previous generation: {}", e))?;
    }

    let changed = tx
      .execute(
        "UPDATE generations SET state = ? WHERE name = ?",
        params![state.as_str(), name],
      )
      .map_err(|e| eyre!("Failed to update generation {}: {}", name, e))?;

    if changed == 0 {
      return Err(eyre!("Unknown cache generation: {}", name));
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn active_generation(&self) -> Result<Option<String>> {
    let conn = self.lock()?;

    let name = conn
      .query_row(
        "SELECT name FROM generations WHERE state = ?",
        params![GenerationState::Active.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query active generation: {}", e))?;

    Ok(name)
  }

  fn list_generations(&self) -> Result<Vec<(String, GenerationState)>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name, state FROM generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare generation query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        let name: String = row.get(0)?;
        let state: String = row.get(1)?;
        Ok((name, state))
      })
      .map_err(|e| eyre!("Failed to list generations: {}", e))?;

    let mut generations = Vec::new();
    for row in rows {
      let (name, state) = row.map_err(|e| eyre!("Failed to read generation row: {}", e))?;
      let state = GenerationState::parse(&state)
        .ok_or_else(|| eyre!("Corrupt generation state for {}: {}", name, state))?;
      generations.push((name, state));
    }

    Ok(generations)
  }

  fn delete_generation(&self, name: &str) -> Result<()> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to purge entries for {}: {}", name, e))?;

    tx.execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_entry(&self, generation: &str, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE generation = ? AND fingerprint = ?",
        params![generation, fingerprint.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((status, headers, body)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Corrupt cached headers: {}", e))?;
        Ok(Some(CacheEntry {
          status,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entry(
    &self,
    generation: &str,
    fingerprint: &Fingerprint,
    entry: CacheEntry,
  ) -> Result<()> {
    let conn = self.lock()?;

    let state: Option<String> = conn
      .query_row(
        "SELECT state FROM generations WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query generation {}: {}", generation, e))?;

    // New entries are never written to a generation that has been replaced.
    match state.as_deref().and_then(GenerationState::parse) {
      None => return Err(eyre!("Unknown cache generation: {}", generation)),
      Some(GenerationState::Superseded) => {
        return Err(eyre!("Cache generation {} is superseded", generation))
      }
      Some(_) => {}
    }

    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (generation, fingerprint, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![
          generation,
          fingerprint.as_str(),
          entry.status,
          headers,
          entry.body
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn delete_entry(&self, generation: &str, fingerprint: &Fingerprint) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE generation = ? AND fingerprint = ?",
        params![generation, fingerprint.as_str()],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::testing::basic;

  fn store() -> SqliteCacheStore {
    SqliteCacheStore::in_memory().unwrap()
  }

  fn entry(body: &[u8]) -> CacheEntry {
    CacheEntry::from_response(&basic(200, body))
  }

  #[test]
  fn test_put_and_match_round_trip() {
    let store = store();
    store.ensure_generation("v1").unwrap();

    let fp = Fingerprint::get("https://digame.app/feed");
    store.put_entry("v1", &fp, entry(b"payload")).unwrap();

    let hit = store.match_entry("v1", &fp).unwrap().unwrap();
    assert_eq!(hit.status, 200);
    assert_eq!(hit.body, b"payload");

    let miss = store
      .match_entry("v1", &Fingerprint::get("https://digame.app/other"))
      .unwrap();
    assert!(miss.is_none());
  }

  #[test]
  fn test_put_is_last_write_wins() {
    let store = store();
    store.ensure_generation("v1").unwrap();

    let fp = Fingerprint::get("https://digame.app/feed");
    store.put_entry("v1", &fp, entry(b"old")).unwrap();
    store.put_entry("v1", &fp, entry(b"new")).unwrap();

    let hit = store.match_entry("v1", &fp).unwrap().unwrap();
    assert_eq!(hit.body, b"new");
  }

  #[test]
  fn test_put_refuses_superseded_generation() {
    let store = store();
    store.ensure_generation("v1").unwrap();
    store
      .set_generation_state("v1", GenerationState::Superseded)
      .unwrap();

    let fp = Fingerprint::get("https://digame.app/feed");
    assert!(store.put_entry("v1", &fp, entry(b"late")).is_err());
  }

  #[test]
  fn test_put_refuses_unknown_generation() {
    let store = store();
    let fp = Fingerprint::get("https://digame.app/feed");
    assert!(store.put_entry("nope", &fp, entry(b"x")).is_err());
  }

  #[test]
  fn test_delete_generation_purges_entries() {
    let store = store();
    store.ensure_generation("v1").unwrap();

    let fp = Fingerprint::get("https://digame.app/feed");
    store.put_entry("v1", &fp, entry(b"payload")).unwrap();
    store.delete_generation("v1").unwrap();

    assert!(store.list_generations().unwrap().is_empty());
    assert!(store.match_entry("v1", &fp).unwrap().is_none());
  }

  #[test]
  fn test_failed_state_change_leaves_connection_usable() {
    let store = store();

    // The rejected update must not leave a transaction open.
    assert!(store
      .set_generation_state("ghost", GenerationState::Active)
      .is_err());

    store.ensure_generation("v1").unwrap();
    store
      .set_generation_state("v1", GenerationState::Active)
      .unwrap();
    assert_eq!(store.active_generation().unwrap().as_deref(), Some("v1"));
  }

  #[test]
  fn test_only_one_generation_active() {
    let store = store();
    store.ensure_generation("v1").unwrap();
    store.ensure_generation("v2").unwrap();

    store
      .set_generation_state("v1", GenerationState::Active)
      .unwrap();
    store
      .set_generation_state("v2", GenerationState::Active)
      .unwrap();

    assert_eq!(store.active_generation().unwrap().as_deref(), Some("v2"));

    let active: Vec<_> = store
      .list_generations()
      .unwrap()
      .into_iter()
      .filter(|(_, state)| *state == GenerationState::Active)
      .collect();
    assert_eq!(active.len(), 1);
  }
}
