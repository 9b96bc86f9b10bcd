pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Durable store shared by the task table, the mutation log, the response
/// caches and settings.
///
/// Every statement runs under the connection lock; callers must drop the
/// guard before awaiting.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database, at `path` or the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway database that lives only as long as this handle.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch("PRAGMA foreign_keys = ON;")
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    Ok(Self::data_dir()?.join("taskflow.db"))
  }

  /// Directory holding the database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("taskflow"))
  }

  /// Apply every migration newer than the stored `user_version`.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;
    let current: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    for (index, migration) in schema::MIGRATIONS.iter().enumerate() {
      let version = index as i64 + 1;
      if version <= current {
        continue;
      }

      conn
        .execute_batch(migration)
        .map_err(|e| eyre!("Failed to run migration v{}: {}", version, e))?;
      conn
        .pragma_update(None, "user_version", version)
        .map_err(|e| eyre!("Failed to record schema version {}: {}", version, e))?;
      tracing::debug!(version, "applied schema migration");
    }

    Ok(())
  }

  /// Lock the connection.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn schema_version(&self) -> Result<i64> {
    let conn = self.conn()?;
    conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))
  }

  pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    conn
      .query_row(
        "SELECT value FROM settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read setting {}: {}", key, e))
  }

  pub fn put_setting(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store setting {}: {}", key, e))?;
    Ok(())
  }

  /// Returns whether the key existed.
  pub fn delete_setting(&self, key: &str) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn
      .execute("DELETE FROM settings WHERE key = ?1", params![key])
      .map_err(|e| eyre!("Failed to delete setting {}: {}", key, e))?;
    Ok(changed > 0)
  }
}
