//! Background-sync tags registered while offline.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::sync::Arc;

use crate::db::Database;

/// Persisted set of tags the host should fire once connectivity returns.
#[derive(Clone)]
pub struct SyncRegistry {
  db: Arc<Database>,
}

impl SyncRegistry {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Registering an already registered tag keeps a single registration.
  pub fn register(&self, tag: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO sync_registrations (tag, registered_at) VALUES (?1, ?2)",
        params![tag, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to register sync tag {}: {}", tag, e))?;
    Ok(())
  }

  pub fn registered(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT tag FROM sync_registrations ORDER BY registered_at, tag")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let tags = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list sync tags: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read sync tag: {}", e))?;

    Ok(tags)
  }

  pub fn unregister(&self, tag: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute(
        "DELETE FROM sync_registrations WHERE tag = ?1",
        params![tag],
      )
      .map_err(|e| eyre!("Failed to unregister sync tag {}: {}", tag, e))?;
    Ok(changed > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn register_is_deduplicated() {
    let registry = SyncRegistry::new(Arc::new(Database::open_in_memory().unwrap()));
    registry.register("sync-tasks").unwrap();
    registry.register("sync-tasks").unwrap();
    assert_eq!(registry.registered().unwrap(), vec!["sync-tasks"]);

    assert!(registry.unregister("sync-tasks").unwrap());
    assert!(!registry.unregister("sync-tasks").unwrap());
    assert!(registry.registered().unwrap().is_empty());
  }
}
