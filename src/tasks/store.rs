//! Materialized task records in the durable store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use super::types::{TaskId, TaskRecord};
use crate::db::Database;

#[derive(Clone)]
pub struct TaskStore {
  db: Arc<Database>,
}

impl TaskStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Insert a new, not yet completed record.
  pub fn insert(&self, text: &str, synced: bool) -> Result<TaskRecord> {
    let created_at = Utc::now();
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO tasks (text, completed, created_at, synced) VALUES (?1, 0, ?2, ?3)",
        params![text, created_at.to_rfc3339(), synced],
      )
      .map_err(|e| eyre!("Failed to insert task: {}", e))?;

    Ok(TaskRecord {
      id: TaskId(conn.last_insert_rowid()),
      text: text.to_string(),
      completed: false,
      created_at,
      synced,
    })
  }

  pub fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        "SELECT id, text, completed, created_at, synced FROM tasks WHERE id = ?1",
        params![id.0],
        map_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load task {}: {}", id, e))
  }

  /// All records in creation order.
  pub fn list(&self) -> Result<Vec<TaskRecord>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, text, completed, created_at, synced FROM tasks ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let tasks = stmt
      .query_map([], map_row)
      .map_err(|e| eyre!("Failed to list tasks: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read task: {}", e))?;

    Ok(tasks)
  }

  /// Set completion and sync state in one write. Returns the updated record.
  pub fn update(&self, id: TaskId, completed: bool, synced: bool) -> Result<Option<TaskRecord>> {
    {
      let conn = self.db.conn()?;
      let changed = conn
        .execute(
          "UPDATE tasks SET completed = ?2, synced = ?3 WHERE id = ?1",
          params![id.0, completed, synced],
        )
        .map_err(|e| eyre!("Failed to update task {}: {}", id, e))?;
      if changed == 0 {
        return Ok(None);
      }
    }
    self.get(id)
  }

  pub fn set_synced(&self, id: TaskId, synced: bool) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute(
        "UPDATE tasks SET synced = ?2 WHERE id = ?1",
        params![id.0, synced],
      )
      .map_err(|e| eyre!("Failed to update task {}: {}", id, e))?;
    Ok(changed > 0)
  }

  /// Returns whether the record existed.
  pub fn delete(&self, id: TaskId) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute("DELETE FROM tasks WHERE id = ?1", params![id.0])
      .map_err(|e| eyre!("Failed to delete task {}: {}", id, e))?;
    Ok(changed > 0)
  }

  pub fn completed(&self) -> Result<Vec<TaskRecord>> {
    Ok(self.list()?.into_iter().filter(|t| t.completed).collect())
  }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
  let created_at: String = row.get(3)?;
  let created_at = DateTime::parse_from_rfc3339(&created_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| {
      rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

  Ok(TaskRecord {
    id: TaskId(row.get(0)?),
    text: row.get(1)?,
    completed: row.get(2)?,
    created_at,
    synced: row.get(4)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> TaskStore {
    TaskStore::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  #[test]
  fn ids_are_monotonic_and_not_reused() {
    let store = store();
    let a = store.insert("a", true).unwrap();
    let b = store.insert("b", true).unwrap();
    assert!(b.id > a.id);

    store.delete(b.id).unwrap();
    let c = store.insert("c", true).unwrap();
    assert!(c.id > b.id);
  }

  #[test]
  fn update_and_reload() {
    let store = store();
    let task = store.insert("Buy milk", true).unwrap();

    let updated = store.update(task.id, true, false).unwrap().unwrap();
    assert!(updated.completed);
    assert!(!updated.synced);
    assert_eq!(updated.created_at, task.created_at);
    assert_eq!(store.get(task.id).unwrap(), Some(updated));

    assert!(store.update(TaskId(999), true, true).unwrap().is_none());
  }

  #[test]
  fn completed_filters_and_delete_reports_existence() {
    let store = store();
    let a = store.insert("a", true).unwrap();
    store.insert("b", true).unwrap();
    store.update(a.id, true, true).unwrap();

    let done = store.completed().unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, a.id);

    assert!(store.delete(a.id).unwrap());
    assert!(!store.delete(a.id).unwrap());
    assert_eq!(store.list().unwrap().len(), 1);
  }
}
