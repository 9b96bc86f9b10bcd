//! Append-only pending-mutation log.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use super::types::{MutationId, MutationKind, PendingMutation};
use crate::db::Database;
use crate::tasks::TaskId;

/// Storage behind the mutation queue.
pub trait MutationLog: Send + Sync {
  /// Append a new entry with a fresh id and the current timestamp.
  fn append(
    &self,
    kind: MutationKind,
    local_ref: Option<TaskId>,
    payload: &serde_json::Value,
  ) -> Result<PendingMutation>;

  /// Ids of every entry, oldest first.
  fn ids(&self) -> Result<Vec<MutationId>>;

  fn get(&self, id: MutationId) -> Result<Option<PendingMutation>>;

  /// Returns whether the entry existed.
  fn remove(&self, id: MutationId) -> Result<bool>;

  /// Remove a delivered entry and, in the same transaction, mark its record
  /// synced when no other entry still references it.
  fn acknowledge(&self, id: MutationId, local_ref: Option<TaskId>) -> Result<bool>;

  fn len(&self) -> Result<usize>;

  /// Drop every entry. Returns how many were removed.
  fn clear(&self) -> Result<usize>;

  fn contains_ref(&self, task: TaskId) -> Result<bool>;

  /// Drop every entry for a record whose create is still queued, in one
  /// transaction. Returns how many were removed; zero when the create has
  /// already been delivered.
  fn discard_unsent(&self, task: TaskId) -> Result<usize>;
}

pub struct SqliteMutationLog {
  db: Arc<Database>,
}

impl SqliteMutationLog {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

const SELECT_COLUMNS: &str = "SELECT id, kind, local_ref, payload, enqueued_at FROM pending_mutations";

impl MutationLog for SqliteMutationLog {
  fn append(
    &self,
    kind: MutationKind,
    local_ref: Option<TaskId>,
    payload: &serde_json::Value,
  ) -> Result<PendingMutation> {
    let enqueued_at = Utc::now();
    let payload_text =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO pending_mutations (kind, local_ref, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
        params![
          kind.as_str(),
          local_ref.map(|r| r.0),
          payload_text,
          enqueued_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to append mutation: {}", e))?;

    Ok(PendingMutation {
      id: MutationId(conn.last_insert_rowid()),
      kind,
      local_ref,
      payload: payload.clone(),
      enqueued_at,
    })
  }

  fn ids(&self) -> Result<Vec<MutationId>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT id FROM pending_mutations ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let ids = stmt
      .query_map([], |row| row.get(0).map(MutationId))
      .map_err(|e| eyre!("Failed to read mutation log: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read mutation id: {}", e))?;

    Ok(ids)
  }

  fn get(&self, id: MutationId) -> Result<Option<PendingMutation>> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        &format!("{} WHERE id = ?1", SELECT_COLUMNS),
        params![id.0],
        map_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load mutation {}: {}", id, e))
  }

  fn remove(&self, id: MutationId) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute("DELETE FROM pending_mutations WHERE id = ?1", params![id.0])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;
    Ok(changed > 0)
  }

  fn acknowledge(&self, id: MutationId, local_ref: Option<TaskId>) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let removed = tx
      .execute("DELETE FROM pending_mutations WHERE id = ?1", params![id.0])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;

    if let Some(task) = local_ref {
      tx.execute(
        "UPDATE tasks SET synced = 1 WHERE id = ?1
           AND NOT EXISTS (SELECT 1 FROM pending_mutations WHERE local_ref = ?1)",
        params![task.0],
      )
      .map_err(|e| eyre!("Failed to mark task {} synced: {}", task, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  fn len(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count mutations: {}", e))?;
    Ok(count as usize)
  }

  fn clear(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM pending_mutations", [])
      .map_err(|e| eyre!("Failed to clear mutation log: {}", e))
  }

  fn contains_ref(&self, task: TaskId) -> Result<bool> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        "SELECT EXISTS (SELECT 1 FROM pending_mutations WHERE local_ref = ?1)",
        params![task.0],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to query mutation log: {}", e))
  }

  fn discard_unsent(&self, task: TaskId) -> Result<usize> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let unsent: bool = tx
      .query_row(
        "SELECT EXISTS (SELECT 1 FROM pending_mutations WHERE local_ref = ?1 AND kind = ?2)",
        params![task.0, MutationKind::Create.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to query mutation log: {}", e))?;
    if !unsent {
      return Ok(0);
    }

    let removed = tx
      .execute(
        "DELETE FROM pending_mutations WHERE local_ref = ?1",
        params![task.0],
      )
      .map_err(|e| eyre!("Failed to discard mutations for task {}: {}", task, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed)
  }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<PendingMutation> {
  let conversion = |index: usize, e: Box<dyn std::error::Error + Send + Sync>| {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e)
  };

  let kind: String = row.get(1)?;
  let payload: String = row.get(3)?;
  let enqueued_at: String = row.get(4)?;

  Ok(PendingMutation {
    id: MutationId(row.get(0)?),
    kind: kind.parse().map_err(|e: String| conversion(1, e.into()))?,
    local_ref: row.get::<_, Option<i64>>(2)?.map(TaskId),
    payload: serde_json::from_str(&payload).map_err(|e| conversion(3, Box::new(e)))?,
    enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| conversion(4, Box::new(e)))?,
  })
}
