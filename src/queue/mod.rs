//! Durable mutation queue.
//!
//! The single source of truth for what must still reach the server. Entries
//! are appended while offline, drained oldest first, and removed only once
//! the server has acknowledged them.

mod log;
mod types;

pub use log::{MutationLog, SqliteMutationLog};
pub use types::{MutationId, MutationKind, PendingMutation};

use color_eyre::Result;
use std::sync::Arc;

use crate::tasks::TaskId;

#[derive(Clone)]
pub struct MutationQueue {
  log: Arc<dyn MutationLog>,
}

impl MutationQueue {
  pub fn new(log: Arc<dyn MutationLog>) -> Self {
    Self { log }
  }

  /// Append a mutation. Never touches the network.
  pub fn enqueue(
    &self,
    kind: MutationKind,
    local_ref: Option<TaskId>,
    payload: serde_json::Value,
  ) -> Result<MutationId> {
    let mutation = self.log.append(kind, local_ref, &payload)?;
    tracing::debug!(id = %mutation.id, %kind, "enqueued mutation");
    Ok(mutation.id)
  }

  /// Snapshot of the queue in FIFO order.
  ///
  /// Fails when the log cannot be read at all, which is different from an
  /// empty queue.
  pub fn drain(&self) -> Result<Drain> {
    Ok(Drain {
      log: Arc::clone(&self.log),
      ids: self.log.ids()?,
      position: 0,
    })
  }

  /// Remove an entry. Removing an id that is already gone is a no-op.
  pub fn remove(&self, id: MutationId) -> Result<()> {
    if !self.log.remove(id)? {
      tracing::debug!(%id, "mutation already removed");
    }
    Ok(())
  }

  /// Remove a delivered entry and mark its record synced.
  pub fn acknowledge(&self, mutation: &PendingMutation) -> Result<()> {
    self.log.acknowledge(mutation.id, mutation.local_ref)?;
    Ok(())
  }

  pub fn len(&self) -> Result<usize> {
    self.log.len()
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn list(&self) -> Result<Vec<PendingMutation>> {
    self.drain()?.collect()
  }

  /// Manual escape hatch for entries that will never be accepted.
  pub fn clear(&self) -> Result<usize> {
    self.log.clear()
  }

  pub fn contains_ref(&self, task: TaskId) -> Result<bool> {
    self.log.contains_ref(task)
  }

  /// Forget a record the server has never seen. Returns how many queued
  /// entries were dropped, zero when its create was already delivered.
  pub fn discard_unsent(&self, task: TaskId) -> Result<usize> {
    let discarded = self.log.discard_unsent(task)?;
    if discarded > 0 {
      tracing::debug!(%task, discarded, "discarded unsent mutations");
    }
    Ok(discarded)
  }
}

/// Lazy pass over a snapshot of queued ids.
///
/// Entries are loaded as the iterator reaches them; ones removed in the
/// meantime are skipped and ones appended after the snapshot are not part of
/// this pass. `rewind` restarts the same pass from the beginning.
pub struct Drain {
  log: Arc<dyn MutationLog>,
  ids: Vec<MutationId>,
  position: usize,
}

impl Drain {
  pub fn rewind(&mut self) {
    self.position = 0;
  }

  pub fn snapshot_len(&self) -> usize {
    self.ids.len()
  }
}

impl Iterator for Drain {
  type Item = Result<PendingMutation>;

  fn next(&mut self) -> Option<Self::Item> {
    while let Some(id) = self.ids.get(self.position).copied() {
      self.position += 1;
      match self.log.get(id) {
        Ok(Some(mutation)) => return Some(Ok(mutation)),
        Ok(None) => continue,
        Err(e) => return Some(Err(e)),
      }
    }
    None
  }
}
