//! Task operations as the UI calls them.
//!
//! Every change is applied to the local store first. While online it is then
//! sent straight to the server; offline, or when that send fails, it goes to
//! the mutation queue and the background-sync tag is registered.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use super::store::TaskStore;
use super::types::{TaskId, TaskRecord};
use crate::connectivity::Connectivity;
use crate::queue::{MutationId, MutationKind, MutationQueue, PendingMutation};
use crate::sync::{Delivery, MutationSink, SyncRegistry};

/// How a change left the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
  /// Sent directly and acknowledged
  Delivered,
  /// Queued for the next sync
  Queued(MutationId),
  /// Merged into a change that is already queued for this record
  Folded,
  /// The server never saw the record, so its queued changes were dropped
  Discarded,
}

#[derive(Clone)]
pub struct TaskService {
  tasks: TaskStore,
  queue: MutationQueue,
  sink: Arc<dyn MutationSink>,
  connectivity: Connectivity,
  registry: SyncRegistry,
  sync_tag: String,
}

impl TaskService {
  pub fn new(
    tasks: TaskStore,
    queue: MutationQueue,
    sink: Arc<dyn MutationSink>,
    connectivity: Connectivity,
    registry: SyncRegistry,
    sync_tag: impl Into<String>,
  ) -> Self {
    Self {
      tasks,
      queue,
      sink,
      connectivity,
      registry,
      sync_tag: sync_tag.into(),
    }
  }

  pub fn list(&self) -> Result<Vec<TaskRecord>> {
    self.tasks.list()
  }

  /// Mutations still waiting for the server.
  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    self.queue.list()
  }

  pub async fn add_task(&self, text: &str) -> Result<(TaskRecord, Dispatch)> {
    let text = text.trim();
    if text.is_empty() {
      return Err(eyre!("Task text cannot be empty"));
    }

    if !self.connectivity.is_online() {
      let record = self.tasks.insert(text, false)?;
      let id = self.queue_mutation(MutationKind::Create, &record)?;
      return Ok((record, Dispatch::Queued(id)));
    }

    // Optimistically synced; downgraded if the send fails.
    let mut record = self.tasks.insert(text, true)?;
    let dispatch = self.send_or_queue(MutationKind::Create, &mut record).await?;
    Ok((record, dispatch))
  }

  /// Flip completion. `None` when the task does not exist.
  pub async fn toggle_task(&self, id: TaskId) -> Result<Option<(TaskRecord, Dispatch)>> {
    let Some(current) = self.tasks.get(id)? else {
      return Ok(None);
    };
    let completed = !current.completed;

    // A queued change replays the record as it is at sync time, so editing
    // the local row is enough.
    if !current.synced && self.queue.contains_ref(id)? {
      let record = self.updated(id, completed, false)?;
      tracing::debug!(task = %id, "folded into queued mutation");
      return Ok(Some((record, Dispatch::Folded)));
    }

    if !self.connectivity.is_online() {
      let record = self.updated(id, completed, false)?;
      let mutation = self.queue_mutation(MutationKind::Update, &record)?;
      return Ok(Some((record, Dispatch::Queued(mutation))));
    }

    let mut record = self.updated(id, completed, true)?;
    let dispatch = self.send_or_queue(MutationKind::Update, &mut record).await?;
    Ok(Some((record, dispatch)))
  }

  /// Remove a task. `None` when the task does not exist.
  pub async fn delete_task(&self, id: TaskId) -> Result<Option<Dispatch>> {
    let Some(mut record) = self.tasks.get(id)? else {
      return Ok(None);
    };
    self.tasks.delete(id)?;

    // Created offline and never delivered: nothing to tell the server.
    if !record.synced && self.queue.discard_unsent(id)? > 0 {
      tracing::debug!(task = %id, "dropped unsent record");
      return Ok(Some(Dispatch::Discarded));
    }

    // The server may have an older version; replay the delete behind
    // whatever is already queued for it.
    if !record.synced || !self.connectivity.is_online() {
      let mutation = self.queue_mutation(MutationKind::Delete, &record)?;
      return Ok(Some(Dispatch::Queued(mutation)));
    }

    let delivery = Delivery::direct(MutationKind::Delete, &record)?;
    match self.sink.deliver(&delivery).await {
      Ok(()) => Ok(Some(Dispatch::Delivered)),
      Err(e) => {
        tracing::warn!(task = %id, error = %e, "direct delete failed, queueing");
        record.synced = false;
        let mutation = self.queue_mutation(MutationKind::Delete, &record)?;
        Ok(Some(Dispatch::Queued(mutation)))
      }
    }
  }

  /// Delete every completed task.
  pub async fn clear_completed(&self) -> Result<Vec<(TaskId, Dispatch)>> {
    let mut cleared = Vec::new();
    for task in self.tasks.completed()? {
      if let Some(dispatch) = self.delete_task(task.id).await? {
        cleared.push((task.id, dispatch));
      }
    }
    Ok(cleared)
  }

  fn updated(&self, id: TaskId, completed: bool, synced: bool) -> Result<TaskRecord> {
    self
      .tasks
      .update(id, completed, synced)?
      .ok_or_else(|| eyre!("Task {} disappeared during update", id))
  }

  /// Send a change for a record already stored as synced. On failure the
  /// record is marked unsynced and the change is queued instead.
  async fn send_or_queue(&self, kind: MutationKind, record: &mut TaskRecord) -> Result<Dispatch> {
    let delivery = Delivery::direct(kind, record)?;
    match self.sink.deliver(&delivery).await {
      Ok(()) => Ok(Dispatch::Delivered),
      Err(e) => {
        tracing::warn!(task = %record.id, %kind, error = %e, "direct send failed, queueing");
        self.tasks.set_synced(record.id, false)?;
        record.synced = false;
        let id = self.queue_mutation(kind, record)?;
        Ok(Dispatch::Queued(id))
      }
    }
  }

  fn queue_mutation(&self, kind: MutationKind, record: &TaskRecord) -> Result<MutationId> {
    let payload = serde_json::to_value(record)
      .map_err(|e| eyre!("Failed to serialize task {}: {}", record.id, e))?;
    let id = self.queue.enqueue(kind, Some(record.id), payload)?;
    self.registry.register(&self.sync_tag)?;
    tracing::info!(task = %record.id, %kind, mutation = %id, "queued for background sync");
    Ok(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::queue::SqliteMutationLog;
  use crate::test_utils::ScriptedSink;

  struct Fixture {
    service: TaskService,
    queue: MutationQueue,
    sink: Arc<ScriptedSink>,
    connectivity: Connectivity,
    registry: SyncRegistry,
  }

  fn fixture(online: bool) -> Fixture {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let queue = MutationQueue::new(Arc::new(SqliteMutationLog::new(Arc::clone(&db))));
    let sink = Arc::new(ScriptedSink::new());
    let connectivity = Connectivity::new(online);
    let registry = SyncRegistry::new(Arc::clone(&db));
    let service = TaskService::new(
      TaskStore::new(db),
      queue.clone(),
      sink.clone(),
      connectivity.clone(),
      registry.clone(),
      "sync-tasks",
    );
    Fixture {
      service,
      queue,
      sink,
      connectivity,
      registry,
    }
  }

  #[tokio::test]
  async fn offline_add_queues_and_registers_tag() {
    let f = fixture(false);
    let (record, dispatch) = f.service.add_task("  Buy milk ").await.unwrap();

    assert_eq!(record.text, "Buy milk");
    assert!(!record.synced);
    assert!(matches!(dispatch, Dispatch::Queued(_)));
    assert_eq!(f.queue.len().unwrap(), 1);
    assert_eq!(f.registry.registered().unwrap(), vec!["sync-tasks"]);
    assert!(f.sink.attempts().is_empty());
  }

  #[tokio::test]
  async fn online_add_is_sent_directly() {
    let f = fixture(true);
    let (record, dispatch) = f.service.add_task("Buy milk").await.unwrap();

    assert_eq!(dispatch, Dispatch::Delivered);
    assert!(record.synced);
    assert!(f.queue.is_empty().unwrap());
    assert!(f.sink.attempted_keys()[0].starts_with("direct-"));
  }

  #[tokio::test]
  async fn failed_direct_send_falls_back_to_queue() {
    let f = fixture(true);
    f.sink.set_offline(true);
    let (record, dispatch) = f.service.add_task("Buy milk").await.unwrap();

    assert!(matches!(dispatch, Dispatch::Queued(_)));
    assert!(!record.synced);
    assert!(!f.service.list().unwrap()[0].synced);
    assert_eq!(f.queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn empty_text_is_rejected() {
    let f = fixture(false);
    assert!(f.service.add_task("   ").await.is_err());
    assert!(f.service.list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn toggle_of_unsynced_record_folds_into_queued_create() {
    let f = fixture(false);
    let (record, _) = f.service.add_task("a").await.unwrap();

    let (toggled, dispatch) = f.service.toggle_task(record.id).await.unwrap().unwrap();
    assert!(toggled.completed);
    assert_eq!(dispatch, Dispatch::Folded);
    assert_eq!(f.queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn offline_toggle_of_synced_record_queues_update() {
    let f = fixture(true);
    let (record, _) = f.service.add_task("a").await.unwrap();
    f.connectivity.set_online(false);

    let (toggled, dispatch) = f.service.toggle_task(record.id).await.unwrap().unwrap();
    assert!(!toggled.synced);
    assert!(matches!(dispatch, Dispatch::Queued(_)));
    assert_eq!(f.service.pending().unwrap()[0].kind, MutationKind::Update);
  }

  #[tokio::test]
  async fn delete_of_synced_record_online_goes_direct() {
    let f = fixture(true);
    let (record, _) = f.service.add_task("a").await.unwrap();

    assert_eq!(
      f.service.delete_task(record.id).await.unwrap(),
      Some(Dispatch::Delivered)
    );
    assert!(f.service.list().unwrap().is_empty());
    assert_eq!(f.service.delete_task(record.id).await.unwrap(), None);
  }

  #[tokio::test]
  async fn clear_completed_queues_deletes_offline() {
    let f = fixture(false);
    let (a, _) = f.service.add_task("a").await.unwrap();
    f.service.add_task("b").await.unwrap();
    f.service.toggle_task(a.id).await.unwrap();

    let cleared = f.service.clear_completed().await.unwrap();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].0, a.id);

    assert_eq!(cleared[0].1, Dispatch::Discarded);

    let kinds: Vec<_> = f.service.pending().unwrap().iter().map(|m| m.kind).collect();
    assert_eq!(kinds, vec![MutationKind::Create]);
    assert_eq!(f.service.list().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn deleting_an_unsent_task_drops_its_queued_changes() {
    let f = fixture(false);
    let (record, _) = f.service.add_task("Buy milk").await.unwrap();

    assert_eq!(
      f.service.delete_task(record.id).await.unwrap(),
      Some(Dispatch::Discarded)
    );
    assert!(f.service.list().unwrap().is_empty());
    assert!(f.queue.is_empty().unwrap());
    assert!(f.sink.attempts().is_empty());
  }

  #[tokio::test]
  async fn offline_delete_of_synced_task_is_queued() {
    let f = fixture(true);
    let (record, _) = f.service.add_task("a").await.unwrap();
    f.connectivity.set_online(false);
    f.service.toggle_task(record.id).await.unwrap();

    let dispatch = f.service.delete_task(record.id).await.unwrap();
    assert!(matches!(dispatch, Some(Dispatch::Queued(_))));
    let kinds: Vec<_> = f.service.pending().unwrap().iter().map(|m| m.kind).collect();
    assert_eq!(kinds, vec![MutationKind::Update, MutationKind::Delete]);
  }
}
