//! Drains the mutation queue against the server.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::sink::{Delivery, MutationSink};
use crate::clients::{post_to_all, ClientMessage, Clients};
use crate::config::SyncConfig;
use crate::notify::NotificationChannel;
use crate::queue::{MutationId, MutationKind, MutationQueue, PendingMutation};
use crate::tasks::{TaskId, TaskRecord, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Draining,
  Attempting(MutationId),
}

/// What woke the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
  Reconnected,
  Tag(String),
  Manual,
}

impl fmt::Display for SyncTrigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SyncTrigger::Reconnected => write!(f, "reconnected"),
      SyncTrigger::Tag(tag) => write!(f, "tag:{}", tag),
      SyncTrigger::Manual => write!(f, "manual"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
  Acked,
  /// Left queued for the next trigger
  Failed(String),
  /// Not attempted because an earlier change to the same record failed
  Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
  pub mutation_id: MutationId,
  pub local_ref: Option<TaskId>,
  pub kind: MutationKind,
  pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub trigger: SyncTrigger,
  /// Attempted items in queue order
  pub items: Vec<ItemReport>,
  /// The log could not be read; nothing was attempted
  pub aborted: bool,
  /// Another cycle was already running, so this trigger did nothing
  pub coalesced: bool,
}

impl SyncReport {
  fn new(trigger: SyncTrigger) -> Self {
    Self {
      trigger,
      items: Vec::new(),
      aborted: false,
      coalesced: false,
    }
  }

  pub fn acked(&self) -> usize {
    self
      .items
      .iter()
      .filter(|i| i.outcome == ItemOutcome::Acked)
      .count()
  }

  /// Items left queued, whether attempted or deferred.
  pub fn failed(&self) -> usize {
    self.items.len() - self.acked()
  }
}

/// Puts the coordinator back to idle when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a Mutex<SyncState>);

impl Drop for CycleGuard<'_> {
  fn drop(&mut self) {
    if let Ok(mut state) = self.0.lock() {
      *state = SyncState::Idle;
    }
  }
}

pub struct SyncCoordinator {
  queue: MutationQueue,
  tasks: TaskStore,
  sink: Arc<dyn MutationSink>,
  clients: Arc<dyn Clients>,
  notifications: Arc<NotificationChannel>,
  item_delay: Duration,
  tag: String,
  state: Mutex<SyncState>,
}

impl SyncCoordinator {
  pub fn new(
    config: &SyncConfig,
    queue: MutationQueue,
    tasks: TaskStore,
    sink: Arc<dyn MutationSink>,
    clients: Arc<dyn Clients>,
    notifications: Arc<NotificationChannel>,
  ) -> Self {
    Self {
      queue,
      tasks,
      sink,
      clients,
      notifications,
      item_delay: config.item_delay(),
      tag: config.tag.clone(),
      state: Mutex::new(SyncState::Idle),
    }
  }

  pub fn state(&self) -> SyncState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(SyncState::Idle)
  }

  /// Run a cycle for a background-sync event. Tags other than the
  /// configured one are ignored.
  pub async fn handle_sync_event(&self, tag: &str) -> Option<SyncReport> {
    if tag != self.tag {
      debug!(tag, "ignoring unknown sync tag");
      return None;
    }
    Some(self.run(SyncTrigger::Tag(tag.to_string())).await)
  }

  /// Drain the queue once, oldest first.
  ///
  /// Failures stay queued for the next trigger and do not stop items for
  /// other records. Later items for a record whose earlier item failed are
  /// deferred, so changes to one record always reach the server in order.
  pub async fn run(&self, trigger: SyncTrigger) -> SyncReport {
    let mut report = SyncReport::new(trigger);

    let _guard = match self.begin_cycle() {
      Some(guard) => guard,
      None => {
        debug!(trigger = %report.trigger, "sync already running, coalescing trigger");
        report.coalesced = true;
        return report;
      }
    };

    let drain = match self.queue.drain() {
      Ok(drain) => drain,
      Err(e) => {
        warn!(error = %e, "mutation log unavailable, will retry on next trigger");
        report.aborted = true;
        return report;
      }
    };

    info!(trigger = %report.trigger, pending = drain.snapshot_len(), "sync cycle started");

    let mut held: HashSet<TaskId> = HashSet::new();
    for next in drain {
      let mutation = match next {
        Ok(mutation) => mutation,
        Err(e) => {
          warn!(error = %e, "skipping unreadable queued mutation");
          continue;
        }
      };

      if let Some(task) = mutation.local_ref.filter(|task| held.contains(task)) {
        debug!(id = %mutation.id, %task, "deferring behind an earlier failure");
        report.items.push(ItemReport {
          mutation_id: mutation.id,
          local_ref: mutation.local_ref,
          kind: mutation.kind,
          outcome: ItemOutcome::Deferred,
        });
        continue;
      }

      self.set_state(SyncState::Attempting(mutation.id));
      if !self.item_delay.is_zero() {
        tokio::time::sleep(self.item_delay).await;
      }
      let outcome = self.attempt(&mutation).await;
      self.set_state(SyncState::Draining);

      if let (Some(task), false) = (mutation.local_ref, outcome == ItemOutcome::Acked) {
        held.insert(task);
      }
      report.items.push(ItemReport {
        mutation_id: mutation.id,
        local_ref: mutation.local_ref,
        kind: mutation.kind,
        outcome,
      });
    }

    info!(
      trigger = %report.trigger,
      acked = report.acked(),
      failed = report.failed(),
      "sync cycle finished"
    );
    report
  }

  fn begin_cycle(&self) -> Option<CycleGuard<'_>> {
    let mut state = self.state.lock().ok()?;
    if *state != SyncState::Idle {
      return None;
    }
    *state = SyncState::Draining;
    Some(CycleGuard(&self.state))
  }

  fn set_state(&self, next: SyncState) {
    if let Ok(mut state) = self.state.lock() {
      *state = next;
    }
  }

  async fn attempt(&self, mutation: &PendingMutation) -> ItemOutcome {
    let current = match mutation.local_ref {
      Some(id) => match self.tasks.get(id) {
        Ok(record) => record,
        Err(e) => return self.failed(mutation, format!("Failed to read task {}: {}", id, e)),
      },
      None => None,
    };

    let delivery = match Delivery::queued(mutation, current.as_ref()) {
      Ok(delivery) => delivery,
      Err(e) => return self.failed(mutation, e.to_string()),
    };

    if let Err(e) = self.sink.deliver(&delivery).await {
      return self.failed(mutation, e.to_string());
    }

    // Delivered but not recorded: the entry is redelivered next time and the
    // idempotency key lets the server drop the duplicate.
    if let Err(e) = self.queue.acknowledge(mutation) {
      return self.failed(mutation, format!("acknowledgement not recorded: {}", e));
    }

    info!(id = %mutation.id, kind = %mutation.kind, "mutation acknowledged");
    if let Some(task) = self.synced_record(mutation) {
      let message = ClientMessage::SyncSuccess { task: task.clone() };
      if let Err(e) = post_to_all(self.clients.as_ref(), &message).await {
        warn!(error = %e, "failed to notify clients of sync");
      }
      self.notifications.confirm_sync(&task).await;
    }
    ItemOutcome::Acked
  }

  fn failed(&self, mutation: &PendingMutation, reason: String) -> ItemOutcome {
    warn!(id = %mutation.id, kind = %mutation.kind, error = %reason, "delivery failed, leaving queued");
    ItemOutcome::Failed(reason)
  }

  /// The stored record to announce after an ack. Deletes and records that
  /// no longer exist locally are not announced.
  fn synced_record(&self, mutation: &PendingMutation) -> Option<TaskRecord> {
    if mutation.kind == MutationKind::Delete {
      return None;
    }
    let id = mutation.local_ref?;
    match self.tasks.get(id) {
      Ok(record) => record,
      Err(e) => {
        debug!(task = %id, error = %e, "failed to reload synced task");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clients::LocalClients;
  use crate::config::Config;
  use crate::db::Database;
  use crate::notify::{LocalPushManager, PermissionState};
  use crate::queue::SqliteMutationLog;
  use crate::test_utils::{BrokenLog, RecordingNotifier, ScriptedSink};

  struct Fixture {
    coordinator: SyncCoordinator,
    queue: MutationQueue,
    tasks: TaskStore,
    sink: Arc<ScriptedSink>,
    clients: Arc<LocalClients>,
    notifier: Arc<RecordingNotifier>,
    notifications: Arc<NotificationChannel>,
  }

  fn fixture_with(delay_ms: u64, broken_log: bool) -> Fixture {
    let mut config = Config::default();
    config.sync.item_delay_ms = delay_ms;
    let db = Arc::new(Database::open_in_memory().unwrap());
    let queue = if broken_log {
      MutationQueue::new(Arc::new(BrokenLog))
    } else {
      MutationQueue::new(Arc::new(SqliteMutationLog::new(Arc::clone(&db))))
    };
    let tasks = TaskStore::new(Arc::clone(&db));
    let sink = Arc::new(ScriptedSink::new());
    let clients = Arc::new(LocalClients::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = Arc::new(LocalPushManager::new(
      Arc::clone(&db),
      PermissionState::Granted,
      config.notifications.push_endpoint.clone(),
    ));
    let notifications = Arc::new(NotificationChannel::new(
      &config,
      db,
      manager,
      notifier.clone(),
      clients.clone(),
    ));
    let coordinator = SyncCoordinator::new(
      &config.sync,
      queue.clone(),
      tasks.clone(),
      sink.clone(),
      clients.clone(),
      Arc::clone(&notifications),
    );
    Fixture {
      coordinator,
      queue,
      tasks,
      sink,
      clients,
      notifier,
      notifications,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(0, false)
  }

  fn queue_create(f: &Fixture, text: &str) -> (TaskRecord, MutationId) {
    let record = f.tasks.insert(text, false).unwrap();
    let id = f
      .queue
      .enqueue(
        MutationKind::Create,
        Some(record.id),
        serde_json::to_value(&record).unwrap(),
      )
      .unwrap();
    (record, id)
  }

  #[tokio::test]
  async fn failed_item_stays_queued_and_later_items_proceed() {
    let f = fixture();
    let (_, first) = queue_create(&f, "one");
    let (two, second) = queue_create(&f, "two");
    let (_, third) = queue_create(&f, "three");
    f.sink.reject_mutation(second);

    let report = f.coordinator.run(SyncTrigger::Manual).await;

    assert_eq!(
      f.sink.attempted_keys(),
      vec![
        format!("mutation-{}", first),
        format!("mutation-{}", second),
        format!("mutation-{}", third),
      ]
    );
    assert_eq!(report.acked(), 2);
    assert!(matches!(report.items[1].outcome, ItemOutcome::Failed(_)));

    let remaining: Vec<_> = f.queue.list().unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(remaining, vec![second]);
    assert!(!f.tasks.get(two.id).unwrap().unwrap().synced);
    assert_eq!(f.coordinator.state(), SyncState::Idle);
  }

  #[tokio::test]
  async fn ack_marks_synced_and_broadcasts() {
    let f = fixture();
    f.clients
      .attach(url::Url::parse("http://localhost:5173/").unwrap())
      .unwrap();
    let mut rx = f.clients.subscribe();
    f.notifications.subscribe().await.unwrap();
    let (record, _) = queue_create(&f, "Buy milk");

    let report = f.coordinator.run(SyncTrigger::Reconnected).await;

    assert_eq!(report.acked(), 1);
    assert!(f.queue.is_empty().unwrap());
    assert!(f.tasks.get(record.id).unwrap().unwrap().synced);

    let (_, ClientMessage::SyncSuccess { task }) = rx.try_recv().unwrap();
    assert_eq!(task.text, "Buy milk");
    assert!(task.synced);

    let shown = f.notifier.shown();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].body, "Buy milk");
  }

  #[tokio::test]
  async fn failed_delivery_sends_no_notification() {
    let f = fixture();
    f.notifications.subscribe().await.unwrap();
    f.sink.set_offline(true);
    queue_create(&f, "later");

    let report = f.coordinator.run(SyncTrigger::Manual).await;
    assert_eq!(report.failed(), 1);
    assert_eq!(f.queue.len().unwrap(), 1);
    assert!(f.notifier.shown().is_empty());
  }

  fn queue_delete(f: &Fixture, record: &TaskRecord) -> MutationId {
    f.tasks.delete(record.id).unwrap();
    f.queue
      .enqueue(
        MutationKind::Delete,
        Some(record.id),
        serde_json::to_value(record).unwrap(),
      )
      .unwrap()
  }

  #[tokio::test]
  async fn deleted_record_is_replayed_from_snapshot_without_announcement() {
    let f = fixture();
    f.clients
      .attach(url::Url::parse("http://localhost:5173/").unwrap())
      .unwrap();
    let mut rx = f.clients.subscribe();
    f.notifications.subscribe().await.unwrap();
    let (record, _) = queue_create(&f, "gone");
    queue_delete(&f, &record);

    let report = f.coordinator.run(SyncTrigger::Manual).await;
    assert_eq!(report.acked(), 2);
    let attempts = f.sink.attempts();
    assert_eq!(attempts[1].kind, MutationKind::Delete);
    assert_eq!(attempts[1].body["text"], "gone");

    // The record is gone locally, so nothing claims it was synced.
    assert!(rx.try_recv().is_err());
    assert!(f.notifier.shown().is_empty());
  }

  #[tokio::test]
  async fn later_changes_wait_behind_a_failed_one() {
    let f = fixture();
    let (record, create) = queue_create(&f, "Buy milk");
    let delete = queue_delete(&f, &record);
    let (_, other) = queue_create(&f, "unrelated");
    f.sink.reject_mutation(create);

    let first = f.coordinator.run(SyncTrigger::Manual).await;
    let outcomes: Vec<_> = first.items.iter().map(|i| (i.kind, i.outcome.clone())).collect();
    assert!(matches!(outcomes[0], (MutationKind::Create, ItemOutcome::Failed(_))));
    assert_eq!(outcomes[1], (MutationKind::Delete, ItemOutcome::Deferred));
    assert_eq!(outcomes[2], (MutationKind::Create, ItemOutcome::Acked));
    assert_eq!(first.failed(), 2);
    assert_eq!(
      f.sink.attempted_keys(),
      vec![format!("mutation-{}", create), format!("mutation-{}", other)]
    );

    f.sink.accept_mutation(create);
    let second = f.coordinator.run(SyncTrigger::Manual).await;
    assert_eq!(second.acked(), 2);
    assert!(f.queue.is_empty().unwrap());

    // The delete follows the create, so the server ends without the record.
    let kinds: Vec<_> = f.sink.attempts().iter().skip(2).map(|d| d.kind).collect();
    assert_eq!(kinds, vec![MutationKind::Create, MutationKind::Delete]);
    assert_eq!(
      f.sink.attempted_keys().last().unwrap(),
      &format!("mutation-{}", delete)
    );
  }

  #[tokio::test]
  async fn unreadable_log_aborts_the_cycle() {
    let f = fixture_with(0, true);
    let report = f.coordinator.run(SyncTrigger::Reconnected).await;
    assert!(report.aborted);
    assert!(report.items.is_empty());
    assert!(f.sink.attempts().is_empty());
    assert_eq!(f.coordinator.state(), SyncState::Idle);
  }

  #[tokio::test]
  async fn unknown_tags_are_ignored() {
    let f = fixture();
    queue_create(&f, "x");
    assert!(f.coordinator.handle_sync_event("other-tag").await.is_none());
    assert_eq!(f.queue.len().unwrap(), 1);

    let report = f.coordinator.handle_sync_event("sync-tasks").await.unwrap();
    assert_eq!(report.trigger, SyncTrigger::Tag("sync-tasks".to_string()));
    assert_eq!(f.queue.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn concurrent_triggers_are_coalesced() {
    let f = fixture_with(10, false);
    queue_create(&f, "a");

    let (first, second) = tokio::join!(
      f.coordinator.run(SyncTrigger::Reconnected),
      f.coordinator.run(SyncTrigger::Manual)
    );

    assert!(!first.coalesced);
    assert_eq!(first.acked(), 1);
    assert!(second.coalesced);
    assert_eq!(f.sink.attempts().len(), 1);
  }
}
