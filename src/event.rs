use tokio::sync::{mpsc, oneshot};

use crate::connectivity::Connectivity;
use crate::http::{Request, Response};
use crate::notify::Notification;
use crate::sync::SyncRegistry;

/// Worker events
#[derive(Debug)]
pub enum WorkerEvent {
  /// Precache the app shell
  Install,
  /// Purge old cache generations and claim clients
  Activate,
  /// Intercepted request; the answer goes back on `respond_to`
  Fetch {
    request: Request,
    respond_to: Option<oneshot::Sender<Response>>,
  },
  /// Background-sync tag fired
  Sync { tag: String },
  /// Connectivity came back with no sync tag registered
  Reconnected,
  Push { payload: Option<Vec<u8>> },
  NotificationClick { notification: Notification },
}

/// Event discriminant used as the dispatch table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  Install,
  Activate,
  Fetch,
  Sync,
  Reconnected,
  Push,
  NotificationClick,
}

impl WorkerEvent {
  pub fn kind(&self) -> EventKind {
    match self {
      WorkerEvent::Install => EventKind::Install,
      WorkerEvent::Activate => EventKind::Activate,
      WorkerEvent::Fetch { .. } => EventKind::Fetch,
      WorkerEvent::Sync { .. } => EventKind::Sync,
      WorkerEvent::Reconnected => EventKind::Reconnected,
      WorkerEvent::Push { .. } => EventKind::Push,
      WorkerEvent::NotificationClick { .. } => EventKind::NotificationClick,
    }
  }
}

/// Event handler fed by the host and by connectivity changes
pub struct EventHandler {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender for host-originated events
  pub fn sender(&self) -> mpsc::UnboundedSender<WorkerEvent> {
    self.tx.clone()
  }

  /// On every offline to online transition, fire one sync event per
  /// registered tag, or a plain reconnect when none is registered.
  pub fn watch_connectivity(&self, connectivity: &Connectivity, registry: SyncRegistry) {
    let tx = self.tx.clone();
    let mut rx = connectivity.subscribe();
    let mut online = *rx.borrow_and_update();

    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let now = *rx.borrow_and_update();
        let reconnected = now && !online;
        online = now;
        if !reconnected {
          continue;
        }

        let events = match registry.registered() {
          Ok(tags) if !tags.is_empty() => tags
            .into_iter()
            .map(|tag| WorkerEvent::Sync { tag })
            .collect(),
          Ok(_) => vec![WorkerEvent::Reconnected],
          Err(e) => {
            tracing::warn!(error = %e, "failed to read sync registrations");
            vec![WorkerEvent::Reconnected]
          }
        };
        for event in events {
          if tx.send(event).is_err() {
            return;
          }
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<WorkerEvent> {
    self.rx.recv().await
  }
}
