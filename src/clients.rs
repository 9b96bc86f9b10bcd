//! Open application windows and the messages posted to them.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use url::Url;

use crate::tasks::TaskRecord;

/// Structured message posted to every open client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
  /// A queued mutation was acknowledged by the server
  #[serde(rename = "SYNC_SUCCESS")]
  SyncSuccess { task: TaskRecord },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientWindow {
  pub id: String,
  pub url: Url,
  pub focused: bool,
  /// Whether this worker answers the window's requests
  pub controlled: bool,
}

/// The host's view of open application windows.
#[async_trait]
pub trait Clients: Send + Sync {
  async fn match_all(&self) -> Result<Vec<ClientWindow>>;

  async fn focus(&self, id: &str) -> Result<ClientWindow>;

  async fn open_window(&self, url: &Url) -> Result<ClientWindow>;

  async fn post_message(&self, id: &str, message: &ClientMessage) -> Result<()>;

  /// Take control of every open window. Returns how many were newly claimed.
  async fn claim(&self) -> Result<usize>;
}

/// Post a message to every open client. Returns how many received it.
pub async fn post_to_all(clients: &dyn Clients, message: &ClientMessage) -> Result<usize> {
  let windows = clients.match_all().await?;
  let mut delivered = 0;
  for window in &windows {
    match clients.post_message(&window.id, message).await {
      Ok(()) => delivered += 1,
      Err(e) => tracing::warn!(client = %window.id, error = %e, "failed to post message"),
    }
  }
  Ok(delivered)
}

/// In-process client registry. Posted messages are published on a broadcast
/// channel so the embedding UI (or a test) can observe them.
pub struct LocalClients {
  windows: Mutex<Vec<ClientWindow>>,
  outbox: broadcast::Sender<(String, ClientMessage)>,
}

impl Default for LocalClients {
  fn default() -> Self {
    Self::new()
  }
}

impl LocalClients {
  pub fn new() -> Self {
    let (outbox, _) = broadcast::channel(64);
    Self {
      windows: Mutex::new(Vec::new()),
      outbox,
    }
  }

  /// Register an already open window, not yet controlled.
  pub fn attach(&self, url: Url) -> Result<ClientWindow> {
    let window = ClientWindow {
      id: uuid::Uuid::new_v4().to_string(),
      url,
      focused: false,
      controlled: false,
    };
    self.lock()?.push(window.clone());
    Ok(window)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<(String, ClientMessage)> {
    self.outbox.subscribe()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ClientWindow>>> {
    self
      .windows
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[async_trait]
impl Clients for LocalClients {
  async fn match_all(&self) -> Result<Vec<ClientWindow>> {
    Ok(self.lock()?.clone())
  }

  async fn focus(&self, id: &str) -> Result<ClientWindow> {
    let mut windows = self.lock()?;
    if !windows.iter().any(|w| w.id == id) {
      return Err(eyre!("No client with id {}", id));
    }
    for window in windows.iter_mut() {
      window.focused = window.id == id;
    }
    windows
      .iter()
      .find(|w| w.id == id)
      .cloned()
      .ok_or_else(|| eyre!("No client with id {}", id))
  }

  async fn open_window(&self, url: &Url) -> Result<ClientWindow> {
    let mut windows = self.lock()?;
    for window in windows.iter_mut() {
      window.focused = false;
    }
    let window = ClientWindow {
      id: uuid::Uuid::new_v4().to_string(),
      url: url.clone(),
      focused: true,
      controlled: true,
    };
    windows.push(window.clone());
    Ok(window)
  }

  async fn post_message(&self, id: &str, message: &ClientMessage) -> Result<()> {
    if !self.lock()?.iter().any(|w| w.id == id) {
      return Err(eyre!("No client with id {}", id));
    }
    // Nobody listening is fine
    let _ = self.outbox.send((id.to_string(), message.clone()));
    Ok(())
  }

  async fn claim(&self) -> Result<usize> {
    let mut windows = self.lock()?;
    let mut claimed = 0;
    for window in windows.iter_mut().filter(|w| !w.controlled) {
      window.controlled = true;
      claimed += 1;
    }
    Ok(claimed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tasks::TaskId;
  use chrono::Utc;

  fn task() -> TaskRecord {
    TaskRecord {
      id: TaskId(1),
      text: "Buy milk".to_string(),
      completed: false,
      created_at: Utc::now(),
      synced: true,
    }
  }

  #[test]
  fn sync_success_wire_format() {
    let message = ClientMessage::SyncSuccess { task: task() };
    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(json["type"], "SYNC_SUCCESS");
    assert_eq!(json["task"]["text"], "Buy milk");
  }

  #[tokio::test]
  async fn post_to_all_reaches_every_window() {
    let clients = LocalClients::new();
    let mut rx = clients.subscribe();
    let a = clients.attach(Url::parse("http://localhost:5173/").unwrap()).unwrap();
    let b = clients.attach(Url::parse("http://localhost:5173/tasks").unwrap()).unwrap();

    let message = ClientMessage::SyncSuccess { task: task() };
    assert_eq!(post_to_all(&clients, &message).await.unwrap(), 2);

    let (first, _) = rx.try_recv().unwrap();
    let (second, _) = rx.try_recv().unwrap();
    assert_eq!(vec![first, second], vec![a.id, b.id]);
  }

  #[tokio::test]
  async fn claim_and_focus() {
    let clients = LocalClients::new();
    let a = clients.attach(Url::parse("http://localhost:5173/").unwrap()).unwrap();
    clients.attach(Url::parse("http://localhost:5173/b").unwrap()).unwrap();

    assert_eq!(clients.claim().await.unwrap(), 2);
    assert_eq!(clients.claim().await.unwrap(), 0);

    let focused = clients.focus(&a.id).await.unwrap();
    assert!(focused.focused);
    assert!(clients.focus("missing").await.is_err());
  }
}
