//! Fakes for the network, host and storage seams shared by test modules.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::http::{Network, NetworkError, Request, Response};
use crate::notify::{Notification, Notifier, PermissionState, PushManager, PushSubscription};
use crate::queue::{MutationId, MutationKind, MutationLog, PendingMutation};
use crate::sync::{Delivery, DeliveryError, MutationSink};
use crate::tasks::TaskId;

enum Route {
  Respond(u16, String),
  Fail,
}

/// Network answering from a fixed route table keyed by method and URL.
///
/// Unrouted requests fail with a transport error.
#[derive(Default)]
pub struct ScriptedNetwork {
  routes: Mutex<HashMap<(Method, String), Route>>,
  offline: AtomicBool,
  gate: Mutex<Option<Arc<Notify>>>,
  calls: Mutex<Vec<(Method, String)>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, method: Method, url: &str, status: u16, body: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method, url.to_string()), Route::Respond(status, body.to_string()));
  }

  pub fn fail(&self, method: Method, url: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method, url.to_string()), Route::Fail);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Park every later fetch until the returned gate is notified.
  pub fn hold(&self) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
    gate
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls(&self) -> Vec<(Method, String)> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetworkError> {
    self
      .calls
      .lock()
      .unwrap()
      .push((request.method.clone(), request.url.to_string()));

    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.notified().await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(NetworkError::Offline);
    }

    let routes = self.routes.lock().unwrap();
    match routes.get(&(request.method.clone(), request.url.to_string())) {
      Some(Route::Respond(status, body)) => Ok(Response::new(*status, body.as_bytes().to_vec())),
      Some(Route::Fail) | None => Err(NetworkError::Transport {
        url: request.url.to_string(),
        message: "connection refused".to_string(),
      }),
    }
  }
}

/// Sink that records every delivery and rejects chosen mutations.
#[derive(Default)]
pub struct ScriptedSink {
  delivered: Mutex<Vec<Delivery>>,
  rejected: Mutex<HashSet<String>>,
  offline: AtomicBool,
}

impl ScriptedSink {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reject the delivery carrying this idempotency key.
  pub fn reject(&self, idempotency_key: &str) {
    self
      .rejected
      .lock()
      .unwrap()
      .insert(idempotency_key.to_string());
  }

  pub fn reject_mutation(&self, id: MutationId) {
    self.reject(&format!("mutation-{}", id));
  }

  pub fn accept_mutation(&self, id: MutationId) {
    self
      .rejected
      .lock()
      .unwrap()
      .remove(&format!("mutation-{}", id));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Every attempted delivery, rejected ones included.
  pub fn attempts(&self) -> Vec<Delivery> {
    self.delivered.lock().unwrap().clone()
  }

  pub fn attempted_keys(&self) -> Vec<String> {
    self
      .attempts()
      .into_iter()
      .map(|d| d.idempotency_key)
      .collect()
  }
}

#[async_trait]
impl MutationSink for ScriptedSink {
  async fn deliver(&self, delivery: &Delivery) -> std::result::Result<(), DeliveryError> {
    if self.offline.load(Ordering::SeqCst) {
      return Err(NetworkError::Offline.into());
    }
    self.delivered.lock().unwrap().push(delivery.clone());
    if self
      .rejected
      .lock()
      .unwrap()
      .contains(&delivery.idempotency_key)
    {
      return Err(DeliveryError::Rejected {
        kind: delivery.kind,
        status: 500,
      });
    }
    Ok(())
  }
}

/// Notifier that keeps what it was asked to show.
#[derive(Default)]
pub struct RecordingNotifier {
  shown: Mutex<Vec<Notification>>,
  fail_next: AtomicBool,
}

impl RecordingNotifier {
  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }

  pub fn fail_next(&self) {
    self.fail_next.store(true, Ordering::SeqCst);
  }
}

#[async_trait]
impl Notifier for RecordingNotifier {
  async fn show(&self, notification: &Notification) -> Result<()> {
    if self.fail_next.swap(false, Ordering::SeqCst) {
      return Err(eyre!("notification display failed"));
    }
    self.shown.lock().unwrap().push(notification.clone());
    Ok(())
  }
}

/// Host without a push service.
pub struct UnsupportedPushManager;

#[async_trait]
impl PushManager for UnsupportedPushManager {
  fn is_supported(&self) -> bool {
    false
  }

  async fn permission(&self) -> Result<PermissionState> {
    Ok(PermissionState::Default)
  }

  async fn request_permission(&self) -> Result<PermissionState> {
    Err(eyre!("push is not supported"))
  }

  async fn subscribe(&self, _key: &[u8]) -> Result<PushSubscription> {
    Err(eyre!("push is not supported"))
  }

  async fn get_subscription(&self) -> Result<Option<PushSubscription>> {
    Ok(None)
  }

  async fn unsubscribe(&self) -> Result<bool> {
    Ok(false)
  }
}

/// Mutation log whose storage cannot be opened.
pub struct BrokenLog;

impl MutationLog for BrokenLog {
  fn append(
    &self,
    _kind: MutationKind,
    _local_ref: Option<TaskId>,
    _payload: &serde_json::Value,
  ) -> Result<PendingMutation> {
    Err(eyre!("store unavailable"))
  }

  fn ids(&self) -> Result<Vec<MutationId>> {
    Err(eyre!("store unavailable"))
  }

  fn get(&self, _id: MutationId) -> Result<Option<PendingMutation>> {
    Err(eyre!("store unavailable"))
  }

  fn remove(&self, _id: MutationId) -> Result<bool> {
    Err(eyre!("store unavailable"))
  }

  fn acknowledge(&self, _id: MutationId, _local_ref: Option<TaskId>) -> Result<bool> {
    Err(eyre!("store unavailable"))
  }

  fn len(&self) -> Result<usize> {
    Err(eyre!("store unavailable"))
  }

  fn clear(&self) -> Result<usize> {
    Err(eyre!("store unavailable"))
  }

  fn contains_ref(&self, _task: TaskId) -> Result<bool> {
    Err(eyre!("store unavailable"))
  }

  fn discard_unsent(&self, _task: TaskId) -> Result<usize> {
    Err(eyre!("store unavailable"))
  }
}
