//! Host-side seams: the push manager and the notification display.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use super::types::{Notification, PermissionState, PushSubscription, SubscriptionKeys};
use crate::db::Database;

const PERMISSION_KEY: &str = "host:notification-permission";
const REGISTRATION_KEY: &str = "host:push-registration";

/// The host's push registration API.
#[async_trait]
pub trait PushManager: Send + Sync {
  fn is_supported(&self) -> bool;

  async fn permission(&self) -> Result<PermissionState>;

  /// Prompt the user. Only prompts once; later calls return the stored answer.
  async fn request_permission(&self) -> Result<PermissionState>;

  async fn subscribe(&self, application_server_key: &[u8]) -> Result<PushSubscription>;

  async fn get_subscription(&self) -> Result<Option<PushSubscription>>;

  /// Returns false when there was nothing to revoke.
  async fn unsubscribe(&self) -> Result<bool>;
}

/// Shows notifications to the user.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn show(&self, notification: &Notification) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Registration {
  application_server_key: String,
  subscription: PushSubscription,
}

/// Push manager backed by the local database.
///
/// Permission prompts are answered with the configured state, and
/// subscriptions get a fresh endpoint under the configured push service.
pub struct LocalPushManager {
  db: Arc<Database>,
  answer: PermissionState,
  push_endpoint: Url,
}

impl LocalPushManager {
  pub fn new(db: Arc<Database>, answer: PermissionState, push_endpoint: Url) -> Self {
    Self {
      db,
      answer,
      push_endpoint,
    }
  }

  fn registration(&self) -> Result<Option<Registration>> {
    match self.db.get_setting(REGISTRATION_KEY)? {
      Some(raw) => serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| eyre!("Failed to parse push registration: {}", e)),
      None => Ok(None),
    }
  }

  fn random_key(len: usize) -> String {
    let mut bytes = Vec::with_capacity(len + 16);
    while bytes.len() < len {
      bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    }
    bytes.truncate(len);
    URL_SAFE_NO_PAD.encode(bytes)
  }
}

#[async_trait]
impl PushManager for LocalPushManager {
  fn is_supported(&self) -> bool {
    true
  }

  async fn permission(&self) -> Result<PermissionState> {
    match self.db.get_setting(PERMISSION_KEY)? {
      Some(raw) => raw
        .parse()
        .map_err(|e| eyre!("Failed to read notification permission: {}", e)),
      None => Ok(PermissionState::Default),
    }
  }

  async fn request_permission(&self) -> Result<PermissionState> {
    let current = self.permission().await?;
    if current != PermissionState::Default {
      return Ok(current);
    }
    self.db.put_setting(PERMISSION_KEY, self.answer.as_str())?;
    tracing::info!(permission = %self.answer, "notification permission answered");
    Ok(self.answer)
  }

  async fn subscribe(&self, application_server_key: &[u8]) -> Result<PushSubscription> {
    if self.permission().await? != PermissionState::Granted {
      return Err(eyre!("Notification permission not granted"));
    }

    let encoded_key = URL_SAFE_NO_PAD.encode(application_server_key);
    if let Some(existing) = self.registration()? {
      if existing.application_server_key == encoded_key {
        return Ok(existing.subscription);
      }
    }

    let mut endpoint = self.push_endpoint.clone();
    endpoint
      .path_segments_mut()
      .map_err(|_| eyre!("Push endpoint {} cannot be a base", self.push_endpoint))?
      .push(&uuid::Uuid::new_v4().to_string());

    let subscription = PushSubscription {
      endpoint: endpoint.to_string(),
      expiration_time: None,
      keys: SubscriptionKeys {
        p256dh: Self::random_key(65),
        auth: Self::random_key(16),
      },
    };
    let registration = Registration {
      application_server_key: encoded_key,
      subscription: subscription.clone(),
    };
    let raw = serde_json::to_string(&registration)
      .map_err(|e| eyre!("Failed to serialize push registration: {}", e))?;
    self.db.put_setting(REGISTRATION_KEY, &raw)?;

    Ok(subscription)
  }

  async fn get_subscription(&self) -> Result<Option<PushSubscription>> {
    Ok(self.registration()?.map(|r| r.subscription))
  }

  async fn unsubscribe(&self) -> Result<bool> {
    self.db.delete_setting(REGISTRATION_KEY)
  }
}

/// Prints notifications to stdout.
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
  async fn show(&self, notification: &Notification) -> Result<()> {
    println!("[notification] {}: {}", notification.title, notification.body);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manager(answer: PermissionState) -> LocalPushManager {
    LocalPushManager::new(
      Arc::new(Database::open_in_memory().unwrap()),
      answer,
      Url::parse("https://push.example/send").unwrap(),
    )
  }

  #[tokio::test]
  async fn permission_is_asked_once() {
    let manager = manager(PermissionState::Granted);
    assert_eq!(manager.permission().await.unwrap(), PermissionState::Default);
    assert_eq!(
      manager.request_permission().await.unwrap(),
      PermissionState::Granted
    );
    assert_eq!(manager.permission().await.unwrap(), PermissionState::Granted);
  }

  #[tokio::test]
  async fn subscribe_requires_permission() {
    let manager = manager(PermissionState::Denied);
    manager.request_permission().await.unwrap();
    assert!(manager.subscribe(&[4, 1, 2]).await.is_err());
  }

  #[tokio::test]
  async fn subscription_is_reused_for_the_same_key() {
    let manager = manager(PermissionState::Granted);
    manager.request_permission().await.unwrap();

    let first = manager.subscribe(&[4, 1, 2]).await.unwrap();
    let again = manager.subscribe(&[4, 1, 2]).await.unwrap();
    assert_eq!(first, again);
    assert!(first.endpoint.starts_with("https://push.example/send/"));

    let rotated = manager.subscribe(&[4, 9, 9]).await.unwrap();
    assert_ne!(first.endpoint, rotated.endpoint);

    assert!(manager.unsubscribe().await.unwrap());
    assert!(!manager.unsubscribe().await.unwrap());
    assert!(manager.get_subscription().await.unwrap().is_none());
  }
}
