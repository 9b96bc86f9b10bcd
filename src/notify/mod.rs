//! Best-effort user-visible notifications and push subscription management.
//!
//! Notification failures never affect sync outcomes: `confirm_sync` logs and
//! swallows them, and a missing permission is a state rather than an error.

mod host;
mod types;

pub use host::{ConsoleNotifier, LocalPushManager, Notifier, PushManager};
pub use types::{
  decode_application_server_key, Notification, NotificationStatus, PermissionState, PushPayload,
  PushSubscription,
};

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use url::Url;

use crate::clients::{ClientWindow, Clients};
use crate::config::{Config, NotificationConfig};
use crate::db::Database;
use crate::tasks::TaskRecord;

const SUBSCRIPTION_KEY: &str = "push-subscription";

/// What a notification click did.
#[derive(Debug, Clone, PartialEq)]
pub enum ClickAction {
  Focused(ClientWindow),
  Opened(ClientWindow),
}

pub struct NotificationChannel {
  manager: Arc<dyn PushManager>,
  notifier: Arc<dyn Notifier>,
  clients: Arc<dyn Clients>,
  db: Arc<Database>,
  config: NotificationConfig,
  origin: Url,
}

impl NotificationChannel {
  pub fn new(
    config: &Config,
    db: Arc<Database>,
    manager: Arc<dyn PushManager>,
    notifier: Arc<dyn Notifier>,
    clients: Arc<dyn Clients>,
  ) -> Self {
    Self {
      manager,
      notifier,
      clients,
      db,
      config: config.notifications.clone(),
      origin: config.origin.clone(),
    }
  }

  /// Ask for permission and register with the push service.
  ///
  /// `None` when push is unsupported or the user did not grant permission.
  pub async fn subscribe(&self) -> Result<Option<PushSubscription>> {
    if !self.manager.is_supported() {
      tracing::info!("push notifications are not supported");
      return Ok(None);
    }

    let permission = self.manager.request_permission().await?;
    if permission != PermissionState::Granted {
      tracing::info!(%permission, "notification permission not granted");
      return Ok(None);
    }

    let key = decode_application_server_key(&self.config.vapid_public_key)?;
    let subscription = self.manager.subscribe(&key).await?;
    let raw = serde_json::to_string(&subscription)
      .map_err(|e| eyre!("Failed to serialize push subscription: {}", e))?;
    self.db.put_setting(SUBSCRIPTION_KEY, &raw)?;

    tracing::info!(endpoint = %subscription.endpoint, "subscribed to push");
    Ok(Some(subscription))
  }

  /// Revoke the subscription and forget its details.
  pub async fn unsubscribe(&self) -> Result<bool> {
    let revoked = if self.manager.get_subscription().await?.is_some() {
      self.manager.unsubscribe().await?
    } else {
      false
    };
    let forgotten = self.db.delete_setting(SUBSCRIPTION_KEY)?;
    Ok(revoked || forgotten)
  }

  pub async fn status(&self) -> Result<NotificationStatus> {
    let supported = self.manager.is_supported();
    if !supported {
      return Ok(NotificationStatus {
        supported,
        permission: PermissionState::Default,
        subscribed: false,
      });
    }

    Ok(NotificationStatus {
      supported,
      permission: self.manager.permission().await?,
      subscribed: self.manager.get_subscription().await?.is_some(),
    })
  }

  pub fn stored_subscription(&self) -> Result<Option<PushSubscription>> {
    match self.db.get_setting(SUBSCRIPTION_KEY)? {
      Some(raw) => serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| eyre!("Failed to parse stored push subscription: {}", e)),
      None => Ok(None),
    }
  }

  /// Tell the user a queued task reached the server.
  pub async fn confirm_sync(&self, task: &TaskRecord) {
    match self.manager.permission().await {
      Ok(PermissionState::Granted) => {}
      Ok(permission) => {
        tracing::debug!(%permission, task = %task.id, "skipping sync confirmation");
        return;
      }
      Err(e) => {
        tracing::warn!(error = %e, "failed to read notification permission");
        return;
      }
    }

    let notification = Notification::new("Task synced", task.text.clone())
      .with_icon(self.config.icon.clone())
      .with_tag(format!("sync-{}", task.id));
    if let Err(e) = self.notifier.show(&notification).await {
      tracing::warn!(task = %task.id, error = %e, "failed to show sync confirmation");
    }
  }

  pub async fn handle_push(&self, payload: Option<&[u8]>) -> Notification {
    let notification = PushPayload::parse(payload).into_notification(&self.config);
    if let Err(e) = self.notifier.show(&notification).await {
      tracing::warn!(error = %e, "failed to show push notification");
    }
    notification
  }

  /// Focus an open window on the notification's origin, or open one.
  pub async fn handle_click(&self, notification: &Notification) -> Result<ClickAction> {
    let target_path = notification.data.url.as_deref().unwrap_or("/");
    let target = self
      .origin
      .join(target_path)
      .map_err(|e| eyre!("Invalid notification target {}: {}", target_path, e))?;

    let windows = self.clients.match_all().await?;
    if let Some(window) = windows
      .iter()
      .find(|w| w.url.origin() == target.origin())
    {
      let focused = self.clients.focus(&window.id).await?;
      return Ok(ClickAction::Focused(focused));
    }

    let opened = self.clients.open_window(&target).await?;
    Ok(ClickAction::Opened(opened))
  }

  /// Show a local notification if a subscription exists.
  pub async fn test_notification(&self) -> Result<bool> {
    if self.stored_subscription()?.is_none() {
      return Ok(false);
    }
    let notification = Notification::new(
      self.config.default_title.clone(),
      "Push notifications are working",
    )
    .with_icon(self.config.icon.clone())
    .with_tag("test");
    self.notifier.show(&notification).await?;
    Ok(true)
  }
}
