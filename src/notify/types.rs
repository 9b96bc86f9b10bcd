use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

use crate::config::NotificationConfig;

/// The user's answer to the notification permission prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
  /// Not asked yet
  #[default]
  Default,
  Granted,
  Denied,
}

impl PermissionState {
  pub fn as_str(self) -> &'static str {
    match self {
      PermissionState::Default => "default",
      PermissionState::Granted => "granted",
      PermissionState::Denied => "denied",
    }
  }
}

impl std::fmt::Display for PermissionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for PermissionState {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "default" => Ok(PermissionState::Default),
      "granted" => Ok(PermissionState::Granted),
      "denied" => Ok(PermissionState::Denied),
      other => Err(format!("unknown permission state: {}", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
  pub p256dh: String,
  pub auth: String,
}

/// Details the push service needs to reach this installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSubscription {
  pub endpoint: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expiration_time: Option<i64>,
  pub keys: SubscriptionKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NotificationStatus {
  pub supported: bool,
  pub permission: PermissionState,
  pub subscribed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
  #[serde(default)]
  pub url: Option<String>,
}

/// A user-visible notification as handed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub image: Option<String>,
  pub tag: Option<String>,
  #[serde(default)]
  pub data: NotificationData,
}

impl Notification {
  pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      body: body.into(),
      icon: None,
      image: None,
      tag: None,
      data: NotificationData::default(),
    }
  }

  pub fn with_icon(mut self, icon: Option<String>) -> Self {
    self.icon = icon;
    self
  }

  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tag = Some(tag.into());
    self
  }
}

/// Incoming push message. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub icon: Option<String>,
  pub image: Option<String>,
  pub tag: Option<String>,
  #[serde(default)]
  pub data: NotificationData,
}

impl PushPayload {
  /// An absent or malformed payload yields an empty one, so the defaults apply.
  pub fn parse(raw: Option<&[u8]>) -> Self {
    let Some(bytes) = raw else {
      return Self::default();
    };
    match serde_json::from_slice(bytes) {
      Ok(payload) => payload,
      Err(e) => {
        tracing::debug!(error = %e, "push payload is not JSON, using defaults");
        Self::default()
      }
    }
  }

  pub fn into_notification(self, config: &NotificationConfig) -> Notification {
    Notification {
      title: self.title.unwrap_or_else(|| config.default_title.clone()),
      body: self.body.unwrap_or_else(|| config.default_body.clone()),
      icon: self.icon.or_else(|| config.icon.clone()),
      image: self.image,
      tag: self.tag,
      data: self.data,
    }
  }
}

/// Decode the base64url VAPID key into the raw bytes the push manager expects.
pub fn decode_application_server_key(key: &str) -> Result<Vec<u8>> {
  URL_SAFE_NO_PAD
    .decode(key.trim().trim_end_matches('='))
    .map_err(|e| eyre!("Invalid application server key: {}", e))
}
