use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::tasks::TaskId;

/// Queue-local identifier. Insertion-ordered and never reused, so it doubles
/// as the deduplication key for redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub i64);

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl MutationKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MutationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(format!("unknown mutation kind: {}", other)),
    }
  }
}

/// A task write that still has to reach the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
  pub id: MutationId,
  pub kind: MutationKind,
  /// Weak reference to the originating record; it may be gone by replay time
  pub local_ref: Option<TaskId>,
  /// Snapshot of the record at enqueue time
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
}
