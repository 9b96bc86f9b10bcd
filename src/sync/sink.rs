//! Delivery of mutations to the sync server.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use url::Url;

use crate::config::Config;
use crate::http::{Network, NetworkError, Request};
use crate::queue::{MutationKind, PendingMutation};
use crate::tasks::{TaskId, TaskRecord};

/// One attempt to replay a mutation server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
  /// Lets the server drop a replay it has already applied
  pub idempotency_key: String,
  pub kind: MutationKind,
  pub local_ref: Option<TaskId>,
  pub body: serde_json::Value,
}

impl Delivery {
  /// Replay of a queued entry. The body is the record as it is now, or the
  /// enqueue-time snapshot when the record is gone.
  pub fn queued(mutation: &PendingMutation, current: Option<&TaskRecord>) -> Result<Self> {
    let body = match current {
      Some(record) => serde_json::to_value(record)
        .map_err(|e| eyre!("Failed to serialize task {}: {}", record.id, e))?,
      None => mutation.payload.clone(),
    };

    Ok(Self {
      idempotency_key: format!("mutation-{}", mutation.id),
      kind: mutation.kind,
      local_ref: mutation.local_ref,
      body,
    })
  }

  /// A mutation sent straight away while online.
  pub fn direct(kind: MutationKind, record: &TaskRecord) -> Result<Self> {
    Ok(Self {
      idempotency_key: format!("direct-{}", uuid::Uuid::new_v4()),
      kind,
      local_ref: Some(record.id),
      body: serde_json::to_value(record)
        .map_err(|e| eyre!("Failed to serialize task {}: {}", record.id, e))?,
    })
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
  #[error(transparent)]
  Network(#[from] NetworkError),
  #[error("server rejected {kind} with status {status}")]
  Rejected { kind: MutationKind, status: u16 },
  #[error("{0} mutation has no task reference")]
  Unaddressable(MutationKind),
}

/// Where mutations are delivered.
#[async_trait]
pub trait MutationSink: Send + Sync {
  /// `Ok` is a positive acknowledgement; anything else leaves the entry queued.
  async fn deliver(&self, delivery: &Delivery) -> std::result::Result<(), DeliveryError>;
}

/// Replays mutations as REST calls against `{server}/api/tasks`.
pub struct HttpSink {
  network: Arc<dyn Network>,
  endpoint: Url,
}

impl HttpSink {
  pub fn new(network: Arc<dyn Network>, config: &Config) -> Result<Self> {
    let collection = format!("{}tasks", config.cache.api_marker.trim_start_matches('/'));
    let endpoint = config
      .server_base()
      .join(&collection)
      .map_err(|e| eyre!("Invalid sync endpoint: {}", e))?;

    Ok(Self { network, endpoint })
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }

  fn request_for(&self, delivery: &Delivery) -> std::result::Result<Request, DeliveryError> {
    let (method, url) = match delivery.kind {
      MutationKind::Create => (Method::POST, self.endpoint.clone()),
      MutationKind::Update | MutationKind::Delete => {
        let id = delivery
          .local_ref
          .ok_or(DeliveryError::Unaddressable(delivery.kind))?;
        let mut url = self.endpoint.clone();
        url
          .path_segments_mut()
          .map_err(|_| NetworkError::InvalidRequest(format!("{} cannot be a base", self.endpoint)))?
          .push(&id.to_string());
        let method = if delivery.kind == MutationKind::Update {
          Method::PUT
        } else {
          Method::DELETE
        };
        (method, url)
      }
    };

    let request = Request::new(method, url).with_header("idempotency-key", &delivery.idempotency_key);
    if delivery.kind == MutationKind::Delete {
      return Ok(request);
    }
    request
      .with_json(&delivery.body)
      .map_err(|e| NetworkError::InvalidRequest(e.to_string()).into())
  }
}

#[async_trait]
impl MutationSink for HttpSink {
  async fn deliver(&self, delivery: &Delivery) -> std::result::Result<(), DeliveryError> {
    let request = self.request_for(delivery)?;
    let response = self.network.fetch(&request).await?;

    // A delete for something the server no longer has is already applied.
    let already_gone = delivery.kind == MutationKind::Delete && matches!(response.status, 404 | 410);
    if response.is_success() || already_gone {
      Ok(())
    } else {
      Err(DeliveryError::Rejected {
        kind: delivery.kind,
        status: response.status,
      })
    }
  }
}
