//! Online/offline tracking.

use async_trait::async_trait;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use crate::http::{Network, NetworkError, Request, Response};

/// Shared connectivity flag. Clones observe the same state.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Returns whether the state changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      tracing::info!(online, "connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Check reachability of `url` and record the result. Any HTTP answer
  /// counts as online.
  pub async fn probe(&self, network: &dyn Network, url: &Url) -> bool {
    let online = match network.fetch(&Request::new(Method::HEAD, url.clone())).await {
      Ok(_) => true,
      Err(e) => {
        tracing::debug!(error = %e, "connectivity probe failed");
        false
      }
    };
    self.set_online(online);
    online
  }

  /// Probe periodically until the returned handle is aborted.
  pub fn spawn_probe(&self, network: Arc<dyn Network>, url: Url, interval: Duration) -> JoinHandle<()> {
    let connectivity = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        connectivity.probe(network.as_ref(), &url).await;
      }
    })
  }
}

/// Network that refuses every request while connectivity is down.
pub struct GatedNetwork {
  inner: Arc<dyn Network>,
  connectivity: Connectivity,
}

impl GatedNetwork {
  pub fn new(inner: Arc<dyn Network>, connectivity: Connectivity) -> Self {
    Self {
      inner,
      connectivity,
    }
  }
}

#[async_trait]
impl Network for GatedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    if !self.connectivity.is_online() {
      return Err(NetworkError::Offline);
    }
    self.inner.fetch(request).await
  }
}
