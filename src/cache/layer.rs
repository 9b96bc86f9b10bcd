//! Cache engine that answers intercepted requests with a per-class strategy.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::classify::{Classifier, RequestClass, Strategy};
use super::fallback;
use super::storage::CacheStorage;
use crate::config::Config;
use crate::http::{Network, Request, Response, ResponseSource};

/// Cache engine that sits between the application and the network.
///
/// `handle` never fails: every miss without a network answer turns into a
/// fallback response, so the calling page always gets something back.
pub struct CacheEngine {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  classifier: Classifier,
  /// Cache generation for the current deployment
  cache_name: String,
  offline_page: Option<Url>,
  /// Background revalidations still in flight
  revalidations: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
  pub fn new(config: &Config, storage: Arc<dyn CacheStorage>, network: Arc<dyn Network>) -> Self {
    let offline_page = config
      .offline_page_url()
      .map_err(|e| warn!(error = %e, "offline page disabled"))
      .ok();

    Self {
      storage,
      network,
      classifier: Classifier::new(config),
      cache_name: config.cache.cache_name(),
      offline_page,
      revalidations: Mutex::new(Vec::new()),
    }
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  pub(super) fn network(&self) -> &Arc<dyn Network> {
    &self.network
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    self.classifier.classify(request)
  }

  /// Answer a request using the strategy its classification selects.
  pub async fn handle(&self, request: &Request) -> Response {
    let class = self.classify(request);
    debug!(method = %request.method, url = %request.url, ?class, "intercepted request");

    match class.strategy() {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request, class).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// Cached copy if present, with no network call; else fetch and store.
  pub async fn cache_first(&self, request: &Request) -> Response {
    if let Some(cached) = self.lookup(request) {
      debug!(url = %request.url, "cache hit");
      return cached;
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(request, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "cache miss and network failed");
        if request.is_navigation() {
          self.offline_page()
        } else {
          fallback::not_available_offline()
        }
      }
    }
  }

  /// Fresh from the network when possible, cache only as a fallback.
  pub async fn network_first(&self, request: &Request, class: RequestClass) -> Response {
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(request, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "network failed, trying cache");
        if let Some(cached) = self.lookup(request) {
          return cached;
        }
        if request.is_navigation() {
          self.offline_page()
        } else if class == RequestClass::Api {
          fallback::api_offline()
        } else {
          fallback::not_available_offline()
        }
      }
    }
  }

  /// Cached copy right away while a background fetch refreshes the entry.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Response {
    if let Some(cached) = self.lookup(request) {
      self.spawn_revalidation(request.clone());
      return cached;
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(request, &response);
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "no cache and network failed");
        if request.destination == crate::http::Destination::Image {
          fallback::placeholder_image()
        } else {
          fallback::not_found()
        }
      }
    }
  }

  /// Wait for background revalidations started so far.
  pub async fn settle(&self) {
    let pending: Vec<JoinHandle<()>> = match self.revalidations.lock() {
      Ok(mut handles) => handles.drain(..).collect(),
      Err(_) => return,
    };

    for result in futures::future::join_all(pending).await {
      if let Err(e) = result {
        warn!(error = %e, "revalidation task panicked");
      }
    }
  }

  fn spawn_revalidation(&self, request: Request) {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let cache_name = self.cache_name.clone();

    let handle = tokio::spawn(async move {
      match network.fetch(&request).await {
        Ok(response) if response.is_success() && cacheable(&request) => {
          if let Err(e) = storage.put(&cache_name, &request, &response) {
            debug!(url = %request.url, error = %e, "revalidation could not update cache");
          }
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "revalidation left cache unchanged");
        }
        Err(e) => {
          debug!(url = %request.url, error = %e, "revalidation failed, cache left unchanged");
        }
      }
    });

    if let Ok(mut handles) = self.revalidations.lock() {
      handles.retain(|h| !h.is_finished());
      handles.push(handle);
    }
  }

  /// Store errors count as a miss.
  fn lookup(&self, request: &Request) -> Option<Response> {
    match self.storage.match_request(&self.cache_name, request) {
      Ok(hit) => hit.map(|c| c.response),
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache lookup failed");
        None
      }
    }
  }

  fn store(&self, request: &Request, response: &Response) {
    if !cacheable(request) {
      return;
    }
    if let Err(e) = self.storage.put(&self.cache_name, request, response) {
      warn!(url = %request.url, error = %e, "failed to store response in cache");
    }
  }

  /// The precached offline page, or a plain 408 when even that is missing.
  fn offline_page(&self) -> Response {
    self
      .offline_page
      .as_ref()
      .and_then(|url| self.lookup(&Request::get(url.clone())))
      .map(|page| page.with_source(ResponseSource::Fallback))
      .unwrap_or_else(fallback::not_available_offline)
  }
}

/// Only GET responses are stored.
fn cacheable(request: &Request) -> bool {
  request.method == reqwest::Method::GET
}
