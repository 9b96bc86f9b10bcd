//! Request classification: which strategy answers which request.

use std::collections::HashSet;
use url::{Origin, Url};

use crate::config::Config;
use crate::http::{Destination, Request};

/// Bucket a request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Path contains the API marker segment
  Api,
  /// Documents, scripts, styles and the known static assets
  AppShell,
  /// Images and anything from another origin
  External,
  Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl RequestClass {
  pub fn strategy(self) -> Strategy {
    match self {
      Self::Api | Self::Other => Strategy::NetworkFirst,
      Self::AppShell => Strategy::CacheFirst,
      Self::External => Strategy::StaleWhileRevalidate,
    }
  }
}

pub struct Classifier {
  origin: Origin,
  api_marker: String,
  /// Same-origin paths of the app shell
  static_paths: HashSet<String>,
  /// Absolute URLs declared as static (external stylesheets)
  static_urls: HashSet<String>,
}

impl Classifier {
  pub fn new(config: &Config) -> Self {
    Self {
      origin: config.origin.origin(),
      api_marker: config.cache.api_marker.clone(),
      static_paths: config.cache.app_shell.iter().cloned().collect(),
      static_urls: config
        .cache
        .external_styles
        .iter()
        .map(Url::to_string)
        .collect(),
    }
  }

  /// First matching rule wins: API, app shell, external, other.
  pub fn classify(&self, request: &Request) -> RequestClass {
    let same_origin = request.url.origin() == self.origin;
    let path = request.url.path();

    if self.is_api_path(path) {
      return RequestClass::Api;
    }

    let shell_destination = matches!(
      request.destination,
      Destination::Document | Destination::Script | Destination::Style
    );
    let static_asset = (same_origin && self.static_paths.contains(path))
      || self.static_urls.contains(request.url.as_str());
    if shell_destination || static_asset {
      return RequestClass::AppShell;
    }

    if request.destination == Destination::Image || !same_origin {
      return RequestClass::External;
    }

    RequestClass::Other
  }

  /// `/api/...` or a bare `/api` both count.
  pub fn is_api_path(&self, path: &str) -> bool {
    path.contains(&self.api_marker) || path.ends_with(self.api_marker.trim_end_matches('/'))
  }
}
