//! Core traits and types for the caching system.

use sha2::{Digest, Sha256};

use crate::http::Request;

/// Anything that can be looked up in a named cache.
pub trait CacheKey {
  /// Stable, fixed-length key for storage.
  fn cache_hash(&self) -> String;

  /// Human-readable description, stored next to the entry for listing.
  fn description(&self) -> String;
}

impl CacheKey for Request {
  fn cache_hash(&self) -> String {
    let input = format!("{} {}", self.method, normalize_url(&self.url));

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    normalize_url(&self.url)
  }
}

/// Fragments never reach the server, so they must not split cache entries.
fn normalize_url(url: &url::Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  #[test]
  fn key_ignores_fragment_but_not_query() {
    let a = Request::get(Url::parse("http://localhost/app.js#top").unwrap());
    let b = Request::get(Url::parse("http://localhost/app.js").unwrap());
    let c = Request::get(Url::parse("http://localhost/app.js?v=2").unwrap());

    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_ne!(b.cache_hash(), c.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
  }

  #[test]
  fn key_includes_method() {
    let url = Url::parse("http://localhost/api/tasks").unwrap();
    let get = Request::get(url.clone());
    let head = Request::new(Method::HEAD, url);
    assert_ne!(get.cache_hash(), head.cache_hash());
  }
}
