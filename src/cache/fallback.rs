//! Synthetic responses for requests nobody can answer.

use crate::http::Response;

const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#e5e7eb"/><text x="100" y="105" font-family="sans-serif" font-size="14" fill="#6b7280" text-anchor="middle">Offline</text></svg>"##;

/// 408 for anything that has neither a network answer nor a cache entry.
pub fn not_available_offline() -> Response {
  Response::synthetic(
    408,
    "Request Timeout",
    "text/plain; charset=utf-8",
    "Resource not available offline",
  )
}

/// 404 for external resources that were never cached.
pub fn not_found() -> Response {
  Response::synthetic(
    404,
    "Not Found",
    "text/plain; charset=utf-8",
    "Resource not found",
  )
}

/// Machine-readable 408 for API calls.
pub fn api_offline() -> Response {
  let body = serde_json::json!({
    "error": "offline",
    "message": "Network unavailable and no cached data for this request",
  });
  Response::synthetic(
    408,
    "Request Timeout",
    "application/json",
    body.to_string(),
  )
}

/// Grey placeholder so broken images still render.
pub fn placeholder_image() -> Response {
  Response::synthetic(200, "OK", "image/svg+xml", PLACEHOLDER_SVG)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::ResponseSource;

  #[test]
  fn api_offline_is_structured() {
    let response = api_offline();
    assert_eq!(response.status, 408);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["error"], "offline");
    assert!(body["message"].as_str().unwrap().contains("Network unavailable"));
  }

  #[test]
  fn placeholder_is_an_image() {
    let response = placeholder_image();
    assert!(response.is_success());
    assert_eq!(response.source, ResponseSource::Fallback);
    assert_eq!(response.content_type(), Some("image/svg+xml"));
    assert!(response.text().starts_with("<svg"));
  }
}
