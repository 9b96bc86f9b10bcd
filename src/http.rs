//! Request/response model at the interception boundary and the network seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::str::FromStr;
use url::{Origin, Url};

/// What the request is for, as reported by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  /// A navigable page
  Document,
  Script,
  Style,
  Image,
  Font,
  /// Data calls (fetch/XHR) and anything unlabelled
  #[default]
  Empty,
}

impl FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "image" => Ok(Self::Image),
      "font" => Ok(Self::Font),
      "empty" | "" => Ok(Self::Empty),
      other => Err(format!("unknown request destination: {}", other)),
    }
  }
}

/// An outbound request as seen by the cache engine.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      destination: Destination::Empty,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A top-level page load.
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_destination(Destination::Document)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self> {
    let bytes =
      serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;
    self.body = Some(bytes);
    Ok(self.with_header("content-type", "application/json"))
  }

  pub fn is_navigation(&self) -> bool {
    self.destination == Destination::Document
  }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from a named cache
  Cache,
  /// Synthesized or offline page, because neither network nor cache could answer
  Fallback,
}

#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: default_status_text(status).to_string(),
      headers: BTreeMap::new(),
      body: body.into(),
      source: ResponseSource::Network,
    }
  }

  /// A response built locally rather than fetched.
  pub fn synthetic(status: u16, status_text: &str, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status_text: status_text.to_string(),
      source: ResponseSource::Fallback,
      ..Self::new(status, body).with_header("content-type", content_type)
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get("content-type").map(String::as_str)
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to parse response body: {}", e))
  }
}

fn default_status_text(status: u16) -> &'static str {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}

/// Transport-level failures. Any HTTP status, including 5xx, is a response, not an error.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
  #[error("network unavailable")]
  Offline,
  #[error("request to {url} failed: {message}")]
  Transport { url: String, message: String },
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// The outbound network as seen from inside the worker.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetworkError>;
}

/// reqwest-backed network.
pub struct HttpNetwork {
  client: reqwest::Client,
  /// Bearer token for the sync server
  token: Option<String>,
  /// Only requests to this origin carry the token
  token_origin: Origin,
}

impl HttpNetwork {
  pub fn new(token: Option<String>, server: &Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("taskflow/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      token,
      token_origin: server.origin(),
    })
  }

  fn token_for(&self, request: &Request) -> Option<&str> {
    if request.headers.contains_key("authorization") || request.url.origin() != self.token_origin {
      return None;
    }
    self.token.as_deref()
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetworkError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(token) = self.token_for(request) {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let transport = |e: reqwest::Error| NetworkError::Transport {
      url: request.url.to_string(),
      message: e.to_string(),
    };

    let response = builder.send().await.map_err(transport)?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(transport)?.to_vec();

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      headers,
      body,
      source: ResponseSource::Network,
    })
  }
}
