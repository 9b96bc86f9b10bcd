use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::notify::PermissionState;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// The app's own origin; requests elsewhere are treated as external resources
  pub origin: Url,
  /// Base URL of the sync server (defaults to the app origin)
  pub server_url: Option<Url>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub prefix: String,
  /// Deployment version tag; bumping it invalidates every older cache on activate
  pub version: String,
  /// Path segment that marks API data requests
  #[serde(deserialize_with = "deserialize_path_marker")]
  pub api_marker: String,
  /// App-shell paths precached on install and always served cache-first
  pub app_shell: Vec<String>,
  /// External stylesheets precached on install
  pub external_styles: Vec<Url>,
  /// Served for navigations when neither network nor cache can answer
  pub offline_page: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background-sync tag registered while offline
  pub tag: String,
  /// Fixed processing delay applied before each queued item is delivered
  pub item_delay_ms: u64,
  /// How often the connectivity probe runs in `taskflow run`
  pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub vapid_public_key: String,
  pub default_title: String,
  pub default_body: String,
  pub icon: Option<String>,
  /// Answer the local host gives to permission prompts
  pub permission: PermissionState,
  /// Push service the local host registers subscriptions with
  pub push_endpoint: Url,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
  pub path: Option<PathBuf>,
}

/// Normalize a path marker to `/segment/` so it only matches whole segments.
fn deserialize_path_marker<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let raw = String::deserialize(deserializer)?;
  Ok(normalize_marker(&raw))
}

fn normalize_marker(raw: &str) -> String {
  let trimmed = raw.trim().trim_matches('/');
  format!("/{}/", trimmed)
}

const DEFAULT_ORIGIN: &str = "http://localhost:5173";
const DEFAULT_PUSH_ENDPOINT: &str = "https://push.taskflow.local/send";

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse(DEFAULT_ORIGIN).expect("DEFAULT_ORIGIN is a valid URL"),
      server_url: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
      database: DatabaseConfig::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "taskflow".to_string(),
      version: "v3".to_string(),
      api_marker: "/api/".to_string(),
      app_shell: [
        "/",
        "/index.html",
        "/offline.html",
        "/src/main.tsx",
        "/src/App.tsx",
        "/src/Task.tsx",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      external_styles: Vec::new(),
      offline_page: "/offline.html".to_string(),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-tasks".to_string(),
      item_delay_ms: 1000,
      probe_interval_secs: 5,
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      vapid_public_key:
        "BEl62iUYgUivxIkv69yViEuiBIa-Ib9-SkvMeAtA3LFgDzkrxZJjSgSnfckjBJuBkr3qBUYIHBQFLXYp5Nksh8U"
          .to_string(),
      default_title: "TaskFlow".to_string(),
      default_body: "You have a new notification".to_string(),
      icon: Some("/icons/icon-192x192.png".to_string()),
      permission: PermissionState::Granted,
      push_endpoint: Url::parse(DEFAULT_PUSH_ENDPOINT)
        .expect("DEFAULT_PUSH_ENDPOINT is a valid URL"),
    }
  }
}

impl CacheConfig {
  /// Name of the cache generation for the current deployment.
  pub fn cache_name(&self) -> String {
    format!("{}-{}", self.prefix, self.version)
  }
}

impl SyncConfig {
  pub fn item_delay(&self) -> Duration {
    Duration::from_millis(self.item_delay_ms)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./taskflow.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/taskflow/config.yaml
  ///
  /// Without a file the built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::info!("no configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("taskflow.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("taskflow").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Base URL mutations are replayed against.
  pub fn server_base(&self) -> &Url {
    self.server_url.as_ref().unwrap_or(&self.origin)
  }

  /// Resolve a path against the app origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  pub fn offline_page_url(&self) -> Result<Url> {
    self.resolve(&self.cache.offline_page)
  }

  /// Everything fetched and stored on install: the app shell plus external stylesheets.
  pub fn precache_manifest(&self) -> Result<Vec<Url>> {
    let mut urls = self
      .cache
      .app_shell
      .iter()
      .map(|p| self.resolve(p))
      .collect::<Result<Vec<_>>>()?;
    urls.extend(self.cache.external_styles.iter().cloned());
    Ok(urls)
  }

  /// Get the sync server token from the environment, if any.
  ///
  /// Checks TASKFLOW_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TASKFLOW_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn defaults_describe_the_current_generation() {
    let config = Config::default();
    assert_eq!(config.cache.cache_name(), "taskflow-v3");
    assert_eq!(config.server_base().as_str(), "http://localhost:5173/");
    assert_eq!(
      config.notifications.push_endpoint.host_str(),
      Some("push.taskflow.local")
    );
    assert_eq!(
      config.offline_page_url().unwrap().as_str(),
      "http://localhost:5173/offline.html"
    );
  }

  #[test]
  fn partial_yaml_keeps_defaults_and_normalizes_marker() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "origin: https://tasks.example.com\ncache:\n  version: v4\n  api_marker: data\n  external_styles:\n    - https://fonts.example.net/inter.css\nsync:\n  item_delay_ms: 0\n"
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.cache.cache_name(), "taskflow-v4");
    assert_eq!(config.cache.api_marker, "/data/");
    assert_eq!(config.sync.tag, "sync-tasks");
    assert_eq!(config.sync.item_delay(), Duration::ZERO);

    let manifest = config.precache_manifest().unwrap();
    assert_eq!(manifest[0].as_str(), "https://tasks.example.com/");
    assert_eq!(
      manifest.last().unwrap().as_str(),
      "https://fonts.example.net/inter.css"
    );
    assert_eq!(manifest.len(), config.cache.app_shell.len() + 1);
  }

  #[test]
  fn explicit_missing_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }

  #[test]
  fn marker_normalization() {
    assert_eq!(normalize_marker("/api"), "/api/");
    assert_eq!(normalize_marker("api/"), "/api/");
    assert_eq!(normalize_marker(" /v1/api/ "), "/v1/api/");
  }
}
