//! Install (precache) and activate (generation purge).

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use tracing::info;
use url::Url;

use super::layer::CacheEngine;
use crate::http::Request;

impl CacheEngine {
  /// Fetch every manifest URL and store them under the current generation.
  ///
  /// All or nothing: one failed or non-2xx fetch aborts the install and
  /// nothing is written.
  pub async fn install(&self, manifest: &[Url]) -> Result<usize> {
    let network = self.network();

    let fetches = manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: server answered {}",
          url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request, response))
    });

    let entries = try_join_all(fetches).await?;

    self.storage().open(self.cache_name())?;
    self.storage().put_all(self.cache_name(), &entries)?;

    info!(cache = self.cache_name(), count = entries.len(), "precached app shell");
    Ok(entries.len())
  }

  /// Delete every cache generation other than the current one.
  ///
  /// Returns the names that were removed.
  pub fn activate(&self) -> Result<Vec<String>> {
    let current = self.cache_name();
    self.storage().open(current)?;

    let mut deleted = Vec::new();
    for name in self.storage().cache_names()? {
      if name != current && self.storage().delete_cache(&name)? {
        info!(cache = %name, "deleted stale cache generation");
        deleted.push(name);
      }
    }

    Ok(deleted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, SqliteStorage};
  use crate::config::Config;
  use crate::db::Database;
  use crate::http::Response;
  use crate::test_utils::ScriptedNetwork;
  use reqwest::Method;
  use std::sync::Arc;

  fn engine_for(
    version: &str,
    db: &Arc<Database>,
    network: &Arc<ScriptedNetwork>,
  ) -> CacheEngine {
    let mut config = Config::default();
    config.cache.version = version.to_string();
    CacheEngine::new(
      &config,
      Arc::new(SqliteStorage::new(Arc::clone(db))),
      network.clone(),
    )
  }

  #[tokio::test]
  async fn install_precaches_manifest() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = Arc::new(ScriptedNetwork::new());
    let engine = engine_for("v3", &db, &network);
    let config = Config::default();
    let manifest = config.precache_manifest().unwrap();
    for url in &manifest {
      network.respond(Method::GET, url.as_str(), 200, url.path());
    }

    assert_eq!(engine.install(&manifest).await.unwrap(), manifest.len());
    assert_eq!(
      engine.storage().keys("taskflow-v3").unwrap().len(),
      manifest.len()
    );
  }

  #[tokio::test]
  async fn install_is_all_or_nothing() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = Arc::new(ScriptedNetwork::new());
    let engine = engine_for("v3", &db, &network);
    let a = Url::parse("http://localhost:5173/").unwrap();
    let b = Url::parse("http://localhost:5173/index.html").unwrap();
    network.respond(Method::GET, a.as_str(), 200, "ok");
    network.respond(Method::GET, b.as_str(), 500, "down");

    assert!(engine.install(&[a, b]).await.is_err());
    assert!(engine.storage().keys("taskflow-v3").unwrap().is_empty());
  }

  #[tokio::test]
  async fn activating_new_version_purges_every_older_cache() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let network = Arc::new(ScriptedNetwork::new());
    let storage = SqliteStorage::new(Arc::clone(&db));
    let page = Request::get(Url::parse("http://localhost:5173/").unwrap());
    for name in ["taskflow-v1", "taskflow-v2", "third-party-cache"] {
      storage.put(name, &page, &Response::new(200, name)).unwrap();
    }

    let engine = engine_for("v3", &db, &network);
    let mut deleted = engine.activate().unwrap();
    deleted.sort();

    assert_eq!(
      deleted,
      vec!["taskflow-v1", "taskflow-v2", "third-party-cache"]
    );
    assert_eq!(storage.cache_names().unwrap(), vec!["taskflow-v3"]);
    assert!(engine.activate().unwrap().is_empty());
  }
}
