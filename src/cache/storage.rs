//! Named cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::traits::CacheKey;
use crate::db::Database;
use crate::http::{Request, Response, ResponseSource};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response, tagged as coming from cache
  pub response: Response,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}

/// Trait for named-cache backends.
///
/// Entries are keyed by `(cache_name, request key)`; writing the same key
/// again overwrites it.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet.
  fn open(&self, cache_name: &str) -> Result<()>;

  /// Look up the entry stored for this request.
  fn match_request(&self, cache_name: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Store (or overwrite) the response for this request.
  fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store several entries at once; either all land or none do.
  fn put_all(&self, cache_name: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn delete_entry(&self, cache_name: &str, request: &Request) -> Result<bool>;

  /// URLs stored in the named cache.
  fn keys(&self, cache_name: &str) -> Result<Vec<String>>;

  /// Every cache name that exists.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Drop a whole named cache. Returns whether it existed.
  fn delete_cache(&self, cache_name: &str) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

fn insert_entry(
  conn: &rusqlite::Connection,
  cache_name: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_names (name, created_at) VALUES (?1, ?2)",
      params![cache_name, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, cache_key, url, method, status, status_text, headers, body, cached_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
      params![
        cache_name,
        request.cache_hash(),
        request.description(),
        request.method.as_str(),
        response.status,
        response.status_text,
        headers,
        response.body,
        Utc::now().to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_names (name, created_at) VALUES (?1, ?2)",
        params![cache_name, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;
    Ok(())
  }

  fn match_request(&self, cache_name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ?1 AND cache_key = ?2",
        params![cache_name, request.cache_hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", cache_name, e))?;

    let Some((status, status_text, headers, body, cached_at)) = row else {
      return Ok(None);
    };

    let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

    Ok(Some(CachedResponse {
      response: Response {
        status,
        status_text,
        headers,
        body,
        source: ResponseSource::Cache,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<()> {
    let conn = self.db.conn()?;
    insert_entry(&conn, cache_name, request, response)
  }

  fn put_all(&self, cache_name: &str, entries: &[(Request, Response)]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (request, response) in entries {
      insert_entry(&tx, cache_name, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn delete_entry(&self, cache_name: &str, request: &Request) -> Result<bool> {
    let conn = self.db.conn()?;
    let changed = conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?1 AND cache_key = ?2",
        params![cache_name, request.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(changed > 0)
  }

  fn keys(&self, cache_name: &str) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ?1 ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache_name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache {}: {}", cache_name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(urls)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_names ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, cache_name: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    // Entries go with the name via ON DELETE CASCADE
    let changed = conn
      .execute("DELETE FROM cache_names WHERE name = ?1", params![cache_name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;
    Ok(changed > 0)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
