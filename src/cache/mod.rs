//! Request-interception cache for offline support.
//!
//! Every outbound request is classified and answered with one of three
//! strategies:
//! - Cache-First for the app shell (documents, scripts, styles, static assets)
//! - Network-First for API data and anything unclassified
//! - Stale-While-Revalidate for images and other-origin resources
//!
//! Caches are named per deployment generation; activating a new generation
//! deletes every other one.

mod classify;
pub mod fallback;
mod layer;
mod lifecycle;
mod storage;
mod traits;

pub use layer::CacheEngine;
pub use storage::{CacheStorage, SqliteStorage};
