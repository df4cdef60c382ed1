//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use crate::error::ClassifiedError;

/// Identifies a logical resource whose data is cached as one entry.
pub trait QueryKey {
  /// Stable, fixed-length identifier used as the entry table key.
  fn cache_hash(&self) -> String;

  /// Human-readable form for logs.
  fn description(&self) -> String;
}

/// SHA256 over the key parts, so tuple keys map to a fixed-length string.
pub fn hash_parts(parts: &[&str]) -> String {
  let mut hasher = Sha256::new();
  for part in parts {
    hasher.update(part.as_bytes());
    // Separator keeps ["ab", "c"] and ["a", "bc"] apart.
    hasher.update([0u8]);
  }
  hex::encode(hasher.finalize())
}

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Created but never fetched
  Idle,
  /// A fetch is in flight; earlier data, if any, is still present
  Fetching,
  /// Last fetch succeeded
  Success,
  /// Last fetch failed after retries; earlier data is preserved
  Error,
}

/// Snapshot of an entry as seen by subscribers.
pub struct QueryView<T> {
  pub status: QueryStatus,
  pub data: Option<Arc<T>>,
  pub error: Option<ClassifiedError>,
  /// Wall-clock time of the last successful fetch
  pub updated_at: Option<DateTime<Utc>>,
}

impl<T> QueryView<T> {
  pub fn idle() -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      updated_at: None,
    }
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_deref()
  }

  /// Fetching with nothing to show yet.
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Fetching && self.data.is_none()
  }

  pub fn is_fetching(&self) -> bool {
    self.status == QueryStatus::Fetching
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn error(&self) -> Option<&ClassifiedError> {
    self.error.as_ref()
  }
}

impl<T> Clone for QueryView<T> {
  fn clone(&self) -> Self {
    Self {
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
      updated_at: self.updated_at,
    }
  }
}

impl<T: fmt::Debug> fmt::Debug for QueryView<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryView")
      .field("status", &self.status)
      .field("data", &self.data)
      .field("error", &self.error)
      .field("updated_at", &self.updated_at)
      .finish()
  }
}

/// Full entry record returned by `CacheStore::read`.
#[derive(Debug)]
pub struct CacheEntry<T> {
  pub key: String,
  pub view: QueryView<T>,
  pub subscriber_count: usize,
  pub is_stale: bool,
  pub is_invalidated: bool,
}

impl<T> CacheEntry<T> {
  pub fn status(&self) -> QueryStatus {
    self.view.status
  }

  pub fn data(&self) -> Option<&T> {
    self.view.data()
  }

  pub fn error(&self) -> Option<&ClassifiedError> {
    self.view.error()
  }
}
