//! Generic in-memory query cache.
//!
//! This module provides a resource-agnostic entry table that:
//! - Holds last-known-good data per key with a freshness window
//! - Tracks the single in-flight fetch for each key
//! - Preserves data across failed fetches
//! - Publishes every state transition to subscribers over a watch channel
//! - Evicts entries nobody has used for a configurable idle period

mod store;
mod traits;

pub use store::{
  CacheConfig, CacheStore, Claim, FetchResult, FetchWhen, Fetcher, InFlight, Invalidation,
  Subscription,
};
pub use traits::{hash_parts, CacheEntry, QueryKey, QueryStatus, QueryView};
