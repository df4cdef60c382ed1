//! Typed access to the `/api/tasks` endpoints, plain and cached.

mod cached_client;
mod client;
mod keys;
mod types;

pub use cached_client::CachedTaskClient;
pub use client::TaskApi;
pub use keys::TaskQueryKey;
pub use types::{DataEnvelope, MessageEnvelope};
