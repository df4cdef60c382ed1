//! Client-side data sync for a task list: a query cache with stale-while-revalidate
//! reads, request dedup, bounded retries, invalidation on writes, and a mock
//! transport that injects latency and faults.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod mock;
pub mod mutation;
pub mod query;
pub mod retry;
pub mod task;
pub mod transport;
