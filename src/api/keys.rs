use crate::cache::{hash_parts, QueryKey};

/// Cache keys for task reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskQueryKey {
  /// The whole task collection, `GET /api/tasks`.
  All,
}

impl QueryKey for TaskQueryKey {
  fn cache_hash(&self) -> String {
    match self {
      TaskQueryKey::All => hash_parts(&["tasks"]),
    }
  }

  fn description(&self) -> String {
    match self {
      TaskQueryKey::All => "tasks".to_string(),
    }
  }
}
