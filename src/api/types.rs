//! Response bodies of the task endpoints.

use serde::Deserialize;

/// `{data: ...}`, the success body of list, create and update.
#[derive(Debug, Deserialize)]
pub struct DataEnvelope<T> {
  pub data: T,
}

/// `{message}`, the success body of delete and every failure body.
#[derive(Debug, Deserialize)]
pub struct MessageEnvelope {
  pub message: String,
}
