use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{classify, ClassifiedError, ErrorKind};
use crate::mock::TASKS_PATH;
use crate::task::{CreateTaskInput, Task, UpdateTaskInput};
use crate::transport::{Method, RawOutcome, Transport};

use super::types::{DataEnvelope, MessageEnvelope};

/// Task API client over any [`Transport`]. One call is one request; retries
/// belong to the orchestrators.
#[derive(Clone)]
pub struct TaskApi {
  transport: Arc<dyn Transport>,
}

impl TaskApi {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }

  /// List all tasks
  pub async fn fetch_tasks(&self) -> Result<Vec<Task>, ClassifiedError> {
    let envelope: DataEnvelope<Vec<Task>> = self.request(Method::Get, TASKS_PATH, None).await?;
    Ok(envelope.data)
  }

  pub async fn create_task(&self, input: &CreateTaskInput) -> Result<Task, ClassifiedError> {
    let body = encode(input)?;
    let envelope: DataEnvelope<Task> = self.request(Method::Post, TASKS_PATH, Some(body)).await?;
    Ok(envelope.data)
  }

  pub async fn update_task(&self, id: Uuid, input: &UpdateTaskInput) -> Result<Task, ClassifiedError> {
    let body = encode(input)?;
    let envelope: DataEnvelope<Task> = self
      .request(Method::Put, &task_path(id), Some(body))
      .await?;
    Ok(envelope.data)
  }

  /// Set the completion flag; the rest of the task is left alone.
  pub async fn toggle_task(&self, id: Uuid, completed: bool) -> Result<Task, ClassifiedError> {
    self
      .update_task(id, &UpdateTaskInput::completed(completed))
      .await
  }

  /// Delete a task and return the server's confirmation message.
  pub async fn delete_task(&self, id: Uuid) -> Result<String, ClassifiedError> {
    let envelope: MessageEnvelope = self.request(Method::Delete, &task_path(id), None).await?;
    Ok(envelope.message)
  }

  async fn request<D: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
  ) -> Result<D, ClassifiedError> {
    debug!(%method, path, "Sending request");
    let outcome = self.transport.send(method, path, body).await;
    decode(&outcome)
  }
}

fn task_path(id: Uuid) -> String {
  format!("{}/{}", TASKS_PATH, id)
}

fn encode<T: Serialize>(input: &T) -> Result<Value, ClassifiedError> {
  serde_json::to_value(input).map_err(|e| {
    ClassifiedError::new(ErrorKind::Unknown, format!("failed to encode request: {}", e), None)
  })
}

/// Non-2xx goes through the classifier. A 2xx that does not decode is `Unknown`.
fn decode<D: DeserializeOwned>(outcome: &RawOutcome) -> Result<D, ClassifiedError> {
  if !outcome.is_ok() {
    return Err(classify(outcome));
  }
  let status = outcome.status().unwrap_or_default();
  outcome
    .body()
    .cloned()
    .and_then(|body| serde_json::from_value(body).ok())
    .ok_or_else(|| ClassifiedError::malformed(status))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mock::{MockServer, RecordStore};
  use crate::transport::testing::ScriptedTransport;
  use crate::transport::{FaultConfig, FaultInjectingTransport, ScriptedRolls};
  use chrono::Utc;
  use serde_json::json;

  fn mock_api(db: Arc<RecordStore>) -> TaskApi {
    let transport = FaultInjectingTransport::new(
      MockServer::new(db),
      FaultConfig::reliable(),
      Box::new(ScriptedRolls::new([])),
    );
    TaskApi::new(Arc::new(transport))
  }

  #[tokio::test]
  async fn test_create_round_trip() {
    let db = Arc::new(RecordStore::new());
    let api = mock_api(Arc::clone(&db));

    let created = api
      .create_task(&CreateTaskInput::new("Write report", "by Friday"))
      .await
      .unwrap();

    assert_eq!(created.title, "Write report");
    assert_eq!(created.description, "by Friday");
    assert!(!created.completed);
    assert_eq!(created.created_at, created.updated_at);

    let listed = api.fetch_tasks().await.unwrap();
    assert_eq!(listed, vec![created]);
  }

  #[tokio::test]
  async fn test_toggle_only_changes_completed() {
    let task = Task::create(CreateTaskInput::new("Call mom", ""), Utc::now());
    let db = Arc::new(RecordStore::with_tasks(vec![task.clone()]));
    let api = mock_api(db);

    let toggled = api.toggle_task(task.id, true).await.unwrap();

    assert!(toggled.completed);
    assert_eq!(toggled.title, task.title);
    assert!(toggled.updated_at >= toggled.created_at);
  }

  #[tokio::test]
  async fn test_update_unknown_id_is_not_found() {
    let api = mock_api(Arc::new(RecordStore::new()));

    let err = api
      .update_task(Uuid::new_v4(), &UpdateTaskInput::completed(true))
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.message, "تسک یافت نشد");
    assert!(!err.retryable);
  }

  #[tokio::test]
  async fn test_blank_title_is_bad_request() {
    let api = mock_api(Arc::new(RecordStore::new()));

    let err = api
      .create_task(&CreateTaskInput::new("   ", ""))
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::BadRequest);
    assert_eq!(err.message, "عنوان تسک الزامی است");
  }

  #[tokio::test]
  async fn test_delete_returns_confirmation() {
    let task = Task::create(CreateTaskInput::new("Old", ""), Utc::now());
    let db = Arc::new(RecordStore::with_tasks(vec![task.clone()]));
    let api = mock_api(Arc::clone(&db));

    let message = api.delete_task(task.id).await.unwrap();

    assert_eq!(message, "تسک با موفقیت حذف شد");
    assert!(db.is_empty());
  }

  #[tokio::test]
  async fn test_malformed_success_body_is_unknown() {
    let transport = ScriptedTransport::always(RawOutcome::response(200, json!({ "items": [] })));
    let api = TaskApi::new(Arc::new(transport));

    let err = api.fetch_tasks().await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::Unknown);
    assert_eq!(err.http_status, Some(200));
    assert!(!err.retryable);
  }

  #[tokio::test]
  async fn test_injected_fault_carries_route_message() {
    let transport = FaultInjectingTransport::new(
      MockServer::new(Arc::new(RecordStore::new())),
      FaultConfig {
        failure_rate: 1.0,
        network_failure_rate: 0.0,
        latency: std::time::Duration::ZERO,
      },
      Box::new(ScriptedRolls::new([0.1])),
    );
    let api = TaskApi::new(Arc::new(transport));

    let err = api.fetch_tasks().await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::ServerError);
    assert_eq!(err.message, "خطای سرور. لطفا دوباره تلاش کنید");
    assert!(err.retryable);
  }
}
