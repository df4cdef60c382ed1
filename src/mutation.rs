//! Write-side orchestration: retried task writes that re-sync reads by invalidation.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{TaskApi, TaskQueryKey};
use crate::error::ClassifiedError;
use crate::query::QueryClient;
use crate::retry::{self, RetryPolicy};
use crate::task::{CreateTaskInput, Task, UpdateTaskInput};

/// One write against the task collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TaskMutation {
  Create(CreateTaskInput),
  Update { id: Uuid, input: UpdateTaskInput },
  ToggleComplete { id: Uuid, completed: bool },
  Delete { id: Uuid },
}

impl TaskMutation {
  pub fn name(&self) -> &'static str {
    match self {
      TaskMutation::Create(_) => "create",
      TaskMutation::Update { .. } => "update",
      TaskMutation::ToggleComplete { .. } => "toggle",
      TaskMutation::Delete { .. } => "delete",
    }
  }

  /// Confirmation shown when the write succeeds.
  pub fn success_message(&self) -> &'static str {
    match self {
      TaskMutation::Create(_) => "تسک با موفقیت ایجاد شد",
      TaskMutation::Update { .. } => "تسک با موفقیت ویرایش شد",
      TaskMutation::ToggleComplete { .. } => "وضعیت تسک با موفقیت تغییر کرد",
      TaskMutation::Delete { .. } => "تسک با موفقیت حذف شد",
    }
  }
}

/// What happened to one write call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationRecord {
  pub input: TaskMutation,
  pub attempts_made: u32,
  pub last_error: Option<ClassifiedError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationSuccess {
  pub message: &'static str,
  /// The written task; `None` for deletes
  pub task: Option<Task>,
  pub record: MutationRecord,
}

/// A write that failed terminally or ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct MutationFailure {
  pub error: ClassifiedError,
  pub record: MutationRecord,
}

impl MutationFailure {
  pub fn message(&self) -> &str {
    &self.error.message
  }
}

pub type MutationResult = Result<MutationSuccess, MutationFailure>;

/// Runs task writes. Calls are independent: nothing is deduplicated and
/// nothing is written to the cache speculatively.
#[derive(Clone)]
pub struct MutationClient {
  api: TaskApi,
  queries: QueryClient<Vec<Task>>,
  retry: RetryPolicy,
}

impl MutationClient {
  pub fn new(api: TaskApi, queries: QueryClient<Vec<Task>>, retry: RetryPolicy) -> Self {
    Self {
      api,
      queries,
      retry,
    }
  }

  pub async fn run(&self, mutation: TaskMutation) -> MutationResult {
    let name = mutation.name();
    let attempted = retry::run(&self.retry, name, || self.execute(&mutation)).await;

    match attempted.result {
      Ok(task) => {
        let invalidation = self.queries.invalidate(&TaskQueryKey::All);
        info!(
          mutation = name,
          attempts = attempted.attempts,
          ?invalidation,
          "Mutation succeeded"
        );
        Ok(MutationSuccess {
          message: mutation.success_message(),
          task,
          record: MutationRecord {
            input: mutation,
            attempts_made: attempted.attempts,
            last_error: None,
          },
        })
      }
      Err(error) => {
        warn!(
          mutation = name,
          attempts = attempted.attempts,
          kind = %error.kind,
          "Mutation failed: {}",
          error.message
        );
        Err(MutationFailure {
          record: MutationRecord {
            input: mutation,
            attempts_made: attempted.attempts,
            last_error: Some(error.clone()),
          },
          error,
        })
      }
    }
  }

  pub fn handle(&self) -> MutationHandle {
    MutationHandle {
      client: self.clone(),
      pending: Arc::new(AtomicUsize::new(0)),
    }
  }

  async fn execute(&self, mutation: &TaskMutation) -> Result<Option<Task>, ClassifiedError> {
    match mutation {
      TaskMutation::Create(input) => self.api.create_task(input).await.map(Some),
      TaskMutation::Update { id, input } => self.api.update_task(*id, input).await.map(Some),
      TaskMutation::ToggleComplete { id, completed } => {
        self.api.toggle_task(*id, *completed).await.map(Some)
      }
      TaskMutation::Delete { id } => self.api.delete_task(*id).await.map(|_| None),
    }
  }
}

/// `{mutate, is_pending}` for one UI control. Clones share the pending count.
#[derive(Clone)]
pub struct MutationHandle {
  client: MutationClient,
  pending: Arc<AtomicUsize>,
}

impl MutationHandle {
  pub async fn mutate(&self, mutation: TaskMutation) -> MutationResult {
    let _pending = PendingGuard::enter(&self.pending);
    self.client.run(mutation).await
  }

  /// True while any call through this handle is running.
  pub fn is_pending(&self) -> bool {
    self.pending.load(Ordering::SeqCst) > 0
  }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
  fn enter(count: &'a AtomicUsize) -> Self {
    count.fetch_add(1, Ordering::SeqCst);
    Self(count)
  }
}

impl Drop for PendingGuard<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheConfig, Invalidation};
  use crate::error::ErrorKind;
  use crate::mock::{MockServer, RecordStore};
  use crate::transport::testing::ScriptedTransport;
  use crate::transport::{FaultConfig, FaultInjectingTransport, RawOutcome, ScriptedRolls, Transport};
  use chrono::Utc;
  use serde_json::json;
  use std::time::Duration;

  struct Harness {
    db: Arc<RecordStore>,
    api: TaskApi,
    queries: QueryClient<Vec<Task>>,
    mutations: MutationClient,
  }

  fn harness(tasks: Vec<Task>, transport: Option<Arc<dyn Transport>>) -> Harness {
    let db = Arc::new(RecordStore::with_tasks(tasks));
    let transport = transport.unwrap_or_else(|| {
      let mock = FaultInjectingTransport::new(
        MockServer::new(Arc::clone(&db)),
        FaultConfig {
          latency: Duration::from_millis(50),
          ..FaultConfig::reliable()
        },
        Box::new(ScriptedRolls::new([])),
      );
      Arc::new(mock) as Arc<dyn Transport>
    });
    let api = TaskApi::new(transport);
    let queries = QueryClient::new(CacheConfig::default(), RetryPolicy::queries());
    let mutations = MutationClient::new(api.clone(), queries.clone(), RetryPolicy::mutations());
    Harness {
      db,
      api,
      queries,
      mutations,
    }
  }

  fn tasks_fetcher(
    api: &TaskApi,
  ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Vec<Task>, ClassifiedError>>
       + Send
       + Sync
       + 'static {
    use futures::FutureExt;
    let api = api.clone();
    move || {
      let api = api.clone();
      async move { api.fetch_tasks().await }.boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_update_unknown_id_fails_after_one_attempt() {
    let h = harness(vec![], None);

    let failure = h
      .mutations
      .run(TaskMutation::Update {
        id: Uuid::new_v4(),
        input: UpdateTaskInput::completed(true),
      })
      .await
      .unwrap_err();

    assert_eq!(failure.error.kind, ErrorKind::NotFound);
    assert_eq!(failure.message(), "تسک یافت نشد");
    assert_eq!(failure.record.attempts_made, 1);
    assert_eq!(failure.record.last_error, Some(failure.error.clone()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_returns_confirmation_and_task() {
    let h = harness(vec![], None);

    let success = h
      .mutations
      .run(TaskMutation::Create(CreateTaskInput::new("Plan trip", "")))
      .await
      .unwrap();

    assert_eq!(success.message, "تسک با موفقیت ایجاد شد");
    let task = success.task.unwrap();
    assert_eq!(task.created_at, task.updated_at);
    assert_eq!(h.db.get(&task.id), Some(task));
    assert_eq!(success.record.attempts_made, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_then_read_excludes_task() {
    let doomed = Task::create(CreateTaskInput::new("Doomed", ""), Utc::now());
    let kept = Task::create(CreateTaskInput::new("Kept", ""), Utc::now());
    let h = harness(vec![doomed.clone(), kept.clone()], None);

    let mut tasks = h.queries.ensure(&TaskQueryKey::All, tasks_fetcher(&h.api));
    assert_eq!(tasks.settled().await.data().map(Vec::len), Some(2));

    let success = h
      .mutations
      .run(TaskMutation::Delete { id: doomed.id })
      .await
      .unwrap();
    assert_eq!(success.message, "تسک با موفقیت حذف شد");
    assert!(success.task.is_none());

    // Invalidation already started the refetch; no manual refresh needed.
    assert!(tasks.view().is_fetching());
    let view = tasks.settled().await;
    assert_eq!(view.data(), Some(&vec![kept]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_without_subscribers_marks_stale() {
    let h = harness(vec![], None);
    h.queries
      .fetch(&TaskQueryKey::All, tasks_fetcher(&h.api))
      .await
      .unwrap();

    h.mutations
      .run(TaskMutation::Create(CreateTaskInput::new("New", "")))
      .await
      .unwrap();

    let entry = h.queries.read(&TaskQueryKey::All);
    assert!(entry.is_invalidated);
    assert_eq!(h.queries.invalidate(&TaskQueryKey::All), Invalidation::Marked);

    let tasks = h
      .queries
      .fetch(&TaskQueryKey::All, tasks_fetcher(&h.api))
      .await
      .unwrap();
    assert_eq!(tasks.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_does_not_touch_cache() {
    let h = harness(vec![], None);
    h.queries
      .fetch(&TaskQueryKey::All, tasks_fetcher(&h.api))
      .await
      .unwrap();

    h.mutations
      .run(TaskMutation::Delete { id: Uuid::new_v4() })
      .await
      .unwrap_err();

    assert!(!h.queries.read(&TaskQueryKey::All).is_invalidated);
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_error_is_retried_once() {
    let transport = Arc::new(ScriptedTransport::always(RawOutcome::response(
      500,
      json!({ "message": "خطا در ایجاد تسک. لطفا دوباره تلاش کنید" }),
    )));
    let h = harness(vec![], Some(transport.clone() as Arc<dyn Transport>));

    let failure = h
      .mutations
      .run(TaskMutation::Create(CreateTaskInput::new("Retry me", "")))
      .await
      .unwrap_err();

    assert_eq!(failure.error.kind, ErrorKind::ServerError);
    assert_eq!(failure.message(), "خطا در ایجاد تسک. لطفا دوباره تلاش کنید");
    assert_eq!(failure.record.attempts_made, 2);
    assert_eq!(transport.calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_creates_both_execute() {
    let h = harness(vec![], None);
    let input = CreateTaskInput::new("Same", "");

    let (a, b) = tokio::join!(
      h.mutations.run(TaskMutation::Create(input.clone())),
      h.mutations.run(TaskMutation::Create(input.clone())),
    );

    assert_ne!(a.unwrap().task.unwrap().id, b.unwrap().task.unwrap().id);
    assert_eq!(h.db.len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_handle_is_pending_while_running() {
    let task = Task::create(CreateTaskInput::new("Flip", ""), Utc::now());
    let h = harness(vec![task.clone()], None);
    let handle = h.mutations.handle();
    assert!(!handle.is_pending());

    let running = {
      let handle = handle.clone();
      tokio::spawn(async move {
        handle
          .mutate(TaskMutation::ToggleComplete {
            id: task.id,
            completed: true,
          })
          .await
      })
    };
    tokio::task::yield_now().await;
    assert!(handle.is_pending());

    let success = running.await.unwrap().unwrap();
    assert_eq!(success.message, "وضعیت تسک با موفقیت تغییر کرد");
    assert!(success.task.unwrap().completed);
    assert!(!handle.is_pending());
  }
}
