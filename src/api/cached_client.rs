//! Task client that reads through the query cache and writes through the
//! mutation orchestrator.

use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::{CacheConfig, Subscription};
use crate::error::ClassifiedError;
use crate::mutation::{MutationClient, MutationHandle, MutationResult, TaskMutation};
use crate::query::QueryClient;
use crate::retry::RetryPolicy;
use crate::task::Task;
use crate::transport::Transport;

use super::client::TaskApi;
use super::keys::TaskQueryKey;

/// The one handle the presentation layer needs.
///
/// Clones share the same cache and transport.
#[derive(Clone)]
pub struct CachedTaskClient {
  api: TaskApi,
  queries: QueryClient<Vec<Task>>,
  mutations: MutationClient,
}

impl CachedTaskClient {
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: CacheConfig,
    reads: RetryPolicy,
    writes: RetryPolicy,
  ) -> Self {
    let api = TaskApi::new(transport);
    let queries = QueryClient::new(cache, reads);
    let mutations = MutationClient::new(api.clone(), queries.clone(), writes);
    Self {
      api,
      queries,
      mutations,
    }
  }

  pub fn queries(&self) -> &QueryClient<Vec<Task>> {
    &self.queries
  }

  /// Live view of the task list, fetching if needed.
  pub fn tasks(&self) -> Subscription<Vec<Task>> {
    self.queries.ensure(&TaskQueryKey::All, self.fetcher())
  }

  /// Task list, from cache when fresh.
  pub async fn fetch_tasks(&self) -> Result<Arc<Vec<Task>>, ClassifiedError> {
    self.queries.fetch(&TaskQueryKey::All, self.fetcher()).await
  }

  pub fn refetch_tasks(&self) -> bool {
    self.queries.refetch(&TaskQueryKey::All)
  }

  pub fn on_focus(&self) -> usize {
    self.queries.on_focus()
  }

  pub async fn mutate(&self, mutation: TaskMutation) -> MutationResult {
    self.mutations.run(mutation).await
  }

  pub fn mutation_handle(&self) -> MutationHandle {
    self.mutations.handle()
  }

  pub fn spawn_gc(&self, every: Duration) -> JoinHandle<()> {
    self.queries.spawn_gc(every)
  }

  fn fetcher(
    &self,
  ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Vec<Task>, ClassifiedError>>
       + Send
       + Sync
       + 'static {
    let api = self.api.clone();
    move || {
      let api = api.clone();
      async move { api.fetch_tasks().await }.boxed()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mock::{MockServer, RecordStore};
  use crate::task::CreateTaskInput;
  use crate::transport::{FaultConfig, FaultInjectingTransport, ScriptedRolls};

  fn client_with_rolls(db: Arc<RecordStore>, rolls: Vec<f64>) -> CachedTaskClient {
    let transport = FaultInjectingTransport::new(
      MockServer::new(db),
      FaultConfig::default(),
      Box::new(ScriptedRolls::new(rolls)),
    );
    CachedTaskClient::new(
      Arc::new(transport),
      CacheConfig::default(),
      RetryPolicy::queries(),
      RetryPolicy::mutations(),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_reads_survive_injected_faults() {
    let db = Arc::new(RecordStore::new());
    db.create(CreateTaskInput::new("Seeded", ""));
    // First attempt draws an injected 500; the retry goes through.
    let client = client_with_rolls(db, vec![0.01, 0.5]);

    let mut tasks = client.tasks();
    let view = tasks.settled().await;

    assert!(view.is_success());
    assert_eq!(view.data().map(Vec::len), Some(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_injected_not_found_is_surfaced_once() {
    let client = client_with_rolls(Arc::new(RecordStore::new()), vec![0.07]);

    let err = client.fetch_tasks().await.unwrap_err();

    assert_eq!(err.message, "تسک‌ها یافت نشدند");
    assert!(!err.retryable);
  }

  #[tokio::test(start_paused = true)]
  async fn test_create_shows_up_in_open_subscription() {
    let client = client_with_rolls(Arc::new(RecordStore::new()), vec![]);
    let mut tasks = client.tasks();
    assert_eq!(tasks.settled().await.data(), Some(&vec![]));

    let handle = client.mutation_handle();
    let success = handle
      .mutate(TaskMutation::Create(CreateTaskInput::new("Fresh", "")))
      .await
      .unwrap();

    let view = tasks.settled().await;
    assert_eq!(view.data(), Some(&vec![success.task.unwrap()]));
  }
}
