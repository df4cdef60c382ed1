//! Read-side orchestration on top of the cache store.
//!
//! Inspired by TanStack Query, [`QueryClient`] decides per key whether to
//! serve cached data, refresh it in the background, or wait for a fetch, and
//! runs every fetch through the read [`RetryPolicy`].
//!
//! # Example
//!
//! ```ignore
//! let api = task_api.clone();
//! let mut tasks = client.ensure(&TaskQueryKey::All, move || {
//!     let api = api.clone();
//!     async move { api.fetch_tasks().await }
//! });
//!
//! // In the event loop
//! while let Some(view) = tasks.changed().await {
//!     if view.is_loading() {
//!         render_spinner();
//!     } else if let Some(tasks) = view.data() {
//!         render_tasks(tasks, view.error());
//!     }
//! }
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{
  CacheConfig, CacheEntry, CacheStore, Claim, FetchResult, FetchWhen, Fetcher, Invalidation,
  QueryKey, Subscription,
};
use crate::error::{ClassifiedError, ErrorKind};
use crate::retry::{self, RetryPolicy};

struct Inner<T> {
  store: Arc<CacheStore<T>>,
  retry: RetryPolicy,
}

/// Shared handle to the query cache. Clones refer to the same entries.
pub struct QueryClient<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for QueryClient<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Send + Sync + 'static> QueryClient<T> {
  pub fn new(config: CacheConfig, retry: RetryPolicy) -> Self {
    Self {
      inner: Arc::new(Inner {
        store: Arc::new(CacheStore::new(config)),
        retry,
      }),
    }
  }

  pub fn store(&self) -> &Arc<CacheStore<T>> {
    &self.inner.store
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.inner.retry
  }

  pub fn read<K: QueryKey>(&self, key: &K) -> CacheEntry<T> {
    self.inner.store.read(key)
  }

  /// Subscribe to a key, fetching if there is nothing fresh to show.
  ///
  /// A fresh entry is served as is. A stale one is served while a background
  /// refetch runs. A missing, invalidated or failed entry is fetched. If a
  /// fetch is already running the subscriber just follows it.
  pub fn ensure<K, F, Fut>(&self, key: &K, fetcher: F) -> Subscription<T>
  where
    K: QueryKey,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ClassifiedError>> + Send + 'static,
  {
    let hash = key.cache_hash();
    self.register(&hash, key.description(), fetcher);
    let subscription = self
      .inner
      .store
      .subscribe_hash(hash.clone(), key.description());
    self.inner.start(&hash, FetchWhen::IfStale);
    subscription
  }

  /// Get data for a key, waiting for the network only when necessary.
  ///
  /// Fresh data returns immediately. Data that is merely old is returned
  /// while a background refetch runs. Otherwise this waits for the (possibly
  /// shared) fetch to settle, retries included.
  pub async fn fetch<K, F, Fut>(&self, key: &K, fetcher: F) -> FetchResult<T>
  where
    K: QueryKey,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ClassifiedError>> + Send + 'static,
  {
    let hash = key.cache_hash();
    self.register(&hash, key.description(), fetcher);
    match self.inner.start(&hash, FetchWhen::IfStale) {
      Some(Claim::Fresh(data)) => Ok(data),
      Some(Claim::Running {
        stale: Some(data), ..
      }) => Ok(data),
      Some(Claim::Running { handle, .. }) => handle.await,
      None => Err(ClassifiedError::new(
        ErrorKind::Unknown,
        ErrorKind::Unknown.fallback_message(),
        None,
      )),
    }
  }

  /// Fetch a key again with its registered fetcher, even if fresh.
  ///
  /// Joins the running fetch if there is one. Returns false if the key has
  /// never been fetched.
  pub fn refetch<K: QueryKey>(&self, key: &K) -> bool {
    self.inner.start(&key.cache_hash(), FetchWhen::Always).is_some()
  }

  /// Mark a key stale; refetch right away if anyone is subscribed.
  pub fn invalidate<K: QueryKey>(&self, key: &K) -> Invalidation {
    let hash = key.cache_hash();
    let outcome = self.inner.store.invalidate_hash(&hash);
    if outcome == Invalidation::Refetch {
      self.inner.start(&hash, FetchWhen::Always);
    }
    outcome
  }

  /// Window refocus: refetch every subscribed key whose data is stale.
  ///
  /// Displayed data stays in place while the refetch runs. Returns the number
  /// of fetches started.
  pub fn on_focus(&self) -> usize {
    let keys = self.inner.store.stale_active_keys();
    let started = keys
      .iter()
      .filter(|hash| {
        matches!(
          self.inner.start(hash, FetchWhen::IfStale),
          Some(Claim::Running { started: true, .. })
        )
      })
      .count();
    if started > 0 {
      info!(started, "Refetching stale queries on focus");
    }
    started
  }

  /// Evict idle entries every `every` until the client is dropped.
  pub fn spawn_gc(&self, every: Duration) -> JoinHandle<()> {
    self.inner.store.spawn_gc(every)
  }

  fn register<F, Fut>(&self, hash: &str, description: String, fetcher: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ClassifiedError>> + Send + 'static,
  {
    let fetcher: Fetcher<T> = Arc::new(move || fetcher().boxed());
    self.inner.store.register_fetcher(hash, description, fetcher);
  }
}

impl<T: Send + Sync + 'static> Inner<T> {
  fn start(self: &Arc<Self>, hash: &str, when: FetchWhen) -> Option<Claim<T>> {
    let inner = Arc::clone(self);
    let owned_hash = hash.to_string();
    self.store.claim(hash, when, move |generation, fetcher| {
      // Spawned so the fetch completes and caches even if every waiter goes away.
      let task = tokio::spawn(inner.run(owned_hash, generation, fetcher));
      async move {
        task.await.unwrap_or_else(|e| {
          Err(ClassifiedError::new(
            ErrorKind::Unknown,
            format!("fetch task failed: {}", e),
            None,
          ))
        })
      }
      .boxed()
      .shared()
    })
  }

  fn run(
    self: Arc<Self>,
    hash: String,
    generation: u64,
    fetcher: Fetcher<T>,
  ) -> BoxFuture<'static, FetchResult<T>> {
    async move {
      let label = self.store.description(&hash).unwrap_or_default();
      self.store.mark_dispatched(&hash, generation);
      let attempted = retry::run(&self.retry, &label, || fetcher()).await;
      let result = attempted.result.map(Arc::new);

      match &result {
        Ok(_) => info!(key = %label, generation, attempts = attempted.attempts, "Query succeeded"),
        Err(e) => warn!(
          key = %label,
          generation,
          attempts = attempted.attempts,
          kind = %e.kind,
          "Query failed: {}",
          e.message
        ),
      }

      if self.store.settle(&hash, generation, result.clone()) {
        info!(key = %label, "Refetching after mid-flight invalidation");
        self.start(&hash, FetchWhen::Always);
      }
      result
    }
    .boxed()
  }
}
