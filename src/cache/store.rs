//! Keyed entry table: last-known-good data, freshness, in-flight handles.
//!
//! Every operation takes the table lock once, so each state transition is
//! atomic and subscribers are notified inside the same critical section.

use chrono::Utc;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::traits::{CacheEntry, QueryKey, QueryStatus, QueryView};
use crate::error::ClassifiedError;

/// Result of one fetch as shared between everyone waiting on it.
pub type FetchResult<T> = Result<Arc<T>, ClassifiedError>;

/// Handle to a running fetch. Cloning and awaiting it never starts another.
pub type InFlight<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

/// Factory producing one fetch attempt for a key.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, ClassifiedError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// How long after a successful fetch data counts as fresh
  pub stale_time: Duration,
  /// How long an unsubscribed entry is kept before eviction
  pub gc_time: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(30),
      gc_time: Duration::from_secs(5 * 60),
    }
  }
}

/// When a fetch should be started for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchWhen {
  /// Unless one is already in flight
  Always,
  /// Only when the entry is missing, stale, invalidated or errored
  IfStale,
}

/// Outcome of asking to fetch a key.
pub enum Claim<T> {
  /// Data is fresh; nothing was started.
  Fresh(Arc<T>),
  /// A fetch is running. `started` is false when an existing one was joined.
  /// `stale` is cached data that may be shown while it runs.
  Running {
    handle: InFlight<T>,
    started: bool,
    stale: Option<Arc<T>>,
  },
}

/// What `invalidate` did to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
  /// No entry under this key
  Absent,
  /// Marked stale; refetched on next subscriber activity
  Marked,
  /// Marked stale and subscribers are active; caller should fetch now
  Refetch,
  /// A fetch was in flight; one follow-up fetch will run after it settles
  Deferred,
  /// Already invalidated with a fetch in flight covering it
  Coalesced,
}

struct InFlightFetch<T> {
  generation: u64,
  handle: InFlight<T>,
  /// Set once the fetch task has begun sending requests
  dispatched: bool,
}

struct Slot<T> {
  description: String,
  status: QueryStatus,
  data: Option<Arc<T>>,
  error: Option<ClassifiedError>,
  fetched_at: Option<Instant>,
  updated_at: Option<chrono::DateTime<Utc>>,
  subscribers: usize,
  invalidated: bool,
  refetch_after_settle: bool,
  issued: u64,
  settled: u64,
  in_flight: Option<InFlightFetch<T>>,
  fetcher: Option<Fetcher<T>>,
  idle_since: Instant,
  tx: watch::Sender<QueryView<T>>,
}

impl<T> Slot<T> {
  fn new(description: String) -> Self {
    let (tx, _rx) = watch::channel(QueryView::idle());
    Self {
      description,
      status: QueryStatus::Idle,
      data: None,
      error: None,
      fetched_at: None,
      updated_at: None,
      subscribers: 0,
      invalidated: false,
      refetch_after_settle: false,
      issued: 0,
      settled: 0,
      in_flight: None,
      fetcher: None,
      idle_since: Instant::now(),
      tx,
    }
  }

  fn view(&self) -> QueryView<T> {
    QueryView {
      status: self.status,
      data: self.data.clone(),
      error: self.error.clone(),
      updated_at: self.updated_at,
    }
  }

  fn notify(&self) {
    self.tx.send_replace(self.view());
  }

  fn is_fresh(&self, stale_time: Duration, now: Instant) -> bool {
    self.status == QueryStatus::Success
      && !self.invalidated
      && self
        .fetched_at
        .map(|t| now.saturating_duration_since(t) <= stale_time)
        .unwrap_or(false)
  }

  /// Data that may be displayed while a refetch runs.
  fn servable(&self) -> Option<Arc<T>> {
    if self.invalidated {
      return None;
    }
    self.data.clone()
  }

  /// Last-issued-wins: anything older than what already settled is dropped.
  fn accepts(&self, generation: u64) -> bool {
    generation >= self.settled
  }

  fn apply_data(&mut self, generation: u64, data: Arc<T>) -> bool {
    if !self.accepts(generation) {
      return false;
    }
    self.status = QueryStatus::Success;
    self.data = Some(data);
    self.error = None;
    self.fetched_at = Some(Instant::now());
    self.updated_at = Some(Utc::now());
    self.invalidated = self.refetch_after_settle;
    self.settled = generation;
    true
  }

  fn apply_error(&mut self, generation: u64, error: ClassifiedError) -> bool {
    if !self.accepts(generation) {
      return false;
    }
    self.status = QueryStatus::Error;
    self.error = Some(error);
    self.settled = generation;
    true
  }

  fn remove_subscriber(&mut self) {
    self.subscribers = self.subscribers.saturating_sub(1);
    if self.subscribers == 0 {
      self.idle_since = Instant::now();
    }
  }
}

/// Cache of query results shared by every subscriber of a key.
pub struct CacheStore<T> {
  slots: Mutex<HashMap<String, Slot<T>>>,
  config: CacheConfig,
}

impl<T> CacheStore<T> {
  pub fn new(config: CacheConfig) -> Self {
    Self {
      slots: Mutex::new(HashMap::new()),
      config,
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// Current state of an entry; an idle record when nothing is cached.
  pub fn read<K: QueryKey>(&self, key: &K) -> CacheEntry<T> {
    self.read_hash(&key.cache_hash(), key.description())
  }

  fn read_hash(&self, hash: &str, description: String) -> CacheEntry<T> {
    let slots = self.slots.lock();
    let now = Instant::now();
    match slots.get(hash) {
      Some(slot) => CacheEntry {
        key: slot.description.clone(),
        view: slot.view(),
        subscriber_count: slot.subscribers,
        is_stale: !slot.is_fresh(self.config.stale_time, now),
        is_invalidated: slot.invalidated,
      },
      None => CacheEntry {
        key: description,
        view: QueryView::idle(),
        subscriber_count: 0,
        is_stale: true,
        is_invalidated: false,
      },
    }
  }

  pub fn contains<K: QueryKey>(&self, key: &K) -> bool {
    self.slots.lock().contains_key(&key.cache_hash())
  }

  pub fn is_fresh<K: QueryKey>(&self, key: &K) -> bool {
    let slots = self.slots.lock();
    slots
      .get(&key.cache_hash())
      .map(|slot| slot.is_fresh(self.config.stale_time, Instant::now()))
      .unwrap_or(false)
  }

  pub fn len(&self) -> usize {
    self.slots.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Mark the start of a fetch and return its generation.
  pub fn begin_fetch<K: QueryKey>(&self, key: &K) -> u64 {
    let mut slots = self.slots.lock();
    let slot = slots
      .entry(key.cache_hash())
      .or_insert_with(|| Slot::new(key.description()));
    Self::begin(slot)
  }

  fn begin(slot: &mut Slot<T>) -> u64 {
    slot.issued += 1;
    slot.status = QueryStatus::Fetching;
    slot.notify();
    slot.issued
  }

  /// Store fetched data. Returns false if a newer fetch already settled.
  pub fn write<K: QueryKey>(&self, key: &K, generation: u64, data: T) -> bool {
    let mut slots = self.slots.lock();
    let slot = slots
      .entry(key.cache_hash())
      .or_insert_with(|| Slot::new(key.description()));
    let applied = slot.apply_data(generation, Arc::new(data));
    if applied {
      slot.notify();
    }
    applied
  }

  /// Record a failed fetch, keeping earlier data. Returns false if superseded.
  pub fn write_error<K: QueryKey>(&self, key: &K, generation: u64, error: ClassifiedError) -> bool {
    let mut slots = self.slots.lock();
    let slot = slots
      .entry(key.cache_hash())
      .or_insert_with(|| Slot::new(key.description()));
    let applied = slot.apply_error(generation, error);
    if applied {
      slot.notify();
    }
    applied
  }

  pub fn invalidate<K: QueryKey>(&self, key: &K) -> Invalidation {
    self.invalidate_hash(&key.cache_hash())
  }

  pub(crate) fn invalidate_hash(&self, hash: &str) -> Invalidation {
    let mut slots = self.slots.lock();
    let Some(slot) = slots.get_mut(hash) else {
      return Invalidation::Absent;
    };

    // A fetch that has not sent anything yet will read the post-invalidation
    // state. One that has needs exactly one follow-up.
    let outcome = if let Some(in_flight) = &slot.in_flight {
      if !in_flight.dispatched || slot.refetch_after_settle {
        Invalidation::Coalesced
      } else {
        slot.refetch_after_settle = true;
        Invalidation::Deferred
      }
    } else if slot.subscribers > 0 {
      Invalidation::Refetch
    } else {
      Invalidation::Marked
    };
    slot.invalidated = true;

    info!(key = %slot.description, ?outcome, "Invalidated");
    outcome
  }

  /// Attach a subscriber, creating the entry on first access.
  pub fn subscribe<K: QueryKey>(self: &Arc<Self>, key: &K) -> Subscription<T> {
    self.subscribe_hash(key.cache_hash(), key.description())
  }

  pub(crate) fn subscribe_hash(self: &Arc<Self>, hash: String, description: String) -> Subscription<T> {
    let mut slots = self.slots.lock();
    let slot = slots
      .entry(hash.clone())
      .or_insert_with(|| Slot::new(description));
    slot.subscribers += 1;
    let rx = slot.tx.subscribe();
    debug!(key = %slot.description, subscribers = slot.subscribers, "Subscribed");

    Subscription {
      store: Arc::downgrade(self),
      hash,
      rx,
    }
  }

  /// Remember how to fetch a key; the most recent fetcher wins.
  pub(crate) fn register_fetcher(&self, hash: &str, description: String, fetcher: Fetcher<T>) {
    let mut slots = self.slots.lock();
    let slot = slots
      .entry(hash.to_string())
      .or_insert_with(|| Slot::new(description));
    slot.fetcher = Some(fetcher);
  }

  pub(crate) fn description(&self, hash: &str) -> Option<String> {
    self.slots.lock().get(hash).map(|s| s.description.clone())
  }

  /// Join the in-flight fetch for a key, or start one via `start`.
  ///
  /// Check and insert happen under one lock, so at most one fetch per key is
  /// ever in flight. Returns `None` when the key has no registered fetcher.
  pub(crate) fn claim<S>(&self, hash: &str, when: FetchWhen, start: S) -> Option<Claim<T>>
  where
    S: FnOnce(u64, Fetcher<T>) -> InFlight<T>,
  {
    let mut slots = self.slots.lock();
    let slot = slots.get_mut(hash)?;

    if let Some(in_flight) = &slot.in_flight {
      debug!(key = %slot.description, generation = in_flight.generation, "Joining in-flight fetch");
      return Some(Claim::Running {
        handle: in_flight.handle.clone(),
        started: false,
        stale: slot.servable(),
      });
    }

    if when == FetchWhen::IfStale && slot.is_fresh(self.config.stale_time, Instant::now()) {
      return slot.data.clone().map(Claim::Fresh);
    }

    let fetcher = slot.fetcher.clone()?;
    let generation = Self::begin(slot);
    let handle = start(generation, fetcher);
    slot.in_flight = Some(InFlightFetch {
      generation,
      handle: handle.clone(),
      dispatched: false,
    });
    debug!(key = %slot.description, generation, "Fetch started");

    Some(Claim::Running {
      handle,
      started: true,
      stale: slot.servable(),
    })
  }

  /// Record that the fetch of `generation` is about to send its first request.
  pub(crate) fn mark_dispatched(&self, hash: &str, generation: u64) {
    let mut slots = self.slots.lock();
    if let Some(in_flight) = slots
      .get_mut(hash)
      .and_then(|slot| slot.in_flight.as_mut())
      .filter(|f| f.generation == generation)
    {
      in_flight.dispatched = true;
    }
  }

  /// Apply a finished fetch and release its in-flight slot.
  ///
  /// Returns true when an invalidation arrived mid-flight and subscribers are
  /// still attached, meaning one follow-up fetch should start now.
  pub(crate) fn settle(&self, hash: &str, generation: u64, result: FetchResult<T>) -> bool {
    let mut slots = self.slots.lock();
    let Some(slot) = slots.get_mut(hash) else {
      return false;
    };

    if slot
      .in_flight
      .as_ref()
      .map(|f| f.generation == generation)
      .unwrap_or(false)
    {
      slot.in_flight = None;
    }

    let applied = match result {
      Ok(data) => slot.apply_data(generation, data),
      Err(error) => slot.apply_error(generation, error),
    };
    if !applied {
      debug!(key = %slot.description, generation, settled = slot.settled, "Dropped superseded result");
      return false;
    }

    let follow_up = slot.refetch_after_settle && slot.subscribers > 0;
    slot.refetch_after_settle = false;
    if slot.subscribers == 0 {
      slot.idle_since = Instant::now();
    }
    slot.notify();
    follow_up
  }

  /// Keys with active subscribers whose data is no longer fresh.
  pub(crate) fn stale_active_keys(&self) -> Vec<String> {
    let slots = self.slots.lock();
    let now = Instant::now();
    slots
      .iter()
      .filter(|(_, slot)| {
        slot.subscribers > 0
          && slot.in_flight.is_none()
          && !slot.is_fresh(self.config.stale_time, now)
      })
      .map(|(hash, _)| hash.clone())
      .collect()
  }

  /// Evict entries nobody has used for `gc_time`. Returns how many were removed.
  pub fn collect_garbage(&self) -> usize {
    let mut slots = self.slots.lock();
    let now = Instant::now();
    let gc_time = self.config.gc_time;
    let before = slots.len();
    slots.retain(|_, slot| {
      slot.subscribers > 0
        || slot.in_flight.is_some()
        || now.saturating_duration_since(slot.idle_since) < gc_time
    });
    let evicted = before - slots.len();
    if evicted > 0 {
      info!(evicted, remaining = slots.len(), "Evicted idle cache entries");
    }
    evicted
  }

  fn unsubscribe(&self, hash: &str) {
    let mut slots = self.slots.lock();
    if let Some(slot) = slots.get_mut(hash) {
      slot.remove_subscriber();
      debug!(key = %slot.description, subscribers = slot.subscribers, "Unsubscribed");
    }
  }
}

impl<T: Send + Sync + 'static> CacheStore<T> {
  /// Periodically run [`collect_garbage`](Self::collect_garbage) until the store is dropped.
  pub fn spawn_gc(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
    let store = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match store.upgrade() {
          Some(store) => {
            store.collect_garbage();
          }
          None => break,
        }
      }
    })
  }
}

/// Live view of one cache entry. Dropping it detaches the subscriber.
pub struct Subscription<T> {
  store: Weak<CacheStore<T>>,
  hash: String,
  rx: watch::Receiver<QueryView<T>>,
}

impl<T> Subscription<T> {
  /// Latest published view.
  pub fn view(&self) -> QueryView<T> {
    self.rx.borrow().clone()
  }

  /// Wait for the next transition. `None` once the entry is gone.
  ///
  /// Only the latest view is kept. A subscriber that falls behind skips
  /// straight to it, so it may never see a `Fetching` that lasted less than one
  /// of its polls. Views it does see are always in publish order.
  pub async fn changed(&mut self) -> Option<QueryView<T>> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }

  /// Wait until the entry is neither idle nor fetching.
  pub async fn settled(&mut self) -> QueryView<T> {
    let done = |v: &QueryView<T>| matches!(v.status, QueryStatus::Success | QueryStatus::Error);
    let settled = match self.rx.wait_for(done).await {
      Ok(view) => Some(view.clone()),
      Err(_) => None,
    };
    settled.unwrap_or_else(|| self.rx.borrow().clone())
  }

  /// Detach now instead of on drop.
  pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
  fn drop(&mut self) {
    if let Some(store) = self.store.upgrade() {
      store.unsubscribe(&self.hash);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;

  struct Key(&'static str);

  impl QueryKey for Key {
    fn cache_hash(&self) -> String {
      super::super::traits::hash_parts(&[self.0])
    }

    fn description(&self) -> String {
      self.0.to_string()
    }
  }

  fn store() -> Arc<CacheStore<Vec<u32>>> {
    Arc::new(CacheStore::new(CacheConfig::default()))
  }

  fn server_error() -> ClassifiedError {
    ClassifiedError::new(ErrorKind::ServerError, "boom", Some(500))
  }

  #[tokio::test]
  async fn test_read_missing_key_is_idle() {
    let store = store();
    let entry = store.read(&Key("tasks"));
    assert_eq!(entry.status(), QueryStatus::Idle);
    assert!(entry.data().is_none());
    assert!(!store.contains(&Key("tasks")));
  }

  #[tokio::test]
  async fn test_write_sets_success() {
    let store = store();
    let key = Key("tasks");
    let generation = store.begin_fetch(&key);
    assert_eq!(store.read(&key).status(), QueryStatus::Fetching);

    assert!(store.write(&key, generation, vec![1, 2]));

    let entry = store.read(&key);
    assert_eq!(entry.status(), QueryStatus::Success);
    assert_eq!(entry.data(), Some(&vec![1, 2]));
    assert!(entry.view.updated_at.is_some());
    assert!(!entry.is_stale);
  }

  #[tokio::test]
  async fn test_write_error_preserves_data() {
    let store = store();
    let key = Key("tasks");
    let first = store.begin_fetch(&key);
    store.write(&key, first, vec![7]);

    let second = store.begin_fetch(&key);
    assert!(store.write_error(&key, second, server_error()));

    let entry = store.read(&key);
    assert_eq!(entry.status(), QueryStatus::Error);
    assert_eq!(entry.data(), Some(&vec![7]));
    assert_eq!(entry.error().map(|e| e.kind), Some(ErrorKind::ServerError));
  }

  #[tokio::test]
  async fn test_older_fetch_cannot_clobber_newer() {
    let store = store();
    let key = Key("tasks");
    let older = store.begin_fetch(&key);
    let newer = store.begin_fetch(&key);

    assert!(store.write(&key, newer, vec![2]));
    assert!(!store.write(&key, older, vec![1]));
    assert!(!store.write_error(&key, older, server_error()));

    let entry = store.read(&key);
    assert_eq!(entry.status(), QueryStatus::Success);
    assert_eq!(entry.data(), Some(&vec![2]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_entry_goes_stale_after_stale_time() {
    let store = store();
    let key = Key("tasks");
    let generation = store.begin_fetch(&key);
    store.write(&key, generation, vec![]);
    assert!(store.is_fresh(&key));

    tokio::time::advance(Duration::from_secs(31)).await;

    assert!(!store.is_fresh(&key));
    assert!(store.read(&key).is_stale);
    // Stale data is still readable.
    assert_eq!(store.read(&key).data(), Some(&vec![]));
  }

  #[tokio::test]
  async fn test_subscribers_see_transitions() {
    let store = store();
    let key = Key("tasks");
    let mut sub = store.subscribe(&key);
    assert_eq!(store.read(&key).subscriber_count, 1);

    let generation = store.begin_fetch(&key);
    let view = sub.changed().await.unwrap();
    assert_eq!(view.status, QueryStatus::Fetching);

    store.write(&key, generation, vec![3]);
    let view = sub.changed().await.unwrap();
    assert_eq!(view.status, QueryStatus::Success);
    assert_eq!(view.data(), Some(&vec![3]));
  }

  #[tokio::test]
  async fn test_slow_subscriber_skips_to_latest_view() {
    let store = store();
    let key = Key("tasks");
    let mut sub = store.subscribe(&key);

    let first = store.begin_fetch(&key);
    store.write(&key, first, vec![1]);
    let second = store.begin_fetch(&key);
    store.write(&key, second, vec![2]);

    let view = sub.changed().await.unwrap();
    assert_eq!(view.status, QueryStatus::Success);
    assert_eq!(view.data(), Some(&vec![2]));

    store.begin_fetch(&key);
    let view = sub.changed().await.unwrap();
    assert!(view.is_fetching());
    assert_eq!(view.data(), Some(&vec![2]));
  }

  #[tokio::test]
  async fn test_drop_detaches_subscriber() {
    let store = store();
    let key = Key("tasks");
    let a = store.subscribe(&key);
    let b = store.subscribe(&key);
    assert_eq!(store.read(&key).subscriber_count, 2);

    drop(a);
    assert_eq!(store.read(&key).subscriber_count, 1);
    b.unsubscribe();
    assert_eq!(store.read(&key).subscriber_count, 0);
  }

  #[tokio::test]
  async fn test_invalidate_outcomes() {
    let store = store();
    let key = Key("tasks");
    assert_eq!(store.invalidate(&key), Invalidation::Absent);

    let generation = store.begin_fetch(&key);
    store.write(&key, generation, vec![]);
    assert_eq!(store.invalidate(&key), Invalidation::Marked);
    assert!(store.read(&key).is_invalidated);
    assert!(!store.is_fresh(&key));

    let _sub = store.subscribe(&key);
    assert_eq!(store.invalidate(&key), Invalidation::Refetch);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gc_skips_subscribed_and_evicts_idle() {
    let store = store();
    let kept = Key("kept");
    let dropped = Key("dropped");
    let _sub = store.subscribe(&kept);
    let generation = store.begin_fetch(&dropped);
    store.write(&dropped, generation, vec![]);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(store.collect_garbage(), 0);

    tokio::time::advance(Duration::from_secs(5 * 60)).await;
    assert_eq!(store.collect_garbage(), 1);
    assert!(store.contains(&kept));
    assert!(!store.contains(&dropped));
  }
}
