//! The write-back cache orchestrator.
//!
//! One instance per process, constructed explicitly and handed to request
//! handlers by reference. Reads and writes against the bounded stores are
//! synchronous; persistence happens later, when a collaborator drains the
//! sync queue into the backing store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backing::BackingStore;
use crate::config::{CacheConfig, StoreLimits};
use crate::queue::{PendingWrite, SyncQueue, WriteAction, WritePayload};
use crate::store::{CacheStore, StoreName};

/// Per-store figures in a [`StatusReport`].
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
  pub size: usize,
  pub limit: usize,
  pub usage_percent: f64,
}

/// Snapshot of cache occupancy and queue depth for operational monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
  pub stores: BTreeMap<StoreName, StoreStatus>,
  pub pending_writes: usize,
  pub last_sync: Option<DateTime<Utc>>,
}

/// What a drain accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
  /// Writes persisted and removed from the queue
  pub flushed: usize,
  /// Writes that failed and stay queued for a backed-off retry
  pub failed: usize,
}

/// One bounded store per collection, fixed at construction so a store lookup
/// can never miss.
struct StoreSet {
  posts: Mutex<CacheStore>,
  comments: Mutex<CacheStore>,
  likes: Mutex<CacheStore>,
  users: Mutex<CacheStore>,
  follows: Mutex<CacheStore>,
  messages: Mutex<CacheStore>,
  conversations: Mutex<CacheStore>,
}

impl StoreSet {
  fn new(limits: &StoreLimits) -> Self {
    let store = |name: StoreName| Mutex::new(CacheStore::new(name, limits.limit(name)));
    Self {
      posts: store(StoreName::Posts),
      comments: store(StoreName::Comments),
      likes: store(StoreName::Likes),
      users: store(StoreName::Users),
      follows: store(StoreName::Follows),
      messages: store(StoreName::Messages),
      conversations: store(StoreName::Conversations),
    }
  }

  fn get(&self, name: StoreName) -> &Mutex<CacheStore> {
    match name {
      StoreName::Posts => &self.posts,
      StoreName::Comments => &self.comments,
      StoreName::Likes => &self.likes,
      StoreName::Users => &self.users,
      StoreName::Follows => &self.follows,
      StoreName::Messages => &self.messages,
      StoreName::Conversations => &self.conversations,
    }
  }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
  mutex.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

/// Bounded, multi-collection write-back cache.
///
/// Store and queue mutations never hold a lock across an await; the drain
/// gate serializes concurrent drains around the backing-store calls.
pub struct WriteBackCache {
  config: CacheConfig,
  stores: StoreSet,
  queue: Mutex<SyncQueue>,
  last_sync: Mutex<Option<DateTime<Utc>>>,
  drain_gate: tokio::sync::Mutex<()>,
}

impl WriteBackCache {
  pub fn new(config: CacheConfig) -> Self {
    let stores = StoreSet::new(&config.limits);
    let queue = Mutex::new(SyncQueue::new(config.max_pending_age()));
    Self {
      config,
      stores,
      queue,
      last_sync: Mutex::new(None),
      drain_gate: tokio::sync::Mutex::new(()),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// Read a cached value, bumping its access time. A miss has no side
  /// effect; the caller loads from the backing store and calls `set`.
  pub fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>> {
    Ok(lock(self.stores.get(store))?.get(key))
  }

  /// Cache a value. With `needs_sync`, the mutation is also staged for the
  /// next drain; the queue action is derived from the value (see
  /// [`WritePayload::from_value`]), and a malformed payload fails before the
  /// cache is touched.
  pub fn set(&self, store: StoreName, key: &str, value: Value, needs_sync: bool) -> Result<()> {
    if needs_sync {
      let payload = WritePayload::from_value(store, &value)?;
      lock(&self.queue)?.enqueue(store, key, payload);
    }
    lock(self.stores.get(store))?.insert(key, value, needs_sync);
    Ok(())
  }

  /// Stage a mutation without touching the store — for callers that shaped
  /// the payload themselves or already hold the cached value.
  pub fn mark_for_sync(&self, store: StoreName, key: &str, payload: WritePayload) -> Result<()> {
    lock(&self.queue)?.enqueue(store, key, payload);
    Ok(())
  }

  /// Drop an entry from its store. The matching pending write, if any, is
  /// left alone — its lifetime is independent of the cache entry.
  pub fn remove(&self, store: StoreName, key: &str) -> Result<()> {
    lock(self.stores.get(store))?.remove(key);
    Ok(())
  }

  /// Wipe one store entirely.
  pub fn clear(&self, store: StoreName) -> Result<()> {
    lock(self.stores.get(store))?.clear();
    Ok(())
  }

  /// Drop pending writes past the max age. Returns how many were dropped.
  pub fn expire_stale(&self) -> Result<usize> {
    Ok(lock(&self.queue)?.expire_stale(Utc::now()))
  }

  /// Whether a collaborator should trigger a drain: pending writes exist and
  /// the last drain is absent or stale.
  pub fn should_sync(&self) -> Result<bool> {
    if lock(&self.queue)?.is_empty() {
      return Ok(false);
    }
    let last_sync = *lock(&self.last_sync)?;
    Ok(match last_sync {
      None => true,
      Some(at) => Utc::now() - at >= self.config.sync_staleness(),
    })
  }

  /// Drain the whole queue into the backing store.
  pub async fn sync_to_database<B: BackingStore>(&self, backing: &B) -> Result<SyncOutcome> {
    self.drain(backing, None).await
  }

  /// Drain only one store's pending writes, immediately.
  pub async fn force_sync_type<B: BackingStore>(
    &self,
    backing: &B,
    store: StoreName,
  ) -> Result<SyncOutcome> {
    self.drain(backing, Some(store)).await
  }

  /// Snapshot the eligible writes, then persist them one by one. Each write
  /// is removed from the queue only after its own success, so a failure
  /// retains exactly the failed items for a backed-off retry, and a write
  /// re-enqueued mid-drain survives for the next cycle.
  async fn drain<B: BackingStore>(
    &self,
    backing: &B,
    only: Option<StoreName>,
  ) -> Result<SyncOutcome> {
    let _gate = self.drain_gate.lock().await;

    let snapshot = lock(&self.queue)?.drainable(Utc::now(), only);
    let mut outcome = SyncOutcome::default();
    if snapshot.is_empty() {
      *lock(&self.last_sync)? = Some(Utc::now());
      return Ok(outcome);
    }

    // Grouped by store so flush logging stays per-collection
    let mut groups: BTreeMap<StoreName, Vec<PendingWrite>> = BTreeMap::new();
    for write in snapshot {
      groups.entry(write.store).or_default().push(write);
    }

    for (store, writes) in groups {
      debug!("Flushing {} pending write(s) for {}", writes.len(), store);
      for write in writes {
        match apply(backing, &write).await {
          Ok(()) => {
            lock(&self.queue)?.remove_if_unchanged(write.store, &write.key, write.enqueued_at);
            outcome.flushed += 1;
          }
          Err(e) => {
            warn!("Failed to flush {}:{}: {}", store, write.key, e);
            lock(&self.queue)?.record_failure(
              write.store,
              &write.key,
              write.enqueued_at,
              Utc::now(),
            );
            outcome.failed += 1;
          }
        }
      }
    }

    *lock(&self.last_sync)? = Some(Utc::now());
    info!(
      "Drained sync queue: {} flushed, {} failed",
      outcome.flushed, outcome.failed
    );
    Ok(outcome)
  }

  /// Seed the cache with the hottest content: recent posts and recently
  /// active users, loaded read-through (never staged for sync).
  pub async fn warm_up<B: BackingStore>(&self, backing: &B) -> Result<()> {
    let posts = backing.recent_posts(self.config.warmup_posts).await?;
    let users = backing.recent_users(self.config.warmup_users).await?;
    let counts = (posts.len(), users.len());

    {
      let mut store = lock(self.stores.get(StoreName::Posts))?;
      for doc in posts {
        store.insert(&doc.id, doc.fields, false);
      }
    }
    {
      let mut store = lock(self.stores.get(StoreName::Users))?;
      for doc in users {
        store.insert(&doc.id, doc.fields, false);
      }
    }

    info!("Warmed cache with {} posts and {} users", counts.0, counts.1);
    Ok(())
  }

  /// Occupancy and queue depth. Pure read, no side effects.
  pub fn status(&self) -> Result<StatusReport> {
    let mut stores = BTreeMap::new();
    for name in StoreName::ALL {
      let store = lock(self.stores.get(name))?;
      let (size, limit) = (store.len(), store.limit());
      let usage_percent = if limit == 0 {
        0.0
      } else {
        size as f64 / limit as f64 * 100.0
      };
      stores.insert(
        name,
        StoreStatus {
          size,
          limit,
          usage_percent,
        },
      );
    }

    Ok(StatusReport {
      stores,
      pending_writes: lock(&self.queue)?.len(),
      last_sync: *lock(&self.last_sync)?,
    })
  }

  #[cfg(test)]
  pub(crate) fn backdate_pending(
    &self,
    store: StoreName,
    key: &str,
    enqueued_at: DateTime<Utc>,
  ) -> Result<()> {
    if let Some(write) = lock(&self.queue)?.entry_mut(store, key) {
      write.enqueued_at = enqueued_at;
    }
    Ok(())
  }

  #[cfg(test)]
  pub(crate) fn clear_backoff(&self, store: StoreName, key: &str) -> Result<()> {
    if let Some(write) = lock(&self.queue)?.entry_mut(store, key) {
      write.last_attempt = None;
    }
    Ok(())
  }
}

/// Translate a pending write into the matching backing-store operation.
async fn apply<B: BackingStore>(backing: &B, write: &PendingWrite) -> Result<()> {
  let fields = &write.payload.fields;
  match write.payload.action {
    WriteAction::Upsert => {
      backing
        .upsert_by_filter(write.store, json!({ "_id": write.key }), fields.clone())
        .await
    }
    WriteAction::Like => {
      let filter = filter_of(fields, &["targetId", "userId", "kind"])?;
      let set_fields = with_created_at(&filter, fields);
      backing
        .upsert_by_filter(write.store, filter, set_fields)
        .await
    }
    WriteAction::Unlike => {
      let filter = filter_of(fields, &["targetId", "userId", "kind"])?;
      backing.delete_by_filter(write.store, filter).await
    }
    WriteAction::Follow => {
      let filter = filter_of(fields, &["followerId", "followingId"])?;
      let set_fields = with_created_at(&filter, fields);
      backing
        .upsert_by_filter(write.store, filter, set_fields)
        .await
    }
    WriteAction::Unfollow => {
      let filter = filter_of(fields, &["followerId", "followingId"])?;
      backing.delete_by_filter(write.store, filter).await
    }
  }
}

/// Extract the unique-document filter fields from a payload. A missing field
/// is an error: the write stays queued (and eventually expires) rather than
/// being mistranslated.
fn filter_of(fields: &Value, keys: &[&str]) -> Result<Value> {
  let mut filter = Map::new();
  for key in keys {
    let value = fields
      .get(*key)
      .cloned()
      .ok_or_else(|| eyre!("Pending write is missing filter field '{}'", key))?;
    filter.insert((*key).to_string(), value);
  }
  Ok(Value::Object(filter))
}

/// Relationship documents persist their filter fields plus a creation stamp,
/// taken from the payload when present.
fn with_created_at(filter: &Value, fields: &Value) -> Value {
  let mut set_fields = filter.as_object().cloned().unwrap_or_default();
  let created_at = fields
    .get("createdAt")
    .cloned()
    .unwrap_or_else(|| json!(Utc::now().to_rfc3339()));
  set_fields.insert("createdAt".to_string(), created_at);
  Value::Object(set_fields)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backing::{BackingOp, Document, MemoryBacking};
  use chrono::Duration;

  fn cache() -> WriteBackCache {
    WriteBackCache::new(CacheConfig::default())
  }

  #[test]
  fn test_set_then_get_with_status() {
    let cache = cache();
    let doc = json!({"author": "u1", "text": "hello"});
    cache.set(StoreName::Posts, "p1", doc.clone(), true).unwrap();

    assert_eq!(cache.get(StoreName::Posts, "p1").unwrap(), Some(doc));

    let status = cache.status().unwrap();
    assert_eq!(status.stores[&StoreName::Posts].size, 1);
    assert_eq!(status.stores[&StoreName::Posts].limit, 2000);
    assert_eq!(status.pending_writes, 1);
    assert!(status.last_sync.is_none());
  }

  #[test]
  fn test_set_without_sync_stages_nothing() {
    let cache = cache();
    cache.set(StoreName::Users, "u1", json!({"name": "amy"}), false).unwrap();
    assert_eq!(cache.status().unwrap().pending_writes, 0);
  }

  #[test]
  fn test_malformed_action_neither_caches_nor_stages() {
    let cache = cache();
    let bad = json!({"action": "boost", "targetId": "p1"});
    assert!(cache.set(StoreName::Likes, "p1:u1", bad, true).is_err());
    assert_eq!(cache.get(StoreName::Likes, "p1:u1").unwrap(), None);
    assert_eq!(cache.status().unwrap().pending_writes, 0);
  }

  #[test]
  fn test_removing_entry_keeps_pending_write() {
    let cache = cache();
    cache.set(StoreName::Posts, "p1", json!({"x": 1}), true).unwrap();
    cache.remove(StoreName::Posts, "p1").unwrap();

    let status = cache.status().unwrap();
    assert_eq!(status.stores[&StoreName::Posts].size, 0);
    assert_eq!(status.pending_writes, 1);
  }

  #[tokio::test]
  async fn test_drain_upserts_posts_by_id() {
    let cache = cache();
    let backing = MemoryBacking::new();
    cache.set(StoreName::Posts, "p1", json!({"text": "hi"}), true).unwrap();

    let outcome = cache.sync_to_database(&backing).await.unwrap();
    assert_eq!(outcome, SyncOutcome { flushed: 1, failed: 0 });
    assert_eq!(cache.status().unwrap().pending_writes, 0);

    let ops = backing.operations();
    assert_eq!(
      ops[0],
      BackingOp::Upsert {
        collection: StoreName::Posts,
        filter: json!({"_id": "p1"}),
        set_fields: json!({"text": "hi"}),
      }
    );
  }

  #[tokio::test]
  async fn test_drain_translates_like_and_unlike() {
    let cache = cache();
    let backing = MemoryBacking::new();

    let like = json!({
      "action": "like", "targetId": "p1", "userId": "u1",
      "kind": "post", "createdAt": "2026-08-30T00:00:00Z"
    });
    cache.set(StoreName::Likes, "p1:u1:post", like, true).unwrap();
    cache.sync_to_database(&backing).await.unwrap();

    let unlike = json!({"action": "unlike", "targetId": "p1", "userId": "u1", "kind": "post"});
    cache.set(StoreName::Likes, "p1:u1:post", unlike, true).unwrap();
    cache.sync_to_database(&backing).await.unwrap();

    let expected_filter = json!({"targetId": "p1", "userId": "u1", "kind": "post"});
    let ops = backing.operations();
    assert_eq!(
      ops[0],
      BackingOp::Upsert {
        collection: StoreName::Likes,
        filter: expected_filter.clone(),
        set_fields: json!({
          "targetId": "p1", "userId": "u1", "kind": "post",
          "createdAt": "2026-08-30T00:00:00Z"
        }),
      }
    );
    assert_eq!(
      ops[1],
      BackingOp::Delete {
        collection: StoreName::Likes,
        filter: expected_filter,
      }
    );
  }

  #[tokio::test]
  async fn test_conflated_unlike_is_replayed_unconditionally() {
    let cache = cache();
    let backing = MemoryBacking::new();

    // like then unlike before any drain: only the unlike reaches storage
    let like = json!({"action": "like", "targetId": "p1", "userId": "u1", "kind": "post"});
    let unlike = json!({"action": "unlike", "targetId": "p1", "userId": "u1", "kind": "post"});
    cache.set(StoreName::Likes, "p1:u1:post", like, true).unwrap();
    cache.set(StoreName::Likes, "p1:u1:post", unlike, true).unwrap();
    assert_eq!(cache.status().unwrap().pending_writes, 1);

    cache.sync_to_database(&backing).await.unwrap();
    let ops = backing.operations();
    assert_eq!(ops.len(), 1);
    assert!(matches!(ops[0], BackingOp::Delete { .. }));
  }

  #[tokio::test]
  async fn test_mark_for_sync_stages_without_touching_store() {
    let cache = cache();
    let backing = MemoryBacking::new();

    // The handler already persisted nothing to the cache; it just wants the
    // mutation reconciled on the next drain.
    let payload = WritePayload::new(
      WriteAction::Follow,
      json!({"followerId": "u1", "followingId": "u2"}),
    );
    cache.mark_for_sync(StoreName::Follows, "u1:u2", payload).unwrap();

    let status = cache.status().unwrap();
    assert_eq!(status.stores[&StoreName::Follows].size, 0);
    assert_eq!(status.pending_writes, 1);

    cache.sync_to_database(&backing).await.unwrap();
    assert!(matches!(
      backing.operations()[0],
      BackingOp::Upsert { collection: StoreName::Follows, .. }
    ));
  }

  #[tokio::test]
  async fn test_unfollow_translates_to_delete() {
    let cache = cache();
    let backing = MemoryBacking::new();
    let unfollow = json!({"action": "unfollow", "followerId": "u1", "followingId": "u2"});
    cache.set(StoreName::Follows, "u1:u2", unfollow, true).unwrap();
    cache.sync_to_database(&backing).await.unwrap();

    assert_eq!(
      backing.operations()[0],
      BackingOp::Delete {
        collection: StoreName::Follows,
        filter: json!({"followerId": "u1", "followingId": "u2"}),
      }
    );
  }

  #[tokio::test]
  async fn test_force_sync_drains_only_that_store() {
    let cache = cache();
    let backing = MemoryBacking::new();
    cache.set(StoreName::Posts, "p1", json!({"text": "hi"}), true).unwrap();
    let like = json!({"action": "like", "targetId": "p1", "userId": "u1", "kind": "post"});
    cache.set(StoreName::Likes, "p1:u1:post", like, true).unwrap();

    let outcome = cache.force_sync_type(&backing, StoreName::Likes).await.unwrap();
    assert_eq!(outcome, SyncOutcome { flushed: 1, failed: 0 });

    // posts write untouched, likes write gone
    assert_eq!(cache.status().unwrap().pending_writes, 1);
    let ops = backing.operations();
    assert_eq!(ops.len(), 1);
    assert!(matches!(
      ops[0],
      BackingOp::Upsert { collection: StoreName::Likes, .. }
    ));
  }

  #[tokio::test]
  async fn test_failed_flush_retains_only_failed_items() {
    let cache = cache();
    let backing = MemoryBacking::new();
    backing.fail_collection(StoreName::Posts);

    cache.set(StoreName::Posts, "p1", json!({"text": "hi"}), true).unwrap();
    cache.set(StoreName::Comments, "c1", json!({"text": "yo"}), true).unwrap();

    let outcome = cache.sync_to_database(&backing).await.unwrap();
    assert_eq!(outcome, SyncOutcome { flushed: 1, failed: 1 });
    assert_eq!(cache.status().unwrap().pending_writes, 1);

    // Still backed off: an immediate drain flushes nothing
    backing.heal_collection(StoreName::Posts);
    let outcome = cache.sync_to_database(&backing).await.unwrap();
    assert_eq!(outcome, SyncOutcome::default());

    // Once the backoff window passes the retry succeeds
    cache.clear_backoff(StoreName::Posts, "p1").unwrap();
    let outcome = cache.sync_to_database(&backing).await.unwrap();
    assert_eq!(outcome, SyncOutcome { flushed: 1, failed: 0 });
    assert_eq!(cache.status().unwrap().pending_writes, 0);
  }

  #[tokio::test]
  async fn test_expired_write_is_absent_from_next_drain() {
    let cache = cache();
    let backing = MemoryBacking::new();
    cache.set(StoreName::Posts, "p1", json!({"text": "hi"}), true).unwrap();
    cache
      .backdate_pending(StoreName::Posts, "p1", Utc::now() - Duration::minutes(31))
      .unwrap();

    assert_eq!(cache.expire_stale().unwrap(), 1);
    let outcome = cache.sync_to_database(&backing).await.unwrap();
    assert_eq!(outcome, SyncOutcome::default());
    assert!(backing.operations().is_empty());
  }

  #[tokio::test]
  async fn test_warm_up_seeds_without_staging_writes() {
    let mut config = CacheConfig::default();
    config.warmup_posts = 2;
    let cache = WriteBackCache::new(config);

    let backing = MemoryBacking::new();
    backing.seed_posts(vec![
      Document::new("p1", json!({"text": "a"})),
      Document::new("p2", json!({"text": "b"})),
      Document::new("p3", json!({"text": "c"})),
    ]);
    backing.seed_users(vec![Document::new("u1", json!({"name": "amy"}))]);

    cache.warm_up(&backing).await.unwrap();

    let status = cache.status().unwrap();
    assert_eq!(status.stores[&StoreName::Posts].size, 2); // capped by warmup_posts
    assert_eq!(status.stores[&StoreName::Users].size, 1);
    assert_eq!(status.pending_writes, 0);
    assert_eq!(
      cache.get(StoreName::Posts, "p1").unwrap(),
      Some(json!({"text": "a"}))
    );
  }

  #[tokio::test]
  async fn test_should_sync_tracks_queue_and_staleness() {
    let cache = cache();
    let backing = MemoryBacking::new();
    assert!(!cache.should_sync().unwrap());

    cache.set(StoreName::Posts, "p1", json!({"x": 1}), true).unwrap();
    assert!(cache.should_sync().unwrap()); // never drained yet

    cache.sync_to_database(&backing).await.unwrap();
    cache.set(StoreName::Posts, "p2", json!({"x": 2}), true).unwrap();
    // drained moments ago, still inside the staleness threshold
    assert!(!cache.should_sync().unwrap());
  }

  #[test]
  fn test_status_usage_percent() {
    let mut config = CacheConfig::default();
    config.limits.conversations = 4;
    let cache = WriteBackCache::new(config);
    cache.set(StoreName::Conversations, "c1", json!(1), false).unwrap();
    cache.set(StoreName::Conversations, "c2", json!(2), false).unwrap();

    let status = cache.status().unwrap();
    let conv = &status.stores[&StoreName::Conversations];
    assert_eq!(conv.size, 2);
    assert!((conv.usage_percent - 50.0).abs() < f64::EPSILON);
  }
}
