//! Bounded per-collection stores and their eviction policy.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Report};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// The cached collections. A closed enum so an unknown store name can never
/// silently no-op; string-keyed boundaries go through `FromStr` and fail fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreName {
  Posts,
  Comments,
  Likes,
  Users,
  Follows,
  Messages,
  Conversations,
}

impl StoreName {
  /// All stores, in status-report order.
  pub const ALL: [StoreName; 7] = [
    StoreName::Posts,
    StoreName::Comments,
    StoreName::Likes,
    StoreName::Users,
    StoreName::Follows,
    StoreName::Messages,
    StoreName::Conversations,
  ];

  /// Collection name as used by the backing store.
  pub fn as_str(&self) -> &'static str {
    match self {
      StoreName::Posts => "posts",
      StoreName::Comments => "comments",
      StoreName::Likes => "likes",
      StoreName::Users => "users",
      StoreName::Follows => "follows",
      StoreName::Messages => "messages",
      StoreName::Conversations => "conversations",
    }
  }
}

impl fmt::Display for StoreName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for StoreName {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "posts" => Ok(StoreName::Posts),
      "comments" => Ok(StoreName::Comments),
      "likes" => Ok(StoreName::Likes),
      "users" => Ok(StoreName::Users),
      "follows" => Ok(StoreName::Follows),
      "messages" => Ok(StoreName::Messages),
      "conversations" => Ok(StoreName::Conversations),
      other => Err(eyre!("Unknown cache store: {}", other)),
    }
  }
}

/// A single cached document with its access bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  /// The cached document
  pub value: Value,
  /// Bumped on every read; eviction orders by this
  pub last_access: DateTime<Utc>,
  /// Bumped on every write
  pub last_modified: DateTime<Utc>,
  /// Whether a matching pending write was enqueued
  pub needs_sync: bool,
}

/// A bounded key→entry map for one collection.
///
/// Capacity is enforced synchronously by the `set` path: once an insert pushes
/// the map over its limit, a batched trim removes the coldest entries. The
/// batch (down to 80% of the limit) amortizes the sort, so the trim only runs
/// once per fifth of the budget rather than per insert.
#[derive(Debug)]
pub struct CacheStore {
  name: StoreName,
  limit: usize,
  entries: HashMap<String, CacheEntry>,
}

impl CacheStore {
  pub fn new(name: StoreName, limit: usize) -> Self {
    Self {
      name,
      limit,
      entries: HashMap::new(),
    }
  }

  /// Read a value, bumping `last_access` on hit. A miss has no side effect.
  pub fn get(&mut self, key: &str) -> Option<Value> {
    let entry = self.entries.get_mut(key)?;
    entry.last_access = Utc::now();
    Some(entry.value.clone())
  }

  /// Insert or replace an entry, refreshing both timestamps, then enforce the
  /// capacity limit.
  pub fn insert(&mut self, key: &str, value: Value, needs_sync: bool) {
    let now = Utc::now();
    self.entries.insert(
      key.to_string(),
      CacheEntry {
        value,
        last_access: now,
        last_modified: now,
        needs_sync,
      },
    );

    if self.entries.len() > self.limit {
      self.evict_excess();
    }
  }

  /// Batched trim: drop the coldest entries (lowest `last_access`) until the
  /// store is back at 80% of its limit. Returns the number of evictions.
  pub fn evict_excess(&mut self) -> usize {
    let keep_target = self.limit - self.limit / 5;
    if self.entries.len() <= keep_target {
      return 0;
    }
    let excess = self.entries.len() - keep_target;

    let mut by_access: Vec<(String, DateTime<Utc>)> = self
      .entries
      .iter()
      .map(|(key, entry)| (key.clone(), entry.last_access))
      .collect();
    by_access.sort_by(|a, b| a.1.cmp(&b.1));

    for (key, _) in by_access.into_iter().take(excess) {
      self.entries.remove(&key);
    }

    debug!("Evicted {} cold entries from {}", excess, self.name);
    excess
  }

  /// Look at an entry without touching its access time.
  pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
    self.entries.get(key)
  }

  pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
    self.entries.remove(key)
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn limit(&self) -> usize {
    self.limit
  }

  #[cfg(test)]
  fn entry_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
    self.entries.get_mut(key)
  }
}
