//! Deferred-persistence queue with latest-wins conflation.
//!
//! Pending writes are keyed by `store:key`; re-enqueueing a key replaces the
//! prior entry wholesale, so only the final state of a churning object is ever
//! replayed to the backing store. Entries that outlive the max age are dropped
//! unflushed, and flush failures are retried under exponential backoff until
//! that same age bound drops them.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use crate::store::StoreName;

/// Backoff schedule for failed flushes: 30s, 60s, 120s, 240s, capped at 5min.
const RETRY_BASE_SECS: i64 = 30;
const RETRY_CAP_SECS: i64 = 300;

/// What a pending write does to the backing store when flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
  /// Merge fields into the document matched by id (posts, comments, ...)
  Upsert,
  /// Upsert the unique (targetId, userId, kind) like document
  Like,
  /// Delete the matching like document
  Unlike,
  /// Upsert the unique (followerId, followingId) follow document
  Follow,
  /// Delete the matching follow document
  Unfollow,
}

/// The mutation carried by a pending write: an action plus the document
/// fields it applies.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePayload {
  pub action: WriteAction,
  pub fields: Value,
}

impl WritePayload {
  pub fn new(action: WriteAction, fields: Value) -> Self {
    Self { action, fields }
  }

  pub fn upsert(fields: Value) -> Self {
    Self::new(WriteAction::Upsert, fields)
  }

  /// Derive the action from a document's `action` field.
  ///
  /// Like and follow payloads carry their action inline (`"like"`,
  /// `"unlike"`, `"follow"`, `"unfollow"`); a missing field means creation.
  /// Every other store upserts by id. An unrecognized action string is an
  /// error rather than a silently mistranslated write.
  pub fn from_value(store: StoreName, value: &Value) -> Result<Self> {
    let action = value.get("action").and_then(Value::as_str);
    let action = match store {
      StoreName::Likes => match action {
        Some("like") | None => WriteAction::Like,
        Some("unlike") => WriteAction::Unlike,
        Some(other) => return Err(eyre!("Unknown likes action: {}", other)),
      },
      StoreName::Follows => match action {
        Some("follow") | None => WriteAction::Follow,
        Some("unfollow") => WriteAction::Unfollow,
        Some(other) => return Err(eyre!("Unknown follows action: {}", other)),
      },
      _ => WriteAction::Upsert,
    };
    Ok(Self::new(action, value.clone()))
  }
}

/// A not-yet-persisted mutation staged for the next drain.
#[derive(Debug, Clone)]
pub struct PendingWrite {
  pub store: StoreName,
  pub key: String,
  pub payload: WritePayload,
  pub enqueued_at: DateTime<Utc>,
  /// Failed flush attempts so far
  pub attempts: u32,
  pub last_attempt: Option<DateTime<Utc>>,
}

impl PendingWrite {
  /// Whether this write may be flushed now, given its backoff window.
  fn drainable_at(&self, now: DateTime<Utc>) -> bool {
    match self.last_attempt {
      None => true,
      Some(attempted) => {
        let exp = self.attempts.saturating_sub(1).min(8);
        let backoff = (RETRY_BASE_SECS << exp).min(RETRY_CAP_SECS);
        now - attempted >= Duration::seconds(backoff)
      }
    }
  }
}

/// Staging map of pending writes, deduplicated by `store:key`.
#[derive(Debug)]
pub struct SyncQueue {
  pending: HashMap<String, PendingWrite>,
  max_age: Duration,
}

impl SyncQueue {
  pub fn new(max_age: Duration) -> Self {
    Self {
      pending: HashMap::new(),
      max_age,
    }
  }

  fn composite_key(store: StoreName, key: &str) -> String {
    format!("{}:{}", store, key)
  }

  /// Stage a mutation, replacing any prior write for the same key
  /// (latest-wins; retry bookkeeping starts over for the new write).
  pub fn enqueue(&mut self, store: StoreName, key: &str, payload: WritePayload) {
    self.pending.insert(
      Self::composite_key(store, key),
      PendingWrite {
        store,
        key: key.to_string(),
        payload,
        enqueued_at: Utc::now(),
        attempts: 0,
        last_attempt: None,
      },
    );
  }

  /// Drop writes older than the max age without flushing them. Abandoned
  /// mutations are intentionally lossy past this bound.
  pub fn expire_stale(&mut self, now: DateTime<Utc>) -> usize {
    let max_age = self.max_age;
    let before = self.pending.len();
    self.pending.retain(|composite, write| {
      let keep = now - write.enqueued_at <= max_age;
      if !keep {
        warn!(
          "Dropping pending write {} after {} failed attempt(s): exceeded max age",
          composite, write.attempts
        );
      }
      keep
    });
    before - self.pending.len()
  }

  /// Snapshot the writes eligible for a drain, optionally restricted to one
  /// store. The queue itself is left untouched; the drain removes entries
  /// one by one as they persist.
  pub fn drainable(&self, now: DateTime<Utc>, only: Option<StoreName>) -> Vec<PendingWrite> {
    self
      .pending
      .values()
      .filter(|w| only.map_or(true, |store| w.store == store))
      .filter(|w| w.drainable_at(now))
      .cloned()
      .collect()
  }

  /// Remove a flushed write, but only if it has not been re-enqueued since
  /// the drain snapshot was taken. Returns whether an entry was removed.
  pub fn remove_if_unchanged(
    &mut self,
    store: StoreName,
    key: &str,
    enqueued_at: DateTime<Utc>,
  ) -> bool {
    let composite = Self::composite_key(store, key);
    if self
      .pending
      .get(&composite)
      .is_some_and(|w| w.enqueued_at == enqueued_at)
    {
      self.pending.remove(&composite);
      true
    } else {
      false
    }
  }

  /// Record a failed flush attempt so the write backs off before its next
  /// try. A write re-enqueued since the snapshot keeps its fresh bookkeeping.
  pub fn record_failure(
    &mut self,
    store: StoreName,
    key: &str,
    enqueued_at: DateTime<Utc>,
    now: DateTime<Utc>,
  ) {
    let composite = Self::composite_key(store, key);
    if let Some(write) = self.pending.get_mut(&composite) {
      if write.enqueued_at == enqueued_at {
        write.attempts += 1;
        write.last_attempt = Some(now);
      }
    }
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn count_for(&self, store: StoreName) -> usize {
    self.pending.values().filter(|w| w.store == store).count()
  }

  #[cfg(test)]
  pub(crate) fn entry_mut(&mut self, store: StoreName, key: &str) -> Option<&mut PendingWrite> {
    self.pending.get_mut(&Self::composite_key(store, key))
  }
}
