//! The backing-store seam and an in-process implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::store::StoreName;

/// A document fetched from the backing store, keyed for cache insertion.
#[derive(Debug, Clone)]
pub struct Document {
  pub id: String,
  pub fields: Value,
}

impl Document {
  pub fn new(id: impl Into<String>, fields: Value) -> Self {
    Self {
      id: id.into(),
      fields,
    }
  }
}

/// The durable persistence layer the cache eventually synchronizes to.
///
/// Writes are filter-based so one seam covers both upsert-by-id documents and
/// unique relationship documents (likes, follows). The reads exist for
/// warm-up only; request-path reads belong to the embedding service.
#[async_trait]
pub trait BackingStore: Send + Sync {
  /// Merge `set_fields` into the document matching `filter`, inserting it if
  /// absent.
  async fn upsert_by_filter(
    &self,
    collection: StoreName,
    filter: Value,
    set_fields: Value,
  ) -> Result<()>;

  /// Delete the document(s) matching `filter`. Deleting nothing is not an
  /// error.
  async fn delete_by_filter(&self, collection: StoreName, filter: Value) -> Result<()>;

  /// The most recently created posts, newest first.
  async fn recent_posts(&self, limit: usize) -> Result<Vec<Document>>;

  /// The most recently active users, most recent first.
  async fn recent_users(&self, limit: usize) -> Result<Vec<Document>>;
}

/// A write operation as applied to a [`MemoryBacking`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackingOp {
  Upsert {
    collection: StoreName,
    filter: Value,
    set_fields: Value,
  },
  Delete {
    collection: StoreName,
    filter: Value,
  },
}

#[derive(Debug, Default)]
struct MemoryBackingInner {
  ops: Vec<BackingOp>,
  posts: Vec<Document>,
  users: Vec<Document>,
  failing: HashSet<StoreName>,
}

/// In-process backing store for tests and local development.
///
/// Records every write it is asked to perform and serves seeded warm-up
/// data; individual collections can be made to fail to exercise the retry
/// path.
#[derive(Debug, Default)]
pub struct MemoryBacking {
  inner: Mutex<MemoryBackingInner>,
}

impl MemoryBacking {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed the documents served by `recent_posts`.
  pub fn seed_posts(&self, posts: Vec<Document>) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.posts = posts;
    }
  }

  /// Seed the documents served by `recent_users`.
  pub fn seed_users(&self, users: Vec<Document>) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.users = users;
    }
  }

  /// Make every write against `collection` fail until healed.
  pub fn fail_collection(&self, collection: StoreName) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.failing.insert(collection);
    }
  }

  pub fn heal_collection(&self, collection: StoreName) {
    if let Ok(mut inner) = self.inner.lock() {
      inner.failing.remove(&collection);
    }
  }

  /// Every write applied so far, in order.
  pub fn operations(&self) -> Vec<BackingOp> {
    self
      .inner
      .lock()
      .map(|inner| inner.ops.clone())
      .unwrap_or_default()
  }

  fn check_writable(&self, collection: StoreName) -> Result<()> {
    let inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if inner.failing.contains(&collection) {
      return Err(eyre!("Write to {} refused (collection marked failing)", collection));
    }
    Ok(())
  }
}

#[async_trait]
impl BackingStore for MemoryBacking {
  async fn upsert_by_filter(
    &self,
    collection: StoreName,
    filter: Value,
    set_fields: Value,
  ) -> Result<()> {
    self.check_writable(collection)?;
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    inner.ops.push(BackingOp::Upsert {
      collection,
      filter,
      set_fields,
    });
    Ok(())
  }

  async fn delete_by_filter(&self, collection: StoreName, filter: Value) -> Result<()> {
    self.check_writable(collection)?;
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    inner.ops.push(BackingOp::Delete { collection, filter });
    Ok(())
  }

  async fn recent_posts(&self, limit: usize) -> Result<Vec<Document>> {
    let inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(inner.posts.iter().take(limit).cloned().collect())
  }

  async fn recent_users(&self, limit: usize) -> Result<Vec<Document>> {
    let inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(inner.users.iter().take(limit).cloned().collect())
  }
}
