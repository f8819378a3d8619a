use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::Path;

use crate::store::StoreName;

/// Cache configuration: per-store capacity limits plus timing knobs.
///
/// `Default` carries the reference constants; services that want different
/// budgets load overrides from YAML or build the struct directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub limits: StoreLimits,
  /// Pending writes older than this are dropped unflushed (seconds)
  pub max_pending_age_secs: i64,
  /// Interval of the background stale-write sweep (seconds)
  pub expiry_interval_secs: u64,
  /// `should_sync` reports true once the last drain is older than this (seconds)
  pub sync_staleness_secs: i64,
  /// How many recently created posts to preload on warm-up
  pub warmup_posts: usize,
  /// How many recently active users to preload on warm-up
  pub warmup_users: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      limits: StoreLimits::default(),
      max_pending_age_secs: 30 * 60,
      expiry_interval_secs: 5 * 60,
      sync_staleness_secs: 60,
      warmup_posts: 100,
      warmup_users: 100,
    }
  }
}

/// Capacity limit per store, in entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreLimits {
  pub posts: usize,
  pub comments: usize,
  pub likes: usize,
  pub users: usize,
  pub follows: usize,
  pub messages: usize,
  pub conversations: usize,
}

impl Default for StoreLimits {
  fn default() -> Self {
    Self {
      posts: 2000,
      comments: 5000,
      likes: 10000,
      users: 3000,
      follows: 8000,
      messages: 4000,
      conversations: 1000,
    }
  }
}

impl StoreLimits {
  /// Look up the capacity limit for a store.
  pub fn limit(&self, store: StoreName) -> usize {
    match store {
      StoreName::Posts => self.posts,
      StoreName::Comments => self.comments,
      StoreName::Likes => self.likes,
      StoreName::Users => self.users,
      StoreName::Follows => self.follows,
      StoreName::Messages => self.messages,
      StoreName::Conversations => self.conversations,
    }
  }
}

impl CacheConfig {
  /// Load configuration from a YAML file.
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::from_yaml(&contents)
  }

  /// Parse configuration from a YAML string.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse cache config: {}", e))
  }

  /// Maximum age a pending write may reach before it is dropped unflushed.
  pub fn max_pending_age(&self) -> Duration {
    Duration::seconds(self.max_pending_age_secs)
  }

  /// Interval for the background expiry sweep.
  pub fn expiry_interval(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.expiry_interval_secs)
  }

  /// How stale the last drain may get before `should_sync` fires.
  pub fn sync_staleness(&self) -> Duration {
    Duration::seconds(self.sync_staleness_secs)
  }
}
