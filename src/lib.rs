//! Bounded, multi-collection write-back cache for high-churn social objects.
//!
//! The cache sits between a platform's request handlers and its
//! document-oriented backing store:
//! - Each collection (posts, comments, likes, users, follows, messages,
//!   conversations) gets a bounded in-memory store; crossing a budget trims
//!   the coldest entries in a batch.
//! - Mutating writes are accepted immediately and staged in a sync queue
//!   keyed by `store:key` with latest-wins conflation, then drained into the
//!   backing store in per-collection batches.
//! - Writes that fail to flush retry under backoff; writes nobody flushes
//!   within 30 minutes are dropped. Durability is eventual, never immediate.
//!
//! Construct one [`WriteBackCache`] per process and hand it to handlers by
//! reference; pair it with an [`ExpiryTask`] for the background stale-write
//! sweep.

mod backing;
mod cache;
mod config;
mod expiry;
mod queue;
mod store;

pub use backing::{BackingOp, BackingStore, Document, MemoryBacking};
pub use cache::{StatusReport, StoreStatus, SyncOutcome, WriteBackCache};
pub use config::{CacheConfig, StoreLimits};
pub use expiry::ExpiryTask;
pub use queue::{PendingWrite, SyncQueue, WriteAction, WritePayload};
pub use store::{CacheEntry, CacheStore, StoreName};
