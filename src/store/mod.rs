// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backing store integration.
//!
//! The queue itself (ticks, batches, event storage, subscriptions) lives in
//! the backing store. This module defines what the consumer needs from it:
//!
//! | Call | Used by |
//! |------|---------|
//! | `fetch_batch` / `commit_batch` | Consumer Loop |
//! | `get_node_info` / `list_subscribers` / `list_combined_members` | bootstrap, takeover, pause polling |
//! | `switch_provider` / `promote_root` | takeover, wait-behind |
//! | `pause_node` / `resume_node` | takeover (merge workers), operator commands |
//! | `register_at` / `set_completed` / `subscription_position` | rewind / reset |
//! | `set_consumer_error` | error reporting |
//!
//! A consumer's position on its provider is the store's subscription
//! record; `fetch_batch` always continues from there and returns the same
//! open batch until it is committed.
//!
//! # Example
//!
//! ```rust,no_run
//! use cascade_consumer::store::{BackingStore, MemoryStore};
//!
//! # async fn example() {
//! let store = MemoryStore::new();
//! if let Ok(Some(batch)) = store.fetch_batch("root", "branch-1").await {
//!     let _ = store.commit_batch("branch-1", batch.batch_id).await;
//! }
//! # }
//! ```

mod exclusive;
mod memory;
pub mod postgres;

pub use exclusive::ExclusiveStore;
pub use memory::{MemoryStore, StoreCall};
pub use postgres::PgStore;

use crate::event::Batch;
use crate::topology::{Node, Tick};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Result type for backing store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Driver-level failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection lost, timeout, server restarting.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the call (constraint, unknown consumer, ...).
    #[error("store rejected call: {0}")]
    Rejected(String),

    /// A referenced node or subscription does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Transient errors are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// What the consumer needs from the queue backend.
///
/// Implementations must be cheap to call concurrently from several
/// node workers; wrap a single shared session in [`ExclusiveStore`].
pub trait BackingStore: Send + Sync + 'static {
    /// Next batch for `consumer` on `provider`'s queue, or `None` when
    /// nothing new is ticked yet.
    fn fetch_batch(&self, provider: &str, consumer: &str) -> BoxFuture<'_, Option<Batch>>;

    /// Close the batch and move `node`'s subscription and completed tick
    /// to its end. Committing an already-closed batch is a no-op.
    fn commit_batch(&self, node: &str, batch_id: u64) -> BoxFuture<'_, ()>;

    fn get_node_info(&self, node: &str) -> BoxFuture<'_, Option<Node>>;

    fn list_subscribers(&self, node: &str) -> BoxFuture<'_, Vec<String>>;

    /// Re-point `node` at `new_provider`, keeping its position.
    ///
    /// Idempotent: switching to the current provider is a no-op.
    fn switch_provider(&self, node: &str, new_provider: &str) -> BoxFuture<'_, ()>;

    fn pause_node(&self, node: &str) -> BoxFuture<'_, ()>;

    fn resume_node(&self, node: &str) -> BoxFuture<'_, ()>;

    /// Turn `node` into a root (no provider).
    fn promote_root(&self, node: &str) -> BoxFuture<'_, ()>;

    /// Part members of a combined queue.
    fn list_combined_members(&self, _combined_queue: &str) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    /// Record (or clear) the last error of a node's worker.
    fn set_consumer_error(&self, _node: &str, _error: Option<&str>) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Re-register `node` on `provider` at `tick`.
    fn register_at(&self, provider: &str, node: &str, _tick: Tick) -> BoxFuture<'_, ()> {
        let msg = format!("register_at {node} on {provider} not supported");
        Box::pin(async move { Err(StoreError::Rejected(msg)) })
    }

    /// Overwrite the completed tick of `node`.
    fn set_completed(&self, node: &str, _tick: Tick) -> BoxFuture<'_, ()> {
        let msg = format!("set_completed on {node} not supported");
        Box::pin(async move { Err(StoreError::Rejected(msg)) })
    }

    /// Position of `consumer`'s subscription on `provider`.
    fn subscription_position(&self, _provider: &str, _consumer: &str) -> BoxFuture<'_, Option<Tick>> {
        Box::pin(async { Ok(None) })
    }
}

impl<S: BackingStore + ?Sized> BackingStore for Arc<S> {
    fn fetch_batch(&self, provider: &str, consumer: &str) -> BoxFuture<'_, Option<Batch>> {
        (**self).fetch_batch(provider, consumer)
    }

    fn commit_batch(&self, node: &str, batch_id: u64) -> BoxFuture<'_, ()> {
        (**self).commit_batch(node, batch_id)
    }

    fn get_node_info(&self, node: &str) -> BoxFuture<'_, Option<Node>> {
        (**self).get_node_info(node)
    }

    fn list_subscribers(&self, node: &str) -> BoxFuture<'_, Vec<String>> {
        (**self).list_subscribers(node)
    }

    fn switch_provider(&self, node: &str, new_provider: &str) -> BoxFuture<'_, ()> {
        (**self).switch_provider(node, new_provider)
    }

    fn pause_node(&self, node: &str) -> BoxFuture<'_, ()> {
        (**self).pause_node(node)
    }

    fn resume_node(&self, node: &str) -> BoxFuture<'_, ()> {
        (**self).resume_node(node)
    }

    fn promote_root(&self, node: &str) -> BoxFuture<'_, ()> {
        (**self).promote_root(node)
    }

    fn list_combined_members(&self, combined_queue: &str) -> BoxFuture<'_, Vec<String>> {
        (**self).list_combined_members(combined_queue)
    }

    fn set_consumer_error(&self, node: &str, error: Option<&str>) -> BoxFuture<'_, ()> {
        (**self).set_consumer_error(node, error)
    }

    fn register_at(&self, provider: &str, node: &str, tick: Tick) -> BoxFuture<'_, ()> {
        (**self).register_at(provider, node, tick)
    }

    fn set_completed(&self, node: &str, tick: Tick) -> BoxFuture<'_, ()> {
        (**self).set_completed(node, tick)
    }

    fn subscription_position(&self, provider: &str, consumer: &str) -> BoxFuture<'_, Option<Tick>> {
        (**self).subscription_position(provider, consumer)
    }
}
