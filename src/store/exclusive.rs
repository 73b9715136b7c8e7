// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutual exclusion over a single shared store session.
//!
//! Several node workers in one process may share one physical connection.
//! [`ExclusiveStore`] holds a lock for exactly the duration of each call,
//! so fetches and commits of different workers never interleave on the
//! session while no worker keeps it between calls.

use super::{BackingStore, BoxFuture};
use crate::event::Batch;
use crate::topology::{Node, Tick};
use tokio::sync::Mutex;

pub struct ExclusiveStore<S> {
    inner: S,
    session: Mutex<()>,
}

impl<S: BackingStore> ExclusiveStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            session: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

macro_rules! exclusive {
    ($self:ident, $call:expr) => {{
        let fut = $call;
        Box::pin(async move {
            let _session = $self.session.lock().await;
            fut.await
        })
    }};
}

impl<S: BackingStore> BackingStore for ExclusiveStore<S> {
    fn fetch_batch(&self, provider: &str, consumer: &str) -> BoxFuture<'_, Option<Batch>> {
        exclusive!(self, self.inner.fetch_batch(provider, consumer))
    }

    fn commit_batch(&self, node: &str, batch_id: u64) -> BoxFuture<'_, ()> {
        exclusive!(self, self.inner.commit_batch(node, batch_id))
    }

    fn get_node_info(&self, node: &str) -> BoxFuture<'_, Option<Node>> {
        exclusive!(self, self.inner.get_node_info(node))
    }

    fn list_subscribers(&self, node: &str) -> BoxFuture<'_, Vec<String>> {
        exclusive!(self, self.inner.list_subscribers(node))
    }

    fn switch_provider(&self, node: &str, new_provider: &str) -> BoxFuture<'_, ()> {
        exclusive!(self, self.inner.switch_provider(node, new_provider))
    }

    fn pause_node(&self, node: &str) -> BoxFuture<'_, ()> {
        exclusive!(self, self.inner.pause_node(node))
    }

    fn resume_node(&self, node: &str) -> BoxFuture<'_, ()> {
        exclusive!(self, self.inner.resume_node(node))
    }

    fn promote_root(&self, node: &str) -> BoxFuture<'_, ()> {
        exclusive!(self, self.inner.promote_root(node))
    }

    fn list_combined_members(&self, combined_queue: &str) -> BoxFuture<'_, Vec<String>> {
        exclusive!(self, self.inner.list_combined_members(combined_queue))
    }

    fn set_consumer_error(&self, node: &str, error: Option<&str>) -> BoxFuture<'_, ()> {
        exclusive!(self, self.inner.set_consumer_error(node, error))
    }

    fn register_at(&self, provider: &str, node: &str, tick: Tick) -> BoxFuture<'_, ()> {
        exclusive!(self, self.inner.register_at(provider, node, tick))
    }

    fn set_completed(&self, node: &str, tick: Tick) -> BoxFuture<'_, ()> {
        exclusive!(self, self.inner.set_completed(node, tick))
    }

    fn subscription_position(&self, provider: &str, consumer: &str) -> BoxFuture<'_, Option<Tick>> {
        exclusive!(self, self.inner.subscription_position(provider, consumer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::topology::NodeType;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_exclusive_store_passes_through() {
        let store = ExclusiveStore::new(MemoryStore::new());
        store.inner().add_node(Node::new("root", NodeType::Root)).await;
        store
            .inner()
            .add_node(Node::new("b1", NodeType::Branch).with_provider("root"))
            .await;

        assert_eq!(store.list_subscribers("root").await.unwrap(), vec!["b1"]);
        store.pause_node("b1").await.unwrap();
        assert!(store.get_node_info("b1").await.unwrap().unwrap().is_paused);
    }

    #[tokio::test]
    async fn test_concurrent_calls_serialize() {
        let store = Arc::new(ExclusiveStore::new(MemoryStore::new()));
        store.inner().add_node(Node::new("root", NodeType::Root)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&store);
            handles.push(tokio::spawn(async move { s.get_node_info("root").await }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap().is_some());
        }
    }
}
