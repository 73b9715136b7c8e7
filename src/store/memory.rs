// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backing store.
//!
//! Models a cascade the way the queue backend sees it: one tick log shared
//! by every node (events are replicated, tick ids are global), per-node
//! records, and subscriptions `(provider, consumer) -> tick`. A root serves
//! every tick in the log; any other node serves up to its own completed
//! tick, which is what makes trailing behind an old provider observable.
//!
//! Records every write call and supports failure injection, so it doubles
//! as the test backend.

use super::{BackingStore, BoxFuture, StoreError, StoreResult};
use crate::event::{Batch, Event};
use crate::topology::{Node, NodeType, Tick};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;
use tracing::trace;

/// A recorded write call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Commit { node: String, batch_id: u64 },
    Switch { node: String, provider: String },
    Pause(String),
    Resume(String),
    PromoteRoot(String),
    RegisterAt { provider: String, node: String, tick: Tick },
    SetCompleted { node: String, tick: Tick },
}

type SubKey = (String, String);

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    log: Vec<(Tick, Vec<Event>)>,
    subs: BTreeMap<SubKey, Tick>,
    open: BTreeMap<SubKey, Batch>,
    batch_owner: HashMap<u64, SubKey>,
    next_batch_id: u64,
    errors: BTreeMap<String, String>,
    unreachable: BTreeSet<String>,
    offline: bool,
    failures: HashMap<String, usize>,
    calls: Vec<StoreCall>,
}

impl State {
    fn check(&mut self, op: &str) -> StoreResult<()> {
        if self.offline {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        if let Some(left) = self.failures.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Unavailable(format!("injected failure in {op}")));
            }
        }
        Ok(())
    }

    fn reachable(&self, node: &str) -> StoreResult<()> {
        if self.unreachable.contains(node) {
            return Err(StoreError::Unavailable(format!("node {node} unreachable")));
        }
        Ok(())
    }

    fn last_tick(&self) -> Tick {
        self.log.last().map_or(0, |(t, _)| *t)
    }

    fn head(&self, node: &Node) -> Tick {
        if node.node_type.is_root() || node.provider_node.is_none() {
            self.last_tick()
        } else {
            node.completed_tick.unwrap_or(0)
        }
    }

    fn drop_open(&mut self, key: &SubKey) {
        if let Some(batch) = self.open.remove(key) {
            self.batch_owner.remove(&batch.batch_id);
        }
    }
}

/// In-memory [`BackingStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a node record. A node with a provider is
    /// subscribed at its completed tick.
    pub async fn add_node(&self, node: Node) {
        let mut st = self.state.lock().await;
        if let Some(provider) = node.provider_node.clone() {
            let key = (provider, node.node_name.clone());
            let pos = node.completed_tick.unwrap_or(0);
            st.subs.entry(key).or_insert(pos);
        }
        st.nodes.insert(node.node_name.clone(), node);
    }

    /// Append a tick carrying `events`. Returns the new tick id.
    pub async fn tick(&self, events: Vec<Event>) -> Tick {
        let mut st = self.state.lock().await;
        let tick = st.last_tick() + 1;
        st.log.push((tick, events));
        tick
    }

    pub async fn last_tick(&self) -> Tick {
        self.state.lock().await.last_tick()
    }

    pub async fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().await.nodes.get(name).cloned()
    }

    /// Fail every call with a transient error while set.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Fail the next `count` calls of `op` (method name) transiently.
    pub async fn fail_next(&self, op: &str, count: usize) {
        self.state.lock().await.failures.insert(op.to_string(), count);
    }

    /// Make fetches from and lookups of `node` fail transiently.
    pub async fn set_unreachable(&self, node: &str, unreachable: bool) {
        let mut st = self.state.lock().await;
        if unreachable {
            st.unreachable.insert(node.to_string());
        } else {
            st.unreachable.remove(node);
        }
    }

    /// Delete a node record, as `pgq_node.drop_node` does. Subscriptions
    /// stay until their consumers are moved.
    pub async fn remove_node(&self, node: &str) {
        self.state.lock().await.nodes.remove(node);
    }

    pub async fn mark_dead(&self, node: &str) {
        let mut st = self.state.lock().await;
        if let Some(n) = st.nodes.get_mut(node) {
            n.is_dead = true;
        }
        st.unreachable.insert(node.to_string());
    }

    /// Flip the stored pause flag without recording a call, as an
    /// administrator working on the store directly would.
    pub async fn set_paused_flag(&self, node: &str, paused: bool) {
        if let Some(n) = self.state.lock().await.nodes.get_mut(node) {
            n.is_paused = paused;
        }
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn switch_calls(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::Switch { node, provider } => Some((node.clone(), provider.clone())),
                _ => None,
            })
            .collect()
    }

    pub async fn consumer_error(&self, node: &str) -> Option<String> {
        self.state.lock().await.errors.get(node).cloned()
    }
}

impl BackingStore for MemoryStore {
    fn fetch_batch(&self, provider: &str, consumer: &str) -> BoxFuture<'_, Option<Batch>> {
        let key = (provider.to_string(), consumer.to_string());
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("fetch_batch")?;
            st.reachable(&key.0)?;

            let provider_node = st
                .nodes
                .get(&key.0)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.0.clone()))?;

            if let Some(batch) = st.open.get(&key) {
                return Ok(Some(batch.clone()));
            }

            let pos = *st.subs.get(&key).ok_or_else(|| {
                StoreError::NotFound(format!("subscription {} on {}", key.1, key.0))
            })?;
            let head = st.head(&provider_node);

            let Some((tick, events)) = st
                .log
                .iter()
                .find(|(t, _)| *t > pos && *t <= head)
                .cloned()
            else {
                return Ok(None);
            };

            st.next_batch_id += 1;
            let batch = Batch {
                batch_id: st.next_batch_id,
                prev_tick: pos,
                tick,
                events,
            };
            trace!(provider = %key.0, consumer = %key.1, batch_id = batch.batch_id, tick, "Opened batch");
            st.batch_owner.insert(batch.batch_id, key.clone());
            st.open.insert(key, batch.clone());
            Ok(Some(batch))
        })
    }

    fn commit_batch(&self, node: &str, batch_id: u64) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("commit_batch")?;
            let Some(key) = st.batch_owner.remove(&batch_id) else {
                return Ok(());
            };
            let Some(batch) = st.open.remove(&key) else {
                return Ok(());
            };
            st.subs.insert(key, batch.tick);
            if let Some(n) = st.nodes.get_mut(&node) {
                n.completed_tick = Some(n.completed_tick.map_or(batch.tick, |t| t.max(batch.tick)));
            }
            st.calls.push(StoreCall::Commit { node, batch_id });
            Ok(())
        })
    }

    fn get_node_info(&self, node: &str) -> BoxFuture<'_, Option<Node>> {
        let node = node.to_string();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("get_node_info")?;
            st.reachable(&node)?;
            Ok(st.nodes.get(&node).cloned())
        })
    }

    fn list_subscribers(&self, node: &str) -> BoxFuture<'_, Vec<String>> {
        let node = node.to_string();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("list_subscribers")?;
            Ok(st
                .nodes
                .values()
                .filter(|n| n.provider_node.as_deref() == Some(node.as_str()))
                .map(|n| n.node_name.clone())
                .collect())
        })
    }

    fn switch_provider(&self, node: &str, new_provider: &str) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        let new_provider = new_provider.to_string();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("switch_provider")?;
            if !st.nodes.contains_key(&new_provider) {
                return Err(StoreError::NotFound(new_provider));
            }
            let (old, completed) = match st.nodes.get(&node) {
                Some(n) => (n.provider_node.clone(), n.completed_tick),
                None => return Err(StoreError::NotFound(node)),
            };
            st.calls.push(StoreCall::Switch {
                node: node.clone(),
                provider: new_provider.clone(),
            });
            if old.as_deref() == Some(new_provider.as_str()) {
                return Ok(());
            }

            let mut pos = completed;
            if let Some(old) = old {
                let key = (old, node.clone());
                st.drop_open(&key);
                let old_pos = st.subs.remove(&key);
                pos = pos.or(old_pos);
            }
            st.subs.insert((new_provider.clone(), node.clone()), pos.unwrap_or(0));
            if let Some(n) = st.nodes.get_mut(&node) {
                n.provider_node = Some(new_provider);
            }
            Ok(())
        })
    }

    fn pause_node(&self, node: &str) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("pause_node")?;
            let n = st
                .nodes
                .get_mut(&node)
                .ok_or_else(|| StoreError::NotFound(node.clone()))?;
            n.is_paused = true;
            st.calls.push(StoreCall::Pause(node));
            Ok(())
        })
    }

    fn resume_node(&self, node: &str) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("resume_node")?;
            let n = st
                .nodes
                .get_mut(&node)
                .ok_or_else(|| StoreError::NotFound(node.clone()))?;
            n.is_paused = false;
            st.calls.push(StoreCall::Resume(node));
            Ok(())
        })
    }

    fn promote_root(&self, node: &str) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("promote_root")?;
            let n = st
                .nodes
                .get_mut(&node)
                .ok_or_else(|| StoreError::NotFound(node.clone()))?;
            let old = n.provider_node.take();
            n.node_type = if n.node_type.is_combined() {
                NodeType::CombinedRoot
            } else {
                NodeType::Root
            };
            if let Some(old) = old {
                let key = (old, node.clone());
                st.drop_open(&key);
                st.subs.remove(&key);
            }
            st.calls.push(StoreCall::PromoteRoot(node));
            Ok(())
        })
    }

    fn list_combined_members(&self, combined_queue: &str) -> BoxFuture<'_, Vec<String>> {
        let queue = combined_queue.to_string();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("list_combined_members")?;
            Ok(st
                .nodes
                .values()
                .filter(|n| n.part_of() == Some(queue.as_str()))
                .map(|n| n.node_name.clone())
                .collect())
        })
    }

    fn set_consumer_error(&self, node: &str, error: Option<&str>) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        let error = error.map(str::to_string);
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("set_consumer_error")?;
            match error {
                Some(e) => st.errors.insert(node, e),
                None => st.errors.remove(&node),
            };
            Ok(())
        })
    }

    fn register_at(&self, provider: &str, node: &str, tick: Tick) -> BoxFuture<'_, ()> {
        let key = (provider.to_string(), node.to_string());
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("register_at")?;
            st.drop_open(&key);
            st.subs.insert(key.clone(), tick);
            st.calls.push(StoreCall::RegisterAt {
                provider: key.0,
                node: key.1,
                tick,
            });
            Ok(())
        })
    }

    fn set_completed(&self, node: &str, tick: Tick) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("set_completed")?;
            let n = st
                .nodes
                .get_mut(&node)
                .ok_or_else(|| StoreError::NotFound(node.clone()))?;
            n.completed_tick = Some(tick);
            st.calls.push(StoreCall::SetCompleted { node, tick });
            Ok(())
        })
    }

    fn subscription_position(&self, provider: &str, consumer: &str) -> BoxFuture<'_, Option<Tick>> {
        let key = (provider.to_string(), consumer.to_string());
        Box::pin(async move {
            let mut st = self.state.lock().await;
            st.check("subscription_position")?;
            Ok(st.subs.get(&key).copied())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn chain() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_node(Node::new("root", NodeType::Root)).await;
        store
            .add_node(Node::new("b1", NodeType::Branch).with_provider("root"))
            .await;
        store
            .add_node(Node::new("leaf", NodeType::Leaf).with_provider("b1"))
            .await;
        store
    }

    #[tokio::test]
    async fn test_empty_fetch_is_none() {
        let store = chain().await;
        assert_eq!(store.fetch_batch("root", "b1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_batch_redelivered_until_commit() {
        let store = chain().await;
        store.tick(vec![Event::new(1, "x", "")]).await;
        store.tick(vec![Event::new(2, "y", "")]).await;

        let first = store.fetch_batch("root", "b1").await.unwrap().unwrap();
        let again = store.fetch_batch("root", "b1").await.unwrap().unwrap();
        assert_eq!(first, again);
        assert_eq!((first.prev_tick, first.tick), (0, 1));

        store.commit_batch("b1", first.batch_id).await.unwrap();
        assert_eq!(store.node("b1").await.unwrap().completed_tick, Some(1));

        let next = store.fetch_batch("root", "b1").await.unwrap().unwrap();
        assert_eq!((next.prev_tick, next.tick), (1, 2));
        assert_ne!(next.batch_id, first.batch_id);

        // Double commit is a no-op.
        store.commit_batch("b1", first.batch_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_branch_serves_up_to_its_completed_tick() {
        let store = chain().await;
        store.tick(vec![]).await;
        store.tick(vec![]).await;
        assert_eq!(store.fetch_batch("b1", "leaf").await.unwrap(), None);

        let b = store.fetch_batch("root", "b1").await.unwrap().unwrap();
        store.commit_batch("b1", b.batch_id).await.unwrap();
        let leaf_batch = store.fetch_batch("b1", "leaf").await.unwrap().unwrap();
        assert_eq!(leaf_batch.tick, 1);
    }

    #[tokio::test]
    async fn test_switch_provider_keeps_position_and_is_idempotent() {
        let store = chain().await;
        store.tick(vec![]).await;
        let b = store.fetch_batch("b1", "leaf").await.unwrap();
        assert!(b.is_none());
        store.set_completed("leaf", 1).await.unwrap();

        store.switch_provider("leaf", "root").await.unwrap();
        store.switch_provider("leaf", "root").await.unwrap();
        assert_eq!(store.subscription_position("root", "leaf").await.unwrap(), Some(1));
        assert_eq!(store.subscription_position("b1", "leaf").await.unwrap(), None);
        assert_eq!(store.switch_calls().await.len(), 2);
        assert_eq!(
            store.node("leaf").await.unwrap().provider_node.as_deref(),
            Some("root")
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = chain().await;
        store.fail_next("get_node_info", 1).await;
        let err = store.get_node_info("root").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.get_node_info("root").await.is_ok());

        store.set_offline(true).await;
        assert!(store.list_subscribers("root").await.is_err());
        store.set_offline(false).await;

        store.mark_dead("root").await;
        assert!(store.fetch_batch("root", "b1").await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_promote_root_drops_subscription() {
        let store = chain().await;
        store.promote_root("b1").await.unwrap();
        let b1 = store.node("b1").await.unwrap();
        assert_eq!(b1.node_type, NodeType::Root);
        assert_eq!(store.subscription_position("root", "b1").await.unwrap(), None);
        assert!(store.calls().await.contains(&StoreCall::PromoteRoot("b1".into())));
    }

    #[tokio::test]
    async fn test_consumer_error_set_and_clear() {
        let store = chain().await;
        store.set_consumer_error("b1", Some("boom")).await.unwrap();
        assert_eq!(store.consumer_error("b1").await.as_deref(), Some("boom"));
        store.set_consumer_error("b1", None).await.unwrap();
        assert_eq!(store.consumer_error("b1").await, None);
    }
}
