// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Takeover protocol.
//!
//! The local node replaces a dead node: it inherits the dead node's
//! provider (or becomes a root) and the dead node's subscribers are
//! re-pointed at it.
//!
//! ```text
//!        request                 pause merge workers
//! Idle ──────────→ Requested ─────────────────────────→ MergeWorkersPaused
//!  ↑                   │                                        │
//!  │                   │ replacement unreachable                │ inherit provider
//!  │                   ↓                                        ↓ or promote root
//!  │            (TakeoverFailed,                            Switching
//!  │             stays Requested)                               │
//!  │                                                            │ re-point subscribers
//!  │          resume merge workers                              ↓
//!  └─────────────────────────────────────────────────────── Resuming
//! ```
//!
//! Merge workers aggregating over any affected node stay paused until
//! every subscriber is re-pointed. Each store call is idempotent, so a
//! step that failed halfway is simply run again.
//!
//! At most one takeover per dead node: a request for a dead node that is
//! in flight, queued or already taken over is coalesced.

use crate::circuit_breaker::StoreCircuit;
use crate::error::{CascadeError, Result};
use crate::metrics;
use crate::store::BackingStore;
use crate::topology::{Node, Topology};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, info, warn};

/// Where the current takeover stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TakeoverState {
    Idle,
    Requested { dead: String },
    MergeWorkersPaused { dead: String, paused: Vec<String> },
    Switching { dead: String, paused: Vec<String> },
    Resuming { dead: String, paused: Vec<String> },
}

impl TakeoverState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requested { .. } => "requested",
            Self::MergeWorkersPaused { .. } => "merge_workers_paused",
            Self::Switching { .. } => "switching",
            Self::Resuming { .. } => "resuming",
        }
    }

    /// Dead node of the takeover in flight.
    pub fn dead(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Requested { dead }
            | Self::MergeWorkersPaused { dead, .. }
            | Self::Switching { dead, .. }
            | Self::Resuming { dead, .. } => Some(dead),
        }
    }
}

/// Result of [`Takeover::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Started,
    Queued,
    Coalesced,
}

/// What is known about a dead node when its takeover is requested.
#[derive(Debug, Clone)]
pub(crate) struct TakeoverJob {
    pub dead: String,
    /// Record before removal; carries the provider to inherit.
    pub dead_record: Option<Node>,
    pub subscribers: Vec<String>,
}

/// Takeover driver owned by one node worker.
#[derive(Debug)]
pub(crate) struct Takeover {
    state: TakeoverState,
    job: Option<TakeoverJob>,
    queued: VecDeque<TakeoverJob>,
    completed: BTreeSet<String>,
}

impl Takeover {
    pub fn new() -> Self {
        Self {
            state: TakeoverState::Idle,
            job: None,
            queued: VecDeque::new(),
            completed: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> &TakeoverState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == TakeoverState::Idle && self.queued.is_empty()
    }

    pub fn request(&mut self, local: &str, job: TakeoverJob) -> RequestOutcome {
        let dead = job.dead.clone();
        let duplicate = self.job.as_ref().is_some_and(|j| j.dead == dead)
            || self.queued.iter().any(|j| j.dead == dead)
            || self.completed.contains(&dead);

        let outcome = if duplicate {
            RequestOutcome::Coalesced
        } else if self.job.is_none() {
            self.job = Some(job);
            self.set_state(local, TakeoverState::Requested { dead: dead.clone() });
            RequestOutcome::Started
        } else {
            self.queued.push_back(job);
            RequestOutcome::Queued
        };

        if outcome == RequestOutcome::Coalesced {
            debug!(dead = %dead, "Takeover already handled, coalesced");
            metrics::record_takeover_outcome(local, "coalesced");
        } else {
            info!(dead = %dead, ?outcome, "Takeover requested");
        }
        outcome
    }

    /// A node with this name exists again; a later loss is a new takeover.
    pub fn forget(&mut self, node: &str) {
        self.completed.remove(node);
    }

    fn set_state(&mut self, local: &str, state: TakeoverState) {
        if state != self.state {
            metrics::record_takeover_transition(local, state.label());
            debug!(from = self.state.label(), to = state.label(), "Takeover transition");
        }
        self.state = state;
    }

    /// Run the state machine until it is idle or a step fails.
    ///
    /// A failure leaves the state where it was, so the next call retries
    /// the failed step.
    pub async fn drive<S: BackingStore>(
        &mut self,
        topology: &mut Topology,
        store: &S,
        circuit: &StoreCircuit,
    ) -> Result<()> {
        let local = topology.local_name().to_string();

        loop {
            let next = match self.state.clone() {
                TakeoverState::Idle => match self.queued.pop_front() {
                    Some(job) => {
                        let dead = job.dead.clone();
                        self.job = Some(job);
                        TakeoverState::Requested { dead }
                    }
                    None => return Ok(()),
                },

                TakeoverState::Requested { dead } => {
                    let paused = self.pause_merge_workers(topology, store, circuit, &dead).await?;
                    TakeoverState::MergeWorkersPaused { dead, paused }
                }

                TakeoverState::MergeWorkersPaused { dead, paused } => {
                    self.take_place(topology, store, circuit, &dead).await?;
                    TakeoverState::Switching { dead, paused }
                }

                TakeoverState::Switching { dead, paused } => {
                    let subscribers = self.job.as_ref().map(|j| j.subscribers.clone()).unwrap_or_default();
                    for sub in &subscribers {
                        circuit
                            .write("switch_provider", || store.switch_provider(sub, &local))
                            .await?;
                        if topology.contains(sub) {
                            if let Err(e) = topology.set_provider(sub, &local) {
                                warn!(subscriber = %sub, error = %e, "Re-pointed in store but not locally");
                            }
                        }
                        info!(subscriber = %sub, from = %dead, "Subscriber re-pointed");
                    }
                    TakeoverState::Resuming { dead, paused }
                }

                TakeoverState::Resuming { dead, paused } => {
                    for worker in &paused {
                        circuit
                            .write("resume_node", || store.resume_node(worker))
                            .await?;
                        topology.set_paused(worker, false);
                    }
                    info!(dead = %dead, "Takeover complete");
                    metrics::record_takeover_outcome(&local, "completed");
                    self.completed.insert(dead);
                    self.job = None;
                    TakeoverState::Idle
                }
            };
            self.set_state(&local, next);
        }
    }

    /// Check the replacement, collect subscribers, pause merge workers.
    async fn pause_merge_workers<S: BackingStore>(
        &mut self,
        topology: &mut Topology,
        store: &S,
        circuit: &StoreCircuit,
        dead: &str,
    ) -> Result<Vec<String>> {
        let local = topology.local_name().to_string();
        let fail = |reason: String| {
            warn!(dead = %dead, replacement = %local, reason = %reason, "Takeover failed");
            metrics::record_takeover_outcome(&local, "failed");
            CascadeError::TakeoverFailed {
                dead: dead.to_string(),
                replacement: local.clone(),
                reason,
            }
        };

        match circuit.read("get_node_info", || store.get_node_info(&local)).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(fail("replacement not registered".into())),
            Err(e) => return Err(fail(e.to_string())),
        }

        let listed = circuit
            .read("list_subscribers", || store.list_subscribers(dead))
            .await
            .map_err(|e| fail(e.to_string()))?;

        let Some(job) = self.job.as_mut() else {
            return Err(CascadeError::Internal("takeover requested without a job".into()));
        };
        let mut subscribers: BTreeSet<String> = job.subscribers.iter().cloned().collect();
        subscribers.extend(listed);
        subscribers.remove(&local);
        subscribers.remove(dead);
        job.subscribers = subscribers.into_iter().collect();

        let mut affected = job.subscribers.clone();
        affected.push(dead.to_string());
        let merge_workers: Vec<String> = topology
            .merge_workers_for(&affected)
            .into_iter()
            .filter(|m| *m != local)
            .collect();

        for worker in &merge_workers {
            circuit.write("pause_node", || store.pause_node(worker)).await?;
            topology.set_paused(worker, true);
            info!(merge_worker = %worker, "Paused merge worker for takeover");
        }
        Ok(merge_workers)
    }

    /// Inherit the dead node's provider, or become a root if it was one.
    async fn take_place<S: BackingStore>(
        &mut self,
        topology: &mut Topology,
        store: &S,
        circuit: &StoreCircuit,
        dead: &str,
    ) -> Result<()> {
        let local = topology.local_name().to_string();
        let mut record = topology
            .get_node(dead)
            .cloned()
            .or_else(|| self.job.as_ref().and_then(|j| j.dead_record.clone()));
        if record.is_none() {
            // A dead node is usually unreachable; that only loses the hint.
            record = circuit
                .read("get_node_info", || store.get_node_info(dead))
                .await
                .ok()
                .flatten();
        }

        let Some(record) = record else {
            warn!(dead = %dead, "Dead node record unknown, keeping own provider");
            return Ok(());
        };

        match record.provider_node.as_deref() {
            Some(provider) if provider == local => {}
            Some(provider) if topology.get_node(provider).is_some_and(|n| n.is_dead) => {
                warn!(provider = %provider, "Provider of dead node is dead too, keeping own provider");
            }
            Some(provider) => {
                circuit
                    .write("switch_provider", || store.switch_provider(&local, provider))
                    .await?;
                if let Err(e) = topology.set_provider(&local, provider) {
                    warn!(provider = %provider, error = %e, "Inherited provider rejected locally");
                }
                info!(provider = %provider, "Inherited provider of dead node");
            }
            None => {
                circuit
                    .write("promote_root", || store.promote_root(&local))
                    .await?;
                topology.promote_root(&local)?;
                info!(dead = %dead, "Promoted to root");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitConfig;
    use crate::store::{MemoryStore, StoreCall};
    use crate::topology::{CombinedType, NodeType};

    fn nodes() -> Vec<Node> {
        vec![
            Node::new("r", NodeType::Root),
            Node::new("b", NodeType::Branch)
                .with_provider("r")
                .with_combined("cq", CombinedType::Part),
            Node::new("b2", NodeType::Branch)
                .with_provider("r")
                .with_combined("cq", CombinedType::Part),
            Node::new("r2", NodeType::Branch).with_provider("r"),
            Node::new("m", NodeType::MergeLeaf)
                .with_provider("b")
                .with_combined("cq", CombinedType::Full),
        ]
    }

    async fn fixture() -> (Topology, MemoryStore) {
        let store = MemoryStore::new();
        let mut topo = Topology::new("r2");
        for n in nodes() {
            store.add_node(n.clone()).await;
            topo.upsert_node(n).unwrap();
        }
        (topo, store)
    }

    fn job(topo: &Topology, dead: &str) -> TakeoverJob {
        TakeoverJob {
            dead: dead.to_string(),
            dead_record: topo.get_node(dead).cloned(),
            subscribers: topo.subscribers_of(dead),
        }
    }

    #[tokio::test]
    async fn test_takeover_of_root() {
        let (mut topo, store) = fixture().await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut takeover = Takeover::new();

        store.mark_dead("r").await;
        let j = job(&topo, "r");
        assert_eq!(takeover.request("r2", j), RequestOutcome::Started);
        takeover.drive(&mut topo, &store, &circuit).await.unwrap();

        assert_eq!(takeover.state(), &TakeoverState::Idle);
        assert!(topo.local().unwrap().node_type.is_root());
        assert_eq!(topo.get_node("b").unwrap().provider_node.as_deref(), Some("r2"));
        assert_eq!(topo.get_node("b2").unwrap().provider_node.as_deref(), Some("r2"));
        assert_eq!(topo.combined_set("cq").unwrap().len(), 2);

        let calls = store.calls().await;
        let pos = |c: &StoreCall| calls.iter().position(|x| x == c).unwrap();
        let pause = pos(&StoreCall::Pause("m".into()));
        let resume = pos(&StoreCall::Resume("m".into()));
        let switch_b = pos(&StoreCall::Switch {
            node: "b".into(),
            provider: "r2".into(),
        });
        let switch_b2 = pos(&StoreCall::Switch {
            node: "b2".into(),
            provider: "r2".into(),
        });
        assert!(pause < switch_b && pause < switch_b2);
        assert!(switch_b < resume && switch_b2 < resume);
        assert!(calls.contains(&StoreCall::PromoteRoot("r2".into())));
    }

    #[tokio::test]
    async fn test_takeover_inherits_provider() {
        let store = MemoryStore::new();
        let mut topo = Topology::new("b2");
        for n in [
            Node::new("root", NodeType::Root),
            Node::new("b1", NodeType::Branch).with_provider("root"),
            Node::new("b2", NodeType::Branch).with_provider("root"),
            Node::new("leaf", NodeType::Leaf).with_provider("b1"),
        ] {
            store.add_node(n.clone()).await;
            topo.upsert_node(n).unwrap();
        }
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut takeover = Takeover::new();

        store.mark_dead("b1").await;
        takeover.request("b2", job(&topo, "b1"));
        takeover.drive(&mut topo, &store, &circuit).await.unwrap();

        assert_eq!(topo.local().unwrap().provider_node.as_deref(), Some("root"));
        assert_eq!(topo.get_node("leaf").unwrap().provider_node.as_deref(), Some("b2"));
        assert_eq!(
            store.switch_calls().await,
            vec![
                ("b2".to_string(), "root".to_string()),
                ("leaf".to_string(), "b2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_replacement_stays_requested() {
        let (mut topo, store) = fixture().await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut takeover = Takeover::new();

        takeover.request("r2", job(&topo, "r"));
        store.set_unreachable("r2", true).await;
        let err = takeover.drive(&mut topo, &store, &circuit).await.unwrap_err();
        assert!(matches!(err, CascadeError::TakeoverFailed { .. }));
        assert_eq!(takeover.state().label(), "requested");
        assert!(store.switch_calls().await.is_empty());

        store.set_unreachable("r2", false).await;
        takeover.drive(&mut topo, &store, &circuit).await.unwrap();
        assert_eq!(takeover.state(), &TakeoverState::Idle);
    }

    #[tokio::test]
    async fn test_duplicate_requests_coalesce() {
        let (mut topo, store) = fixture().await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut takeover = Takeover::new();

        assert_eq!(takeover.request("r2", job(&topo, "r")), RequestOutcome::Started);
        assert_eq!(takeover.request("r2", job(&topo, "r")), RequestOutcome::Coalesced);
        takeover.drive(&mut topo, &store, &circuit).await.unwrap();
        assert_eq!(takeover.request("r2", job(&topo, "r")), RequestOutcome::Coalesced);
        takeover.drive(&mut topo, &store, &circuit).await.unwrap();

        assert_eq!(store.switch_calls().await.len(), 2);

        takeover.forget("r");
        assert_eq!(takeover.request("r2", job(&topo, "r")), RequestOutcome::Started);
    }

    #[tokio::test]
    async fn test_second_dead_node_is_queued() {
        let (mut topo, store) = fixture().await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut takeover = Takeover::new();

        takeover.request("r2", job(&topo, "r"));
        assert_eq!(takeover.request("r2", job(&topo, "b")), RequestOutcome::Queued);
        assert!(!takeover.is_idle());
        takeover.drive(&mut topo, &store, &circuit).await.unwrap();
        assert!(takeover.is_idle());
        assert_eq!(topo.get_node("m").unwrap().provider_node.as_deref(), Some("r2"));
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(TakeoverState::Idle.label(), "idle");
        let s = TakeoverState::Switching {
            dead: "r".into(),
            paused: vec![],
        };
        assert_eq!(s.label(), "switching");
        assert_eq!(s.dead(), Some("r"));
        assert_eq!(TakeoverState::Idle.dead(), None);
    }
}
