// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wait-behind protocol.
//!
//! When a subscriber is about to be re-pointed at the local node, the
//! local node first has to have consumed everything the subscriber
//! already has. Until then the subscriber keeps reading from its old
//! provider and the local node trails that position.
//!
//! ```text
//!              Begin                   Progress(p ≥ target)
//! NotWaiting ────────→ Trailing ─────────────────────────→ CaughtUp
//!                       │    ↑                                │
//!       ProviderDropped │    │                                │ SwitchDone
//!                       ↓    │                                │
//!              Trailing (dropped) ── GapSwitchDone ──→ Switched ←┘
//!                                  (gap if p < target)
//! ```
//!
//! The transition function is pure; [`drive`] performs the store call
//! that makes a transition true before feeding the confirming event.
//!
//! The only way to reach `Switched` below the target position is a
//! confirmed removal of the old provider: an applied `node-dropped`, or
//! the store answering that it has no such node. A failed lookup is not
//! a confirmation. The gap is reported, never hidden.

use crate::circuit_breaker::StoreCircuit;
use crate::error::Result;
use crate::metrics;
use crate::store::BackingStore;
use crate::topology::{Tick, Topology};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Progress of one subscriber hand-over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitBehindState {
    NotWaiting,
    Trailing {
        /// Provider the subscriber reads from until the switch.
        target_provider: String,
        /// Subscriber's position on `target_provider` when trailing began.
        catch_up_position: Tick,
        /// Highest local position seen so far.
        reached: Tick,
        /// Removal of `target_provider` has been confirmed.
        provider_dropped: bool,
        started_at: Instant,
    },
    CaughtUp {
        target_provider: String,
        position: Tick,
    },
    Switched {
        position: Tick,
        /// Switched below the catch-up position.
        gap: bool,
    },
}

/// Inputs to [`WaitBehindState::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitBehindEvent {
    Begin {
        target_provider: String,
        catch_up_position: Tick,
        now: Instant,
    },
    /// Local consumed position.
    Progress(Tick),
    /// Removal of the old provider was confirmed.
    ProviderDropped,
    /// The store switch succeeded after a confirmed removal.
    GapSwitchDone,
    /// The store switch succeeded after catching up.
    SwitchDone,
    Abandon,
}

impl WaitBehindState {
    pub fn transition(self, event: WaitBehindEvent) -> Self {
        use WaitBehindEvent as E;

        match (self, event) {
            (_, E::Abandon) => Self::NotWaiting,

            (
                Self::NotWaiting,
                E::Begin {
                    target_provider,
                    catch_up_position,
                    now,
                },
            ) => Self::Trailing {
                target_provider,
                catch_up_position,
                reached: 0,
                provider_dropped: false,
                started_at: now,
            },

            (
                Self::Trailing {
                    target_provider,
                    catch_up_position,
                    reached,
                    provider_dropped,
                    started_at,
                },
                E::Progress(position),
            ) => {
                let reached = reached.max(position);
                if reached >= catch_up_position {
                    Self::CaughtUp {
                        target_provider,
                        position: reached,
                    }
                } else {
                    Self::Trailing {
                        target_provider,
                        catch_up_position,
                        reached,
                        provider_dropped,
                        started_at,
                    }
                }
            }

            (
                Self::Trailing {
                    target_provider,
                    catch_up_position,
                    reached,
                    started_at,
                    ..
                },
                E::ProviderDropped,
            ) => Self::Trailing {
                target_provider,
                catch_up_position,
                reached,
                provider_dropped: true,
                started_at,
            },

            (
                Self::Trailing {
                    catch_up_position,
                    reached,
                    provider_dropped: true,
                    ..
                },
                E::GapSwitchDone,
            ) => Self::Switched {
                position: reached,
                gap: reached < catch_up_position,
            },

            (Self::CaughtUp { position, .. }, E::SwitchDone) => Self::Switched {
                position,
                gap: false,
            },

            (state, _) => state,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NotWaiting => "not_waiting",
            Self::Trailing { .. } => "trailing",
            Self::CaughtUp { .. } => "caught_up",
            Self::Switched { .. } => "switched",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Trailing { .. } | Self::CaughtUp { .. })
    }
}

/// Start trailing `old` on behalf of `subscriber`.
///
/// A hand-over already in progress for the same subscriber is kept. When
/// the store cannot report the subscriber's position, the last completed
/// tick known locally is the target. An old provider missing from the
/// local topology is loaded from the store when it can be; [`drive`]
/// repeats the lookup until the store confirms it or the record is found.
pub(crate) async fn begin<S: BackingStore>(
    waits: &mut BTreeMap<String, WaitBehindState>,
    topology: &mut Topology,
    store: &S,
    circuit: &StoreCircuit,
    subscriber: &str,
    old: &str,
) {
    if waits.get(subscriber).is_some_and(WaitBehindState::is_active) {
        debug!(subscriber = %subscriber, "Wait-behind already in progress");
        return;
    }

    if !topology.contains(old) {
        match circuit.read("get_node_info", || store.get_node_info(old)).await {
            Ok(Some(node)) => {
                if let Err(e) = topology.upsert_node(node) {
                    warn!(old_provider = %old, error = %e, "Old provider record rejected");
                }
            }
            Ok(None) => debug!(old_provider = %old, "Old provider not in store"),
            Err(e) => warn!(old_provider = %old, error = %e, "Old provider lookup failed"),
        }
    }

    let stored = circuit
        .read("subscription_position", || store.subscription_position(old, subscriber))
        .await
        .unwrap_or_else(|e| {
            warn!(subscriber = %subscriber, error = %e, "Subscriber position unavailable");
            None
        });
    let catch_up_position = stored
        .or_else(|| topology.get_node(subscriber).and_then(|n| n.completed_tick))
        .unwrap_or(0);

    info!(
        subscriber = %subscriber,
        old_provider = %old,
        catch_up_position,
        "Trailing old provider before taking over subscriber"
    );
    let state = WaitBehindState::NotWaiting.transition(WaitBehindEvent::Begin {
        target_provider: old.to_string(),
        catch_up_position,
        now: Instant::now(),
    });
    metrics::record_wait_behind_transition(topology.local_name(), state.label());
    waits.insert(subscriber.to_string(), state);
}

/// Advance every active hand-over as far as it can go right now.
///
/// Finished hand-overs are dropped from `waits`. A failed switch leaves
/// its entry in place for the next call.
pub(crate) async fn drive<S: BackingStore>(
    waits: &mut BTreeMap<String, WaitBehindState>,
    topology: &mut Topology,
    store: &S,
    circuit: &StoreCircuit,
) -> Result<()> {
    let local = topology.local_name().to_string();
    let subscribers: Vec<String> = waits.keys().cloned().collect();

    for subscriber in subscribers {
        let Some(mut state) = waits.remove(&subscriber) else {
            continue;
        };
        let before = state.label();

        if let WaitBehindState::Trailing {
            target_provider,
            catch_up_position,
            provider_dropped,
            ..
        } = &state
        {
            let target = target_provider.clone();
            let target_position = *catch_up_position;
            let mut dropped = *provider_dropped;

            if !dropped && !topology.contains(&target) {
                match circuit.read("get_node_info", || store.get_node_info(&target)).await {
                    Ok(Some(node)) => {
                        if let Err(e) = topology.upsert_node(node) {
                            warn!(old_provider = %target, error = %e, "Old provider record rejected");
                        }
                    }
                    Ok(None) => {
                        info!(old_provider = %target, "Old provider removed from store");
                        dropped = true;
                    }
                    Err(e) => {
                        debug!(old_provider = %target, error = %e, "Old provider lookup failed, still trailing");
                        waits.insert(subscriber, state);
                        continue;
                    }
                }
            }
            if dropped {
                state = state.transition(WaitBehindEvent::ProviderDropped);
            }

            let position = match topology.local() {
                Some(n) if n.node_type.is_root() => target_position,
                Some(n) => n.completed_tick.unwrap_or(0),
                None => 0,
            };
            state = state.transition(WaitBehindEvent::Progress(position));

            if let WaitBehindState::Trailing {
                provider_dropped: true,
                ..
            } = state
            {
                if let Err(e) = switch(topology, store, circuit, &subscriber).await {
                    waits.insert(subscriber, state);
                    return Err(e);
                }
                state = state.transition(WaitBehindEvent::GapSwitchDone);
                if let WaitBehindState::Switched { position, gap: true } = state {
                    warn!(
                        subscriber = %subscriber,
                        old_provider = %target,
                        reached = position,
                        target = target_position,
                        "Old provider gone before catch-up: data continuity gap"
                    );
                    metrics::record_continuity_gap(&local);
                }
            }
        }

        if matches!(state, WaitBehindState::CaughtUp { .. }) {
            if let Err(e) = switch(topology, store, circuit, &subscriber).await {
                if state.label() != before {
                    metrics::record_wait_behind_transition(&local, state.label());
                }
                waits.insert(subscriber, state);
                return Err(e);
            }
            state = state.transition(WaitBehindEvent::SwitchDone);
        }

        if state.label() != before {
            metrics::record_wait_behind_transition(&local, state.label());
        }
        if let WaitBehindState::Switched { position, gap } = state {
            info!(subscriber = %subscriber, position, gap, "Subscriber handed over");
        } else {
            waits.insert(subscriber, state);
        }
    }
    Ok(())
}

/// Record an applied `node-dropped` for `provider` on every hand-over
/// trailing it. The switch itself happens on the next [`drive`].
pub(crate) fn provider_dropped(waits: &mut BTreeMap<String, WaitBehindState>, provider: &str) {
    for (subscriber, state) in waits.iter_mut() {
        if matches!(state, WaitBehindState::Trailing { target_provider, .. } if target_provider == provider) {
            debug!(subscriber = %subscriber, old_provider = %provider, "Old provider dropped");
            *state = state.clone().transition(WaitBehindEvent::ProviderDropped);
        }
    }
}

async fn switch<S: BackingStore>(
    topology: &mut Topology,
    store: &S,
    circuit: &StoreCircuit,
    subscriber: &str,
) -> Result<()> {
    let local = topology.local_name().to_string();
    circuit
        .write("switch_provider", || store.switch_provider(subscriber, &local))
        .await?;
    if topology.contains(subscriber) {
        if let Err(e) = topology.set_provider(subscriber, &local) {
            warn!(subscriber = %subscriber, error = %e, "Switched in store but not in local topology");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitConfig;
    use crate::store::MemoryStore;
    use crate::topology::{Node, NodeType};

    fn trailing(target: Tick) -> WaitBehindState {
        WaitBehindState::NotWaiting.transition(WaitBehindEvent::Begin {
            target_provider: "old".into(),
            catch_up_position: target,
            now: Instant::now(),
        })
    }

    #[test]
    fn test_trails_until_caught_up() {
        let state = trailing(5);
        assert_eq!(state.label(), "trailing");

        let state = state.transition(WaitBehindEvent::Progress(3));
        assert_eq!(state.label(), "trailing");

        let state = state.transition(WaitBehindEvent::Progress(5));
        assert_eq!(
            state,
            WaitBehindState::CaughtUp {
                target_provider: "old".into(),
                position: 5
            }
        );

        let state = state.transition(WaitBehindEvent::SwitchDone);
        assert_eq!(state, WaitBehindState::Switched { position: 5, gap: false });
    }

    #[test]
    fn test_switch_done_ignored_while_trailing() {
        let state = trailing(5).transition(WaitBehindEvent::SwitchDone);
        assert_eq!(state.label(), "trailing");
    }

    #[test]
    fn test_progress_never_moves_back() {
        let state = trailing(10)
            .transition(WaitBehindEvent::Progress(7))
            .transition(WaitBehindEvent::Progress(2));
        match state {
            WaitBehindState::Trailing { reached, .. } => assert_eq!(reached, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dropped_provider_reports_gap() {
        let state = trailing(10)
            .transition(WaitBehindEvent::Progress(6))
            .transition(WaitBehindEvent::ProviderDropped);
        assert_eq!(state.label(), "trailing");

        let state = state.transition(WaitBehindEvent::GapSwitchDone);
        assert_eq!(state, WaitBehindState::Switched { position: 6, gap: true });
    }

    #[test]
    fn test_gap_switch_needs_confirmed_drop() {
        let state = trailing(10)
            .transition(WaitBehindEvent::Progress(6))
            .transition(WaitBehindEvent::GapSwitchDone);
        assert_eq!(state.label(), "trailing");
    }

    #[test]
    fn test_drop_after_catch_up_keeps_waiting_for_switch() {
        let state = trailing(4)
            .transition(WaitBehindEvent::Progress(4))
            .transition(WaitBehindEvent::ProviderDropped)
            .transition(WaitBehindEvent::GapSwitchDone);
        assert_eq!(state.label(), "caught_up");
    }

    #[test]
    fn test_abandon_resets() {
        let state = trailing(4).transition(WaitBehindEvent::Abandon);
        assert_eq!(state, WaitBehindState::NotWaiting);
        assert!(!state.is_active());
    }

    async fn fixture() -> (Topology, MemoryStore) {
        let store = MemoryStore::new();
        store.add_node(Node::new("root", NodeType::Root)).await;
        store
            .add_node(
                Node::new("b1", NodeType::Branch)
                    .with_provider("root")
                    .with_completed_tick(2),
            )
            .await;
        store
            .add_node(
                Node::new("leaf", NodeType::Leaf)
                    .with_provider("root")
                    .with_completed_tick(4),
            )
            .await;

        let mut topo = Topology::new("b1");
        topo.upsert_node(Node::new("root", NodeType::Root)).unwrap();
        topo.upsert_node(
            Node::new("b1", NodeType::Branch)
                .with_provider("root")
                .with_completed_tick(2),
        )
        .unwrap();
        topo.upsert_node(Node::new("leaf", NodeType::Leaf).with_provider("root"))
            .unwrap();
        (topo, store)
    }

    #[tokio::test]
    async fn test_drive_switches_only_after_catch_up() {
        let (mut topo, store) = fixture().await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut waits = BTreeMap::new();

        begin(&mut waits, &mut topo, &store, &circuit, "leaf", "root").await;
        match waits.get("leaf") {
            Some(WaitBehindState::Trailing {
                catch_up_position, ..
            }) => assert_eq!(*catch_up_position, 4),
            other => panic!("unexpected {other:?}"),
        }

        drive(&mut waits, &mut topo, &store, &circuit).await.unwrap();
        assert!(store.switch_calls().await.is_empty());
        assert_eq!(waits["leaf"].label(), "trailing");

        topo.set_completed_tick("b1", 4);
        drive(&mut waits, &mut topo, &store, &circuit).await.unwrap();
        assert_eq!(
            store.switch_calls().await,
            vec![("leaf".to_string(), "b1".to_string())]
        );
        assert!(waits.is_empty());
        assert_eq!(
            topo.get_node("leaf").unwrap().provider_node.as_deref(),
            Some("b1")
        );
    }

    #[tokio::test]
    async fn test_drive_gap_path_when_old_provider_removed() {
        let (mut topo, store) = fixture().await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut waits = BTreeMap::new();

        begin(&mut waits, &mut topo, &store, &circuit, "leaf", "root").await;
        topo.remove_node("root");
        store.remove_node("root").await;
        drive(&mut waits, &mut topo, &store, &circuit).await.unwrap();

        assert!(waits.is_empty());
        assert_eq!(store.switch_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_drive_gap_path_after_applied_drop() {
        let (mut topo, store) = fixture().await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut waits = BTreeMap::new();

        begin(&mut waits, &mut topo, &store, &circuit, "leaf", "root").await;
        topo.remove_node("root");
        provider_dropped(&mut waits, "root");
        store.set_unreachable("root", true).await;
        drive(&mut waits, &mut topo, &store, &circuit).await.unwrap();

        assert!(waits.is_empty());
        assert_eq!(
            store.switch_calls().await,
            vec![("leaf".to_string(), "b1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_lookup_of_old_provider_keeps_trailing() {
        let (mut topo, store) = fixture().await;
        store
            .add_node(
                Node::new("b2", NodeType::Branch)
                    .with_provider("root")
                    .with_completed_tick(9),
            )
            .await;
        store
            .add_node(Node::new("leaf2", NodeType::Leaf).with_provider("b2").with_completed_tick(9))
            .await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut waits = BTreeMap::new();

        store.fail_next("get_node_info", 1).await;
        begin(&mut waits, &mut topo, &store, &circuit, "leaf2", "b2").await;
        assert!(!topo.contains("b2"));

        drive(&mut waits, &mut topo, &store, &circuit).await.unwrap();
        assert!(store.switch_calls().await.is_empty());
        assert!(topo.contains("b2"));
        match &waits["leaf2"] {
            WaitBehindState::Trailing {
                catch_up_position,
                provider_dropped,
                ..
            } => {
                assert_eq!(*catch_up_position, 9);
                assert!(!provider_dropped);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_switch_is_retried() {
        let (mut topo, store) = fixture().await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut waits = BTreeMap::new();

        begin(&mut waits, &mut topo, &store, &circuit, "leaf", "root").await;
        topo.set_completed_tick("b1", 9);
        store.fail_next("switch_provider", 1).await;

        assert!(drive(&mut waits, &mut topo, &store, &circuit).await.is_err());
        assert_eq!(waits["leaf"].label(), "caught_up");

        drive(&mut waits, &mut topo, &store, &circuit).await.unwrap();
        assert!(waits.is_empty());
        assert_eq!(store.switch_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_begin_coalesces() {
        let (mut topo, store) = fixture().await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut waits = BTreeMap::new();

        begin(&mut waits, &mut topo, &store, &circuit, "leaf", "root").await;
        let first = waits["leaf"].clone();
        begin(&mut waits, &mut topo, &store, &circuit, "leaf", "root").await;
        assert_eq!(waits["leaf"], first);
    }

    #[tokio::test]
    async fn test_begin_loads_unknown_old_provider() {
        let (mut topo, store) = fixture().await;
        store
            .add_node(
                Node::new("b2", NodeType::Branch)
                    .with_provider("root")
                    .with_completed_tick(3),
            )
            .await;
        store
            .add_node(Node::new("leaf2", NodeType::Leaf).with_provider("b2").with_completed_tick(3))
            .await;
        let circuit = StoreCircuit::new(CircuitConfig::testing());
        let mut waits = BTreeMap::new();

        begin(&mut waits, &mut topo, &store, &circuit, "leaf2", "b2").await;
        assert!(topo.contains("b2"));

        drive(&mut waits, &mut topo, &store, &circuit).await.unwrap();
        assert_eq!(waits["leaf2"].label(), "trailing");
        assert!(store.switch_calls().await.is_empty());
    }
}
