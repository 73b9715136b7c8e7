// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Control-event interpreter.
//!
//! Applies decoded [`ControlEvent`]s to a [`Topology`] and reports what the
//! Consumer Loop has to do about it. The interpreter never talks to the
//! store: anything that needs I/O (takeover, wait-behind, a provider
//! switch) comes back as an [`AppliedEffect`] for the loop to act on.
//!
//! # Effects
//!
//! ```text
//! node-created     → NodeUpserted
//! node-dropped     → NodeRemoved | NodeLost (provider or replacement is us) | LocalNodeDropped
//! provider-switch  → ProviderUpdated | ProviderSwitchPending (we move) | SubscriberSwitch (moves to us)
//! member-update    → MembersUpdated
//! tag-switch       → WorkerUpdated | Relinquish | Acquire
//! pause / resume   → LocalPaused / LocalResumed | FlagUpdated
//! watermark        → WatermarkAdvanced | WatermarkIgnored
//! unknown kind     → Ignored
//! ```
//!
//! Control events may be redelivered (a batch whose handler failed is
//! fetched again), so every kind is idempotent.

use crate::error::Result;
use crate::event::{Batch, ControlEvent};
use crate::topology::{Node, Tick, Topology, WatermarkUpdate};
use tracing::{debug, info, warn};

/// What applying one control event means for the local worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedEffect {
    NoOp,
    NodeUpserted(String),
    NodeRemoved(String),
    /// A dropped node that matters locally: it was our provider, or we are
    /// named as its replacement. `dead` is the record before removal.
    NodeLost {
        dead: Node,
        subscribers: Vec<String>,
        replacement: Option<String>,
        was_provider: bool,
    },
    /// The local node itself was dropped.
    LocalNodeDropped,
    ProviderUpdated { node: String, provider: String },
    /// The local node moves to `new` once `new` is resolvable and caught up.
    ProviderSwitchPending { old: String, new: String },
    /// `subscriber` moves from `old` to the local node.
    SubscriberSwitch { subscriber: String, old: String },
    MembersUpdated { combined_queue: String, effective: Option<Tick> },
    WorkerUpdated { node: String, worker: String },
    /// This worker gives the local node away.
    Relinquish { new_worker: String },
    /// This worker takes the local node over.
    Acquire,
    LocalPaused,
    LocalResumed,
    FlagUpdated { node: String, paused: bool },
    WatermarkAdvanced { node: String, watermark: Tick },
    WatermarkIgnored { node: String, current: Tick, reported: Tick },
    Ignored { kind: String },
}

/// Decode every control event of a batch, in order.
///
/// Runs before anything is applied, so a malformed payload aborts the
/// batch's control processing without leaving half of it applied.
pub fn decode_batch(batch: &Batch) -> Result<Vec<ControlEvent>> {
    let mut decoded = Vec::new();
    for event in &batch.events {
        if let Some(ce) = ControlEvent::decode(event)? {
            decoded.push(ce);
        }
    }
    Ok(decoded)
}

/// Apply one control event to `topology`.
///
/// `worker_name` is this process's worker identity, used for tag-switch.
/// Mutations that would break a topology invariant are rejected with the
/// corresponding protocol error and leave `topology` unchanged.
pub fn apply(event: &ControlEvent, topology: &mut Topology, worker_name: &str) -> Result<AppliedEffect> {
    let local = topology.local_name().to_string();

    let effect = match event {
        ControlEvent::NodeCreated(node) => {
            let mut node = node.clone();
            // A replayed creation record keeps the local provider and pause state.
            if node.node_name == local {
                if let Some(current) = topology.local() {
                    node.provider_node = current.provider_node.clone();
                    node.is_paused = current.is_paused;
                }
            }
            let name = node.node_name.clone();
            topology.upsert_node(node)?;
            AppliedEffect::NodeUpserted(name)
        }

        ControlEvent::NodeDropped(drop) => {
            if drop.node == local {
                topology.remove_node(&local);
                warn!(node = %local, "Local node dropped from cascade");
                return Ok(AppliedEffect::LocalNodeDropped);
            }
            let was_provider = topology
                .local()
                .and_then(|n| n.provider_node.as_deref())
                == Some(drop.node.as_str());
            let subscribers = topology.subscribers_of(&drop.node);
            match topology.remove_node(&drop.node) {
                None => AppliedEffect::NoOp,
                Some(dead) if was_provider || drop.replacement.as_deref() == Some(local.as_str()) => {
                    info!(
                        dead = %drop.node,
                        replacement = ?drop.replacement,
                        was_provider,
                        "Node lost"
                    );
                    AppliedEffect::NodeLost {
                        dead,
                        subscribers,
                        replacement: drop.replacement.clone(),
                        was_provider,
                    }
                }
                Some(_) => AppliedEffect::NodeRemoved(drop.node.clone()),
            }
        }

        ControlEvent::ProviderSwitch(switch) => {
            if switch.node == local {
                let current = topology.local().and_then(|n| n.provider_node.clone());
                if current.as_deref() == Some(switch.new.as_str()) {
                    AppliedEffect::NoOp
                } else if current.as_deref().is_some_and(|c| c != switch.old) {
                    warn!(
                        expected = %switch.old,
                        actual = ?current,
                        new = %switch.new,
                        "Provider switch does not start from current provider, ignored"
                    );
                    AppliedEffect::NoOp
                } else {
                    AppliedEffect::ProviderSwitchPending {
                        old: current.unwrap_or_else(|| switch.old.clone()),
                        new: switch.new.clone(),
                    }
                }
            } else if switch.new == local {
                let already = topology
                    .get_node(&switch.node)
                    .and_then(|n| n.provider_node.as_deref())
                    == Some(local.as_str());
                if already {
                    AppliedEffect::NoOp
                } else {
                    AppliedEffect::SubscriberSwitch {
                        subscriber: switch.node.clone(),
                        old: switch.old.clone(),
                    }
                }
            } else if topology.contains(&switch.node) {
                topology.set_provider(&switch.node, &switch.new)?;
                AppliedEffect::ProviderUpdated {
                    node: switch.node.clone(),
                    provider: switch.new.clone(),
                }
            } else {
                debug!(node = %switch.node, "provider-switch for unknown node");
                AppliedEffect::NoOp
            }
        }

        ControlEvent::MemberUpdate(update) => {
            topology.set_members(&update.combined_queue, &update.members);
            AppliedEffect::MembersUpdated {
                combined_queue: update.combined_queue.clone(),
                effective: topology.compute_effective_watermark(&update.combined_queue),
            }
        }

        ControlEvent::TagSwitch(tag) => {
            topology.set_worker(&tag.node, &tag.new_worker);
            if tag.node != local || tag.old_worker == tag.new_worker {
                AppliedEffect::WorkerUpdated {
                    node: tag.node.clone(),
                    worker: tag.new_worker.clone(),
                }
            } else if tag.old_worker == worker_name {
                AppliedEffect::Relinquish {
                    new_worker: tag.new_worker.clone(),
                }
            } else if tag.new_worker == worker_name {
                AppliedEffect::Acquire
            } else {
                AppliedEffect::WorkerUpdated {
                    node: tag.node.clone(),
                    worker: tag.new_worker.clone(),
                }
            }
        }

        ControlEvent::Pause(target) => {
            topology.set_paused(&target.node, true);
            if target.node == local {
                AppliedEffect::LocalPaused
            } else {
                AppliedEffect::FlagUpdated {
                    node: target.node.clone(),
                    paused: true,
                }
            }
        }

        ControlEvent::Resume(target) => {
            topology.set_paused(&target.node, false);
            if target.node == local {
                AppliedEffect::LocalResumed
            } else {
                AppliedEffect::FlagUpdated {
                    node: target.node.clone(),
                    paused: false,
                }
            }
        }

        ControlEvent::Watermark(report) => match topology.update_watermark(&report.node, report.watermark) {
            WatermarkUpdate::Advanced { to, .. } => AppliedEffect::WatermarkAdvanced {
                node: report.node.clone(),
                watermark: to,
            },
            WatermarkUpdate::Regressed { current, reported } => {
                warn!(
                    node = %report.node,
                    current,
                    reported,
                    "Ignoring regressing watermark"
                );
                crate::metrics::record_watermark_regression(&report.node);
                AppliedEffect::WatermarkIgnored {
                    node: report.node.clone(),
                    current,
                    reported,
                }
            }
            WatermarkUpdate::Unchanged => AppliedEffect::NoOp,
        },

        ControlEvent::Ignored { kind } => {
            info!(kind = %kind, "Skipping unknown control event");
            AppliedEffect::Ignored { kind: kind.clone() }
        }
    };

    Ok(effect)
}
