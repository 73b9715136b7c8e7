// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory model of the cascade tree.
//!
//! A [`Topology`] is an arena of [`Node`]s keyed by name and owned by the
//! worker of exactly one local node. Provider links are plain names, never
//! references, and every mutation that touches a link is validated before
//! it is committed:
//!
//! - no node reads from itself
//! - no provider chain loops back to the node being changed
//! - `combined_queue` / `combined_type` agree with `node_type`
//!
//! # Combined Sets
//!
//! Merge points aggregate the watermarks of the branches feeding one
//! combined queue. The effective watermark of a combined queue is the
//! minimum over its current members and never regresses:
//!
//! ```text
//! member reports:   B=40  B2=35        effective = 35
//! B2 reports 30     (regression)       ignored, effective = 35
//! B3 joins          (seeded at 35)     effective = 35
//! B2 leaves                            effective = min(40, 35) = 35
//! ```
//!
//! A member joining an existing set is seeded at the current effective
//! watermark so the minimum cannot step backwards.

use crate::error::{CascadeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

/// Queue position (tick id). Monotonic per queue.
pub type Tick = u64;

/// Role of a node in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Root,
    Branch,
    Leaf,
    MergeLeaf,
    MergeBranch,
    CombinedRoot,
    CombinedBranch,
}

impl NodeType {
    /// Roots have no provider and never fetch.
    pub fn is_root(self) -> bool {
        matches!(self, NodeType::Root | NodeType::CombinedRoot)
    }

    /// Merge nodes feed a combined queue from one part queue.
    pub fn is_merge(self) -> bool {
        matches!(self, NodeType::MergeLeaf | NodeType::MergeBranch)
    }

    /// Nodes living on a combined queue.
    pub fn is_combined(self) -> bool {
        matches!(self, NodeType::CombinedRoot | NodeType::CombinedBranch)
    }

    /// Wire name (`merge-leaf`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Root => "root",
            NodeType::Branch => "branch",
            NodeType::Leaf => "leaf",
            NodeType::MergeLeaf => "merge-leaf",
            NodeType::MergeBranch => "merge-branch",
            NodeType::CombinedRoot => "combined-root",
            NodeType::CombinedBranch => "combined-branch",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "root" => Some(NodeType::Root),
            "branch" => Some(NodeType::Branch),
            "leaf" => Some(NodeType::Leaf),
            "merge-leaf" => Some(NodeType::MergeLeaf),
            "merge-branch" => Some(NodeType::MergeBranch),
            "combined-root" => Some(NodeType::CombinedRoot),
            "combined-branch" => Some(NodeType::CombinedBranch),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a node within a combined set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinedType {
    /// Source branch feeding the combined queue.
    Part,
    /// Node consuming or serving the combined stream.
    Full,
}

/// One replication participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_name: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub provider_node: Option<String>,
    #[serde(default)]
    pub worker_name: String,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub is_dead: bool,
    #[serde(default)]
    pub combined_queue: Option<String>,
    #[serde(default)]
    pub combined_type: Option<CombinedType>,
    /// Position up to which everything is applied downstream of this node.
    #[serde(default)]
    pub watermark: Tick,
    /// Last tick the node's worker finished, if it ever finished one.
    #[serde(default)]
    pub completed_tick: Option<Tick>,
}

impl Node {
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            node_name: name.into(),
            node_type,
            provider_node: None,
            worker_name: String::new(),
            is_paused: false,
            is_dead: false,
            combined_queue: None,
            combined_type: None,
            watermark: 0,
            completed_tick: None,
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider_node = Some(provider.into());
        self
    }

    #[must_use]
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker_name = worker.into();
        self
    }

    #[must_use]
    pub fn with_combined(mut self, queue: impl Into<String>, combined_type: CombinedType) -> Self {
        self.combined_queue = Some(queue.into());
        self.combined_type = Some(combined_type);
        self
    }

    #[must_use]
    pub fn with_watermark(mut self, watermark: Tick) -> Self {
        self.watermark = watermark;
        self
    }

    #[must_use]
    pub fn with_completed_tick(mut self, tick: Tick) -> Self {
        self.completed_tick = Some(tick);
        self
    }

    /// Name of the combined queue this node feeds as a part, if any.
    pub fn part_of(&self) -> Option<&str> {
        match self.combined_type {
            Some(CombinedType::Part) => self.combined_queue.as_deref(),
            _ => None,
        }
    }

    /// Check `combined_queue` / `combined_type` against `node_type`.
    pub fn validate_combined(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(CascadeError::CombinedMembership {
                node: self.node_name.clone(),
                reason: reason.to_string(),
            })
        };

        match (&self.combined_queue, self.combined_type) {
            (Some(_), None) => return fail("combined_queue set without combined_type"),
            (None, Some(_)) => return fail("combined_type set without combined_queue"),
            (Some(q), Some(_)) if q.is_empty() => return fail("empty combined_queue"),
            _ => {}
        }

        if self.node_type.is_merge() && self.combined_type != Some(CombinedType::Full) {
            return fail("merge nodes must be full members of a combined queue");
        }

        match self.combined_type {
            Some(CombinedType::Full) if !(self.node_type.is_merge() || self.node_type.is_combined()) => {
                fail("only merge or combined nodes can be full members")
            }
            Some(CombinedType::Part)
                if !matches!(self.node_type, NodeType::Root | NodeType::Branch | NodeType::Leaf) =>
            {
                fail("only root, branch or leaf nodes can be part members")
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of reporting a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkUpdate {
    Advanced { from: Tick, to: Tick },
    Unchanged,
    /// The report was older than what is already known; kept `current`.
    Regressed { current: Tick, reported: Tick },
}

/// Members of one combined queue and their reported watermarks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CombinedSet {
    members: BTreeMap<String, Tick>,
    effective: Option<Tick>,
}

impl CombinedSet {
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn member_watermark(&self, name: &str) -> Option<Tick> {
        self.members.get(name).copied()
    }

    pub fn effective(&self) -> Option<Tick> {
        self.effective
    }

    fn add(&mut self, name: &str, reported: Tick) {
        if self.members.contains_key(name) {
            return;
        }
        let seed = match self.effective {
            Some(floor) => reported.max(floor),
            None => reported,
        };
        self.members.insert(name.to_string(), seed);
        self.renormalize();
    }

    fn remove(&mut self, name: &str) -> bool {
        // Recompute before dropping so the floor reflects the full set.
        self.renormalize();
        let removed = self.members.remove(name).is_some();
        if removed {
            self.renormalize();
        }
        removed
    }

    fn report(&mut self, name: &str, tick: Tick) -> WatermarkUpdate {
        let Some(current) = self.members.get_mut(name) else {
            return WatermarkUpdate::Unchanged;
        };
        if tick < *current {
            return WatermarkUpdate::Regressed {
                current: *current,
                reported: tick,
            };
        }
        if tick == *current {
            return WatermarkUpdate::Unchanged;
        }
        let from = *current;
        *current = tick;
        self.renormalize();
        WatermarkUpdate::Advanced { from, to: tick }
    }

    fn renormalize(&mut self) {
        // Empty set plateaus at the last value.
        if let Some(min) = self.members.values().copied().min() {
            self.effective = Some(match self.effective {
                Some(prev) => prev.max(min),
                None => min,
            });
        }
    }
}

/// Tree of nodes as seen by one local node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    local_node: String,
    nodes: BTreeMap<String, Node>,
    combined: BTreeMap<String, CombinedSet>,
}

impl Topology {
    /// Empty topology owned by `local_node`.
    pub fn new(local_node: impl Into<String>) -> Self {
        Self {
            local_node: local_node.into(),
            nodes: BTreeMap::new(),
            combined: BTreeMap::new(),
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_node
    }

    pub fn local(&self) -> Option<&Node> {
        self.nodes.get(&self.local_node)
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert or replace a node after validating it.
    ///
    /// Watermarks only move forward: replacing a node keeps the higher of
    /// the stored and the incoming watermark.
    pub fn upsert_node(&mut self, mut node: Node) -> Result<()> {
        node.validate_combined()?;
        if let Some(provider) = node.provider_node.as_deref() {
            self.check_link(&node.node_name, provider)?;
        }

        let previous = self.nodes.get(&node.node_name);
        if let Some(prev) = previous {
            node.watermark = node.watermark.max(prev.watermark);
            if let (Some(old), Some(new)) = (prev.completed_tick, node.completed_tick) {
                node.completed_tick = Some(old.max(new));
            } else if node.completed_tick.is_none() {
                node.completed_tick = prev.completed_tick;
            }
            if let Some(old_queue) = prev.part_of() {
                if node.part_of() != Some(old_queue) {
                    let old_queue = old_queue.to_string();
                    if let Some(set) = self.combined.get_mut(&old_queue) {
                        set.remove(&node.node_name);
                    }
                }
            }
        }

        if let Some(queue) = node.part_of() {
            self.combined
                .entry(queue.to_string())
                .or_default()
                .add(&node.node_name, node.watermark);
        }

        debug!(node = %node.node_name, node_type = %node.node_type, "Upserted node");
        self.nodes.insert(node.node_name.clone(), node);
        Ok(())
    }

    /// Remove a node; its combined-set membership goes with it.
    pub fn remove_node(&mut self, name: &str) -> Option<Node> {
        let node = self.nodes.remove(name)?;
        for set in self.combined.values_mut() {
            set.remove(name);
        }
        debug!(node = %name, "Removed node");
        Some(node)
    }

    /// The provider of `name`, if it is known and alive.
    pub fn resolve_provider(&self, name: &str) -> Result<&Node> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| CascadeError::NodeNotFound(name.to_string()))?;
        let provider = node.provider_node.as_deref().unwrap_or("");
        match self.nodes.get(provider) {
            Some(p) if !p.is_dead => Ok(p),
            _ => Err(CascadeError::UnresolvedProvider {
                node: name.to_string(),
                provider: provider.to_string(),
            }),
        }
    }

    /// Re-point `name` at `provider`, rejecting self links and cycles.
    pub fn set_provider(&mut self, name: &str, provider: &str) -> Result<()> {
        self.check_link(name, provider)?;
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| CascadeError::NodeNotFound(name.to_string()))?;
        node.provider_node = Some(provider.to_string());
        Ok(())
    }

    /// Drop the provider link and make the node a root of its kind.
    pub fn promote_root(&mut self, name: &str) -> Result<()> {
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| CascadeError::NodeNotFound(name.to_string()))?;
        node.provider_node = None;
        node.node_type = if node.node_type.is_combined() {
            NodeType::CombinedRoot
        } else {
            NodeType::Root
        };
        Ok(())
    }

    /// Walk up from `provider`; fail if the chain reaches `node`.
    ///
    /// The walk is bounded by the number of known nodes, so a cycle that
    /// does not involve `node` is reported too instead of looping.
    fn check_link(&self, node: &str, provider: &str) -> Result<()> {
        if node == provider {
            return Err(CascadeError::SelfProvider(node.to_string()));
        }
        let mut current = Some(provider);
        let mut steps = 0usize;
        while let Some(name) = current {
            if name == node || steps > self.nodes.len() {
                warn!(node = %node, provider = %provider, "Provider link would create a cycle");
                return Err(CascadeError::CycleDetected {
                    node: node.to_string(),
                    provider: provider.to_string(),
                });
            }
            steps += 1;
            current = self
                .nodes
                .get(name)
                .and_then(|n| n.provider_node.as_deref());
        }
        Ok(())
    }

    pub fn set_paused(&mut self, name: &str, paused: bool) -> bool {
        match self.nodes.get_mut(name) {
            Some(node) => {
                node.is_paused = paused;
                true
            }
            None => false,
        }
    }

    pub fn set_dead(&mut self, name: &str, dead: bool) -> bool {
        match self.nodes.get_mut(name) {
            Some(node) => {
                node.is_dead = dead;
                true
            }
            None => false,
        }
    }

    pub fn set_worker(&mut self, name: &str, worker: &str) -> bool {
        match self.nodes.get_mut(name) {
            Some(node) => {
                node.worker_name = worker.to_string();
                true
            }
            None => false,
        }
    }

    /// Record the tick a node finished. Never moves backwards.
    pub fn set_completed_tick(&mut self, name: &str, tick: Tick) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.completed_tick = Some(node.completed_tick.map_or(tick, |t| t.max(tick)));
        }
    }

    /// Overwrite the completed tick, backwards included. Only an operator
    /// reset does this.
    pub fn reset_completed_tick(&mut self, name: &str, tick: Tick) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.completed_tick = Some(tick);
        }
    }

    /// Report a node's watermark; regressions are ignored.
    pub fn update_watermark(&mut self, name: &str, tick: Tick) -> WatermarkUpdate {
        let mut outcome = WatermarkUpdate::Unchanged;
        if let Some(node) = self.nodes.get_mut(name) {
            outcome = if tick > node.watermark {
                let from = node.watermark;
                node.watermark = tick;
                WatermarkUpdate::Advanced { from, to: tick }
            } else if tick < node.watermark {
                WatermarkUpdate::Regressed {
                    current: node.watermark,
                    reported: tick,
                }
            } else {
                WatermarkUpdate::Unchanged
            };
        }
        for set in self.combined.values_mut() {
            let set_outcome = set.report(name, tick);
            if outcome == WatermarkUpdate::Unchanged {
                outcome = set_outcome;
            }
        }
        outcome
    }

    /// Replace the member list of a combined queue.
    ///
    /// New members are added (and seeded) before departing ones are
    /// removed so the set is never aggregated over a half-updated list.
    pub fn set_members(&mut self, queue: &str, members: &[String]) {
        let seeds: Vec<(String, Tick)> = members
            .iter()
            .map(|m| (m.clone(), self.nodes.get(m).map_or(0, |n| n.watermark)))
            .collect();
        let set = self.combined.entry(queue.to_string()).or_default();
        for (name, watermark) in &seeds {
            set.add(name, *watermark);
        }
        let keep: BTreeSet<&str> = members.iter().map(String::as_str).collect();
        let departing: Vec<String> = set
            .members()
            .filter(|m| !keep.contains(m))
            .map(str::to_string)
            .collect();
        for name in departing {
            set.remove(&name);
        }
    }

    pub fn combined_set(&self, queue: &str) -> Option<&CombinedSet> {
        self.combined.get(queue)
    }

    pub fn combined_queues(&self) -> impl Iterator<Item = (&str, &CombinedSet)> {
        self.combined.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Minimum watermark over the members of `queue`.
    pub fn compute_effective_watermark(&self, queue: &str) -> Option<Tick> {
        self.combined.get(queue).and_then(CombinedSet::effective)
    }

    /// Nodes reading from `name`, sorted by name.
    pub fn subscribers_of(&self, name: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.provider_node.as_deref() == Some(name))
            .map(|n| n.node_name.clone())
            .collect()
    }

    /// Merge workers whose aggregation depends on any of `nodes`.
    ///
    /// That is merge nodes among `nodes` themselves plus the full members
    /// of every combined queue one of `nodes` feeds.
    pub fn merge_workers_for(&self, nodes: &[String]) -> Vec<String> {
        let mut affected_queues = BTreeSet::new();
        for name in nodes {
            for (queue, set) in &self.combined {
                if set.contains(name) {
                    affected_queues.insert(queue.as_str());
                }
            }
        }

        let mut result = BTreeSet::new();
        for node in self.nodes.values() {
            let direct = node.node_type.is_merge() && nodes.contains(&node.node_name);
            let aggregating = node.node_type.is_merge()
                && node
                    .combined_queue
                    .as_deref()
                    .is_some_and(|q| affected_queues.contains(q));
            if direct || aggregating {
                result.insert(node.node_name.clone());
            }
        }
        result.into_iter().collect()
    }

    /// Highest watermark among `nodes` that are known.
    pub fn max_watermark_of(&self, nodes: &[String]) -> Option<Tick> {
        nodes
            .iter()
            .filter_map(|n| self.nodes.get(n))
            .map(|n| n.watermark.max(n.completed_tick.unwrap_or(0)))
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Topology {
        let mut topo = Topology::new("b1");
        topo.upsert_node(Node::new("root", NodeType::Root)).unwrap();
        topo.upsert_node(Node::new("b1", NodeType::Branch).with_provider("root"))
            .unwrap();
        topo.upsert_node(Node::new("leaf", NodeType::Leaf).with_provider("b1"))
            .unwrap();
        topo
    }

    #[test]
    fn test_node_type_wire_names() {
        for t in [
            NodeType::Root,
            NodeType::Branch,
            NodeType::Leaf,
            NodeType::MergeLeaf,
            NodeType::MergeBranch,
            NodeType::CombinedRoot,
            NodeType::CombinedBranch,
        ] {
            assert_eq!(NodeType::parse(t.as_str()), Some(t));
        }
        assert_eq!(NodeType::parse("dead"), None);
        let json = serde_json::to_string(&NodeType::MergeLeaf).unwrap();
        assert_eq!(json, "\"merge-leaf\"");
    }

    #[test]
    fn test_self_provider_rejected() {
        let mut topo = tree();
        let err = topo
            .upsert_node(Node::new("x", NodeType::Branch).with_provider("x"))
            .unwrap_err();
        assert!(matches!(err, CascadeError::SelfProvider(_)));
        assert!(!topo.contains("x"));
    }

    #[test]
    fn test_cycle_rejected_before_commit() {
        let mut topo = tree();
        // root -> b1 -> leaf, make root read from leaf
        let err = topo
            .upsert_node(Node::new("root", NodeType::Branch).with_provider("leaf"))
            .unwrap_err();
        assert!(matches!(err, CascadeError::CycleDetected { .. }));
        assert_eq!(topo.get_node("root").unwrap().provider_node, None);

        let err = topo.set_provider("b1", "leaf").unwrap_err();
        assert!(matches!(err, CascadeError::CycleDetected { .. }));
        assert_eq!(
            topo.get_node("b1").unwrap().provider_node.as_deref(),
            Some("root")
        );
    }

    #[test]
    fn test_resolve_provider() {
        let mut topo = tree();
        assert_eq!(topo.resolve_provider("b1").unwrap().node_name, "root");
        assert!(matches!(
            topo.resolve_provider("root"),
            Err(CascadeError::UnresolvedProvider { .. })
        ));

        topo.set_dead("root", true);
        assert!(topo.resolve_provider("b1").is_err());

        topo.remove_node("root");
        let err = topo.resolve_provider("b1").unwrap_err();
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn test_subscribers_of() {
        let mut topo = tree();
        topo.upsert_node(Node::new("b2", NodeType::Branch).with_provider("root"))
            .unwrap();
        assert_eq!(topo.subscribers_of("root"), vec!["b1", "b2"]);
        assert_eq!(topo.subscribers_of("leaf"), Vec::<String>::new());
    }

    #[test]
    fn test_combined_validation() {
        let bad = Node::new("m", NodeType::MergeLeaf);
        assert!(bad.validate_combined().is_err());

        let bad = Node::new("m", NodeType::MergeLeaf).with_combined("q", CombinedType::Part);
        assert!(bad.validate_combined().is_err());

        let bad = Node::new("b", NodeType::Branch).with_combined("q", CombinedType::Full);
        assert!(bad.validate_combined().is_err());

        let mut half = Node::new("b", NodeType::Branch);
        half.combined_queue = Some("q".into());
        assert!(half.validate_combined().is_err());

        let ok = Node::new("m", NodeType::MergeLeaf).with_combined("q", CombinedType::Full);
        assert!(ok.validate_combined().is_ok());
    }

    #[test]
    fn test_watermark_never_regresses() {
        let mut topo = tree();
        assert_eq!(
            topo.update_watermark("b1", 10),
            WatermarkUpdate::Advanced { from: 0, to: 10 }
        );
        assert_eq!(
            topo.update_watermark("b1", 5),
            WatermarkUpdate::Regressed {
                current: 10,
                reported: 5
            }
        );
        assert_eq!(topo.update_watermark("b1", 10), WatermarkUpdate::Unchanged);
        assert_eq!(topo.get_node("b1").unwrap().watermark, 10);

        // Upsert with an older record keeps the newer watermark.
        topo.upsert_node(
            Node::new("b1", NodeType::Branch)
                .with_provider("root")
                .with_watermark(3),
        )
        .unwrap();
        assert_eq!(topo.get_node("b1").unwrap().watermark, 10);
    }

    #[test]
    fn test_effective_watermark_is_member_minimum() {
        let mut topo = Topology::new("m");
        topo.upsert_node(
            Node::new("b1", NodeType::Branch).with_combined("cq", CombinedType::Part).with_watermark(40),
        )
        .unwrap();
        topo.upsert_node(
            Node::new("b2", NodeType::Branch).with_combined("cq", CombinedType::Part).with_watermark(35),
        )
        .unwrap();
        assert_eq!(topo.compute_effective_watermark("cq"), Some(35));

        topo.update_watermark("b2", 30);
        assert_eq!(topo.compute_effective_watermark("cq"), Some(35));

        topo.update_watermark("b2", 50);
        assert_eq!(topo.compute_effective_watermark("cq"), Some(40));
        assert_eq!(topo.compute_effective_watermark("missing"), None);
    }

    #[test]
    fn test_new_member_seeded_at_effective() {
        let mut topo = Topology::new("m");
        topo.set_members("cq", &["b1".to_string(), "b2".to_string()]);
        topo.update_watermark("b1", 20);
        topo.update_watermark("b2", 25);
        assert_eq!(topo.compute_effective_watermark("cq"), Some(20));

        topo.set_members("cq", &["b1".into(), "b2".into(), "b3".into()]);
        let set = topo.combined_set("cq").unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.member_watermark("b3"), Some(20));
        assert_eq!(topo.compute_effective_watermark("cq"), Some(20));

        topo.set_members("cq", &["b2".into()]);
        assert_eq!(topo.compute_effective_watermark("cq"), Some(25));
    }

    #[test]
    fn test_removed_member_leaves_set() {
        let mut topo = Topology::new("m");
        topo.upsert_node(
            Node::new("b1", NodeType::Branch).with_combined("cq", CombinedType::Part).with_watermark(5),
        )
        .unwrap();
        topo.upsert_node(
            Node::new("b2", NodeType::Branch).with_combined("cq", CombinedType::Part).with_watermark(9),
        )
        .unwrap();
        topo.remove_node("b1");
        assert_eq!(topo.combined_set("cq").unwrap().len(), 1);
        assert_eq!(topo.compute_effective_watermark("cq"), Some(9));

        // Empty set plateaus.
        topo.remove_node("b2");
        assert_eq!(topo.compute_effective_watermark("cq"), Some(9));
    }

    #[test]
    fn test_merge_workers_for() {
        let mut topo = Topology::new("r2");
        topo.upsert_node(Node::new("r", NodeType::Root)).unwrap();
        topo.upsert_node(
            Node::new("b", NodeType::Branch)
                .with_provider("r")
                .with_combined("cq", CombinedType::Part),
        )
        .unwrap();
        topo.upsert_node(
            Node::new("m", NodeType::MergeLeaf)
                .with_provider("b")
                .with_combined("cq", CombinedType::Full),
        )
        .unwrap();
        topo.upsert_node(Node::new("leaf", NodeType::Leaf).with_provider("r"))
            .unwrap();

        assert_eq!(topo.merge_workers_for(&["b".into()]), vec!["m"]);
        assert!(topo.merge_workers_for(&["leaf".into()]).is_empty());
        assert_eq!(topo.merge_workers_for(&["m".into()]), vec!["m"]);
    }

    #[test]
    fn test_promote_root() {
        let mut topo = tree();
        topo.promote_root("b1").unwrap();
        let b1 = topo.get_node("b1").unwrap();
        assert_eq!(b1.node_type, NodeType::Root);
        assert_eq!(b1.provider_node, None);
    }

    #[test]
    fn test_completed_tick_monotonic() {
        let mut topo = tree();
        topo.set_completed_tick("b1", 10);
        topo.set_completed_tick("b1", 7);
        assert_eq!(topo.get_node("b1").unwrap().completed_tick, Some(10));
    }
}
