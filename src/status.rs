// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only tree view of a topology snapshot.
//!
//! Nodes whose provider is missing from the snapshot (or who have none)
//! become roots. Children are ordered by `(levels, total_children, name)`
//! so shallow, small subtrees print first.
//!
//! ```text
//! r1 (root)
//! |  Watermark: 12, Tick: 14
//! +-- b2 (branch)
//! |      Watermark: 12, Tick: 14
//! `-- b1 (branch)
//!     |  Watermark: 10, Tick: 13, PAUSED
//!     `-- l1 (leaf)
//!            Watermark: 10, Tick: 12, NOT UPTODATE
//!            ERR: handler failed
//! ```

use crate::topology::{Node, NodeType, Tick, Topology};
use crate::worker::NodeStatus;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One node of the status tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    pub node_type: NodeType,
    pub watermark: Tick,
    pub completed_tick: Option<Tick>,
    pub paused: bool,
    pub dead: bool,
    pub uptodate: bool,
    pub error: Option<String>,
    /// Height of the subtree, a leaf counts 1.
    pub levels: usize,
    /// Descendants at any depth.
    pub total_children: usize,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn from_node(node: &Node) -> Self {
        Self {
            name: node.node_name.clone(),
            node_type: node.node_type,
            watermark: node.watermark,
            completed_tick: node.completed_tick,
            paused: node.is_paused,
            dead: node.is_dead,
            uptodate: true,
            error: None,
            levels: 1,
            total_children: 0,
            children: Vec::new(),
        }
    }

    pub fn title(&self) -> String {
        format!("{} ({})", self.name, self.node_type)
    }

    /// Status lines printed under the title.
    pub fn info_lines(&self) -> Vec<String> {
        let mut line = format!("Watermark: {}", self.watermark);
        if let Some(tick) = self.completed_tick {
            line.push_str(&format!(", Tick: {tick}"));
        }
        if self.paused {
            line.push_str(", PAUSED");
        }
        if self.dead {
            line.push_str(", DEAD");
        }
        if !self.uptodate {
            line.push_str(", NOT UPTODATE");
        }

        let mut lines = vec![line];
        if let Some(err) = &self.error {
            lines.push(format!("ERR: {}", err.lines().next().unwrap_or_default()));
        }
        lines
    }

    fn sort_key(&self) -> (usize, usize, &str) {
        (self.levels, self.total_children, self.name.as_str())
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut TreeNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(name))
    }
}

/// Forest of provider trees.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologyTree {
    roots: Vec<TreeNode>,
}

impl TopologyTree {
    pub fn build(topology: &Topology) -> Self {
        let mut children: BTreeMap<&str, Vec<&Node>> = BTreeMap::new();
        let mut top: Vec<&Node> = Vec::new();

        for node in topology.nodes() {
            match node.provider_node.as_deref() {
                Some(p)
                    if !node.node_type.is_root() && p != node.node_name && topology.contains(p) =>
                {
                    children.entry(p).or_default().push(node);
                }
                _ => top.push(node),
            }
        }

        let mut placed = BTreeSet::new();
        let mut roots: Vec<TreeNode> = top
            .into_iter()
            .map(|n| grow(n, &children, &mut placed))
            .collect();

        // Nodes on a provider loop never reach a root; show them flat.
        for node in topology.nodes() {
            if !placed.contains(node.node_name.as_str()) {
                roots.push(grow(node, &BTreeMap::new(), &mut placed));
            }
        }

        roots.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self { roots }
    }

    /// Attach worker status (up-to-date flag, last error) to its node.
    #[must_use]
    pub fn with_status(mut self, status: &NodeStatus) -> Self {
        if let Some(node) = self.roots.iter_mut().find_map(|r| r.find_mut(&status.node)) {
            node.uptodate = status.uptodate;
            node.error = status.last_error.clone();
        }
        self
    }

    pub fn roots(&self) -> &[TreeNode] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for root in &self.roots {
            render_node(root, "", None, &mut out);
        }
        out
    }
}

impl fmt::Display for TopologyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn grow<'a>(
    node: &'a Node,
    children: &BTreeMap<&str, Vec<&'a Node>>,
    placed: &mut BTreeSet<&'a str>,
) -> TreeNode {
    placed.insert(node.node_name.as_str());
    let mut tree = TreeNode::from_node(node);

    for child in children.get(node.node_name.as_str()).into_iter().flatten() {
        if placed.contains(child.node_name.as_str()) {
            continue;
        }
        let sub = grow(child, children, placed);
        tree.total_children += 1 + sub.total_children;
        tree.levels = tree.levels.max(sub.levels + 1);
        tree.children.push(sub);
    }
    tree.children.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    tree
}

/// `last` is `None` for a root.
fn render_node(node: &TreeNode, prefix: &str, last: Option<bool>, out: &mut String) {
    let (branch, indent) = match last {
        None => ("", ""),
        Some(false) => ("+-- ", "|   "),
        Some(true) => ("`-- ", "    "),
    };
    out.push_str(&format!("{prefix}{branch}{}\n", node.title()));

    let child_prefix = format!("{prefix}{indent}");
    let bar = if node.children.is_empty() { ' ' } else { '|' };
    for line in node.info_lines() {
        out.push_str(&format!("{child_prefix}{bar}  {line}\n"));
    }

    let count = node.children.len();
    for (i, child) in node.children.iter().enumerate() {
        render_node(child, &child_prefix, Some(i + 1 == count), out);
    }
}
