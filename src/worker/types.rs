// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine and worker state types.
//!
//! # Engine Lifecycle
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (workers spawned)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────────── ShuttingDown
//!
//! Starting ──(invalid config)──→ Failed
//! ```
//!
//! - **Created**: after `CascadeEngine::new()`. Nothing runs.
//! - **Starting**: `start()` called, config validated, workers being spawned.
//! - **Running**: one Consumer Loop per managed node.
//! - **ShuttingDown**: stop signalled; workers finish their current batch.
//! - **Stopped**: every worker exited (or timed out). Safe to drop.
//! - **Failed**: the engine could not start.
//!
//! A single node failing fatally (its record is missing from the store)
//! does not fail the engine; it shows up as [`WorkerState::Failed`] in
//! that node's [`NodeStatus`].

use super::takeover::TakeoverState;
use super::wait_behind::WaitBehindState;
use crate::topology::Tick;
use std::collections::BTreeMap;

/// State of the cascade engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Created,

    /// Validating config and spawning node workers.
    Starting,

    /// Workers running.
    Running,

    /// Shutting down gracefully.
    ///
    /// In-flight batches finish (commit or discard) before workers exit.
    ShuttingDown,

    /// Stopped. Safe to drop.
    Stopped,

    /// Failed to start.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// What one node worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Rebuilding the topology from the store.
    Starting,
    /// Fetching and processing batches.
    Running,
    /// Local node paused; polling the store for resume.
    Paused,
    /// Local node is a root: nothing to fetch.
    Standby,
    /// Provider unknown or dead; polling with backoff.
    WaitingProvider,
    /// Exited after a stop request, shutdown or tag-switch hand-off.
    Stopped,
    /// Exited on a fatal error.
    Failed,
}

impl WorkerState {
    /// Label used for logs and the worker state gauge.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::Standby => "standby",
            WorkerState::WaitingProvider => "waiting_provider",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        }
    }

    /// The worker loop has exited.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one node worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node: String,
    pub state: WorkerState,
    /// Topology has been rebuilt from the store since the worker started.
    pub uptodate: bool,
    pub last_error: Option<String>,
    pub provider: Option<String>,
    pub completed_tick: Option<Tick>,
    pub paused: bool,
    pub takeover: TakeoverState,
    /// Active wait-behinds keyed by the subscriber being handed over.
    pub wait_behind: BTreeMap<String, WaitBehindState>,
}

impl NodeStatus {
    pub(crate) fn starting(node: &str) -> Self {
        Self {
            node: node.to_string(),
            state: WorkerState::Starting,
            uptodate: false,
            last_error: None,
            provider: None,
            completed_tick: None,
            paused: false,
            takeover: TakeoverState::Idle,
            wait_behind: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_copy() {
        let state = EngineState::Failed;
        let copied: EngineState = state;
        assert_eq!(state, copied);
        assert_ne!(EngineState::Created, EngineState::Running);
    }

    #[test]
    fn test_worker_state_labels() {
        assert_eq!(WorkerState::WaitingProvider.to_string(), "waiting_provider");
        assert_eq!(WorkerState::Standby.as_str(), "standby");
        assert!(WorkerState::Failed.is_terminal());
        assert!(WorkerState::Stopped.is_terminal());
        assert!(!WorkerState::Paused.is_terminal());
    }

    #[test]
    fn test_starting_status() {
        let status = NodeStatus::starting("b1");
        assert_eq!(status.node, "b1");
        assert_eq!(status.state, WorkerState::Starting);
        assert!(!status.uptodate);
        assert_eq!(status.takeover, TakeoverState::Idle);
        assert!(status.wait_behind.is_empty());
    }
}
