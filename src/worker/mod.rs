// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cascade engine: one Consumer Loop per managed node.
//!
//! The engine ties together:
//! - The backing store via [`crate::store::BackingStore`], behind circuit breakers
//! - One Consumer Loop task per configured node
//! - The takeover and wait-behind protocols each worker drives between batches
//! - Operator commands and topology snapshots through [`NodeHandle`]
//!
//! # Architecture
//!
//! ```text
//!                     CascadeEngine
//!                          │ start(handler)
//!          ┌───────────────┼───────────────┐
//!          ▼               ▼               ▼
//!     NodeWorker       NodeWorker      NodeWorker      (one tokio task each)
//!      │    ▲           │    ▲          │    ▲
//!      │    │ mpsc      │    │          │    │
//!      │  NodeHandle ───┘    │          │    │         (commands in,
//!      ▼                     ▼          ▼    │          snapshots out via watch)
//!              Arc<S: BackingStore>  ◄───────┘
//! ```
//!
//! Workers share nothing but the store, its circuit breakers and the
//! optional dispatch rate limiter.

mod consumer_loop;
mod handler;
mod takeover;
mod types;
mod wait_behind;

pub use handler::{EventHandler, FnHandler, HandlerError, HandlerFuture, NoOpHandler};
pub use takeover::{RequestOutcome, TakeoverState};
pub use types::{EngineState, NodeStatus, WorkerState};
pub use wait_behind::{WaitBehindEvent, WaitBehindState};

use crate::circuit_breaker::StoreCircuit;
use crate::config::CascadeConfig;
use crate::error::{CascadeError, Result};
use crate::metrics;
use crate::resilience::RateLimiter;
use crate::store::BackingStore;
use crate::topology::{Tick, Topology};
use consumer_loop::{Command, NodeWorker, WorkerChannels, WorkerContext};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COMMAND_CAPACITY: usize = 32;

/// The cascade engine.
///
/// Owns one worker per configured node. Construct with [`new()`](Self::new),
/// then [`start()`](Self::start) with the business-event handler.
pub struct CascadeEngine<S: BackingStore> {
    config: CascadeConfig,

    store: Arc<S>,

    /// Circuit breakers shared by every worker.
    circuit: Arc<StoreCircuit>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    nodes: BTreeMap<String, NodeHandle>,

    worker_handles: Vec<JoinHandle<()>>,
}

impl<S: BackingStore> CascadeEngine<S> {
    /// Create an engine in `Created` state. Nothing runs until
    /// [`start()`](Self::start).
    pub fn new(config: CascadeConfig, store: Arc<S>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let circuit = Arc::new(StoreCircuit::new(config.settings.circuit.circuit_config()));

        Self {
            config,
            store,
            circuit,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            nodes: BTreeMap::new(),
            worker_handles: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn circuit(&self) -> &Arc<StoreCircuit> {
        &self.circuit
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Handle on a managed node. `None` before `start()` or for a node
    /// this engine does not run.
    pub fn node(&self, name: &str) -> Option<NodeHandle> {
        self.nodes.get(name).cloned()
    }

    /// Names of the managed nodes, sorted.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Start one Consumer Loop per configured node.
    pub async fn start<H: EventHandler>(&mut self, handler: H) -> Result<()> {
        self.start_shared(Arc::new(handler)).await
    }

    /// Like [`start()`](Self::start) with a handler the caller keeps a
    /// reference to.
    pub async fn start_shared(&mut self, handler: Arc<dyn EventHandler>) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(CascadeError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            queue = %self.config.queue_name,
            worker = %self.config.worker_name,
            node_count = self.config.nodes.len(),
            "Starting cascade engine"
        );
        let _ = self.state_tx.send(EngineState::Starting);
        metrics::set_engine_state("Starting");

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid configuration");
            let _ = self.state_tx.send(EngineState::Failed);
            metrics::set_engine_state("Failed");
            return Err(e);
        }

        let rate_limiter: Option<Arc<RateLimiter>> =
            self.config.settings.rate_limit.rate_limit_config().map(|cfg| {
                info!(
                    rate_per_sec = cfg.refill_rate,
                    burst = cfg.burst_size,
                    "Rate limiting enabled for dispatch"
                );
                Arc::new(RateLimiter::new(cfg))
            });

        for node_config in self.config.nodes.clone() {
            let name = node_config.node_name.clone();
            let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
            let (topology_tx, topology_rx) = watch::channel(Topology::new(&name));
            let (status_tx, status_rx) = watch::channel(NodeStatus::starting(&name));

            let ctx = WorkerContext {
                store: Arc::clone(&self.store),
                circuit: Arc::clone(&self.circuit),
                handler: Arc::clone(&handler),
                rate_limiter: rate_limiter.clone(),
                settings: self.config.settings.clone(),
                worker_name: self.config.worker_name.clone(),
                designated: node_config.designated_replacement,
            };
            let channels = WorkerChannels {
                commands: commands_rx,
                topology_tx,
                status_tx,
                shutdown_rx: self.shutdown_rx.clone(),
            };
            let worker = NodeWorker::new(&name, ctx, channels);

            let handle = tokio::spawn(async move {
                // Failures are logged and published by the worker itself.
                let _ = worker.run().await;
            });
            info!(node = %name, "Spawned consumer loop");
            self.worker_handles.push(handle);

            self.nodes.insert(
                name.clone(),
                NodeHandle {
                    name,
                    commands: commands_tx,
                    topology_rx,
                    status_rx,
                },
            );
        }

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!(nodes = self.nodes.len(), "Cascade engine running");
        Ok(())
    }

    /// Shutdown gracefully.
    ///
    /// 1. Signal every worker to stop
    /// 2. Wait for in-flight batches to finish (bounded by `stop_drain_timeout`)
    pub async fn shutdown(&mut self) {
        info!("Shutting down cascade engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.worker_handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for workers to finish their batch");
        }

        let drain_timeout = self.config.settings.consumer.stop_drain_duration();
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Worker stopped");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Worker panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Worker timed out during shutdown (batch left open)");
                }
            }
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Cascade engine stopped");
    }
}

/// Operator surface of one managed node.
///
/// Cheap to clone. Commands are queued and executed by the worker between
/// batches; they fail with [`CascadeError::Shutdown`] once the worker has
/// exited.
#[derive(Clone)]
pub struct NodeHandle {
    name: String,
    commands: mpsc::Sender<Command>,
    topology_rx: watch::Receiver<Topology>,
    status_rx: watch::Receiver<NodeStatus>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy of the worker's topology as of its last cycle.
    pub fn get_topology_snapshot(&self) -> Topology {
        self.topology_rx.borrow().clone()
    }

    /// Effective (minimum) watermark of a combined queue, for lag display.
    pub fn get_effective_watermark(&self, combined_queue: &str) -> Option<Tick> {
        self.topology_rx.borrow().compute_effective_watermark(combined_queue)
    }

    pub fn status(&self) -> NodeStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<NodeStatus> {
        self.status_rx.clone()
    }

    /// Take over `dead` with this node as replacement.
    ///
    /// Requesting a takeover already in progress is a no-op.
    pub async fn request_takeover(&self, dead: &str) -> Result<()> {
        if dead == self.name {
            return Err(CascadeError::TakeoverFailed {
                dead: dead.to_string(),
                replacement: self.name.clone(),
                reason: "a node cannot take over itself".to_string(),
            });
        }
        self.send(Command::Takeover {
            dead: dead.to_string(),
        })
        .await
    }

    /// Stop after the current batch.
    pub async fn request_stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    /// Re-register at the provider from the local completed tick.
    pub async fn rewind(&self) -> Result<()> {
        self.send(Command::Rewind).await
    }

    /// Move the local completed tick to the provider's subscription position.
    pub async fn reset(&self) -> Result<()> {
        self.send(Command::Reset).await
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).await.map_err(|_| CascadeError::Shutdown)
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("name", &self.name).finish()
    }
}
