// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Cascade Consumer
//!
//! A consumer engine for cascaded (tree-replicated) event queues in the
//! style of PgQ `pgq_node`.
//!
//! ## Architecture
//!
//! Every node of the cascade reads its queue from a provider node. The
//! engine runs one Consumer Loop per local node, keeps an in-memory model
//! of the tree up to date from control events embedded in the stream, and
//! repairs the tree when a provider disappears:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              cascade-consumer                             │
//! │                                                                           │
//! │  ┌──────────────┐    ┌──────────────┐    ┌─────────────────────────────┐  │
//! │  │ BackingStore │───►│ ConsumerLoop │───►│ EventHandler (business evs) │  │
//! │  │ (pgq / mem)  │    │ (per node)   │    └─────────────────────────────┘  │
//! │  └──────────────┘    └──────┬───────┘                                     │
//! │         ▲                   │ control events                              │
//! │         │                   ▼                                             │
//! │  ┌──────┴───────┐    ┌──────────────┐    ┌─────────────────────────────┐  │
//! │  │ Takeover /   │◄───│ Interpreter  │───►│ Topology (tree + watermarks)│  │
//! │  │ Wait-Behind  │    └──────────────┘    └─────────────────────────────┘  │
//! │  └──────────────┘                                                         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! Business events reach the handler at least once and in queue order. A
//! batch is committed only after the handler accepted every event in it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cascade_consumer::{CascadeConfig, CascadeEngine, NodeConfig, PgStore};
//! use cascade_consumer::worker::NoOpHandler;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cascade_consumer::Result<()> {
//!     let config = CascadeConfig {
//!         queue_name: "orders".into(),
//!         worker_name: "orders_worker".into(),
//!         nodes: vec![NodeConfig::new("branch-1")],
//!         ..Default::default()
//!     };
//!     let store = PgStore::connect("orders", "branch-1", "postgres://localhost/orders").await?;
//!
//!     let mut engine = CascadeEngine::new(config, Arc::new(store));
//!     engine.start(NoOpHandler).await?;
//!
//!     // Runs until shutdown
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod event;
pub mod interpreter;
pub mod metrics;
pub mod resilience;
pub mod status;
pub mod store;
pub mod topology;
pub mod worker;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, StoreCircuit};
pub use config::{CascadeConfig, CascadeSettings, NodeConfig};
pub use error::{CascadeError, Result};
pub use event::{Batch, ControlEvent, Event};
pub use status::TopologyTree;
pub use store::{BackingStore, ExclusiveStore, MemoryStore, PgStore, StoreError};
pub use topology::{CombinedType, Node, NodeType, Tick, Topology};
pub use worker::{CascadeEngine, EngineState, EventHandler, NodeHandle, NodeStatus};
