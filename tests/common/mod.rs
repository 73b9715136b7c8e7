// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A recording handler with failure injection
//! - Cascade fixtures on top of `MemoryStore`
//! - Polling helpers with timeouts
//! - A process-wide metrics recorder for counter assertions

#![allow(dead_code)]

use cascade_consumer::event::{ControlEvent, Event};
use cascade_consumer::worker::{EventHandler, HandlerError, HandlerFuture, NodeStatus};
use cascade_consumer::{CascadeConfig, MemoryStore, Node, NodeConfig, NodeHandle, NodeType, Tick};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Recording handler
// =============================================================================

/// Records every accepted `(node, ev_id)` in arrival order.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<(String, u64)>>,
    /// Remaining failures per event id.
    failures: Mutex<HashMap<u64, usize>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject event `ev_id` the next `times` times it is delivered.
    pub fn fail_on(&self, ev_id: u64, times: usize) {
        self.failures.lock().unwrap().insert(ev_id, times);
    }

    pub fn seen(&self) -> Vec<(String, u64)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn ids_for(&self, node: &str) -> Vec<u64> {
        self.seen()
            .into_iter()
            .filter(|(n, _)| n == node)
            .map(|(_, id)| id)
            .collect()
    }
}

impl EventHandler for RecordingHandler {
    fn handle_event<'a>(&'a self, node: &'a str, event: &'a Event) -> HandlerFuture<'a> {
        Box::pin(async move {
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(left) = failures.get_mut(&event.ev_id) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(HandlerError::new(format!("injected failure on {}", event.ev_id)));
                    }
                }
            }
            self.seen.lock().unwrap().push((node.to_string(), event.ev_id));
            Ok(())
        })
    }
}

// =============================================================================
// Events
// =============================================================================

static NEXT_EV_ID: AtomicU64 = AtomicU64::new(1_000);

/// Business event with a fresh id.
pub fn business() -> Event {
    Event::new(NEXT_EV_ID.fetch_add(1, Ordering::SeqCst), "insert", r#"{"id": 1}"#)
}

pub fn business_with_id(ev_id: u64) -> Event {
    Event::new(ev_id, "insert", r#"{"id": 1}"#)
}

pub fn control(event: &ControlEvent) -> Event {
    Event::control(NEXT_EV_ID.fetch_add(1, Ordering::SeqCst), event)
}

// =============================================================================
// Fixtures
// =============================================================================

/// Config running `nodes` with fast timings; worker name is `test_worker`.
pub fn config_for(nodes: &[&str]) -> CascadeConfig {
    let mut config = CascadeConfig::for_testing(nodes[0]);
    config.worker_name = "test_worker".to_string();
    config.nodes = nodes.iter().map(|n| NodeConfig::new(n)).collect();
    config
}

/// Root `R` and branch `b1` reading from it.
pub async fn root_and_branch() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_node(Node::new("R", NodeType::Root)).await;
    store
        .add_node(Node::new("b1", NodeType::Branch).with_provider("R"))
        .await;
    store
}

pub async fn completed(store: &MemoryStore, node: &str) -> Option<Tick> {
    store.node(node).await.and_then(|n| n.completed_tick)
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `check` until it returns true. Panics after [`WAIT`].
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for a node status matching `pred` and return it.
pub async fn wait_status<F>(handle: &NodeHandle, what: &str, pred: F) -> NodeStatus
where
    F: Fn(&NodeStatus) -> bool,
{
    let mut rx = handle.status_receiver();
    let result = tokio::time::timeout(WAIT, async {
        loop {
            let status = rx.borrow_and_update().clone();
            if pred(&status) {
                return status;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                if pred(&last) {
                    return last;
                }
                panic!("status channel closed waiting for {what}: {last:?}");
            }
        }
    })
    .await;
    match result {
        Ok(status) => status,
        Err(_) => panic!("timed out waiting for {what}: {:?}", handle.status()),
    }
}

// =============================================================================
// Metrics
// =============================================================================

static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();

/// Install the debugging recorder for this test binary (first call only).
/// Tests reading counters must use node names no other test uses.
pub fn install_metrics() {
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        if recorder.install().is_err() {
            panic!("another metrics recorder is already installed");
        }
        snapshotter
    });
}

/// Sum of every counter `name` whose labels include all of `labels`.
pub fn counter_value(name: &str, labels: &[(&str, &str)]) -> u64 {
    let Some(snapshotter) = SNAPSHOTTER.get() else {
        return 0;
    };
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, ..)| {
            let key = key.key();
            key.name() == name
                && labels
                    .iter()
                    .all(|(k, v)| key.labels().any(|l| l.key() == *k && l.value() == *v))
        })
        .map(|(.., value)| match value {
            DebugValue::Counter(n) => n,
            _ => 0,
        })
        .sum()
}
