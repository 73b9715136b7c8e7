// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Batch fetch / commit / retry per node
//! - Control events applied, ignored and rejected
//! - Takeover and wait-behind transitions
//! - Effective watermarks of combined queues
//! - Store call latency and circuit breaker rejections
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `cascade_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use cascade_consumer::metrics;
//!
//! metrics::record_batch_fetched("branch-1", 42);
//! metrics::set_effective_watermark("combined", 1200);
//! ```

use crate::topology::Tick;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Consumer Loop
// =============================================================================

/// Record a non-empty batch fetched by a node.
pub fn record_batch_fetched(node: &str, events: usize) {
    counter!("cascade_batches_fetched_total", "node" => node.to_string()).increment(1);
    histogram!("cascade_batch_size", "node" => node.to_string()).record(events as f64);
}

/// Record an empty fetch (nothing ticked yet).
pub fn record_empty_fetch(node: &str) {
    counter!("cascade_empty_fetches_total", "node" => node.to_string()).increment(1);
}

/// Record a committed batch and the node's new position.
pub fn record_batch_committed(node: &str, tick: Tick, duration: Duration) {
    counter!("cascade_batches_committed_total", "node" => node.to_string()).increment(1);
    gauge!("cascade_completed_tick", "node" => node.to_string()).set(tick as f64);
    histogram!("cascade_batch_duration_seconds", "node" => node.to_string())
        .record(duration.as_secs_f64());
}

/// Record a batch that will be fetched again (handler failure, bad control event, ...).
pub fn record_batch_retry(node: &str, reason: &str) {
    counter!(
        "cascade_batch_retries_total",
        "node" => node.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a batch that was already applied and only needed committing.
pub fn record_batch_skipped(node: &str) {
    counter!("cascade_batches_skipped_total", "node" => node.to_string()).increment(1);
}

/// Record business events handed to the handler.
pub fn record_events_dispatched(node: &str, count: usize) {
    counter!("cascade_events_dispatched_total", "node" => node.to_string()).increment(count as u64);
}

/// Record an error by kind.
pub fn record_error(node: &str, kind: &str) {
    counter!(
        "cascade_errors_total",
        "node" => node.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Worker state gauge per node.
pub fn set_worker_state(node: &str, state: &str) {
    let value = match state {
        "starting" => 0.0,
        "running" => 1.0,
        "paused" => 2.0,
        "standby" => 3.0,
        "waiting_provider" => 4.0,
        "stopped" => 5.0,
        "failed" => 6.0,
        _ => -1.0,
    };
    gauge!("cascade_worker_state", "node" => node.to_string()).set(value);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("cascade_engine_state").set(value);
}

// =============================================================================
// Control Events
// =============================================================================

pub fn record_control_event(node: &str, kind: &str) {
    counter!(
        "cascade_control_events_total",
        "node" => node.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_ignored_control_event(node: &str, kind: &str) {
    counter!(
        "cascade_control_events_ignored_total",
        "node" => node.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_bad_control_event(node: &str) {
    counter!("cascade_control_events_bad_total", "node" => node.to_string()).increment(1);
}

/// Watermark reports older than what is already known.
pub fn record_watermark_regression(node: &str) {
    counter!("cascade_watermark_regressions_total", "node" => node.to_string()).increment(1);
}

/// Effective (minimum) watermark of a combined queue.
pub fn set_effective_watermark(combined_queue: &str, tick: Tick) {
    gauge!("cascade_effective_watermark", "combined_queue" => combined_queue.to_string())
        .set(tick as f64);
}

// =============================================================================
// Takeover / Wait-Behind
// =============================================================================

pub fn record_takeover_transition(node: &str, state: &str) {
    counter!(
        "cascade_takeover_transitions_total",
        "node" => node.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Outcome is one of `completed`, `failed`, `coalesced`.
pub fn record_takeover_outcome(node: &str, outcome: &str) {
    counter!(
        "cascade_takeovers_total",
        "node" => node.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_wait_behind_transition(node: &str, state: &str) {
    counter!(
        "cascade_wait_behind_transitions_total",
        "node" => node.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Old provider vanished before the new one caught up.
pub fn record_continuity_gap(node: &str) {
    counter!("cascade_continuity_gaps_total", "node" => node.to_string()).increment(1);
}

// =============================================================================
// Store
// =============================================================================

pub fn record_store_latency(operation: &str, duration: Duration) {
    histogram!(
        "cascade_store_operation_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "cascade_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}
