// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the cascaded consumer.
//!
//! Errors are grouped by how the Consumer Loop reacts to them, not by
//! where they come from.
//!
//! # Error Categories
//!
//! | Error Type | Class | Loop reaction |
//! |------------|-------|---------------|
//! | `Store` (transient source) | Transient I/O | backoff + retry |
//! | `Store` (non-transient source) | Protocol | log, retry batch |
//! | `CycleDetected` / `SelfProvider` | Protocol | mutation rejected, logged |
//! | `CombinedMembership` | Protocol | mutation rejected, logged |
//! | `UnresolvedProvider` | Protocol | poll with backoff |
//! | `BadControlEvent` | Protocol | batch control processing aborted, retried |
//! | `LostPosition` | Protocol | batch skipped, retried |
//! | `Handler` | Handler | commit withheld, batch redelivered |
//! | `TakeoverFailed` | Takeover | warning, stays retryable |
//! | `NodeNotFound` | Fatal | worker stops |
//! | `Config` | Fatal | worker never starts |
//! | `InvalidState` / `Shutdown` / `Internal` | Bug / lifecycle | surfaced to caller |
//!
//! Use [`CascadeError::is_retryable()`] to decide on backoff and
//! [`CascadeError::is_fatal()`] to decide whether a worker must stop.

use crate::store::StoreError;
use crate::topology::Tick;
use thiserror::Error;

/// Result type alias for cascade operations.
pub type Result<T> = std::result::Result<T, CascadeError>;

/// Errors raised by the topology model, the protocols and the Consumer Loop.
#[derive(Error, Debug)]
pub enum CascadeError {
    /// Backing store call failed.
    ///
    /// Retryable when the store reports the failure as transient
    /// (connection dropped, timeout, circuit open).
    #[error("Store error ({operation}): {message}")]
    Store {
        operation: String,
        message: String,
        #[source]
        source: Option<StoreError>,
    },

    /// The local node does not exist in the backing store.
    ///
    /// Fatal: retrying cannot fix a missing identity.
    #[error("Node not found in store: {0}")]
    NodeNotFound(String),

    /// Applying a provider link would close a cycle.
    #[error("Provider cycle detected: {node} -> {provider}")]
    CycleDetected { node: String, provider: String },

    /// A node was asked to read from itself.
    #[error("Node {0} cannot be its own provider")]
    SelfProvider(String),

    /// `combined_queue` / `combined_type` / `node_type` disagree.
    #[error("Combined membership inconsistent for {node}: {reason}")]
    CombinedMembership { node: String, reason: String },

    /// The provider named in the topology is not (yet) known or is dead.
    #[error("Provider {provider} of {node} is unresolved")]
    UnresolvedProvider { node: String, provider: String },

    /// A recognised control event carried a payload that could not be decoded.
    #[error("Bad control event {kind} (event {event_id}): {reason}")]
    BadControlEvent {
        kind: String,
        event_id: u64,
        reason: String,
    },

    /// The fetched batch does not line up with the node's completed tick.
    #[error("Lost position on {node}: batch {batch_start}..{batch_end}, node has {completed}")]
    LostPosition {
        node: String,
        batch_start: Tick,
        batch_end: Tick,
        completed: Tick,
    },

    /// The user-supplied handler rejected an event.
    #[error("Handler failed on {node} (event {event_id}): {message}")]
    Handler {
        node: String,
        event_id: u64,
        message: String,
    },

    /// Takeover could not complete; the request stays pending.
    #[error("Takeover of {dead} by {replacement} failed: {reason}")]
    TakeoverFailed {
        dead: String,
        replacement: String,
        reason: String,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation (e.g. starting an engine twice).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Operation attempted while the worker is stopping.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CascadeError {
    /// Wrap a store error with the operation that produced it.
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Store error without an underlying driver error (e.g. circuit rejection).
    pub fn store_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if the operation should be retried after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { source, .. } => source.as_ref().map_or(true, StoreError::is_transient),
            Self::UnresolvedProvider { .. } => true,
            Self::BadControlEvent { .. } => true,
            Self::LostPosition { .. } => true,
            Self::Handler { .. } => true,
            Self::TakeoverFailed { .. } => true,
            Self::NodeNotFound(_) => false,
            Self::CycleDetected { .. } => false,
            Self::SelfProvider(_) => false,
            Self::CombinedMembership { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if the error must stop the worker.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NodeNotFound(_) | Self::Config(_))
    }

    /// Check if the error is a protocol inconsistency (batch-scoped, logged).
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::SelfProvider(_)
                | Self::CombinedMembership { .. }
                | Self::UnresolvedProvider { .. }
                | Self::BadControlEvent { .. }
                | Self::LostPosition { .. }
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store { .. } => "store",
            Self::NodeNotFound(_) => "node_not_found",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::SelfProvider(_) => "self_provider",
            Self::CombinedMembership { .. } => "combined_membership",
            Self::UnresolvedProvider { .. } => "unresolved_provider",
            Self::BadControlEvent { .. } => "bad_control_event",
            Self::LostPosition { .. } => "lost_position",
            Self::Handler { .. } => "handler",
            Self::TakeoverFailed { .. } => "takeover_failed",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for CascadeError {
    fn from(e: StoreError) -> Self {
        Self::store("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_store_error_is_retryable() {
        let err = CascadeError::store("fetch_batch", StoreError::Unavailable("reset".into()));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("fetch_batch"));
    }

    #[test]
    fn test_rejected_store_error_not_retryable() {
        let err = CascadeError::store("switch_provider", StoreError::Rejected("no such node".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_circuit_rejection_is_retryable() {
        let err = CascadeError::store_msg("commit_batch", "circuit open");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_node_not_found_is_fatal() {
        let err = CascadeError::NodeNotFound("leaf-1".into());
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("leaf-1"));
    }

    #[test]
    fn test_protocol_errors() {
        let err = CascadeError::CycleDetected {
            node: "a".into(),
            provider: "b".into(),
        };
        assert!(err.is_protocol());
        assert!(!err.is_fatal());
        assert_eq!(err.kind(), "cycle_detected");

        let err = CascadeError::BadControlEvent {
            kind: "watermark".into(),
            event_id: 7,
            reason: "missing field".into(),
        };
        assert!(err.is_protocol());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_lost_position_formatting() {
        let err = CascadeError::LostPosition {
            node: "branch-1".into(),
            batch_start: 10,
            batch_end: 12,
            completed: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("10..12"));
        assert!(msg.contains("has 5"));
    }

    #[test]
    fn test_takeover_failed_is_retryable() {
        let err = CascadeError::TakeoverFailed {
            dead: "root".into(),
            replacement: "branch-2".into(),
            reason: "unreachable".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_protocol());
    }
}
