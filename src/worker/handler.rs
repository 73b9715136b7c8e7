// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Business-event handler.
//!
//! The Consumer Loop hands every non-control event of a batch to the
//! handler, in order. A failing event withholds the batch commit and the
//! whole batch is fetched again, so handlers see events at least once and
//! must be idempotent.
//!
//! # Example
//!
//! ```rust,no_run
//! use cascade_consumer::worker::{EventHandler, HandlerError, HandlerFuture};
//! use cascade_consumer::event::Event;
//!
//! struct Printer;
//!
//! impl EventHandler for Printer {
//!     fn handle_event<'a>(&'a self, node: &'a str, event: &'a Event) -> HandlerFuture<'a> {
//!         Box::pin(async move {
//!             println!("{node}: {} {}", event.ev_type, event.ev_data);
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::event::Event;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Error returned by a handler. The message ends up in the node's
/// consumer error record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// User-supplied business-event processing.
pub trait EventHandler: Send + Sync + 'static {
    /// Process one business event received by `node`.
    fn handle_event<'a>(&'a self, node: &'a str, event: &'a Event) -> HandlerFuture<'a>;
}

/// Handler that accepts everything. Useful for pure relay nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpHandler;

impl EventHandler for NoOpHandler {
    fn handle_event<'a>(&'a self, _node: &'a str, _event: &'a Event) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Adapts a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&str, &Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle_event<'a>(&'a self, node: &'a str, event: &'a Event) -> HandlerFuture<'a> {
        let result = (self.0)(node, event);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_noop_handler_accepts() {
        let ev = Event::new(1, "insert", "{}");
        assert!(NoOpHandler.handle_event("b1", &ev).await.is_ok());
    }

    #[tokio::test]
    async fn test_fn_handler_runs_closure() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = FnHandler(move |_node: &str, ev: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            if ev.ev_type == "bad" {
                Err(HandlerError::new("rejected"))
            } else {
                Ok(())
            }
        });

        assert!(handler.handle_event("b1", &Event::new(1, "ok", "")).await.is_ok());
        let err = handler
            .handle_event("b1", &Event::new(2, "bad", ""))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "rejected");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
