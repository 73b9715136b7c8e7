// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breakers around backing store calls.
//!
//! A store that is down should not be hammered by every node worker at
//! full speed. Reads and writes get separate breakers so a failing commit
//! path does not stop topology lookups and vice versa.
//!
//! # States
//!
//! - **Closed**: calls pass through
//! - **Open**: calls fail fast with [`CircuitError::Rejected`]
//! - **HalfOpen**: a few trial calls decide whether to close again
//!
//! A rejection surfaces as a transient [`CascadeError::Store`] so the
//! Consumer Loop backs off exactly as it does for a dropped connection.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use cascade_consumer::circuit_breaker::StoreCircuit;
//! # use cascade_consumer::store::{BackingStore, MemoryStore};
//! # async fn example() -> cascade_consumer::Result<()> {
//! let circuit = StoreCircuit::default();
//! let store = MemoryStore::new();
//! let info = circuit.read("get_node_info", || store.get_node_info("root")).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{CascadeError, Result};
use crate::store::StoreError;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker state for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Size of the closed-state window; the breaker trips when half of
    /// the calls in it failed.
    pub failure_threshold: u32,
    /// Trial calls in half-open state.
    pub success_threshold: u32,
    /// Time spent open before trying again.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for tests.
    pub fn testing() -> Self {
        Self {
            failure_threshold: 4,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run an async operation through the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_rejection(&self.name);
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Rough state derived from the counters.
    #[must_use]
    pub fn state_hint(&self) -> CircuitState {
        if self.rejections() > 0 && self.rejections() > self.successes() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }
}

/// Breakers for the two classes of store calls.
///
/// - `reads`: fetch_batch, get_node_info, list_subscribers, ...
/// - `writes`: commit_batch, switch_provider, pause/resume, ...
pub struct StoreCircuit {
    pub reads: CircuitBreaker,
    pub writes: CircuitBreaker,
}

impl Default for StoreCircuit {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl StoreCircuit {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            reads: CircuitBreaker::new("store_reads", config.clone()),
            writes: CircuitBreaker::new("store_writes", config),
        }
    }

    /// Guarded read, errors mapped into [`CascadeError`].
    pub async fn read<F, Fut, T>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        guarded(&self.reads, op, f).await
    }

    /// Guarded write, errors mapped into [`CascadeError`].
    pub async fn write<F, Fut, T>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        guarded(&self.writes, op, f).await
    }

    pub fn any_open(&self) -> bool {
        self.reads.state_hint() == CircuitState::Open
            || self.writes.state_hint() == CircuitState::Open
    }
}

async fn guarded<F, Fut, T>(breaker: &CircuitBreaker, op: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, StoreError>>,
{
    let started = Instant::now();
    let result = breaker.call(f).await;
    crate::metrics::record_store_latency(op, started.elapsed());
    result.map_err(|e| match e {
        CircuitError::Rejected => CascadeError::store_msg(op, "circuit open"),
        CircuitError::Inner(e) => CascadeError::store(op, e),
    })
}
