// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cascade consumer.
//!
//! Configuration is passed to [`CascadeEngine::new()`](crate::CascadeEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use cascade_consumer::config::{CascadeConfig, NodeConfig};
//!
//! let config = CascadeConfig {
//!     queue_name: "orders".into(),
//!     worker_name: "orders_worker".into(),
//!     nodes: vec![NodeConfig::new("branch-1")],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CascadeConfig
//! ├── queue_name: String            # Cascaded queue name
//! ├── worker_name: String           # This process's worker identity
//! ├── nodes: Vec<NodeConfig>        # Nodes this process consumes for
//! └── settings: CascadeSettings
//!     ├── consumer: ConsumerConfig      # Loop delays and backoff
//!     ├── takeover: TakeoverConfig      # ProviderLost reaction
//!     ├── wait_behind: WaitBehindConfig # Trailing poll
//!     ├── rate_limit: RateLimitSettings # Dispatch throttling
//!     └── circuit: CircuitSettings      # Store circuit breakers
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! queue_name: "orders"
//! worker_name: "orders_worker"
//!
//! nodes:
//!   - node_name: "branch-1"
//!     designated_replacement: true
//!
//! settings:
//!   consumer:
//!     empty_batch_delay: "500ms"
//!     pause_poll_interval: "2s"
//!   takeover:
//!     auto_takeover: true
//!     provider_dead_grace: "5m"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{CascadeError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

fn parse_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

fn check_duration(field: &str, value: &str) -> Result<()> {
    humantime::parse_duration(value)
        .map(|_| ())
        .map_err(|e| CascadeError::Config(format!("{field}: invalid duration {value:?}: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `CascadeEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Name of the cascaded queue.
    pub queue_name: String,

    /// Worker identity. Compared against `worker_name` in tag-switch events.
    pub worker_name: String,

    /// Nodes this process runs a Consumer Loop for.
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub settings: CascadeSettings,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            queue_name: "queue".to_string(),
            worker_name: "worker".to_string(),
            nodes: Vec::new(),
            settings: CascadeSettings::default(),
        }
    }
}

impl CascadeConfig {
    /// Single-node config with fast timings for tests.
    pub fn for_testing(node_name: &str) -> Self {
        Self {
            queue_name: "testq".to_string(),
            worker_name: format!("{node_name}_worker"),
            nodes: vec![NodeConfig::new(node_name)],
            settings: CascadeSettings::for_testing(),
        }
    }

    /// Reject configs the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(CascadeError::Config("queue_name is empty".into()));
        }
        if self.worker_name.trim().is_empty() {
            return Err(CascadeError::Config("worker_name is empty".into()));
        }
        if self.nodes.is_empty() {
            return Err(CascadeError::Config("no nodes configured".into()));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.node_name.trim().is_empty() {
                return Err(CascadeError::Config("node with empty name".into()));
            }
            if !seen.insert(node.node_name.as_str()) {
                return Err(CascadeError::Config(format!(
                    "duplicate node {}",
                    node.node_name
                )));
            }
        }
        self.settings.validate()
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.node_name == name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NodeConfig: one entry per managed node
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_name: String,

    /// Take over a lost provider even when the drop event names no
    /// replacement (requires `auto_takeover`).
    #[serde(default)]
    pub designated_replacement: bool,
}

impl NodeConfig {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            designated_replacement: false,
        }
    }

    #[must_use]
    pub fn designated(mut self) -> Self {
        self.designated_replacement = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CascadeSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CascadeSettings {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub takeover: TakeoverConfig,
    #[serde(default)]
    pub wait_behind: WaitBehindConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub circuit: CircuitSettings,
}

impl CascadeSettings {
    pub fn for_testing() -> Self {
        Self {
            consumer: ConsumerConfig::for_testing(),
            takeover: TakeoverConfig::default(),
            wait_behind: WaitBehindConfig {
                poll_interval: "10ms".to_string(),
            },
            rate_limit: RateLimitSettings::default(),
            circuit: CircuitSettings {
                failure_threshold: 20,
                success_threshold: 1,
                recovery_timeout: "20ms".to_string(),
            },
        }
    }

    fn validate(&self) -> Result<()> {
        let c = &self.consumer;
        check_duration("consumer.empty_batch_delay", &c.empty_batch_delay)?;
        check_duration("consumer.error_backoff", &c.error_backoff)?;
        check_duration("consumer.max_error_backoff", &c.max_error_backoff)?;
        check_duration("consumer.provider_backoff", &c.provider_backoff)?;
        check_duration("consumer.max_provider_backoff", &c.max_provider_backoff)?;
        check_duration("consumer.pause_poll_interval", &c.pause_poll_interval)?;
        check_duration("consumer.stop_drain_timeout", &c.stop_drain_timeout)?;
        check_duration("consumer.root_standby_delay", &c.root_standby_delay)?;
        if let Some(grace) = &self.takeover.provider_dead_grace {
            check_duration("takeover.provider_dead_grace", grace)?;
        }
        check_duration("wait_behind.poll_interval", &self.wait_behind.poll_interval)?;
        check_duration("circuit.recovery_timeout", &self.circuit.recovery_timeout)?;
        if self.rate_limit.enabled && self.rate_limit.refill_rate == 0 {
            return Err(CascadeError::Config(
                "rate_limit.refill_rate must be positive when enabled".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerConfig: loop timings
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumer Loop timings. All values are humantime strings ("500ms", "5s").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Sleep after an empty fetch.
    #[serde(default = "default_empty_batch_delay")]
    pub empty_batch_delay: String,

    /// First backoff after a failed cycle.
    #[serde(default = "default_error_backoff")]
    pub error_backoff: String,

    #[serde(default = "default_max_error_backoff")]
    pub max_error_backoff: String,

    /// First backoff while the provider is unresolved.
    #[serde(default = "default_provider_backoff")]
    pub provider_backoff: String,

    #[serde(default = "default_max_provider_backoff")]
    pub max_provider_backoff: String,

    /// How often a paused node re-reads its pause flag from the store.
    #[serde(default = "default_pause_poll_interval")]
    pub pause_poll_interval: String,

    /// How long shutdown waits for workers to finish their batch.
    #[serde(default = "default_stop_drain_timeout")]
    pub stop_drain_timeout: String,

    /// Idle period of a root node between command checks.
    #[serde(default = "default_root_standby_delay")]
    pub root_standby_delay: String,
}

fn default_empty_batch_delay() -> String {
    "500ms".to_string()
}

fn default_error_backoff() -> String {
    "1s".to_string()
}

fn default_max_error_backoff() -> String {
    "60s".to_string()
}

fn default_provider_backoff() -> String {
    "1s".to_string()
}

fn default_max_provider_backoff() -> String {
    "30s".to_string()
}

fn default_pause_poll_interval() -> String {
    "1s".to_string()
}

fn default_stop_drain_timeout() -> String {
    "30s".to_string()
}

fn default_root_standby_delay() -> String {
    "10s".to_string()
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            empty_batch_delay: default_empty_batch_delay(),
            error_backoff: default_error_backoff(),
            max_error_backoff: default_max_error_backoff(),
            provider_backoff: default_provider_backoff(),
            max_provider_backoff: default_max_provider_backoff(),
            pause_poll_interval: default_pause_poll_interval(),
            stop_drain_timeout: default_stop_drain_timeout(),
            root_standby_delay: default_root_standby_delay(),
        }
    }
}

impl ConsumerConfig {
    pub fn for_testing() -> Self {
        Self {
            empty_batch_delay: "5ms".to_string(),
            error_backoff: "5ms".to_string(),
            max_error_backoff: "40ms".to_string(),
            provider_backoff: "5ms".to_string(),
            max_provider_backoff: "40ms".to_string(),
            pause_poll_interval: "10ms".to_string(),
            stop_drain_timeout: "2s".to_string(),
            root_standby_delay: "10ms".to_string(),
        }
    }

    pub fn empty_batch_delay_duration(&self) -> Duration {
        parse_or(&self.empty_batch_delay, Duration::from_millis(500))
    }

    pub fn pause_poll_duration(&self) -> Duration {
        parse_or(&self.pause_poll_interval, Duration::from_secs(1))
    }

    pub fn stop_drain_duration(&self) -> Duration {
        parse_or(&self.stop_drain_timeout, Duration::from_secs(30))
    }

    pub fn root_standby_duration(&self) -> Duration {
        parse_or(&self.root_standby_delay, Duration::from_secs(10))
    }

    /// Backoff schedule for failed cycles.
    pub fn error_retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: parse_or(&self.error_backoff, Duration::from_secs(1)),
            max_delay: parse_or(&self.max_error_backoff, Duration::from_secs(60)),
            backoff_factor: 2.0,
        }
    }

    /// Backoff schedule while the provider cannot be resolved.
    pub fn provider_retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: parse_or(&self.provider_backoff, Duration::from_secs(1)),
            max_delay: parse_or(&self.max_provider_backoff, Duration::from_secs(30)),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TakeoverConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeoverConfig {
    /// Start a takeover when the lost provider names this node as its
    /// replacement.
    #[serde(default = "default_true")]
    pub auto_takeover: bool,

    /// How long a provider may stay unresolved before it is reported as
    /// permanently gone. `None` means only an explicit drop counts.
    #[serde(default)]
    pub provider_dead_grace: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TakeoverConfig {
    fn default() -> Self {
        Self {
            auto_takeover: true,
            provider_dead_grace: None,
        }
    }
}

impl TakeoverConfig {
    pub fn provider_dead_grace_duration(&self) -> Option<Duration> {
        self.provider_dead_grace
            .as_deref()
            .and_then(|g| humantime::parse_duration(g).ok())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WaitBehindConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitBehindConfig {
    /// Position re-check interval while trailing.
    #[serde(default = "default_wait_poll_interval")]
    pub poll_interval: String,
}

fn default_wait_poll_interval() -> String {
    "1s".to_string()
}

impl Default for WaitBehindConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_wait_poll_interval(),
        }
    }
}

impl WaitBehindConfig {
    pub fn poll_duration(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RateLimitSettings / CircuitSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    /// Events per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: u32,
}

fn default_burst_size() -> u32 {
    1000
}

fn default_refill_rate() -> u32 {
    10_000
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            burst_size: default_burst_size(),
            refill_rate: default_refill_rate(),
        }
    }
}

impl RateLimitSettings {
    /// `None` when dispatch is unthrottled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.enabled.then(|| RateLimitConfig {
            burst_size: self.burst_size,
            refill_rate: self.refill_rate,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl CircuitSettings {
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: parse_or(&self.recovery_timeout, Duration::from_secs(30)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_testing_is_valid() {
        let config = CascadeConfig::for_testing("b1");
        assert!(config.validate().is_ok());
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(
            config.settings.consumer.empty_batch_delay_duration(),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn test_validate_rejects_empty_nodes() {
        let config = CascadeConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("no nodes"));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = CascadeConfig::for_testing("b1");
        config.nodes.push(NodeConfig::new("b1"));
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_bad_duration() {
        let mut config = CascadeConfig::for_testing("b1");
        config.settings.consumer.pause_poll_interval = "soon".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pause_poll_interval"));

        let mut config = CascadeConfig::for_testing("b1");
        config.settings.takeover.provider_dead_grace = Some("forever".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "queue_name": "orders",
            "worker_name": "w1",
            "nodes": [{"node_name": "b1", "designated_replacement": true}],
            "settings": {"takeover": {"provider_dead_grace": "5m"}}
        }"#;
        let config: CascadeConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.nodes[0].designated_replacement);
        assert!(config.settings.takeover.auto_takeover);
        assert_eq!(
            config.settings.takeover.provider_dead_grace_duration(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.settings.consumer.empty_batch_delay, "500ms");
        assert!(config.settings.rate_limit.rate_limit_config().is_none());
    }

    #[test]
    fn test_grace_has_no_default() {
        assert_eq!(TakeoverConfig::default().provider_dead_grace_duration(), None);
    }

    #[test]
    fn test_retry_schedules() {
        let c = ConsumerConfig::default();
        let retry = c.error_retry();
        assert_eq!(retry.initial_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(60));
        assert_eq!(c.provider_retry().max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_circuit_config_from_settings() {
        let settings = CircuitSettings::default();
        let cfg = settings.circuit_config();
        assert_eq!(cfg.failure_threshold, 5);
        assert_eq!(cfg.recovery_timeout, Duration::from_secs(30));
    }
}
