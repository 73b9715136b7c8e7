// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer Loop: the per-node batch cycle.
//!
//! Each managed node has one worker task that:
//! 1. Rebuilds its topology from the store (node, provider, subscribers,
//!    combined members)
//! 2. Resolves its provider, polling with backoff while it is unknown
//! 3. Fetches the next batch and checks it lines up with the completed tick
//! 4. Applies control events and dispatches business events in arrival order
//! 5. Commits, then acts on what the control events asked for (provider
//!    switch, takeover, wait-behind, hand-off)
//!
//! # Delivery
//!
//! A batch is committed only after every business event in it was
//! accepted by the handler. Anything else (handler error, malformed
//! control event, store error) leaves the batch open and the same batch
//! is fetched again after a backoff: at-least-once toward the handler.
//!
//! # Stopping
//!
//! Stop requests and shutdown are checked between batches and inside
//! every wait. A batch in flight always finishes (commit or discard)
//! first. The only error that stops a worker on its own is the local
//! node missing from the store.

use super::handler::EventHandler;
use super::takeover::{Takeover, TakeoverJob};
use super::types::{NodeStatus, WorkerState};
use super::wait_behind::{self, WaitBehindState};
use crate::circuit_breaker::StoreCircuit;
use crate::config::CascadeSettings;
use crate::error::{CascadeError, Result};
use crate::event::Batch;
use crate::interpreter::{self, AppliedEffect};
use crate::metrics;
use crate::resilience::{Backoff, RateLimiter};
use crate::store::BackingStore;
use crate::topology::{Node, Tick, Topology};
use futures::future::join_all;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Operator command delivered to a worker between batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Stop,
    Pause,
    Resume,
    Rewind,
    Reset,
    Takeover { dead: String },
}

/// Shared collaborators of every worker of one engine.
pub(crate) struct WorkerContext<S: BackingStore> {
    pub store: Arc<S>,
    pub circuit: Arc<StoreCircuit>,
    pub handler: Arc<dyn EventHandler>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub settings: CascadeSettings,
    pub worker_name: String,
    /// Take over a lost provider even when the drop names no replacement.
    pub designated: bool,
}

/// Channels between a worker and its `NodeHandle` / engine.
pub(crate) struct WorkerChannels {
    pub commands: mpsc::Receiver<Command>,
    pub topology_tx: watch::Sender<Topology>,
    pub status_tx: watch::Sender<NodeStatus>,
    pub shutdown_rx: watch::Receiver<bool>,
}

enum Cycle {
    /// Fetch again right away.
    Continue,
    /// Nothing to do for a while.
    Idle(Duration),
    Exit,
}

enum Wake {
    Timer,
    Shutdown { sender_gone: bool },
    Command(Option<Command>),
}

/// Local provider change waiting for the new provider to catch up.
#[derive(Debug, Clone)]
struct PendingSwitch {
    old: String,
    new: String,
}

pub(crate) struct NodeWorker<S: BackingStore> {
    node: String,
    ctx: WorkerContext<S>,
    ch: WorkerChannels,
    topology: Topology,
    state: WorkerState,
    uptodate: bool,
    last_error: Option<String>,
    pending_switch: Option<PendingSwitch>,
    takeover: Takeover,
    waits: BTreeMap<String, WaitBehindState>,
    error_backoff: Backoff,
    provider_backoff: Backoff,
    unresolved_since: Option<Instant>,
    grace_reported: bool,
    pause_unsynced: bool,
    queued: VecDeque<Command>,
    commands_open: bool,
    stop_requested: bool,
}

impl<S: BackingStore> NodeWorker<S> {
    pub fn new(node: &str, ctx: WorkerContext<S>, ch: WorkerChannels) -> Self {
        let error_backoff = Backoff::new(ctx.settings.consumer.error_retry());
        let provider_backoff = Backoff::new(ctx.settings.consumer.provider_retry());
        Self {
            node: node.to_string(),
            ctx,
            ch,
            topology: Topology::new(node),
            state: WorkerState::Starting,
            uptodate: false,
            last_error: None,
            pending_switch: None,
            takeover: Takeover::new(),
            waits: BTreeMap::new(),
            error_backoff,
            provider_backoff,
            unresolved_since: None,
            grace_reported: false,
            pause_unsynced: false,
            queued: VecDeque::new(),
            commands_open: true,
            stop_requested: false,
        }
    }

    /// Run until stopped. Returns the fatal error if there was one.
    pub async fn run(mut self) -> Result<()> {
        let span = info_span!("consumer", node = %self.node);

        async move {
            info!(worker = %self.ctx.worker_name, "Starting consumer loop");
            metrics::set_worker_state(&self.node, WorkerState::Starting.as_str());

            let result = self.run_inner().await;
            match &result {
                Ok(()) => {
                    self.set_state(WorkerState::Stopped);
                    info!("Consumer loop stopped");
                }
                Err(e) => {
                    error!(error = %e, "Consumer loop stopped on fatal error");
                    metrics::record_error(&self.node, e.kind());
                    self.last_error = Some(first_line(&e.to_string()));
                    self.set_state(WorkerState::Failed);
                }
            }
            self.publish();
            result
        }
        .instrument(span)
        .await
    }

    async fn run_inner(&mut self) -> Result<()> {
        loop {
            if self.should_stop() {
                return Ok(());
            }
            match self.bootstrap().await {
                Ok(()) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let delay = self.on_cycle_error(&e).await;
                    self.publish();
                    self.idle(delay).await;
                }
            }
        }
        self.error_backoff.reset();
        self.publish();

        loop {
            if self.should_stop() {
                break;
            }
            let delay = match self.cycle().await {
                Ok(Cycle::Continue) => None,
                Ok(Cycle::Idle(delay)) => Some(delay),
                Ok(Cycle::Exit) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => Some(self.on_cycle_error(&e).await),
            };
            self.publish();
            if let Some(delay) = delay {
                self.idle(delay).await;
            }
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stop_requested || *self.ch.shutdown_rx.borrow()
    }

    /// Sleep, waking early for shutdown or a command.
    async fn idle(&mut self, delay: Duration) {
        let open = self.commands_open;
        let wake = tokio::select! {
            _ = tokio::time::sleep(delay) => Wake::Timer,
            changed = self.ch.shutdown_rx.changed() => Wake::Shutdown {
                sender_gone: changed.is_err(),
            },
            cmd = self.ch.commands.recv(), if open => Wake::Command(cmd),
        };

        match wake {
            Wake::Timer => {}
            Wake::Shutdown { sender_gone } => {
                if sender_gone {
                    debug!("Engine gone, stopping");
                    self.stop_requested = true;
                }
            }
            Wake::Command(Some(cmd)) => self.queued.push_back(cmd),
            Wake::Command(None) => self.commands_open = false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Bootstrap
    // ═══════════════════════════════════════════════════════════════════

    /// Rebuild the topology from the store.
    async fn bootstrap(&mut self) -> Result<()> {
        let store = &self.ctx.store;
        let circuit = &self.ctx.circuit;

        let info = circuit
            .read("get_node_info", || store.get_node_info(&self.node))
            .await?
            .ok_or_else(|| CascadeError::NodeNotFound(self.node.clone()))?;

        let provider = info.provider_node.clone();
        let combined = info
            .combined_queue
            .clone()
            .filter(|_| info.node_type.is_merge() || info.node_type.is_combined());
        let mut topology = Topology::new(&self.node);
        topology.upsert_node(info)?;

        if let Some(provider) = provider {
            // A provider that is down now is picked up by resolution later.
            if let Ok(Some(node)) = circuit
                .read("get_node_info", || store.get_node_info(&provider))
                .await
            {
                upsert_logged(&mut topology, node);
            }
        }

        let subscribers = circuit
            .read("list_subscribers", || store.list_subscribers(&self.node))
            .await?;
        for node in load_nodes(&**store, circuit, &subscribers).await {
            upsert_logged(&mut topology, node);
        }

        if let Some(queue) = combined {
            let members = circuit
                .read("list_combined_members", || store.list_combined_members(&queue))
                .await?;
            for node in load_nodes(&**store, circuit, &members).await {
                upsert_logged(&mut topology, node);
            }
            topology.set_members(&queue, &members);
            if let Some(effective) = topology.compute_effective_watermark(&queue) {
                metrics::set_effective_watermark(&queue, effective);
            }
        }

        info!(
            provider = ?topology.local().and_then(|n| n.provider_node.as_deref()),
            subscribers = subscribers.len(),
            nodes = topology.len(),
            "Topology loaded"
        );
        self.topology = topology;
        self.uptodate = true;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Cycle
    // ═══════════════════════════════════════════════════════════════════

    async fn cycle(&mut self) -> Result<Cycle> {
        while let Ok(cmd) = self.ch.commands.try_recv() {
            self.queued.push_back(cmd);
        }
        while let Some(cmd) = self.queued.pop_front() {
            if let Err(e) = self.handle_command(cmd.clone()).await {
                warn!(command = ?cmd, error = %e, "Command failed");
                metrics::record_error(&self.node, e.kind());
            }
        }
        if self.stop_requested {
            return Ok(Cycle::Exit);
        }

        if !self.takeover.is_idle() {
            if let Err(e) = self
                .takeover
                .drive(&mut self.topology, &*self.ctx.store, &self.ctx.circuit)
                .await
            {
                warn!(error = %e, "Takeover step failed, will retry");
                metrics::record_error(&self.node, e.kind());
                self.last_error = Some(first_line(&e.to_string()));
            }
        }

        if !self.waits.is_empty() {
            if let Err(e) = wait_behind::drive(
                &mut self.waits,
                &mut self.topology,
                &*self.ctx.store,
                &self.ctx.circuit,
            )
            .await
            {
                warn!(error = %e, "Wait-behind step failed, will retry");
                metrics::record_error(&self.node, e.kind());
            }
        }

        let Some(local) = self.topology.local() else {
            return Err(CascadeError::NodeNotFound(self.node.clone()));
        };
        if local.is_paused {
            return self.poll_paused().await;
        }
        if local.node_type.is_root() {
            self.set_state(WorkerState::Standby);
            let delay = self.ctx.settings.consumer.root_standby_duration();
            return Ok(Cycle::Idle(self.idle_delay(delay)));
        }

        self.check_pending_switch().await?;

        let Some(provider) = self.resolve_provider().await? else {
            return Ok(Cycle::Idle(self.provider_backoff.next_delay()));
        };
        self.set_state(WorkerState::Running);

        let store = &self.ctx.store;
        let batch = self
            .ctx
            .circuit
            .read("fetch_batch", || store.fetch_batch(&provider, &self.node))
            .await?;

        match batch {
            Some(batch) => self.process_batch(batch).await,
            None => {
                metrics::record_empty_fetch(&self.node);
                let delay = self.ctx.settings.consumer.empty_batch_delay_duration();
                Ok(Cycle::Idle(self.idle_delay(delay)))
            }
        }
    }

    /// Shorter waits while a hand-over is trailing.
    fn idle_delay(&self, base: Duration) -> Duration {
        if self.waits.is_empty() {
            base
        } else {
            base.min(self.ctx.settings.wait_behind.poll_duration())
        }
    }

    async fn process_batch(&mut self, batch: Batch) -> Result<Cycle> {
        let started = Instant::now();
        metrics::record_batch_fetched(&self.node, batch.events.len());
        debug!(
            batch_id = batch.batch_id,
            prev_tick = batch.prev_tick,
            tick = batch.tick,
            events = batch.events.len(),
            "Fetched batch"
        );

        let completed = self.topology.local().and_then(|n| n.completed_tick);
        let dispatch = match completed {
            None => true,
            Some(c) if batch.prev_tick == c => true,
            Some(c) if batch.tick == c => {
                info!(batch_id = batch.batch_id, tick = c, "Batch already applied, committing only");
                metrics::record_batch_skipped(&self.node);
                false
            }
            Some(c) => {
                return Err(CascadeError::LostPosition {
                    node: self.node.clone(),
                    batch_start: batch.prev_tick,
                    batch_end: batch.tick,
                    completed: c,
                });
            }
        };

        let controls = interpreter::decode_batch(&batch).inspect_err(|_| {
            metrics::record_bad_control_event(&self.node);
        })?;
        let mut controls = controls.into_iter();
        // Control events land on a copy that replaces the live topology
        // once the batch is committed.
        let mut staged = self.topology.clone();
        let mut effects = Vec::new();
        let mut dispatched = 0usize;

        for event in &batch.events {
            if event.is_control() {
                let Some(control) = controls.next() else {
                    continue;
                };
                metrics::record_control_event(&self.node, control.kind());
                match interpreter::apply(&control, &mut staged, &self.ctx.worker_name) {
                    Ok(AppliedEffect::LocalNodeDropped) => {
                        return Err(CascadeError::NodeNotFound(self.node.clone()));
                    }
                    Ok(AppliedEffect::Ignored { kind }) => {
                        metrics::record_ignored_control_event(&self.node, &kind);
                    }
                    Ok(effect) => effects.push(effect),
                    Err(e) if e.is_protocol() => {
                        warn!(
                            kind = control.kind(),
                            event_id = event.ev_id,
                            error = %e,
                            "Control event rejected"
                        );
                        metrics::record_error(&self.node, e.kind());
                    }
                    Err(e) => return Err(e),
                }
            } else if dispatch {
                if let Some(limiter) = &self.ctx.rate_limiter {
                    limiter.acquire().await;
                }
                self.ctx
                    .handler
                    .handle_event(&self.node, event)
                    .await
                    .map_err(|e| CascadeError::Handler {
                        node: self.node.clone(),
                        event_id: event.ev_id,
                        message: e.to_string(),
                    })?;
                dispatched += 1;
            }
        }

        let store = &self.ctx.store;
        self.ctx
            .circuit
            .write("commit_batch", || store.commit_batch(&self.node, batch.batch_id))
            .await?;
        staged.set_completed_tick(&self.node, batch.tick);
        self.topology = staged;
        metrics::record_events_dispatched(&self.node, dispatched);
        metrics::record_batch_committed(&self.node, batch.tick, started.elapsed());
        debug!(batch_id = batch.batch_id, tick = batch.tick, dispatched, "Committed batch");

        self.error_backoff.reset();
        if self.last_error.take().is_some() {
            if let Err(e) = self
                .ctx
                .circuit
                .write("set_consumer_error", || store.set_consumer_error(&self.node, None))
                .await
            {
                debug!(error = %e, "Could not clear consumer error");
            }
        }

        let mut exit = false;
        for effect in effects {
            match self.handle_effect(effect).await {
                Ok(stop) => exit |= stop,
                Err(e) => {
                    warn!(error = %e, "Control effect failed after commit");
                    metrics::record_error(&self.node, e.kind());
                    self.last_error = Some(first_line(&e.to_string()));
                }
            }
        }
        Ok(if exit { Cycle::Exit } else { Cycle::Continue })
    }

    /// Act on an applied control event once its batch is committed.
    /// Returns `true` when the worker must stop consuming.
    async fn handle_effect(&mut self, effect: AppliedEffect) -> Result<bool> {
        match effect {
            AppliedEffect::NodeUpserted(name) => self.takeover.forget(&name),

            AppliedEffect::NodeRemoved(name) => wait_behind::provider_dropped(&mut self.waits, &name),

            AppliedEffect::NodeLost {
                dead,
                subscribers,
                replacement,
                was_provider,
            } => {
                wait_behind::provider_dropped(&mut self.waits, &dead.node_name);
                let named = replacement.as_deref() == Some(self.node.as_str());
                let designated = replacement.is_none() && was_provider && self.ctx.designated;
                if named || designated {
                    if self.ctx.settings.takeover.auto_takeover {
                        let job = TakeoverJob {
                            dead: dead.node_name.clone(),
                            dead_record: Some(dead),
                            subscribers,
                        };
                        self.takeover.request(&self.node, job);
                    } else {
                        warn!(dead = %dead.node_name, "Automatic takeover disabled, waiting for operator");
                    }
                } else if was_provider {
                    warn!(
                        provider = %dead.node_name,
                        replacement = ?replacement,
                        "Provider dropped, waiting to be re-pointed"
                    );
                }
            }

            AppliedEffect::ProviderSwitchPending { old, new } => {
                info!(old = %old, new = %new, "Provider switch pending");
                self.pending_switch = Some(PendingSwitch { old, new });
            }

            AppliedEffect::SubscriberSwitch { subscriber, old } => {
                wait_behind::begin(
                    &mut self.waits,
                    &mut self.topology,
                    &*self.ctx.store,
                    &self.ctx.circuit,
                    &subscriber,
                    &old,
                )
                .await;
            }

            AppliedEffect::MembersUpdated {
                combined_queue,
                effective,
            } => {
                if let Some(tick) = effective {
                    metrics::set_effective_watermark(&combined_queue, tick);
                }
            }

            AppliedEffect::WatermarkAdvanced { node, .. } => {
                for (queue, set) in self.topology.combined_queues() {
                    if let (true, Some(tick)) = (set.contains(&node), set.effective()) {
                        metrics::set_effective_watermark(queue, tick);
                    }
                }
            }

            AppliedEffect::Relinquish { new_worker } => {
                info!(new_worker = %new_worker, "Node handed over to another worker");
                return Ok(true);
            }

            AppliedEffect::Acquire => info!("Node handed over to this worker"),

            AppliedEffect::LocalPaused => {
                info!("Paused by control event");
                self.pause_unsynced = true;
                self.sync_pause().await?;
            }

            AppliedEffect::LocalResumed => {
                self.pause_unsynced = false;
                info!("Resumed by control event");
            }

            _ => {}
        }
        Ok(false)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Provider
    // ═══════════════════════════════════════════════════════════════════

    /// Provider to fetch from, or `None` while it cannot be resolved.
    async fn resolve_provider(&mut self) -> Result<Option<String>> {
        let missing = match self.topology.resolve_provider(&self.node) {
            Ok(p) => {
                let name = p.node_name.clone();
                self.provider_resolved();
                return Ok(Some(name));
            }
            Err(CascadeError::UnresolvedProvider { provider, .. }) => provider,
            Err(e) => return Err(e),
        };

        self.set_state(WorkerState::WaitingProvider);
        let since = *self.unresolved_since.get_or_insert_with(Instant::now);
        debug!(provider = %missing, "Provider unresolved, refreshing from store");

        self.refresh_local().await?;
        if let Ok(p) = self.topology.resolve_provider(&self.node) {
            let name = p.node_name.clone();
            info!(provider = %name, "Provider resolved");
            self.provider_resolved();
            return Ok(Some(name));
        }

        if let Some(grace) = self.ctx.settings.takeover.provider_dead_grace_duration() {
            if since.elapsed() >= grace && !self.grace_reported {
                self.grace_reported = true;
                warn!(
                    provider = %missing,
                    waited = ?since.elapsed(),
                    "Provider unresolved beyond grace period"
                );
                metrics::record_error(&self.node, "unresolved_provider");
                if self.ctx.designated && self.ctx.settings.takeover.auto_takeover && !missing.is_empty() {
                    self.request_takeover_of(&missing);
                }
            }
        }
        Ok(None)
    }

    fn provider_resolved(&mut self) {
        self.provider_backoff.reset();
        self.unresolved_since = None;
        self.grace_reported = false;
    }

    /// Reload the local record and its provider's.
    ///
    /// Picks up a re-pointing done by another node's takeover.
    async fn refresh_local(&mut self) -> Result<()> {
        let store = &self.ctx.store;
        let circuit = &self.ctx.circuit;

        let info = circuit
            .read("get_node_info", || store.get_node_info(&self.node))
            .await?
            .ok_or_else(|| CascadeError::NodeNotFound(self.node.clone()))?;

        let known = self.topology.local().and_then(|n| n.provider_node.clone());
        if info.provider_node != known {
            info!(old = ?known, new = ?info.provider_node, "Provider changed in store");
        }
        let provider = info.provider_node.clone();
        upsert_logged(&mut self.topology, info);

        if let Some(provider) = provider {
            match circuit.read("get_node_info", || store.get_node_info(&provider)).await {
                Ok(Some(node)) => upsert_logged(&mut self.topology, node),
                Ok(None) => debug!(provider = %provider, "Provider not in store"),
                Err(e) => debug!(provider = %provider, error = %e, "Provider lookup failed"),
            }
        }
        self.uptodate = true;
        Ok(())
    }

    /// Commit a pending provider switch once the new provider is known
    /// and has caught up with the local completed tick.
    async fn check_pending_switch(&mut self) -> Result<()> {
        let Some(pending) = self.pending_switch.clone() else {
            return Ok(());
        };
        let store = &self.ctx.store;
        let circuit = &self.ctx.circuit;

        match circuit.read("get_node_info", || store.get_node_info(&pending.new)).await {
            Ok(Some(node)) => upsert_logged(&mut self.topology, node),
            Ok(None) => {}
            Err(e) => debug!(new = %pending.new, error = %e, "New provider lookup failed"),
        }

        let local_completed = self.topology.local().and_then(|n| n.completed_tick).unwrap_or(0);
        let ready = match self.topology.get_node(&pending.new) {
            None => false,
            Some(n) if n.is_dead => false,
            Some(n) if n.node_type.is_root() => true,
            Some(n) => n.completed_tick.unwrap_or(0).max(n.watermark) >= local_completed,
        };
        if !ready {
            debug!(old = %pending.old, new = %pending.new, "New provider not ready, staying on old");
            return Ok(());
        }

        circuit
            .write("switch_provider", || store.switch_provider(&self.node, &pending.new))
            .await?;
        match self.topology.set_provider(&self.node, &pending.new) {
            Ok(()) => info!(old = %pending.old, new = %pending.new, "Provider switched"),
            Err(e) => warn!(new = %pending.new, error = %e, "Provider switch rejected locally"),
        }
        self.pending_switch = None;
        Ok(())
    }

    /// Persist a pause taken from a control event. Until that succeeds the
    /// store would report the node as running.
    async fn sync_pause(&mut self) -> Result<()> {
        let store = &self.ctx.store;
        self.ctx
            .circuit
            .write("pause_node", || store.pause_node(&self.node))
            .await?;
        self.pause_unsynced = false;
        Ok(())
    }

    async fn poll_paused(&mut self) -> Result<Cycle> {
        self.set_state(WorkerState::Paused);
        if self.pause_unsynced {
            self.sync_pause().await?;
        }
        let store = &self.ctx.store;
        let info = self
            .ctx
            .circuit
            .read("get_node_info", || store.get_node_info(&self.node))
            .await?
            .ok_or_else(|| CascadeError::NodeNotFound(self.node.clone()))?;

        if info.is_paused {
            let delay = self.ctx.settings.consumer.pause_poll_duration();
            return Ok(Cycle::Idle(self.idle_delay(delay)));
        }
        self.topology.set_paused(&self.node, false);
        info!("Resumed");
        Ok(Cycle::Continue)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════════

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        let store = &self.ctx.store;
        let circuit = &self.ctx.circuit;

        match cmd {
            Command::Stop => {
                info!("Stop requested");
                self.stop_requested = true;
            }

            Command::Pause => {
                circuit.write("pause_node", || store.pause_node(&self.node)).await?;
                self.topology.set_paused(&self.node, true);
                info!("Paused by operator");
            }

            Command::Resume => {
                circuit.write("resume_node", || store.resume_node(&self.node)).await?;
                self.topology.set_paused(&self.node, false);
                self.pause_unsynced = false;
                info!("Resumed by operator");
            }

            Command::Rewind => {
                let local = self.topology.local();
                let provider = local.and_then(|n| n.provider_node.clone());
                let tick = local.and_then(|n| n.completed_tick);
                match (provider, tick) {
                    (Some(provider), Some(tick)) => {
                        circuit
                            .write("register_at", || store.register_at(&provider, &self.node, tick))
                            .await?;
                        info!(provider = %provider, tick, "Rewound to completed tick");
                    }
                    _ => warn!("Rewind needs a provider and a completed tick"),
                }
            }

            Command::Reset => {
                let Some(provider) = self.topology.local().and_then(|n| n.provider_node.clone()) else {
                    warn!("Reset needs a provider");
                    return Ok(());
                };
                let position: Option<Tick> = circuit
                    .read("subscription_position", || {
                        store.subscription_position(&provider, &self.node)
                    })
                    .await?;
                let Some(position) = position else {
                    warn!(provider = %provider, "Reset: no subscription position on provider");
                    return Ok(());
                };
                circuit
                    .write("set_completed", || store.set_completed(&self.node, position))
                    .await?;
                self.topology.reset_completed_tick(&self.node, position);
                info!(provider = %provider, tick = position, "Completed tick reset to provider position");
            }

            Command::Takeover { dead } => {
                if dead == self.node {
                    warn!("A node cannot take over itself");
                } else {
                    self.request_takeover_of(&dead);
                }
            }
        }
        Ok(())
    }

    fn request_takeover_of(&mut self, dead: &str) {
        let job = TakeoverJob {
            dead: dead.to_string(),
            dead_record: self.topology.get_node(dead).cloned(),
            subscribers: self.topology.subscribers_of(dead),
        };
        self.topology.set_dead(dead, true);
        self.takeover.request(&self.node, job);
    }

    // ═══════════════════════════════════════════════════════════════════
    // Reporting
    // ═══════════════════════════════════════════════════════════════════

    /// Log, record and report a failed cycle. Returns the backoff delay.
    async fn on_cycle_error(&mut self, e: &CascadeError) -> Duration {
        let kind = e.kind();
        metrics::record_error(&self.node, kind);
        if matches!(
            e,
            CascadeError::Handler { .. } | CascadeError::BadControlEvent { .. } | CascadeError::LostPosition { .. }
        ) {
            metrics::record_batch_retry(&self.node, kind);
        }

        let delay = self.error_backoff.next_delay();
        if e.is_retryable() {
            warn!(error = %e, retry_in = ?delay, "Cycle failed");
        } else {
            error!(error = %e, retry_in = ?delay, "Cycle failed");
        }

        let message = first_line(&e.to_string());
        let store = &self.ctx.store;
        if let Err(err) = self
            .ctx
            .circuit
            .write("set_consumer_error", || store.set_consumer_error(&self.node, Some(&message)))
            .await
        {
            debug!(error = %err, "Could not record consumer error");
        }
        self.last_error = Some(message);
        delay
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Worker state");
            metrics::set_worker_state(&self.node, state.as_str());
            self.state = state;
        }
    }

    fn status(&self) -> NodeStatus {
        let local = self.topology.local();
        NodeStatus {
            node: self.node.clone(),
            state: self.state,
            uptodate: self.uptodate,
            last_error: self.last_error.clone(),
            provider: local.and_then(|n| n.provider_node.clone()),
            completed_tick: local.and_then(|n| n.completed_tick),
            paused: local.is_some_and(|n| n.is_paused),
            takeover: self.takeover.state().clone(),
            wait_behind: self.waits.clone(),
        }
    }

    fn publish(&self) {
        self.ch.topology_tx.send_replace(self.topology.clone());
        self.ch.status_tx.send_replace(self.status());
    }
}

/// Look up `names` concurrently. Missing or unreachable nodes are left out.
async fn load_nodes<S: BackingStore>(store: &S, circuit: &StoreCircuit, names: &[String]) -> Vec<Node> {
    let lookups = names
        .iter()
        .map(|name| circuit.read("get_node_info", move || store.get_node_info(name)));
    join_all(lookups)
        .await
        .into_iter()
        .filter_map(|r| r.ok().flatten())
        .collect()
}

fn upsert_logged(topology: &mut Topology, node: Node) {
    let name = node.node_name.clone();
    if let Err(e) = topology.upsert_node(node) {
        warn!(node = %name, error = %e, "Ignoring inconsistent node record");
    }
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().to_string()
}
