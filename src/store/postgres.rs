// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! PostgreSQL backing store over the `pgq` / `pgq_node` SQL API.
//!
//! Every cascade node is its own database. The store keeps one pool per
//! node, starting from the local node's database and resolving the others
//! lazily through `pgq_node.get_queue_locations()`.
//!
//! ```text
//! fetch_batch(provider, consumer)   provider db: pgq.next_batch_info + pgq.get_batch_events
//! commit_batch(node, batch_id)      provider db: pgq.finish_batch
//!                                   node db:     pgq_node.set_consumer_completed
//! register_at(provider, node, tick) provider db: pgq.register_consumer_at
//! ```
//!
//! `pgq_node` functions answer with `(ret_code, ret_note)`; codes of 300
//! and above become [`StoreError::Rejected`].

use super::{BackingStore, BoxFuture, StoreError, StoreResult};
use crate::event::{Batch, Event};
use crate::topology::{CombinedType, Node, NodeType, Tick};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

const POOL_MAX_CONNECTIONS: u32 = 2;
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Moves an existing consumer's position; registers it if absent.
const REGISTER_CONSUMER_AT: &str = "SELECT pgq.register_consumer_at($1, $2, $3)";

/// Map a driver error to the store taxonomy.
fn classify(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_) => StoreError::Unavailable(e.to_string()),
        sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
        other => StoreError::Rejected(other.to_string()),
    }
}

fn check_ret(code: i32, note: &str) -> StoreResult<()> {
    match code {
        c if c < 300 => Ok(()),
        404 => Err(StoreError::NotFound(note.to_string())),
        _ => Err(StoreError::Rejected(format!("{code} {note}"))),
    }
}

fn node_from_row(row: &PgRow) -> StoreResult<Node> {
    let get_str = |col: &str| -> StoreResult<Option<String>> { row.try_get(col).map_err(classify) };

    let name = get_str("node_name")?.unwrap_or_default();
    let type_name = get_str("node_type")?.unwrap_or_default();
    let node_type = NodeType::parse(&type_name)
        .ok_or_else(|| StoreError::Rejected(format!("unknown node type {type_name:?} for {name}")))?;
    let combined_type = match get_str("combined_type")?.as_deref() {
        Some("part") => Some(CombinedType::Part),
        Some("full") => Some(CombinedType::Full),
        _ => None,
    };
    let watermark: Option<i64> = row.try_get("local_watermark").map_err(classify)?;
    let completed: Option<i64> = row.try_get("worker_last_tick").map_err(classify)?;
    let paused: Option<bool> = row.try_get("worker_paused").map_err(classify)?;

    Ok(Node {
        node_name: name,
        node_type,
        provider_node: get_str("provider_node")?.filter(|p| !p.is_empty()),
        worker_name: get_str("worker_name")?.unwrap_or_default(),
        is_paused: paused.unwrap_or(false),
        is_dead: false,
        combined_queue: get_str("combined_queue")?.filter(|q| !q.is_empty()),
        combined_type,
        watermark: watermark.map_or(0, |w| w.max(0) as Tick),
        completed_tick: completed.map(|t| t.max(0) as Tick),
    })
}

fn event_from_row(row: &PgRow) -> StoreResult<Event> {
    let get = |col: &str| -> StoreResult<Option<String>> { row.try_get(col).map_err(classify) };
    let ev_id: i64 = row.try_get("ev_id").map_err(classify)?;
    Ok(Event {
        ev_id: ev_id.max(0) as u64,
        ev_type: get("ev_type")?.unwrap_or_default(),
        ev_data: get("ev_data")?.unwrap_or_default(),
        ev_extra1: get("ev_extra1")?,
        ev_extra2: get("ev_extra2")?,
        ev_extra3: get("ev_extra3")?,
        ev_extra4: get("ev_extra4")?,
    })
}

/// Open batch bookkeeping needed at commit time.
#[derive(Debug, Clone)]
struct OpenBatch {
    provider: String,
    tick: Tick,
}

pub struct PgStore {
    queue_name: String,
    local_node: String,
    pools: RwLock<HashMap<String, PgPool>>,
    open: RwLock<HashMap<u64, OpenBatch>>,
}

impl PgStore {
    /// Connect to the local node's database.
    pub async fn connect(
        queue_name: impl Into<String>,
        local_node: impl Into<String>,
        dsn: &str,
    ) -> StoreResult<Self> {
        let queue_name = queue_name.into();
        let local_node = local_node.into();
        info!(queue = %queue_name, node = %local_node, "Connecting to local queue database");
        let pool = Self::open_pool(dsn).await?;
        let mut pools = HashMap::new();
        pools.insert(local_node.clone(), pool);
        Ok(Self {
            queue_name,
            local_node,
            pools: RwLock::new(pools),
            open: RwLock::new(HashMap::new()),
        })
    }

    async fn open_pool(dsn: &str) -> StoreResult<PgPool> {
        PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
            .connect(dsn)
            .await
            .map_err(classify)
    }

    /// Pool for `node`'s database, resolving its location on first use.
    async fn pool_for(&self, node: &str) -> StoreResult<PgPool> {
        if let Some(pool) = self.pools.read().await.get(node) {
            return Ok(pool.clone());
        }

        let home = self.home().await?;
        let location: Option<String> = sqlx::query_scalar(
            "SELECT node_location FROM pgq_node.get_queue_locations($1) WHERE node_name = $2",
        )
        .bind(&self.queue_name)
        .bind(node)
        .fetch_optional(&home)
        .await
        .map_err(classify)?;
        let location = location.ok_or_else(|| StoreError::NotFound(format!("location of {node}")))?;

        debug!(node = %node, "Opening pool to node database");
        let pool = Self::open_pool(&location).await?;
        self.pools
            .write()
            .await
            .entry(node.to_string())
            .or_insert_with(|| pool.clone());
        Ok(pool)
    }

    async fn home(&self) -> StoreResult<PgPool> {
        self.pools
            .read()
            .await
            .get(&self.local_node)
            .cloned()
            .ok_or_else(|| StoreError::Unavailable("local pool closed".into()))
    }

    async fn call_ret(&self, node: &str, sql: &str, args: &[&str]) -> StoreResult<()> {
        let pool = self.pool_for(node).await?;
        let mut query = sqlx::query_as::<_, (i32, String)>(sql).bind(&self.queue_name);
        for arg in args {
            query = query.bind(*arg);
        }
        let (code, note) = query.fetch_one(&pool).await.map_err(classify)?;
        check_ret(code, &note)
    }
}

impl BackingStore for PgStore {
    fn fetch_batch(&self, provider: &str, consumer: &str) -> BoxFuture<'_, Option<Batch>> {
        let provider = provider.to_string();
        let consumer = consumer.to_string();
        Box::pin(async move {
            let pool = self.pool_for(&provider).await?;
            let info: Option<(Option<i64>, Option<i64>, Option<i64>)> = sqlx::query_as(
                "SELECT batch_id, cur_tick_id, prev_tick_id FROM pgq.next_batch_info($1, $2)",
            )
            .bind(&self.queue_name)
            .bind(&consumer)
            .fetch_optional(&pool)
            .await
            .map_err(classify)?;

            let Some((Some(batch_id), Some(tick), Some(prev_tick))) = info else {
                return Ok(None);
            };

            let rows = sqlx::query(
                "SELECT ev_id, ev_type, ev_data, ev_extra1, ev_extra2, ev_extra3, ev_extra4 \
                 FROM pgq.get_batch_events($1)",
            )
            .bind(batch_id)
            .fetch_all(&pool)
            .await
            .map_err(classify)?;
            let events = rows.iter().map(event_from_row).collect::<StoreResult<Vec<_>>>()?;

            let batch_id = batch_id.max(0) as u64;
            let tick = tick.max(0) as Tick;
            self.open
                .write()
                .await
                .insert(batch_id, OpenBatch { provider, tick });
            Ok(Some(Batch {
                batch_id,
                prev_tick: prev_tick.max(0) as Tick,
                tick,
                events,
            }))
        })
    }

    fn commit_batch(&self, node: &str, batch_id: u64) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            let Some(open) = self.open.read().await.get(&batch_id).cloned() else {
                return Ok(());
            };
            let provider_pool = self.pool_for(&open.provider).await?;
            sqlx::query("SELECT pgq.finish_batch($1)")
                .bind(batch_id as i64)
                .execute(&provider_pool)
                .await
                .map_err(classify)?;

            let pool = self.pool_for(&node).await?;
            let (code, note): (i32, String) = sqlx::query_as(
                "SELECT ret_code, ret_note FROM pgq_node.set_consumer_completed($1, $2, $3)",
            )
            .bind(&self.queue_name)
            .bind(&node)
            .bind(open.tick as i64)
            .fetch_one(&pool)
            .await
            .map_err(classify)?;
            check_ret(code, &note)?;

            self.open.write().await.remove(&batch_id);
            Ok(())
        })
    }

    fn get_node_info(&self, node: &str) -> BoxFuture<'_, Option<Node>> {
        let node = node.to_string();
        Box::pin(async move {
            let pool = match self.pool_for(&node).await {
                Ok(pool) => pool,
                Err(StoreError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            let row = sqlx::query("SELECT * FROM pgq_node.get_node_info($1)")
                .bind(&self.queue_name)
                .fetch_optional(&pool)
                .await
                .map_err(classify)?;
            let Some(row) = row else {
                return Ok(None);
            };
            let code: i32 = row.try_get("ret_code").map_err(classify)?;
            if code == 404 {
                return Ok(None);
            }
            let note: String = row.try_get("ret_note").map_err(classify)?;
            check_ret(code, &note)?;
            node_from_row(&row).map(Some)
        })
    }

    fn list_subscribers(&self, node: &str) -> BoxFuture<'_, Vec<String>> {
        let node = node.to_string();
        Box::pin(async move {
            let pool = self.pool_for(&node).await?;
            sqlx::query_scalar("SELECT node_name FROM pgq_node.get_subscriber_info($1)")
                .bind(&self.queue_name)
                .fetch_all(&pool)
                .await
                .map_err(classify)
        })
    }

    fn switch_provider(&self, node: &str, new_provider: &str) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        let new_provider = new_provider.to_string();
        Box::pin(async move {
            self.call_ret(
                &node,
                "SELECT ret_code, ret_note FROM pgq_node.change_consumer_provider($1, $2, $3)",
                &[&node, &new_provider],
            )
            .await
        })
    }

    fn pause_node(&self, node: &str) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            self.call_ret(
                &node,
                "SELECT ret_code, ret_note FROM pgq_node.set_consumer_paused($1, $2, true)",
                &[&node],
            )
            .await
        })
    }

    fn resume_node(&self, node: &str) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            self.call_ret(
                &node,
                "SELECT ret_code, ret_note FROM pgq_node.set_consumer_paused($1, $2, false)",
                &[&node],
            )
            .await
        })
    }

    fn promote_root(&self, node: &str) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            self.call_ret(
                &node,
                "SELECT ret_code, ret_note FROM pgq_node.promote_branch($1)",
                &[],
            )
            .await
        })
    }

    fn list_combined_members(&self, combined_queue: &str) -> BoxFuture<'_, Vec<String>> {
        let combined_queue = combined_queue.to_string();
        Box::pin(async move {
            let home = self.home().await?;
            sqlx::query_scalar(
                "SELECT node_name FROM pgq_node.get_queue_locations($1) WHERE NOT dead_node",
            )
            .bind(&combined_queue)
            .fetch_all(&home)
            .await
            .map_err(classify)
        })
    }

    fn set_consumer_error(&self, node: &str, error: Option<&str>) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        let error = error.map(str::to_string);
        Box::pin(async move {
            let pool = self.pool_for(&node).await?;
            let (code, note): (i32, String) = sqlx::query_as(
                "SELECT ret_code, ret_note FROM pgq_node.set_consumer_error($1, $2, $3)",
            )
            .bind(&self.queue_name)
            .bind(&node)
            .bind(error)
            .fetch_one(&pool)
            .await
            .map_err(classify)?;
            check_ret(code, &note)
        })
    }

    fn register_at(&self, provider: &str, node: &str, tick: Tick) -> BoxFuture<'_, ()> {
        let provider = provider.to_string();
        let node = node.to_string();
        Box::pin(async move {
            let pool = self.pool_for(&provider).await?;
            let created: i32 = sqlx::query_scalar(REGISTER_CONSUMER_AT)
                .bind(&self.queue_name)
                .bind(&node)
                .bind(tick as i64)
                .fetch_one(&pool)
                .await
                .map_err(classify)?;
            debug!(
                provider = %provider,
                consumer = %node,
                tick,
                created = created == 1,
                "Consumer registered at tick"
            );
            Ok(())
        })
    }

    fn set_completed(&self, node: &str, tick: Tick) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            let pool = self.pool_for(&node).await?;
            let (code, note): (i32, String) = sqlx::query_as(
                "SELECT ret_code, ret_note FROM pgq_node.set_consumer_completed($1, $2, $3)",
            )
            .bind(&self.queue_name)
            .bind(&node)
            .bind(tick as i64)
            .fetch_one(&pool)
            .await
            .map_err(classify)?;
            check_ret(code, &note)
        })
    }

    fn subscription_position(&self, provider: &str, consumer: &str) -> BoxFuture<'_, Option<Tick>> {
        let provider = provider.to_string();
        let consumer = consumer.to_string();
        Box::pin(async move {
            let pool = self.pool_for(&provider).await?;
            let tick: Option<Option<i64>> =
                sqlx::query_scalar("SELECT last_tick FROM pgq.get_consumer_info($1, $2)")
                    .bind(&self.queue_name)
                    .bind(&consumer)
                    .fetch_optional(&pool)
                    .await
                    .map_err(classify)?;
            Ok(tick.flatten().map(|t| t.max(0) as Tick))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_transient());
        assert!(classify(sqlx::Error::PoolClosed).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(classify(sqlx::Error::Io(io)).is_transient());
    }

    #[test]
    fn test_classify_not_found() {
        assert!(matches!(
            classify(sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn test_register_at_moves_consumer_on_provider() {
        assert!(REGISTER_CONSUMER_AT.contains("pgq.register_consumer_at("));
        assert!(!REGISTER_CONSUMER_AT.contains("pgq_node"));
        assert_eq!(REGISTER_CONSUMER_AT.matches('$').count(), 3);
    }

    #[test]
    fn test_check_ret_codes() {
        assert!(check_ret(200, "ok").is_ok());
        assert!(matches!(check_ret(404, "no node"), Err(StoreError::NotFound(_))));
        match check_ret(301, "provider mismatch") {
            Err(StoreError::Rejected(msg)) => assert!(msg.contains("301")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
