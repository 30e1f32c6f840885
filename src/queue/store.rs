//! Shared-store queue backend
//!
//! Persists queue state in an external key-value store so work survives
//! process restarts. Keys are namespaced:
//!
//! - `queue:priority`: sorted set of pending task ids
//! - `queue:data:<id>`: task payload with TTL
//! - `queue:processing:<id>`: lease marker created on dequeue
//! - `queue:failed`: list of failure records
//!
//! A janitor requeues tasks whose lease is older than the configured
//! threshold, giving at-least-once delivery after a crash.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::agent::Task;
use crate::error::{ConductorError, Result};
use crate::queue::{QueueStats, TaskQueue};

const PRIORITY_KEY: &str = "queue:priority";
const DATA_PREFIX: &str = "queue:data:";
const PROCESSING_PREFIX: &str = "queue:processing:";
const FAILED_KEY: &str = "queue:failed";
const SEQ_KEY: &str = "queue:seq";
const COMPLETED_KEY: &str = "queue:completed";

/// Each priority level spans this many sequence numbers in the score
/// space, keeping FIFO order within a priority.
const SEQ_SPAN: f64 = 1e12;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Minimal key-value store interface the queue and result storage need.
/// A Redis-like server satisfies this directly; [`MemoryStore`] is the
/// in-process reference implementation.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All live keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    /// Pop the member with the highest score
    async fn zpop_max(&self, key: &str) -> Result<Option<String>>;
    async fn zcard(&self, key: &str) -> Result<usize>;
    async fn list_push(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn list_len(&self, key: &str) -> Result<usize>;
    async fn incr(&self, key: &str) -> Result<u64>;
}

/// Task queue persisted in a shared store
pub struct SharedStoreQueue {
    store: std::sync::Arc<dyn SharedStore>,
    lease_timeout: Duration,
    ttl: Duration,
}

impl SharedStoreQueue {
    pub fn new(
        store: std::sync::Arc<dyn SharedStore>,
        lease_timeout: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            lease_timeout,
            ttl,
        }
    }

    fn score(priority: u8, seq: u64) -> f64 {
        // Higher priority first; within a priority, earlier sequence
        // numbers get higher scores so zpop_max keeps FIFO order.
        priority as f64 * SEQ_SPAN + (SEQ_SPAN - seq as f64)
    }

    /// Requeue every task whose processing lease has expired. Returns
    /// the number of tasks recovered.
    pub async fn requeue_stale(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let mut recovered = 0;

        for key in self.store.keys(PROCESSING_PREFIX).await? {
            let claimed_at = match self.store.get(&key).await? {
                Some(value) => value
                    .get("claimed_at")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(now),
                None => continue,
            };
            if now - claimed_at < self.lease_timeout.as_secs() as i64 {
                continue;
            }

            let task_id = key.trim_start_matches(PROCESSING_PREFIX).to_string();
            let data_key = format!("{}{}", DATA_PREFIX, task_id);
            match self.store.get(&data_key).await? {
                Some(payload) => {
                    let priority = payload
                        .get("priority")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(5) as u8;
                    let seq = self.store.incr(SEQ_KEY).await?;
                    self.store
                        .zadd(PRIORITY_KEY, &task_id, Self::score(priority, seq))
                        .await?;
                    self.store.delete(&key).await?;
                    warn!(task = %task_id, "requeued task with expired lease");
                    recovered += 1;
                }
                None => {
                    // Payload expired; nothing left to recover
                    self.store.delete(&key).await?;
                }
            }
        }

        if recovered > 0 {
            info!(recovered, "janitor pass finished");
        }
        Ok(recovered)
    }
}

#[async_trait]
impl TaskQueue for SharedStoreQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let payload = serde_json::to_value(&task)?;
        let data_key = format!("{}{}", DATA_PREFIX, task.id);
        self.store.set(&data_key, payload, Some(self.ttl)).await?;

        let seq = self.store.incr(SEQ_KEY).await?;
        self.store
            .zadd(PRIORITY_KEY, &task.id, Self::score(task.priority, seq))
            .await
    }

    async fn dequeue(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.store.zpop_max(PRIORITY_KEY).await {
                Ok(Some(task_id)) => {
                    let data_key = format!("{}{}", DATA_PREFIX, task_id);
                    match self.store.get(&data_key).await {
                        Ok(Some(payload)) => match serde_json::from_value::<Task>(payload) {
                            Ok(task) => {
                                let marker_key = format!("{}{}", PROCESSING_PREFIX, task_id);
                                let marker = serde_json::json!({
                                    "claimed_at": Utc::now().timestamp(),
                                });
                                if let Err(e) =
                                    self.store.set(&marker_key, marker, None).await
                                {
                                    warn!(task = %task_id, "failed to set lease: {}", e);
                                }
                                return Some(task);
                            }
                            Err(e) => {
                                warn!(task = %task_id, "corrupt task payload dropped: {}", e);
                                continue;
                            }
                        },
                        // Payload TTL expired between zadd and now
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("store read failed: {}", e);
                            return None;
                        }
                    }
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    warn!("store pop failed: {}", e);
                    return None;
                }
            }
        }
    }

    async fn complete(&self, task_id: &str) -> Result<()> {
        let marker_key = format!("{}{}", PROCESSING_PREFIX, task_id);
        if self.store.get(&marker_key).await?.is_none() {
            // Already acknowledged; keep the operation idempotent
            return Ok(());
        }
        self.store.delete(&marker_key).await?;
        self.store
            .delete(&format!("{}{}", DATA_PREFIX, task_id))
            .await?;
        self.store.incr(COMPLETED_KEY).await?;
        Ok(())
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<()> {
        let marker_key = format!("{}{}", PROCESSING_PREFIX, task_id);
        if self.store.get(&marker_key).await?.is_none() {
            return Ok(());
        }
        self.store.delete(&marker_key).await?;
        self.store
            .delete(&format!("{}{}", DATA_PREFIX, task_id))
            .await?;
        self.store
            .list_push(
                FAILED_KEY,
                serde_json::json!({
                    "task_id": task_id,
                    "error": error,
                    "failed_at": Utc::now().timestamp(),
                }),
            )
            .await
    }

    async fn maintain(&self) -> Result<usize> {
        self.requeue_stale().await
    }

    async fn stats(&self) -> QueueStats {
        let pending = self.store.zcard(PRIORITY_KEY).await.unwrap_or(0);
        let processing = self
            .store
            .keys(PROCESSING_PREFIX)
            .await
            .map(|k| k.len())
            .unwrap_or(0);
        let completed = self
            .store
            .get(COMPLETED_KEY)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let failed = self.store.list_len(FAILED_KEY).await.unwrap_or(0);

        QueueStats {
            pending,
            processing,
            completed,
            failed,
        }
    }
}

/// In-process [`SharedStore`] implementation. Used as the test backend
/// and as a reference for external store adapters.
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, (serde_json::Value, Option<Instant>)>,
    zsets: DashMap<String, Vec<(String, f64)>>,
    lists: DashMap<String, Vec<serde_json::Value>>,
    counters: DashMap<String, AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.values.get(key)?;
        let (value, expires) = entry.value();
        if let Some(deadline) = expires {
            if Instant::now() >= *deadline {
                drop(entry);
                self.values.remove(key);
                return None;
            }
        }
        Some(value.clone())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.values.insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        if let Some(counter) = self.counters.get(key) {
            return Ok(Some(serde_json::json!(counter.load(Ordering::SeqCst))));
        }
        Ok(self.live(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .values
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .filter(|entry| entry.value().1.map_or(true, |deadline| now < deadline))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut zset = self.zsets.entry(key.to_string()).or_default();
        zset.retain(|(m, _)| m != member);
        zset.push((member.to_string(), score));
        Ok(())
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<String>> {
        let mut zset = match self.zsets.get_mut(key) {
            Some(zset) => zset,
            None => return Ok(None),
        };
        let best = zset
            .iter()
            .enumerate()
            .max_by(|(_, (_, a)), (_, (_, b))| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i);
        Ok(best.map(|i| zset.remove(i).0))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self.zsets.get(key).map(|z| z.len()).unwrap_or(0))
    }

    async fn list_push(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.lists.entry(key.to_string()).or_default().push(value);
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Factory helper resolving the configured backend
pub fn connect_queue(
    settings: Option<&crate::config::SharedStoreSettings>,
    store: Option<std::sync::Arc<dyn SharedStore>>,
) -> Result<std::sync::Arc<dyn TaskQueue>> {
    match (settings, store) {
        (Some(settings), Some(store)) => Ok(std::sync::Arc::new(SharedStoreQueue::new(
            store,
            Duration::from_secs(settings.lease_timeout_secs),
            Duration::from_secs(settings.ttl_secs),
        ))),
        (Some(_), None) => Err(ConductorError::config(
            "shared_store configured but no store adapter provided",
        )),
        _ => Ok(std::sync::Arc::new(crate::queue::InMemoryQueue::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::TaskKind;
    use std::sync::Arc;

    fn task(id: &str, priority: u8) -> Task {
        let mut task = Task::new(TaskKind::Generic, "work");
        task.id = id.to_string();
        task.priority = priority;
        task
    }

    fn queue_with_lease(lease: Duration) -> SharedStoreQueue {
        SharedStoreQueue::new(Arc::new(MemoryStore::new()), lease, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_priority_ordering_via_store() {
        let queue = queue_with_lease(Duration::from_secs(300));
        queue.enqueue(task("low", 2)).await.unwrap();
        queue.enqueue(task("high", 9)).await.unwrap();
        queue.enqueue(task("mid", 5)).await.unwrap();

        assert_eq!(queue.dequeue(Duration::from_millis(10)).await.unwrap().id, "high");
        assert_eq!(queue.dequeue(Duration::from_millis(10)).await.unwrap().id, "mid");
        assert_eq!(queue.dequeue(Duration::from_millis(10)).await.unwrap().id, "low");
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = queue_with_lease(Duration::from_secs(300));
        for i in 0..4 {
            queue.enqueue(task(&format!("t{}", i), 5)).await.unwrap();
        }
        for i in 0..4 {
            let got = queue.dequeue(Duration::from_millis(10)).await.unwrap();
            assert_eq!(got.id, format!("t{}", i));
        }
    }

    #[tokio::test]
    async fn test_janitor_requeues_expired_lease() {
        let queue = queue_with_lease(Duration::from_secs(0));
        queue.enqueue(task("t1", 5)).await.unwrap();

        let claimed = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(claimed.id, "t1");
        // Not completed; lease is immediately stale with a zero timeout
        let recovered = queue.requeue_stale().await.unwrap();
        assert_eq!(recovered, 1);

        let again = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.id, "t1");
    }

    #[tokio::test]
    async fn test_janitor_leaves_fresh_leases() {
        let queue = queue_with_lease(Duration::from_secs(300));
        queue.enqueue(task("t1", 5)).await.unwrap();
        queue.dequeue(Duration::from_millis(10)).await.unwrap();

        let recovered = queue.requeue_stale().await.unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(queue.stats().await.processing, 1);
    }

    #[tokio::test]
    async fn test_complete_clears_lease_and_counts() {
        let queue = queue_with_lease(Duration::from_secs(300));
        queue.enqueue(task("t1", 5)).await.unwrap();
        queue.dequeue(Duration::from_millis(10)).await.unwrap();

        queue.complete("t1").await.unwrap();
        queue.complete("t1").await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_fail_records_failure() {
        let queue = queue_with_lease(Duration::from_secs(300));
        queue.enqueue(task("t1", 5)).await.unwrap();
        queue.dequeue(Duration::from_millis(10)).await.unwrap();
        queue.fail("t1", "agent died").await.unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.failed, 1);
    }
}
