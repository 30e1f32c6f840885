//! Shared-store result persistence
//!
//! Mirrors completed task results into the shared store so other
//! processes can read them: `result:<task_id>` holds the payload with a
//! TTL, `result:index:status:<status>` and `result:index:agent:<id>`
//! hold task id lists, and `metrics:ts:*` keeps time-bucketed counters.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::agent::TaskResult;
use crate::error::Result;
use crate::queue::store::SharedStore;

const RESULT_PREFIX: &str = "result:";
const STATUS_INDEX_PREFIX: &str = "result:index:status:";
const AGENT_INDEX_PREFIX: &str = "result:index:agent:";
const METRICS_PREFIX: &str = "metrics:ts:";

/// Metrics are bucketed per minute
const BUCKET_SECS: i64 = 60;

/// Stores task results and execution metrics in a shared store
pub struct ResultStore {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Persist one result and update the status/agent indexes. Storage
    /// failures are logged, never propagated: result persistence is
    /// best-effort alongside the in-memory map.
    pub async fn record(&self, result: &TaskResult) {
        if let Err(e) = self.try_record(result).await {
            warn!(task = %result.task_id, "result persistence failed: {}", e);
        }
    }

    async fn try_record(&self, result: &TaskResult) -> Result<()> {
        let key = format!("{}{}", RESULT_PREFIX, result.task_id);
        self.store
            .set(&key, serde_json::to_value(result)?, Some(self.ttl))
            .await?;

        let status_index = format!("{}{}", STATUS_INDEX_PREFIX, result.status);
        self.store
            .list_push(&status_index, serde_json::json!(result.task_id))
            .await?;
        let agent_index = format!("{}{}", AGENT_INDEX_PREFIX, result.agent_id);
        self.store
            .list_push(&agent_index, serde_json::json!(result.task_id))
            .await?;

        let bucket = Utc::now().timestamp() / BUCKET_SECS;
        let counter = if result.is_success() {
            format!("{}tasks:completed:{}", METRICS_PREFIX, bucket)
        } else {
            format!("{}tasks:failed:{}", METRICS_PREFIX, bucket)
        };
        self.store.incr(&counter).await?;

        Ok(())
    }

    /// Read a stored result back
    pub async fn get(&self, task_id: &str) -> Option<TaskResult> {
        let key = format!("{}{}", RESULT_PREFIX, task_id);
        match self.store.get(&key).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }

    /// How many results an agent has stored
    pub async fn count_for_agent(&self, agent_id: &str) -> usize {
        let key = format!("{}{}", AGENT_INDEX_PREFIX, agent_id);
        self.store.list_len(&key).await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryStore;

    #[tokio::test]
    async fn test_record_and_read_back() {
        let store = ResultStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let result = TaskResult::success(
            "t1",
            "agent_000",
            serde_json::json!({"output": "done"}),
            Duration::from_millis(20),
        );

        store.record(&result).await;

        let loaded = store.get("t1").await.unwrap();
        assert_eq!(loaded.task_id, "t1");
        assert_eq!(loaded.agent_id, "agent_000");
        assert_eq!(store.count_for_agent("agent_000").await, 1);
    }

    #[tokio::test]
    async fn test_missing_result_is_none() {
        let store = ResultStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        assert!(store.get("ghost").await.is_none());
    }
}
