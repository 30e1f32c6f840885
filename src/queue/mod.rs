//! Pending-task queue
//!
//! Strict priority ordering: higher priority drains first, FIFO within a
//! priority. A task is pending, processing (exactly once), completed, or
//! failed. Two backends satisfy the same interface: a purely in-memory
//! queue and one over a shared key-value store with lease-based crash
//! recovery.

pub mod memory;
pub mod results;
pub mod store;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryQueue;
pub use results::ResultStore;
pub use store::{MemoryStore, SharedStore, SharedStoreQueue};

use crate::agent::Task;
use crate::error::Result;

/// Queue occupancy counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: usize,
}

/// Backend-agnostic task queue interface
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a task to the pending set
    async fn enqueue(&self, task: Task) -> Result<()>;

    /// Claim the highest-priority pending task, waiting up to `timeout`
    async fn dequeue(&self, timeout: Duration) -> Option<Task>;

    /// Acknowledge a processing task as done; repeated calls are no-ops
    async fn complete(&self, task_id: &str) -> Result<()>;

    /// Move a processing task to the failed set
    async fn fail(&self, task_id: &str, error: &str) -> Result<()>;

    async fn stats(&self) -> QueueStats;

    /// Periodic backend maintenance (lease recovery). Returns the
    /// number of tasks recovered; the in-memory backend has nothing to
    /// do.
    async fn maintain(&self) -> Result<usize> {
        Ok(0)
    }
}
