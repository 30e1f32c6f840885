//! In-memory priority queue backend

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::agent::Task;
use crate::error::Result;
use crate::queue::{QueueStats, TaskQueue};

struct QueuedTask {
    priority: u8,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority wins; earlier enqueue wins within a
        // priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    processing: HashMap<String, Task>,
    completed: u64,
    failed: Vec<(String, String)>,
}

/// Priority queue held entirely in process memory
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, task: Task) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueuedTask {
                priority: task.priority,
                seq,
                task,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.heap.pop() {
                    state
                        .processing
                        .insert(entry.task.id.clone(), entry.task.clone());
                    return Some(entry.task);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn complete(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.processing.remove(task_id).is_some() {
            state.completed += 1;
        }
        Ok(())
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.processing.remove(task_id).is_some() {
            state.failed.push((task_id.to_string(), error.to_string()));
        }
        Ok(())
    }

    async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            pending: state.heap.len(),
            processing: state.processing.len(),
            completed: state.completed,
            failed: state.failed.len(),
        }
    }
}
