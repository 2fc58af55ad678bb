//! Result store: per-task state keyed by task id.
//!
//! The trait keeps the supervisor agnostic of the backing store; the
//! default is in-memory with a TTL sweeper. Status transitions are
//! validated against the task state machine on every update.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use scholarqa_core::{Step, Task, TaskId, TaskResult, TaskStatus};

use crate::TaskError;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, task: Task) -> Result<(), TaskError>;

    async fn get(&self, id: &TaskId) -> Option<Task>;

    /// Validated transition; rejects anything the state machine forbids.
    async fn update_status(&self, id: &TaskId, to: TaskStatus) -> Result<(), TaskError>;

    /// Append a step. The caller is responsible for closing the previous
    /// open step first so at most one step is ever open.
    async fn append_step(&self, id: &TaskId, step: Step) -> Result<(), TaskError>;

    /// Close the open step, recording an error on it when given.
    async fn close_open_step(&self, id: &TaskId, error: Option<String>) -> Result<(), TaskError>;

    async fn set_result(&self, id: &TaskId, result: TaskResult) -> Result<(), TaskError>;

    async fn set_detail(&self, id: &TaskId, detail: String) -> Result<(), TaskError>;

    async fn set_estimated_time(&self, id: &TaskId, estimate: String) -> Result<(), TaskError>;
}

/// In-memory store with TTL eviction of terminal tasks.
pub struct InMemoryResultStore {
    tasks: DashMap<String, Task>,
    ttl: Duration,
}

impl InMemoryResultStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
            ttl,
        })
    }

    /// Background sweeper removing expired terminal tasks.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                store.sweep();
            }
        })
    }

    pub fn sweep(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        self.tasks
            .retain(|_, task| !(task.status.is_terminal() && task.updated_at < cutoff));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn with_task<T>(
        &self,
        id: &TaskId,
        f: impl FnOnce(&mut Task) -> Result<T, TaskError>,
    ) -> Result<T, TaskError> {
        let mut entry = self
            .tasks
            .get_mut(id.as_str())
            .ok_or_else(|| TaskError::NotFound(id.clone()))?;
        let out = f(entry.value_mut())?;
        entry.updated_at = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, task: Task) -> Result<(), TaskError> {
        self.tasks.insert(task.id.as_str().to_string(), task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id.as_str()).map(|t| t.clone())
    }

    async fn update_status(&self, id: &TaskId, to: TaskStatus) -> Result<(), TaskError> {
        self.with_task(id, |task| {
            if !task.status.can_transition(to) {
                return Err(TaskError::InvalidTransition {
                    from: task.status,
                    to,
                });
            }
            task.status = to;
            Ok(())
        })
    }

    async fn append_step(&self, id: &TaskId, step: Step) -> Result<(), TaskError> {
        self.with_task(id, |task| {
            task.steps.push(step);
            Ok(())
        })
    }

    async fn close_open_step(&self, id: &TaskId, error: Option<String>) -> Result<(), TaskError> {
        self.with_task(id, |task| {
            if let Some(step) = task.steps.iter_mut().find(|s| s.is_open()) {
                step.end_timestamp = Some(Utc::now());
                step.error = error;
            }
            Ok(())
        })
    }

    async fn set_result(&self, id: &TaskId, result: TaskResult) -> Result<(), TaskError> {
        self.with_task(id, |task| {
            task.result = Some(result);
            Ok(())
        })
    }

    async fn set_detail(&self, id: &TaskId, detail: String) -> Result<(), TaskError> {
        self.with_task(id, |task| {
            task.detail = Some(detail);
            Ok(())
        })
    }

    async fn set_estimated_time(&self, id: &TaskId, estimate: String) -> Result<(), TaskError> {
        self.with_task(id, |task| {
            task.estimated_time = estimate;
            Ok(())
        })
    }
}
