//! Narrow ingress surface: submit, poll, cancel, feedback.
//!
//! The external HTTP layer is a thin wrapper over this service; everything
//! it returns is the wire-stable task state document. Input errors and
//! moderation blocks become terminal `failed` tasks without any further
//! external call.

use std::sync::Arc;

use chrono::Utc;
use scholarqa_core::{CostRecord, Error, Result, Task, TaskId, TaskStateDoc, TaskStatus};
use scholarqa_retrieval::{ModerationVerdict, Moderator};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::ResultStore;
use crate::supervisor::TaskSupervisor;
use crate::trace::TraceRecord;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub query: String,
    pub user_id: String,
    #[serde(default)]
    pub opt_in: bool,
    #[serde(default)]
    pub feedback_toggle: bool,
}

/// Reader reaction to a finished report or one of its sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    ThumbsUp,
    ThumbsDown,
}

/// Collapsed feedback shape: free text and reaction are both optional, at
/// least one must be present.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    pub task_id: String,
    pub user_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reaction: Option<Reaction>,
    /// Section title the feedback refers to, when section-scoped.
    #[serde(default)]
    pub section: Option<String>,
}

pub struct TaskService {
    supervisor: Arc<TaskSupervisor>,
    store: Arc<dyn ResultStore>,
    moderator: Arc<dyn Moderator>,
    moderation_enabled: bool,
}

impl TaskService {
    pub fn new(
        supervisor: Arc<TaskSupervisor>,
        store: Arc<dyn ResultStore>,
        moderator: Arc<dyn Moderator>,
        moderation_enabled: bool,
    ) -> Self {
        Self {
            supervisor,
            store,
            moderator,
            moderation_enabled,
        }
    }

    /// Create a task for the query and start it, unless the input is
    /// rejected up front. The returned document always carries the task id.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskStateDoc> {
        let task = Task::new(TaskId::generate(), &request.user_id, request.query.trim());
        let task_id = task.id.clone();
        self.store
            .put(task)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;

        if request.query.trim().is_empty() {
            return self
                .reject(&task_id, "query must not be empty".to_string())
                .await;
        }

        if self.moderation_enabled {
            let gate = self
                .moderator
                .classify(request.query.trim(), &scholarqa_core::CancelToken::new())
                .await;
            match gate {
                Ok(ModerationVerdict::Block { reason }) => {
                    tracing::info!(task_id = %task_id, "query blocked by moderation");
                    return self
                        .reject(&task_id, format!("query was not accepted: {reason}"))
                        .await;
                }
                Ok(ModerationVerdict::Allow) => {}
                Err(e) => {
                    // Moderation outage fails open; the pipeline still runs.
                    tracing::warn!(error = %e, "moderation check unavailable, allowing query");
                }
            }
        }

        let estimate = self.supervisor.initial_estimate();
        let _ = self.store.set_estimated_time(&task_id, estimate).await;

        let task = self
            .store
            .get(&task_id)
            .await
            .ok_or_else(|| Error::Store("task vanished after put".into()))?;
        self.supervisor.spawn(&task);
        Ok(task.state_doc())
    }

    /// Current state snapshot for pollers.
    pub async fn poll(&self, task_id: &str) -> Result<TaskStateDoc> {
        let task = self
            .store
            .get(&TaskId(task_id.to_string()))
            .await
            .ok_or_else(|| Error::InvalidInput(format!("unknown task id {task_id}")))?;
        Ok(task.state_doc())
    }

    /// Cooperative cancellation; returns the post-cancel snapshot.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskStateDoc> {
        let id = TaskId(task_id.to_string());
        self.store
            .get(&id)
            .await
            .ok_or_else(|| Error::InvalidInput(format!("unknown task id {task_id}")))?;
        self.supervisor.cancel(&id);
        self.poll(task_id).await
    }

    /// Record feedback against a task; returns an opaque acknowledgement id.
    pub async fn feedback(&self, request: FeedbackRequest) -> Result<String> {
        if request.text.as_deref().map_or(true, str::is_empty) && request.reaction.is_none() {
            return Err(Error::InvalidInput(
                "feedback requires text or a reaction".into(),
            ));
        }
        let id = TaskId(request.task_id.clone());
        self.store
            .get(&id)
            .await
            .ok_or_else(|| Error::InvalidInput(format!("unknown task id {}", request.task_id)))?;

        let ack = Uuid::new_v4().to_string();
        tracing::info!(
            task_id = %request.task_id,
            user_id = %request.user_id,
            reaction = ?request.reaction,
            section = ?request.section,
            "feedback received"
        );
        let now = Utc::now();
        self.supervisor.trace_writer().append(
            &id,
            TraceRecord {
                stage: "feedback".to_string(),
                started_at: now,
                ended_at: now,
                duration_ms: 0,
                summary: format!("feedback from {}", request.user_id),
                output: serde_json::json!({
                    "ack": ack,
                    "text": request.text,
                    "reaction": request.reaction,
                    "section": request.section,
                }),
                cost: CostRecord::default(),
                warnings: Vec::new(),
            },
        );
        Ok(ack)
    }

    async fn reject(&self, task_id: &TaskId, detail: String) -> Result<TaskStateDoc> {
        let _ = self.store.set_detail(task_id, detail).await;
        let _ = self
            .store
            .update_status(task_id, TaskStatus::Failed)
            .await;
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| Error::Store("task vanished after put".into()))?;
        Ok(task.state_doc())
    }
}
