//! Task lifecycle types and the wire-stable state document.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::paper::PaperRecord;
use crate::section::GeneratedSection;

/// Unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task state machine.
///
/// Transitions are monotonic: queued -> in_progress -> {complete, failed,
/// cancelled}, with queued -> {cancelled, failed} allowed for tasks rejected
/// or cancelled before admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Queued, InProgress) | (Queued, Cancelled) | (Queued, Failed) => true,
            (InProgress, Complete) | (InProgress, Failed) | (InProgress, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One progress step. Steps are append-only; at most one step per task is
/// open (no end timestamp) at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Stage that produced the step; not part of the wire document.
    #[serde(skip)]
    pub stage: String,
    pub description: String,
    pub start_timestamp: DateTime<Utc>,
    /// Expected completion time for this step.
    pub estimated_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn is_open(&self) -> bool {
        self.end_timestamp.is_none()
    }
}

/// Per-model token and currency usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub cached_calls: u64,
    /// Calls served by this model standing in for a chain's primary.
    #[serde(default)]
    pub fallback_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Total time spent waiting on rate-limit buckets.
    #[serde(default)]
    pub waited_ms: u64,
    pub cost_usd: f64,
}

impl ModelUsage {
    pub fn merge(&mut self, other: &ModelUsage) {
        self.calls += other.calls;
        self.cached_calls += other.cached_calls;
        self.fallback_calls += other.fallback_calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.waited_ms += other.waited_ms;
        self.cost_usd += other.cost_usd;
    }
}

/// Aggregate cost over all models used by a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub by_model: BTreeMap<String, ModelUsage>,
}

impl CostRecord {
    pub fn record(&mut self, model: &str, usage: &ModelUsage) {
        self.by_model
            .entry(model.to_string())
            .or_default()
            .merge(usage);
    }

    pub fn total_usd(&self) -> f64 {
        self.by_model.values().map(|u| u.cost_usd).sum()
    }
}

/// Wall-clock timing per stage, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub total_ms: u64,
    pub by_stage: BTreeMap<String, u64>,
}

/// Final output of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub sections: Vec<GeneratedSection>,
    /// Every paper cited anywhere in the result, in reference-number order.
    pub papers: Vec<PaperRecord>,
    pub cost: CostRecord,
    pub timing: TimingRecord,
    /// Degraded-path notes surfaced to the client (e.g. reranker outage).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// One end-to-end question-answering job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: String,
    pub query: String,
    pub status: TaskStatus,
    pub estimated_time: String,
    pub steps: Vec<Step>,
    pub result: Option<TaskResult>,
    /// Failure message for terminal failures.
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, user_id: &str, query: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: user_id.to_string(),
            query: query.to_string(),
            status: TaskStatus::Queued,
            estimated_time: String::new(),
            steps: Vec::new(),
            result: None,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn open_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.is_open())
    }

    /// Wire-stable snapshot for pollers.
    pub fn state_doc(&self) -> TaskStateDoc {
        TaskStateDoc {
            task_id: self.id.0.clone(),
            query: self.query.clone(),
            task_status: self.status,
            estimated_time: self.estimated_time.clone(),
            steps: self.steps.clone(),
            task_result: self.result.clone(),
            detail: self.detail.clone(),
        }
    }
}

/// The document returned to pollers. Field names and statuses are
/// wire-stable; clients depend on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateDoc {
    pub task_id: String,
    pub query: String,
    pub task_status: TaskStatus,
    pub estimated_time: String,
    pub steps: Vec<Step>,
    pub task_result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Queued.can_transition(InProgress));
        assert!(Queued.can_transition(Cancelled));
        assert!(Queued.can_transition(Failed));
        assert!(InProgress.can_transition(Complete));
        assert!(InProgress.can_transition(Failed));
        assert!(InProgress.can_transition(Cancelled));
        assert!(!Complete.can_transition(InProgress));
        assert!(!Cancelled.can_transition(Complete));
        assert!(!Queued.can_transition(Complete));
    }

    #[test]
    fn test_status_wire_form() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }

    #[test]
    fn test_cost_record_merges_per_model() {
        let mut cost = CostRecord::default();
        let usage = ModelUsage {
            calls: 1,
            input_tokens: 100,
            output_tokens: 50,
            cost_usd: 0.01,
            ..Default::default()
        };
        cost.record("gpt-a", &usage);
        cost.record("gpt-a", &usage);
        cost.record("gpt-b", &usage);
        assert_eq!(cost.by_model["gpt-a"].calls, 2);
        assert_eq!(cost.by_model["gpt-a"].input_tokens, 200);
        assert!((cost.total_usd() - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_state_doc_round_trip() {
        let mut task = Task::new(TaskId::generate(), "u1", "why is the sky blue?");
        let now = Utc::now();
        task.steps.push(Step {
            stage: "decompose".into(),
            description: "Understanding the question".into(),
            start_timestamp: now,
            estimated_timestamp: now + Duration::seconds(5),
            end_timestamp: Some(now + Duration::seconds(3)),
            error: None,
        });
        task.steps.push(Step {
            stage: "retrieve".into(),
            description: "Finding papers".into(),
            start_timestamp: now + Duration::seconds(3),
            estimated_timestamp: now + Duration::seconds(20),
            end_timestamp: None,
            error: None,
        });

        let doc = task.state_doc();
        let json = serde_json::to_string(&doc).unwrap();
        let back: TaskStateDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, task.id.0);
        assert_eq!(back.task_status, TaskStatus::Queued);
        assert_eq!(back.steps.len(), 2);
        assert_eq!(back.steps[0].description, "Understanding the question");
        assert!(back.steps[1].end_timestamp.is_none());
    }

    #[test]
    fn test_open_step_is_latest_unclosed() {
        let mut task = Task::new(TaskId::generate(), "u1", "q");
        assert!(task.open_step().is_none());
        let now = Utc::now();
        task.steps.push(Step {
            stage: "retrieve".into(),
            description: "Finding papers".into(),
            start_timestamp: now,
            estimated_timestamp: now,
            end_timestamp: None,
            error: None,
        });
        assert_eq!(task.open_step().unwrap().stage, "retrieve");
    }
}
