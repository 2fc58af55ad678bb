//! Task orchestration: supervisor, stores and the ingress service.
//!
//! The supervisor drives the stage sequence for each task under an
//! admission semaphore, with cooperative cancellation and a wall-clock
//! deadline. State lives in a `ResultStore`; per-stage records stream to a
//! `TraceSink` through a non-blocking writer. The `TaskService` is the
//! narrow submit/poll/cancel/feedback surface the external HTTP layer
//! wraps.

pub mod estimate;
pub mod runtime;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod trace;

pub use runtime::build_service;
pub use service::{FeedbackRequest, Reaction, SubmitRequest, TaskService};
pub use store::{InMemoryResultStore, ResultStore};
pub use supervisor::TaskSupervisor;
pub use trace::{LocalTraceSink, ObjectStoreTraceSink, TraceRecord, TraceSink, TraceWriter};

use scholarqa_core::{TaskId, TaskStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("store error: {0}")]
    Store(String),

    #[error("trace error: {0}")]
    Trace(String),
}

impl From<TaskError> for scholarqa_core::Error {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound(id) => {
                scholarqa_core::Error::InvalidInput(format!("unknown task id {id}"))
            }
            other => scholarqa_core::Error::Store(other.to_string()),
        }
    }
}
