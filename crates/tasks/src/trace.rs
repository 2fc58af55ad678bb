//! Event trace store.
//!
//! Append-only per-task log of stage records, written through a
//! non-blocking channel so a slow or failing sink never stalls the
//! pipeline. Backends: one JSON document per task on the local filesystem,
//! or the same blob PUT to an object store.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scholarqa_core::{CostRecord, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::TaskError;

/// One stage record: summarized inputs, structured outputs, duration, cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Human-readable input summary.
    pub summary: String,
    /// Structured stage output.
    pub output: serde_json::Value,
    /// Cost incurred by this stage alone.
    pub cost: CostRecord,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn append(&self, task_id: &TaskId, record: TraceRecord) -> Result<(), TaskError>;

    /// Flush and seal the task's document.
    async fn finalize(&self, task_id: &TaskId) -> Result<(), TaskError>;
}

/// Local file hierarchy: `<dir>/<task_id>.json`.
pub struct LocalTraceSink {
    dir: PathBuf,
    pending: DashMap<String, Vec<TraceRecord>>,
}

impl LocalTraceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: DashMap::new(),
        }
    }

    async fn write_document(&self, task_id: &TaskId) -> Result<(), TaskError> {
        let records = self
            .pending
            .get(task_id.as_str())
            .map(|r| r.clone())
            .unwrap_or_default();
        let bytes = serde_json::to_vec_pretty(&records)
            .map_err(|e| TaskError::Trace(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TaskError::Trace(e.to_string()))?;
        let path = self.dir.join(format!("{}.json", task_id.as_str()));
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| TaskError::Trace(e.to_string()))
    }
}

#[async_trait]
impl TraceSink for LocalTraceSink {
    async fn append(&self, task_id: &TaskId, record: TraceRecord) -> Result<(), TaskError> {
        self.pending
            .entry(task_id.as_str().to_string())
            .or_default()
            .push(record);
        // Keep the on-disk document current so crashes lose nothing.
        self.write_document(task_id).await
    }

    async fn finalize(&self, task_id: &TaskId) -> Result<(), TaskError> {
        self.write_document(task_id).await?;
        self.pending.remove(task_id.as_str());
        Ok(())
    }
}

/// Object-store backend: PUT of the whole document at finalize, same key
/// layout as the local sink.
pub struct ObjectStoreTraceSink {
    client: reqwest::Client,
    base_url: String,
    pending: DashMap<String, Vec<TraceRecord>>,
}

impl ObjectStoreTraceSink {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TaskError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TaskError::Trace(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            pending: DashMap::new(),
        })
    }
}

#[async_trait]
impl TraceSink for ObjectStoreTraceSink {
    async fn append(&self, task_id: &TaskId, record: TraceRecord) -> Result<(), TaskError> {
        self.pending
            .entry(task_id.as_str().to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn finalize(&self, task_id: &TaskId) -> Result<(), TaskError> {
        let records = self
            .pending
            .remove(task_id.as_str())
            .map(|(_, r)| r)
            .unwrap_or_default();
        let url = format!(
            "{}/{}.json",
            self.base_url.trim_end_matches('/'),
            task_id.as_str()
        );
        let response = self
            .client
            .put(&url)
            .json(&records)
            .send()
            .await
            .map_err(|e| TaskError::Trace(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TaskError::Trace(format!(
                "object store PUT returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

enum TraceMessage {
    Append(TaskId, TraceRecord),
    Finalize(TaskId),
}

/// Non-blocking facade over a sink. Records for one task stay ordered
/// because a single consumer drains the channel; sink failures are logged
/// and never propagate to the pipeline.
#[derive(Clone)]
pub struct TraceWriter {
    tx: mpsc::UnboundedSender<TraceMessage>,
}

impl TraceWriter {
    pub fn spawn(sink: impl TraceSink + 'static) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let result = match message {
                    TraceMessage::Append(task_id, record) => sink.append(&task_id, record).await,
                    TraceMessage::Finalize(task_id) => sink.finalize(&task_id).await,
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "trace write failed");
                }
            }
        });
        Self { tx }
    }

    pub fn append(&self, task_id: &TaskId, record: TraceRecord) {
        let _ = self
            .tx
            .send(TraceMessage::Append(task_id.clone(), record));
    }

    pub fn finalize(&self, task_id: &TaskId) {
        let _ = self.tx.send(TraceMessage::Finalize(task_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stage: &str) -> TraceRecord {
        let now = Utc::now();
        TraceRecord {
            stage: stage.to_string(),
            started_at: now,
            ended_at: now,
            duration_ms: 5,
            summary: "input".to_string(),
            output: serde_json::json!({"ok": true}),
            cost: CostRecord::default(),
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_local_sink_writes_one_document_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalTraceSink::new(dir.path());
        let task_id = TaskId::generate();

        sink.append(&task_id, record("decompose")).await.unwrap();
        sink.append(&task_id, record("retrieve")).await.unwrap();
        sink.finalize(&task_id).await.unwrap();

        let path = dir.path().join(format!("{}.json", task_id.as_str()));
        let bytes = std::fs::read(path).unwrap();
        let records: Vec<TraceRecord> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, "decompose");
        assert_eq!(records[1].stage, "retrieve");
    }

    #[tokio::test]
    async fn test_writer_preserves_order_and_never_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TraceWriter::spawn(LocalTraceSink::new(dir.path()));
        let task_id = TaskId::generate();

        for i in 0..10 {
            writer.append(&task_id, record(&format!("stage-{i}")));
        }
        writer.finalize(&task_id);

        // Drain asynchronously.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let path = dir.path().join(format!("{}.json", task_id.as_str()));
        let records: Vec<TraceRecord> =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[3].stage, "stage-3");
    }
}
