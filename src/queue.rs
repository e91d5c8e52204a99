// Aglogen Assistant — Background task queue
//
// Fire-and-forget hand-off to workers. Enqueued tasks are recorded for status
// polling and published on a bounded channel per lane: indexing tasks are
// consumed in-process, compute tasks are left for the simulation workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

pub const RUN_SIMULATION: &str = "run_simulation";
pub const RUN_BOX_COUNTING: &str = "run_box_counting";
pub const RUN_FRAKTAL_ANALYSIS: &str = "run_fraktal_analysis";
pub const RUN_FRAKTAL_AUTO_CALIBRATE: &str = "run_fraktal_auto_calibrate";
pub const INDEX_SIMULATION: &str = "index_simulation";
pub const INDEX_ANALYSIS: &str = "index_analysis";
pub const INDEX_DOCUMENT: &str = "index_scientific_document";

/// Finished records kept for status polling before the oldest are dropped.
pub const DEFAULT_FINISHED_LIMIT: usize = 10_000;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task queue is full ({0} lane), try again later")]
    Full(&'static str),
    #[error("Task queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Progress,
    Success,
    Failure,
    Revoked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Progress => "PROGRESS",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Revoked => "REVOKED",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked)
    }
}

/// Which consumer a task is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Indexing,
    Compute,
}

impl Lane {
    pub fn for_task(name: &str) -> Self {
        match name {
            INDEX_SIMULATION | INDEX_ANALYSIS | INDEX_DOCUMENT => Lane::Indexing,
            _ => Lane::Compute,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Indexing => "indexing",
            Lane::Compute => "compute",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub name: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub args: Vec<Value>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub progress: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    finished_seq: Option<u64>,
}

impl TaskRecord {
    fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            args: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            progress: None,
            enqueued_at: Utc::now(),
            finished_at: None,
            finished_seq: None,
        }
    }
}

#[derive(Clone)]
struct Channel {
    tx: mpsc::Sender<TaskMessage>,
    rx: Arc<Mutex<mpsc::Receiver<TaskMessage>>>,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    indexing: Channel,
    compute: Channel,
    records: Arc<RwLock<HashMap<String, TaskRecord>>>,
    finished_seq: Arc<AtomicU64>,
    finished_limit: usize,
}

impl TaskQueue {
    /// `capacity` bounds each lane separately.
    pub fn new(capacity: usize) -> Self {
        Self {
            indexing: Channel::new(capacity),
            compute: Channel::new(capacity),
            records: Arc::new(RwLock::new(HashMap::new())),
            finished_seq: Arc::new(AtomicU64::new(0)),
            finished_limit: DEFAULT_FINISHED_LIMIT,
        }
    }

    pub fn with_finished_limit(mut self, limit: usize) -> Self {
        self.finished_limit = limit;
        self
    }

    fn channel(&self, lane: Lane) -> &Channel {
        match lane {
            Lane::Indexing => &self.indexing,
            Lane::Compute => &self.compute,
        }
    }

    /// Record a task and publish it on its lane. Nothing is recorded when the
    /// lane is full.
    pub async fn enqueue(&self, name: &str, args: Vec<Value>) -> Result<String, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let lane = Lane::for_task(name);
        let record = TaskRecord {
            id: id.clone(),
            name: name.to_string(),
            args: args.clone(),
            ..TaskRecord::pending(&id)
        };
        self.records.write().await.insert(id.clone(), record);

        let msg = TaskMessage {
            id: id.clone(),
            name: name.to_string(),
            args,
        };
        if let Err(e) = self.channel(lane).tx.try_send(msg) {
            self.records.write().await.remove(&id);
            tracing::warn!(task = %name, lane = lane.as_str(), "Task rejected: {}", e);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full(lane.as_str()),
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            });
        }
        tracing::debug!(task = %name, task_id = %id, lane = lane.as_str(), "Task enqueued");
        Ok(id)
    }

    /// Next task published on `lane`. Waits until one arrives.
    pub async fn next_in(&self, lane: Lane) -> Option<TaskMessage> {
        self.channel(lane).rx.lock().await.recv().await
    }

    /// Take a published task without waiting.
    pub async fn try_next_in(&self, lane: Lane) -> Option<TaskMessage> {
        self.channel(lane).rx.lock().await.try_recv().ok()
    }

    /// The record for `id`, if this queue has seen it.
    pub async fn record(&self, id: &str) -> Option<TaskRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Current record. Unknown ids report as pending, mirroring a broker that
    /// has not seen the task yet.
    pub async fn status(&self, id: &str) -> TaskRecord {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_else(|| TaskRecord::pending(id))
    }

    pub async fn revoke(&self, id: &str) {
        let mut records = self.records.write().await;
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| TaskRecord::pending(id));
        record.status = TaskStatus::Revoked;
        self.finish(record);
        self.evict_finished(&mut records);
        tracing::info!(task_id = %id, "Task revoked");
    }

    pub async fn mark_started(&self, id: &str) {
        self.update(id, |r| r.status = TaskStatus::Started).await;
    }

    pub async fn mark_progress(&self, id: &str, progress: Value) {
        self.update(id, |r| {
            r.status = TaskStatus::Progress;
            r.progress = Some(progress);
        })
        .await;
    }

    pub async fn mark_success(&self, id: &str, result: Value) {
        self.update(id, |r| {
            r.status = TaskStatus::Success;
            r.result = Some(result);
        })
        .await;
    }

    pub async fn mark_failure(&self, id: &str, error: impl Into<String>) {
        let error = error.into();
        self.update(id, |r| {
            r.status = TaskStatus::Failure;
            r.error = Some(error);
        })
        .await;
    }

    async fn update(&self, id: &str, f: impl FnOnce(&mut TaskRecord)) {
        let mut records = self.records.write().await;
        let finished = match records.get_mut(id) {
            Some(record) if record.status != TaskStatus::Revoked => {
                f(record);
                let finished = record.status.is_finished();
                if finished {
                    self.finish(record);
                }
                finished
            }
            Some(_) => {
                tracing::debug!(task_id = %id, "Ignoring update for revoked task");
                false
            }
            None => {
                tracing::warn!(task_id = %id, "Update for unknown task");
                false
            }
        };
        if finished {
            self.evict_finished(&mut records);
        }
    }

    fn finish(&self, record: &mut TaskRecord) {
        record.finished_at = Some(Utc::now());
        record.finished_seq = Some(self.finished_seq.fetch_add(1, Ordering::Relaxed));
    }

    /// Drop the oldest finished records beyond the limit. Pending and running
    /// tasks are never dropped.
    fn evict_finished(&self, records: &mut HashMap<String, TaskRecord>) {
        let mut finished: Vec<(u64, String)> = records
            .values()
            .filter_map(|r| r.finished_seq.map(|seq| (seq, r.id.clone())))
            .collect();
        if finished.len() <= self.finished_limit {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.finished_limit;
        for (_, id) in finished.into_iter().take(excess) {
            records.remove(&id);
        }
        tracing::debug!(evicted = excess, "Evicted finished task records");
    }

    /// Tasks recorded under a given name.
    pub async fn tasks_named(&self, name: &str) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.name == name)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        tasks
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_enqueue_and_consume() {
        let queue = TaskQueue::new(8);
        let id = queue.enqueue(RUN_SIMULATION, vec![json!("sim-1")]).await.unwrap();
        let msg = queue.next_in(Lane::Compute).await.unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.name, RUN_SIMULATION);
        assert_eq!(msg.args, vec![json!("sim-1")]);
        assert_eq!(queue.status(&id).await.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_lanes_are_separate() {
        let queue = TaskQueue::new(8);
        let sim = queue.enqueue(RUN_SIMULATION, vec![]).await.unwrap();
        let index = queue.enqueue(INDEX_SIMULATION, vec![]).await.unwrap();

        assert_eq!(queue.next_in(Lane::Indexing).await.unwrap().id, index);
        assert_eq!(queue.try_next_in(Lane::Compute).await.unwrap().id, sim);
        assert!(queue.try_next_in(Lane::Compute).await.is_none());
        assert!(queue.record(&sim).await.is_some());
        assert!(queue.record("missing").await.is_none());
        assert_eq!(Lane::for_task(INDEX_DOCUMENT), Lane::Indexing);
        assert_eq!(Lane::for_task(RUN_FRAKTAL_ANALYSIS), Lane::Compute);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let queue = TaskQueue::new(8);
        let id = queue.enqueue(RUN_BOX_COUNTING, vec![]).await.unwrap();
        queue.mark_started(&id).await;
        queue.mark_progress(&id, json!({"percent": 50})).await;
        assert_eq!(queue.status(&id).await.progress.unwrap()["percent"], 50);
        assert!(queue.status(&id).await.finished_at.is_none());
        queue.mark_success(&id, json!({"dimension": 1.8})).await;
        let record = queue.status(&id).await;
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(record.result.unwrap()["dimension"], 1.8);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_revoked_is_sticky() {
        let queue = TaskQueue::new(8);
        let id = queue.enqueue(RUN_SIMULATION, vec![]).await.unwrap();
        queue.revoke(&id).await;
        queue.mark_success(&id, json!({})).await;
        assert_eq!(queue.status(&id).await.status, TaskStatus::Revoked);
    }

    #[tokio::test]
    async fn test_unknown_is_pending() {
        let queue = TaskQueue::new(1);
        assert_eq!(queue.status("missing").await.status.as_str(), "PENDING");
    }

    #[tokio::test]
    async fn test_full_lane_rejects_without_recording() {
        let queue = TaskQueue::new(1);
        queue.enqueue(RUN_SIMULATION, vec![]).await.unwrap();
        let err = queue.enqueue(RUN_SIMULATION, vec![]).await.unwrap_err();
        assert!(matches!(err, QueueError::Full("compute")));
        assert_eq!(queue.tasks_named(RUN_SIMULATION).await.len(), 1);

        // The indexing lane has its own capacity.
        assert!(queue.enqueue(INDEX_ANALYSIS, vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_finished_records_are_capped() {
        let queue = TaskQueue::new(16).with_finished_limit(2);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = queue.enqueue(RUN_BOX_COUNTING, vec![]).await.unwrap();
            queue.mark_success(&id, json!({})).await;
            ids.push(id);
        }
        let running = queue.enqueue(RUN_BOX_COUNTING, vec![]).await.unwrap();
        queue.mark_started(&running).await;

        let kept = queue.tasks_named(RUN_BOX_COUNTING).await;
        assert_eq!(kept.len(), 3);
        assert!(kept.iter().any(|r| r.id == running));
        assert!(kept.iter().any(|r| r.id == ids[3]));
        assert!(!kept.iter().any(|r| r.id == ids[0]));
    }
}
