//! Durable-ish job queues and worker pools.
//!
//! Each background concern gets its own named queue over a flume MPMC
//! channel and a bounded worker pool. Delivery guarantees within one
//! process: a job is handled by exactly one worker, failed retryable jobs
//! re-enqueue with exponential backoff, and per-user jobs (consolidation,
//! thought generation) coalesce while queued so triggers are idempotent.
//!
//! ```text
//!  enqueue ──► flume channel ──► worker 1..N ──► JobHandler
//!                   ▲                 │
//!                   └── backoff ◄── Err(Transient)
//! ```
//!
//! Workers watch a shutdown signal and finish the job in hand before
//! exiting; the composition root joins them during drain.

pub mod retry;
pub mod scheduler;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::types::{ChunkId, RawRecordId, UserId};

pub use retry::{RetryPolicy, with_policy};

/// The five queues the engine runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueName {
    Ingest,
    AttachEpisode,
    Consolidate,
    GenerateThoughts,
    FileUpload,
}

impl QueueName {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Ingest => "memory.ingest",
            QueueName::AttachEpisode => "memory.attachEpisode",
            QueueName::Consolidate => "memory.consolidate",
            QueueName::GenerateThoughts => "memory.generateThoughts",
            QueueName::FileUpload => "memory.fileUpload",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of background work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Job {
    /// Run the ingestion pipeline for a stored raw record.
    Ingest { record_id: RawRecordId },
    /// Decide episode membership for one indexed chunk.
    AttachEpisode { chunk_id: ChunkId, user_id: UserId },
    /// Cluster a user's orphan chunks into episodes.
    Consolidate { user_id: UserId },
    /// Derive cross-episode thoughts for a user.
    GenerateThoughts { user_id: UserId },
    /// Ingest an uploaded-document record (importance gate bypassed).
    FileUpload { record_id: RawRecordId },
}

impl Job {
    /// The queue this job travels on.
    #[must_use]
    pub fn queue(&self) -> QueueName {
        match self {
            Job::Ingest { .. } => QueueName::Ingest,
            Job::AttachEpisode { .. } => QueueName::AttachEpisode,
            Job::Consolidate { .. } => QueueName::Consolidate,
            Job::GenerateThoughts { .. } => QueueName::GenerateThoughts,
            Job::FileUpload { .. } => QueueName::FileUpload,
        }
    }

    /// Coalescing key: jobs sharing a key collapse while queued. Per-user
    /// serialization for consolidation and thought generation hangs off
    /// this.
    #[must_use]
    pub fn coalesce_key(&self) -> Option<String> {
        match self {
            Job::Consolidate { user_id } => Some(format!("consolidate:{user_id}")),
            Job::GenerateThoughts { user_id } => Some(format!("thoughts:{user_id}")),
            _ => None,
        }
    }

    /// Short description for stats and logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Job::Ingest { record_id } => format!("ingest {record_id}"),
            Job::AttachEpisode { chunk_id, user_id } => {
                format!("attach {chunk_id} for {user_id}")
            }
            Job::Consolidate { user_id } => format!("consolidate {user_id}"),
            Job::GenerateThoughts { user_id } => format!("thoughts {user_id}"),
            Job::FileUpload { record_id } => format!("file-upload {record_id}"),
        }
    }
}

/// Handler outcome; `Transient` failures re-enqueue with backoff.
#[derive(Debug, Error, Diagnostic)]
pub enum JobError {
    #[error("transient job failure: {0}")]
    #[diagnostic(code(engram::queue::transient))]
    Transient(String),

    #[error("permanent job failure: {0}")]
    #[diagnostic(code(engram::queue::permanent))]
    Permanent(String),
}

impl JobError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            JobError::Transient(msg) | JobError::Permanent(msg) => msg,
        }
    }
}

/// Delivery wrapper carrying the attempt count.
#[derive(Clone, Debug)]
pub struct JobEnvelope {
    pub job: Job,
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct StatsInner {
    completed_total: u64,
    failed_total: u64,
    retried_total: u64,
    recent_completed: VecDeque<String>,
    recent_failed: VecDeque<String>,
}

/// Point-in-time queue statistics.
#[derive(Clone, Debug)]
pub struct QueueStats {
    pub name: QueueName,
    pub queued: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub retried_total: u64,
}

/// One named queue with bounded history bookkeeping.
pub struct JobQueue {
    name: QueueName,
    tx: flume::Sender<JobEnvelope>,
    rx: flume::Receiver<JobEnvelope>,
    queued_keys: Mutex<FxHashSet<String>>,
    stats: Mutex<StatsInner>,
    completed_history: usize,
    failed_history: usize,
}

impl JobQueue {
    #[must_use]
    pub fn new(name: QueueName, completed_history: usize, failed_history: usize) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            name,
            tx,
            rx,
            queued_keys: Mutex::new(FxHashSet::default()),
            stats: Mutex::new(StatsInner::default()),
            completed_history,
            failed_history,
        }
    }

    #[must_use]
    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Enqueue a fresh job. Keyed jobs already waiting coalesce into the
    /// queued instance and this call reports `false`.
    pub fn enqueue(&self, job: Job) -> bool {
        if let Some(key) = job.coalesce_key() {
            if let Ok(mut keys) = self.queued_keys.lock() {
                if !keys.insert(key) {
                    return false;
                }
            }
        }
        let accepted = self
            .tx
            .send(JobEnvelope { job, attempt: 1 })
            .is_ok();
        if !accepted {
            warn!(queue = %self.name, "enqueue after queue close dropped");
        }
        accepted
    }

    /// Deliver an envelope after `delay`. Used for the post-upsert settle
    /// delay and for retry backoff; bypasses coalescing.
    pub fn enqueue_after(self: &Arc<Self>, envelope: JobEnvelope, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.tx.send(envelope).is_err() {
                warn!(queue = %queue.name, "delayed enqueue after queue close dropped");
            }
        });
    }

    fn on_dequeued(&self, job: &Job) {
        if let Some(key) = job.coalesce_key() {
            if let Ok(mut keys) = self.queued_keys.lock() {
                keys.remove(&key);
            }
        }
    }

    fn record_completed(&self, job: &Job) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.completed_total += 1;
            stats.recent_completed.push_back(job.describe());
            while stats.recent_completed.len() > self.completed_history {
                stats.recent_completed.pop_front();
            }
        }
    }

    fn record_failed(&self, job: &Job, error: &JobError) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.failed_total += 1;
            stats
                .recent_failed
                .push_back(format!("{}: {}", job.describe(), error.message()));
            while stats.recent_failed.len() > self.failed_history {
                stats.recent_failed.pop_front();
            }
        }
    }

    fn record_retried(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.retried_total += 1;
        }
    }

    /// Snapshot of queue counters.
    pub fn stats(&self) -> QueueStats {
        let inner = self.stats.lock();
        let (completed_total, failed_total, retried_total) = inner
            .map(|s| (s.completed_total, s.failed_total, s.retried_total))
            .unwrap_or_default();
        QueueStats {
            name: self.name,
            queued: self.rx.len(),
            completed_total,
            failed_total,
            retried_total,
        }
    }

    /// Receiver handle for the worker pool.
    #[must_use]
    pub fn receiver(&self) -> flume::Receiver<JobEnvelope> {
        self.rx.clone()
    }
}

/// Background job processor.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;

    /// Called after the final failed attempt; terminal bookkeeping (e.g.
    /// marking the raw record `error`) lives here.
    async fn on_exhausted(&self, _job: &Job, _error: &JobError) {}
}

/// Spawn `worker_count` workers draining `queue` into `handler`.
///
/// Workers stop when the shutdown signal flips or the queue closes; the
/// job in hand always completes first.
pub fn spawn_workers(
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    worker_count: usize,
    max_attempts: u32,
    backoff: RetryPolicy,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..worker_count.max(1))
        .map(|worker_idx| {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let rx = queue.receiver();
                loop {
                    let envelope = tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                        received = rx.recv_async() => match received {
                            Ok(envelope) => envelope,
                            Err(_) => break,
                        },
                    };
                    queue.on_dequeued(&envelope.job);
                    match handler.handle(&envelope.job).await {
                        Ok(()) => queue.record_completed(&envelope.job),
                        Err(err) if err.is_retryable() && envelope.attempt < max_attempts => {
                            queue.record_retried();
                            let delay = backoff.delay_before(envelope.attempt + 1);
                            warn!(
                                queue = %queue.name(),
                                job = %envelope.job.describe(),
                                attempt = envelope.attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "job failed, retrying"
                            );
                            queue.enqueue_after(
                                JobEnvelope {
                                    job: envelope.job,
                                    attempt: envelope.attempt + 1,
                                },
                                delay,
                            );
                        }
                        Err(err) => {
                            error!(
                                queue = %queue.name(),
                                job = %envelope.job.describe(),
                                attempt = envelope.attempt,
                                error = %err,
                                "job failed permanently"
                            );
                            queue.record_failed(&envelope.job, &err);
                            handler.on_exhausted(&envelope.job, &err).await;
                        }
                    }
                }
                info!(queue = %queue.name(), worker = worker_idx, "worker stopped");
            })
        })
        .collect()
}

/// The engine's five queues as one unit.
pub struct QueueSet {
    pub ingest: Arc<JobQueue>,
    pub attach: Arc<JobQueue>,
    pub consolidate: Arc<JobQueue>,
    pub thoughts: Arc<JobQueue>,
    pub file_upload: Arc<JobQueue>,
}

impl QueueSet {
    #[must_use]
    pub fn new(completed_history: usize, failed_history: usize) -> Self {
        let make = |name| Arc::new(JobQueue::new(name, completed_history, failed_history));
        Self {
            ingest: make(QueueName::Ingest),
            attach: make(QueueName::AttachEpisode),
            consolidate: make(QueueName::Consolidate),
            thoughts: make(QueueName::GenerateThoughts),
            file_upload: make(QueueName::FileUpload),
        }
    }

    #[must_use]
    pub fn queue(&self, name: QueueName) -> &Arc<JobQueue> {
        match name {
            QueueName::Ingest => &self.ingest,
            QueueName::AttachEpisode => &self.attach,
            QueueName::Consolidate => &self.consolidate,
            QueueName::GenerateThoughts => &self.thoughts,
            QueueName::FileUpload => &self.file_upload,
        }
    }

    /// Route a job to its queue.
    pub fn enqueue(&self, job: Job) -> bool {
        self.queue(job.queue()).enqueue(job)
    }

    /// Route a job to its queue after `delay`.
    pub fn enqueue_after(&self, job: Job, delay: Duration) {
        let queue = self.queue(job.queue());
        queue.enqueue_after(JobEnvelope { job, attempt: 1 }, delay);
    }

    /// Stats for every queue.
    #[must_use]
    pub fn stats(&self) -> Vec<QueueStats> {
        [
            &self.ingest,
            &self.attach,
            &self.consolidate,
            &self.thoughts,
            &self.file_upload,
        ]
        .into_iter()
        .map(|queue| queue.stats())
        .collect()
    }
}
