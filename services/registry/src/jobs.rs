//! Out-of-band maintenance jobs.
//!
//! Jobs are queued on an mpsc channel and run one at a time by a single
//! worker task. Their status is kept in memory for clients to poll.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{RegistryError, RegistryResult};
use crate::model::EntityId;
use crate::quota::QuotaGuard;
use crate::upload::Uploads;

crate::model::id_type!(
    /// Identifies a queued job.
    JobId
);

/// Work the queue knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Recalculate cached usage for one entity, or every entity.
    RecalculateQuota { entity: Option<EntityId> },
    /// Abort upload sessions past their expiry.
    ExpireUploads,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::RecalculateQuota { .. } => f.write_str("recalculate_quota"),
            Job::ExpireUploads => f.write_str("expire_uploads"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Started,
    Finished,
    Failed,
}

/// Pollable job metadata.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub kind: String,
    pub state: JobState,
    /// Percent done.
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

type Statuses = Arc<DashMap<JobId, JobStatus>>;

/// Handle for enqueueing jobs and reading their status.
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<(JobId, Job)>,
    statuses: Statuses,
}

impl JobQueue {
    /// Spawn the worker on the current runtime.
    pub fn spawn(quota: QuotaGuard, uploads: Uploads) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let statuses: Statuses = Arc::default();
        let worker = Worker {
            quota,
            uploads,
            statuses: statuses.clone(),
        };
        tokio::spawn(worker.run(receiver));
        Self { sender, statuses }
    }

    #[tracing::instrument(skip(self))]
    pub fn enqueue(&self, job: Job) -> RegistryResult<JobId> {
        let id = JobId::new();
        self.statuses.insert(
            id,
            JobStatus {
                id,
                kind: job.to_string(),
                state: JobState::Queued,
                progress: 0,
                result: None,
                error: None,
                enqueued_at: Utc::now(),
                ended_at: None,
            },
        );

        if self.sender.send((id, job)).is_err() {
            self.statuses.remove(&id);
            return Err(RegistryError::Internal("job worker stopped".into()));
        }
        tracing::debug!(%id, "queued job");
        Ok(id)
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.statuses.get(&id).map(|entry| entry.value().clone())
    }
}

struct Worker {
    quota: QuotaGuard,
    uploads: Uploads,
    statuses: Statuses,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<(JobId, Job)>) {
        while let Some((id, job)) = receiver.recv().await {
            self.update(id, |status| status.state = JobState::Started);
            tracing::debug!(%id, %job, "running job");

            let outcome = self.execute(job).await;
            self.update(id, |status| {
                status.ended_at = Some(Utc::now());
                match outcome {
                    Ok(result) => {
                        status.state = JobState::Finished;
                        status.progress = 100;
                        status.result = Some(result);
                    }
                    Err(error) => {
                        tracing::warn!(%id, %error, "job failed");
                        status.state = JobState::Failed;
                        status.error = Some(error.to_string());
                    }
                }
            });
        }
        tracing::debug!("job queue closed");
    }

    async fn execute(&self, job: Job) -> RegistryResult<serde_json::Value> {
        match job {
            Job::RecalculateQuota { entity: Some(entity) } => {
                let used = self.quota.recalculate(entity).await?;
                Ok(serde_json::json!({ "entity": entity, "used_quota": used }))
            }
            Job::RecalculateQuota { entity: None } => {
                let used = self.quota.recalculate_all().await?;
                Ok(serde_json::json!({ "used_quota": used }))
            }
            Job::ExpireUploads => {
                let expired = self.uploads.expire().await?;
                Ok(serde_json::json!({ "expired": expired }))
            }
        }
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut JobStatus)) {
        if let Some(mut status) = self.statuses.get_mut(&id) {
            f(&mut status);
        }
    }
}
