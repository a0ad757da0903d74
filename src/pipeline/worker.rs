use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::runner::{DeduplicationPipeline, DeduplicationReport};
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::models::DedupJob;
use crate::storage::{CheckpointStore, DedupStore, JobStore};

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Done,
    /// Failed; claimable again at `retry_at`.
    Retrying {
        retry_at: DateTime<Utc>,
        error: String,
    },
    /// Failed for the last time, or with an error retrying cannot fix.
    Dead { error: String },
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_for_attempt(attempt: i32, base_ms: i64, max_ms: i64) -> Duration {
    let exp = (attempt.max(1) as u32).saturating_sub(1).min(16);
    let delay = base_ms.saturating_mul(1_i64 << exp).min(max_ms);
    Duration::milliseconds(delay.max(0))
}

/// Backoff plus up to 20% random jitter, so retries of jobs that failed
/// together spread out.
fn jittered_backoff(attempt: i32, config: &WorkerConfig) -> Duration {
    let base = backoff_for_attempt(attempt, config.base_backoff_ms, config.max_backoff_ms);
    let spread = base.num_milliseconds() / 5;
    let jitter = if spread > 0 {
        rand::thread_rng().gen_range(0..=spread)
    } else {
        0
    };
    base + Duration::milliseconds(jitter)
}

/// Claims queued jobs and runs them through the pipeline.
pub struct DedupWorker {
    store: Arc<dyn DedupStore>,
    pipeline: Arc<DeduplicationPipeline>,
    config: WorkerConfig,
    owner: Uuid,
}

impl DedupWorker {
    pub fn new(pipeline: Arc<DeduplicationPipeline>, config: WorkerConfig) -> Self {
        Self {
            store: pipeline.store(),
            pipeline,
            config,
            owner: Uuid::new_v4(),
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Job lease: the run budget plus a margin, so a live run is never
    /// reclaimed by another worker.
    fn job_lease(&self) -> std::time::Duration {
        self.pipeline.config().max_run_duration() + std::time::Duration::from_secs(30)
    }

    /// Poll until `shutdown` fires. Errors are logged and never end the loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(owner = %self.owner, "Dedup worker started");
        let poll = std::time::Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let idle = match self.process_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(owner = %self.owner, error = %e, "Dedup job processing failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            } else if !matches!(shutdown.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
                break;
            }
        }

        info!(owner = %self.owner, "Dedup worker stopped");
    }

    /// Claim and run at most one job. `None` when the queue had nothing ready.
    pub async fn process_once(&self) -> Result<Option<(DedupJob, JobOutcome)>> {
        let now = Utc::now();
        let Some(job) = self.store.claim_next_job(self.owner, now, self.job_lease()).await? else {
            return Ok(None);
        };

        debug!(job_id = %job.id, deliberation_id = job.deliberation_id, attempts = job.attempts, "Claimed job");
        let result = self
            .pipeline
            .run_job(&job)
            .await
            .and_then(|report| match report.failure_error() {
                Some(e) => Err(e),
                None => Ok(report),
            });

        let outcome = self.finish(&job, result).await?;
        Ok(Some((job, outcome)))
    }

    async fn finish(&self, job: &DedupJob, result: Result<DeduplicationReport>) -> Result<JobOutcome> {
        let now = Utc::now();
        match result {
            Ok(report) => {
                self.store.mark_job_done(job.id, self.owner, now).await?;
                if let Err(e) = self.store.clear_steps(job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to clear job checkpoints");
                }
                info!(
                    job_id = %job.id,
                    deliberation_id = job.deliberation_id,
                    phase = ?report.phase,
                    canonicals_created = report.canonicals_created(),
                    cards_linked = report.cards_linked(),
                    "Job done"
                );
                Ok(JobOutcome::Done)
            }
            Err(e) => {
                let attempt = job.attempts.saturating_add(1);
                let message = e.to_string();
                let retry_at = (e.is_transient() && attempt < self.config.max_attempts)
                    .then(|| now + jittered_backoff(attempt, &self.config));

                self.store
                    .mark_job_failed(job.id, self.owner, &message, retry_at, now)
                    .await?;

                match retry_at {
                    Some(retry_at) => {
                        warn!(job_id = %job.id, attempt, %retry_at, error = %message, "Job failed, will retry");
                        Ok(JobOutcome::Retrying {
                            retry_at,
                            error: message,
                        })
                    }
                    None => {
                        error!(job_id = %job.id, attempt, error = %message, "Job is dead");
                        Ok(JobOutcome::Dead { error: message })
                    }
                }
            }
        }
    }
}

/// Spawn `config.concurrency` workers sharing one pipeline. Each stops on `shutdown`.
pub fn spawn_workers(
    pipeline: Arc<DeduplicationPipeline>,
    config: &WorkerConfig,
    shutdown: &broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..config.concurrency.max(1))
        .map(|_| {
            let worker = DedupWorker::new(pipeline.clone(), config.clone());
            tokio::spawn(worker.run(shutdown.subscribe()))
        })
        .collect()
}
