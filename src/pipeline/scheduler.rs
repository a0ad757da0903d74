//! Periodic trigger that queues one deduplication job per deliberation.
//!
//! The scheduler only enqueues. Jobs are run by the workers, so a slow
//! deliberation never delays the next tick and deliberations are processed
//! independently. A deliberation that already has an active job is not
//! queued twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::storage::{DedupStore, JobStore, ValuesStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerStatus {
    Stopped,
    Running,
    /// Enqueueing deliberations right now.
    Triggering,
    Error,
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    pub total_triggers: u64,
    pub failed_triggers: u64,
    /// Ticks skipped because the previous trigger was still enqueueing
    pub skipped_triggers: u64,
    pub jobs_enqueued: u64,
    pub last_trigger: Option<DateTime<Utc>>,
    pub status: SchedulerStatus,
}

impl Default for SchedulerStatistics {
    fn default() -> Self {
        Self {
            total_triggers: 0,
            failed_triggers: 0,
            skipped_triggers: 0,
            jobs_enqueued: 0,
            last_trigger: None,
            status: SchedulerStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueSummary {
    pub deliberations: usize,
    pub newly_enqueued: usize,
    /// Deliberations that already had an active job.
    pub already_active: usize,
}

/// Queue a job for every deliberation.
pub async fn enqueue_all(store: &dyn DedupStore) -> Result<EnqueueSummary> {
    let deliberations = store.list_deliberations().await?;
    let now = Utc::now();
    let mut summary = EnqueueSummary {
        deliberations: deliberations.len(),
        ..EnqueueSummary::default()
    };

    for deliberation in &deliberations {
        let enqueued = store.enqueue_job(deliberation.id, now).await?;
        if enqueued.newly_created {
            summary.newly_enqueued += 1;
        } else {
            summary.already_active += 1;
        }
        debug!(
            deliberation_id = deliberation.id,
            job_id = %enqueued.job.id,
            newly_created = enqueued.newly_created,
            "Enqueued deduplication"
        );
    }

    info!(
        deliberations = summary.deliberations,
        newly_enqueued = summary.newly_enqueued,
        already_active = summary.already_active,
        "Triggered deduplication for all deliberations"
    );
    Ok(summary)
}

pub struct DedupScheduler {
    scheduler: Arc<Mutex<JobScheduler>>,
    store: Arc<dyn DedupStore>,
    config: SchedulerConfig,
    /// Held while a trigger runs, so ticks never overlap.
    trigger_lock: Arc<Mutex<()>>,
    statistics: Arc<RwLock<SchedulerStatistics>>,
    job_id: Option<Uuid>,
}

impl DedupScheduler {
    pub async fn new(store: Arc<dyn DedupStore>, config: SchedulerConfig) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize job scheduler: {e}"))?;

        Ok(Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            store,
            config,
            trigger_lock: Arc::new(Mutex::new(())),
            statistics: Arc::new(RwLock::new(SchedulerStatistics::default())),
            job_id: None,
        })
    }

    #[instrument(skip(self), fields(enabled = self.config.enabled, cron = %self.config.cron_expression))]
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("Scheduler is disabled in configuration, not starting");
            return Ok(());
        }

        let store = self.store.clone();
        let trigger_lock = self.trigger_lock.clone();
        let statistics = self.statistics.clone();

        let job = Job::new_async(self.config.cron_expression.as_str(), move |_uuid, _lock| {
            let store = store.clone();
            let trigger_lock = trigger_lock.clone();
            let statistics = statistics.clone();
            Box::pin(async move {
                if let Err(e) = Self::trigger(store, trigger_lock, statistics).await {
                    warn!(error = %e, "Scheduled deduplication trigger failed");
                }
            })
        })
        .map_err(|e| anyhow::anyhow!("Failed to create cron job: {e}"))?;

        let mut scheduler = self.scheduler.lock().await;
        let job_uuid = scheduler
            .add(job)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to add job to scheduler: {e}"))?;
        scheduler
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start job scheduler: {e}"))?;
        drop(scheduler);

        self.job_id = Some(job_uuid);
        self.statistics.write().await.status = SchedulerStatus::Running;
        info!(job_id = %job_uuid, "Deduplication scheduler started");

        if self.config.run_on_startup {
            info!("Enqueueing all deliberations on startup");
            if let Err(e) = self.trigger_now().await {
                warn!(error = %e, "Startup trigger failed");
            }
        }
        Ok(())
    }

    /// Enqueue every deliberation now, outside the cron schedule.
    pub async fn trigger_now(&self) -> Result<Option<EnqueueSummary>> {
        Self::trigger(
            self.store.clone(),
            self.trigger_lock.clone(),
            self.statistics.clone(),
        )
        .await
    }

    /// `None` when a trigger was already running and this one was skipped.
    async fn trigger(
        store: Arc<dyn DedupStore>,
        trigger_lock: Arc<Mutex<()>>,
        statistics: Arc<RwLock<SchedulerStatistics>>,
    ) -> Result<Option<EnqueueSummary>> {
        let Ok(_guard) = trigger_lock.try_lock() else {
            warn!("Previous trigger still running, skipping");
            statistics.write().await.skipped_triggers += 1;
            return Ok(None);
        };

        let previous = {
            let mut stats = statistics.write().await;
            stats.total_triggers += 1;
            stats.last_trigger = Some(Utc::now());
            std::mem::replace(&mut stats.status, SchedulerStatus::Triggering)
        };

        let result = enqueue_all(store.as_ref()).await;

        let mut stats = statistics.write().await;
        match &result {
            Ok(summary) => {
                stats.jobs_enqueued += summary.newly_enqueued as u64;
                stats.status = previous;
            }
            Err(_) => {
                stats.failed_triggers += 1;
                stats.status = SchedulerStatus::Error;
            }
        }
        result.map(Some)
    }

    #[instrument(skip(self))]
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        info!("Shutting down deduplication scheduler");
        self.statistics.write().await.status = SchedulerStatus::ShuttingDown;

        self.scheduler
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to shutdown job scheduler: {e}"))?;

        // Let an in-flight trigger finish enqueueing.
        let _guard = self.trigger_lock.lock().await;
        self.job_id = None;
        self.statistics.write().await.status = SchedulerStatus::Stopped;
        info!("Deduplication scheduler stopped");
        Ok(())
    }

    pub async fn get_statistics(&self) -> SchedulerStatistics {
        self.statistics.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        matches!(
            self.statistics.read().await.status,
            SchedulerStatus::Running | SchedulerStatus::Triggering
        )
    }

    pub fn get_config(&self) -> &SchedulerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::storage::InMemoryStore;

    async fn store_with(deliberations: usize) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..deliberations {
            store.create_deliberation(&format!("d{i}")).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_enqueue_all_skips_active_jobs() {
        let store = store_with(3).await;
        let first = enqueue_all(store.as_ref()).await.unwrap();
        assert_eq!(first.deliberations, 3);
        assert_eq!(first.newly_enqueued, 3);

        let second = enqueue_all(store.as_ref()).await.unwrap();
        assert_eq!(second.newly_enqueued, 0);
        assert_eq!(second.already_active, 3);
    }

    #[tokio::test]
    async fn test_manual_trigger_updates_statistics() {
        let store = store_with(2).await;
        let scheduler = DedupScheduler::new(store.clone(), SchedulerConfig::default())
            .await
            .unwrap();

        let summary = scheduler.trigger_now().await.unwrap().unwrap();
        assert_eq!(summary.newly_enqueued, 2);

        let stats = scheduler.get_statistics().await;
        assert_eq!(stats.total_triggers, 1);
        assert_eq!(stats.jobs_enqueued, 2);
        assert!(stats.last_trigger.is_some());
        assert_eq!(stats.status, SchedulerStatus::Stopped);

        let job = store
            .claim_next_job(Uuid::new_v4(), Utc::now(), std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let store = store_with(1).await;
        let scheduler = DedupScheduler::new(store, SchedulerConfig::default())
            .await
            .unwrap();

        let _held = scheduler.trigger_lock.lock().await;
        assert_eq!(scheduler.trigger_now().await.unwrap(), None);
        assert_eq!(scheduler.get_statistics().await.skipped_triggers, 1);
    }

    #[tokio::test]
    async fn test_disabled_scheduler_stays_stopped() {
        let config = SchedulerConfig {
            enabled: false,
            ..SchedulerConfig::default()
        };
        let mut scheduler = DedupScheduler::new(store_with(0).await, config).await.unwrap();
        scheduler.start().await.unwrap();
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut scheduler = DedupScheduler::new(store_with(1).await, SchedulerConfig::default())
            .await
            .unwrap();
        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);

        scheduler.shutdown().await.unwrap();
        assert!(!scheduler.is_running().await);
        assert_eq!(scheduler.get_statistics().await.status, SchedulerStatus::Stopped);
    }
}
