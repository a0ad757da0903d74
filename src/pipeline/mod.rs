//! Durable, per-deliberation orchestration: checkpointed runs, the job worker
//! and the hourly trigger.

pub mod events;
pub mod runner;
pub mod scheduler;
pub mod steps;
pub mod worker;

pub use events::{DedupEvent, EventBus};
pub use runner::{ClusterFailure, DeduplicationPipeline, DeduplicationReport, RunPhase};
pub use scheduler::{enqueue_all, DedupScheduler, EnqueueSummary, SchedulerStatistics, SchedulerStatus};
pub use steps::StepRunner;
pub use worker::{backoff_for_attempt, spawn_workers, DedupWorker, JobOutcome};
