pub mod config;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod judgment;
pub mod models;
pub mod pipeline;
pub mod storage;

pub use config::Config;
pub use embedding::{EmbeddingService, SimpleEmbedder};
pub use error::{DedupError, Result};
pub use judgment::{judge_from_config, JudgmentError, JudgmentService, LlmJudge, MockJudge};

// Re-export domain types
pub use models::{
    CanonicalValuesCard, CanonicalizationPair, Context, DedupJob, Deliberation, DeliberationId,
    DeliberationStats, JobStatus, NewValuesCard, ScoredMatch, ValuesCard,
};

// Re-export dedup services
pub use dedup::{
    CanonicalAction, CanonicalizationService, ClusterEngine, ClusterResult, ClusterSettings,
    ClusterStrategy, ContextDeduplicator, SearchParams,
};

// Re-export orchestration types
pub use pipeline::{
    DedupEvent, DedupScheduler, DedupWorker, DeduplicationPipeline, DeduplicationReport, EventBus,
    RunPhase,
};

// Re-export storage backends
pub use storage::{DedupStore, InMemoryStore, PostgresStore};
