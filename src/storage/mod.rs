//! Persistence seams for the deduplication pipeline.
//!
//! Every query is scoped by deliberation. Canonical cards are only ever
//! inserted together with their embedding, and card links are only ever set
//! on rows that do not have one yet.

pub mod memory;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    CanonicalValuesCard, CanonicalizationPair, Context, DedupJob, Deliberation, DeliberationId,
    DeliberationStats, Enqueued, NewCanonicalCard, NewValuesCard, ScoredMatch, ValuesCard,
};

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait ValuesStore: Send + Sync {
    async fn create_deliberation(&self, title: &str) -> Result<Deliberation>;

    async fn get_deliberation(&self, id: DeliberationId) -> Result<Option<Deliberation>>;

    async fn list_deliberations(&self) -> Result<Vec<Deliberation>>;

    /// Store an already validated submission.
    async fn insert_card(&self, card: NewValuesCard) -> Result<ValuesCard>;

    /// Unlinked cards, oldest first.
    async fn fetch_non_canonicalized(
        &self,
        deliberation_id: DeliberationId,
        limit: usize,
    ) -> Result<Vec<ValuesCard>>;

    /// Unlinked cards that still lack an embedding, oldest first.
    async fn fetch_cards_without_embedding(
        &self,
        deliberation_id: DeliberationId,
        limit: usize,
    ) -> Result<Vec<ValuesCard>>;

    async fn update_card_embedding(&self, card_id: Uuid, embedding: &[f32]) -> Result<()>;

    /// Point every unlinked card in `card_ids` at `canonical_id`. Cards that
    /// already have a link keep it. Returns the number of cards changed.
    async fn link_cards(&self, canonical_id: Uuid, card_ids: &[Uuid]) -> Result<u64>;

    async fn get_canonical(&self, id: Uuid) -> Result<Option<CanonicalValuesCard>>;

    /// The canonical card previously promoted from `source_card_id`, if any.
    async fn find_canonical_by_source(
        &self,
        deliberation_id: DeliberationId,
        source_card_id: Uuid,
    ) -> Result<Option<CanonicalValuesCard>>;

    /// Insert a canonical card with its embedding in one statement. If a card
    /// was already promoted from the same source, that row is returned instead.
    async fn insert_canonical(&self, card: NewCanonicalCard) -> Result<CanonicalValuesCard>;

    /// Nearest canonical cards by cosine distance, ascending, at most `limit`,
    /// none further than `max_distance`.
    async fn search_canonical(
        &self,
        deliberation_id: DeliberationId,
        embedding: &[f32],
        limit: usize,
        max_distance: f64,
    ) -> Result<Vec<ScoredMatch<CanonicalValuesCard>>>;

    async fn list_contexts(&self, deliberation_id: DeliberationId) -> Result<Vec<Context>>;

    async fn search_contexts(
        &self,
        deliberation_id: DeliberationId,
        embedding: &[f32],
        limit: usize,
        max_distance: f64,
    ) -> Result<Vec<ScoredMatch<Context>>>;

    /// Insert a context; an existing context with the same name wins.
    async fn insert_context(
        &self,
        deliberation_id: DeliberationId,
        name: &str,
        embedding: &[f32],
    ) -> Result<Context>;

    /// Linked cards next to their canonical card, newest first.
    async fn canonicalization_pairs(
        &self,
        deliberation_id: Option<DeliberationId>,
    ) -> Result<Vec<CanonicalizationPair>>;

    async fn stats(&self, deliberation_id: DeliberationId) -> Result<DeliberationStats>;
}

/// Durable step outputs, keyed by job and step name.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_step(&self, job_id: Uuid, step_name: &str) -> Result<Option<serde_json::Value>>;

    /// First write wins; saving an existing step is a no-op.
    async fn save_step(&self, job_id: Uuid, step_name: &str, output: &serde_json::Value)
        -> Result<()>;

    async fn clear_steps(&self, job_id: Uuid) -> Result<()>;
}

/// At most one holder per deliberation until the lease expires.
#[async_trait]
pub trait ScopeLeaseStore: Send + Sync {
    /// Take or renew the lease. Returns false while another holder's lease is live.
    async fn try_acquire_scope_lease(
        &self,
        deliberation_id: DeliberationId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool>;

    async fn release_scope_lease(&self, deliberation_id: DeliberationId, holder: Uuid)
        -> Result<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Queue a run unless the deliberation already has an active job.
    async fn enqueue_job(&self, deliberation_id: DeliberationId, now: DateTime<Utc>)
        -> Result<Enqueued>;

    /// Claim the oldest available job, including running jobs whose lease expired.
    async fn claim_next_job(
        &self,
        owner: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<DedupJob>>;

    /// Fails with `LeaseLost` if `owner` no longer holds the job.
    async fn mark_job_done(&self, job_id: Uuid, owner: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// `retry_at: None` parks the job as dead.
    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        owner: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<DedupJob>>;
}

/// Everything the pipeline, worker and scheduler need from storage.
pub trait DedupStore: ValuesStore + CheckpointStore + ScopeLeaseStore + JobStore {}

impl<T> DedupStore for T where T: ValuesStore + CheckpointStore + ScopeLeaseStore + JobStore {}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300))
}
