use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{lease_expiry, CheckpointStore, JobStore, ScopeLeaseStore, ValuesStore};
use crate::dedup::similarity::cosine_distance;
use crate::error::{DedupError, Result};
use crate::models::{
    CanonicalValuesCard, CanonicalizationPair, Context, DedupJob, Deliberation, DeliberationId,
    DeliberationStats, Enqueued, JobStatus, NewCanonicalCard, NewValuesCard, ScoredMatch,
    ValuesCard,
};

#[derive(Default)]
struct Inner {
    next_deliberation_id: DeliberationId,
    deliberations: Vec<Deliberation>,
    cards: Vec<ValuesCard>,
    canonicals: Vec<CanonicalValuesCard>,
    contexts: Vec<Context>,
    steps: HashMap<(Uuid, String), serde_json::Value>,
    leases: HashMap<DeliberationId, (Uuid, DateTime<Utc>)>,
    jobs: Vec<DedupJob>,
}

/// Process-local store for tests and dry runs. Mirrors the Postgres
/// semantics, including ordering and link-only-if-unset updates.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    failing_links: AtomicUsize,
    failing_searches: AtomicUsize,
}

fn injected_failure(what: &str) -> DedupError {
    tracing::debug!("Injected {} failure", what);
    DedupError::Database(sqlx::Error::PoolTimedOut)
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn nearest<T: Clone>(
    rows: impl Iterator<Item = (T, Option<f64>)>,
    limit: usize,
    max_distance: f64,
) -> Vec<ScoredMatch<T>> {
    let mut hits: Vec<ScoredMatch<T>> = rows
        .filter_map(|(entity, distance)| distance.map(|distance| ScoredMatch { entity, distance }))
        .filter(|m| m.distance <= max_distance)
        .collect();
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    hits.truncate(limit);
    hits
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `link_cards` fail with a database error.
    pub fn fail_next_links(&self, n: usize) {
        self.failing_links.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` canonical searches fail with a database error.
    pub fn fail_next_searches(&self, n: usize) {
        self.failing_searches.store(n, Ordering::SeqCst);
    }

    pub async fn all_cards(&self, deliberation_id: DeliberationId) -> Vec<ValuesCard> {
        let inner = self.inner.lock().await;
        inner
            .cards
            .iter()
            .filter(|c| c.deliberation_id == deliberation_id)
            .cloned()
            .collect()
    }

    pub async fn all_canonicals(&self, deliberation_id: DeliberationId) -> Vec<CanonicalValuesCard> {
        let inner = self.inner.lock().await;
        inner
            .canonicals
            .iter()
            .filter(|c| c.deliberation_id == deliberation_id)
            .cloned()
            .collect()
    }

    /// Seed a canonical card directly, bypassing the pipeline.
    pub async fn seed_canonical(&self, card: NewCanonicalCard) -> Result<CanonicalValuesCard> {
        self.insert_canonical(card).await
    }
}

#[async_trait]
impl ValuesStore for InMemoryStore {
    async fn create_deliberation(&self, title: &str) -> Result<Deliberation> {
        let mut inner = self.inner.lock().await;
        inner.next_deliberation_id += 1;
        let deliberation = Deliberation {
            id: inner.next_deliberation_id,
            title: title.to_string(),
            created_at: Utc::now(),
        };
        inner.deliberations.push(deliberation.clone());
        Ok(deliberation)
    }

    async fn get_deliberation(&self, id: DeliberationId) -> Result<Option<Deliberation>> {
        let inner = self.inner.lock().await;
        Ok(inner.deliberations.iter().find(|d| d.id == id).cloned())
    }

    async fn list_deliberations(&self) -> Result<Vec<Deliberation>> {
        let inner = self.inner.lock().await;
        Ok(inner.deliberations.clone())
    }

    async fn insert_card(&self, card: NewValuesCard) -> Result<ValuesCard> {
        let mut inner = self.inner.lock().await;
        if !inner.deliberations.iter().any(|d| d.id == card.deliberation_id) {
            return Err(DedupError::NotFound {
                entity: "deliberation",
                id: card.deliberation_id.to_string(),
            });
        }

        // Strictly increasing timestamps keep "oldest first" stable in tests.
        let created_at = match inner.cards.last() {
            Some(last) if last.created_at >= Utc::now() => {
                last.created_at + chrono::Duration::microseconds(1)
            }
            _ => Utc::now(),
        };

        let stored = ValuesCard {
            id: Uuid::new_v4(),
            deliberation_id: card.deliberation_id,
            chat_id: card.chat_id,
            title: card.title,
            description: card.description,
            policies: card.policies,
            embedding: None,
            canonical_card_id: None,
            created_at,
        };
        inner.cards.push(stored.clone());
        Ok(stored)
    }

    async fn fetch_non_canonicalized(
        &self,
        deliberation_id: DeliberationId,
        limit: usize,
    ) -> Result<Vec<ValuesCard>> {
        let inner = self.inner.lock().await;
        let mut cards: Vec<ValuesCard> = inner
            .cards
            .iter()
            .filter(|c| c.deliberation_id == deliberation_id && c.canonical_card_id.is_none())
            .cloned()
            .collect();
        cards.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        cards.truncate(limit);
        Ok(cards)
    }

    async fn fetch_cards_without_embedding(
        &self,
        deliberation_id: DeliberationId,
        limit: usize,
    ) -> Result<Vec<ValuesCard>> {
        let inner = self.inner.lock().await;
        let mut cards: Vec<ValuesCard> = inner
            .cards
            .iter()
            .filter(|c| {
                c.deliberation_id == deliberation_id
                    && c.canonical_card_id.is_none()
                    && c.embedding.is_none()
            })
            .cloned()
            .collect();
        cards.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        cards.truncate(limit);
        Ok(cards)
    }

    async fn update_card_embedding(&self, card_id: Uuid, embedding: &[f32]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let card = inner
            .cards
            .iter_mut()
            .find(|c| c.id == card_id)
            .ok_or_else(|| DedupError::NotFound {
                entity: "values card",
                id: card_id.to_string(),
            })?;
        card.embedding = Some(embedding.to_vec());
        Ok(())
    }

    async fn link_cards(&self, canonical_id: Uuid, card_ids: &[Uuid]) -> Result<u64> {
        if take_failure(&self.failing_links) {
            return Err(injected_failure("link"));
        }

        let mut inner = self.inner.lock().await;
        let canonical_scope = inner
            .canonicals
            .iter()
            .find(|c| c.id == canonical_id)
            .map(|c| c.deliberation_id)
            .ok_or_else(|| DedupError::NotFound {
                entity: "canonical values card",
                id: canonical_id.to_string(),
            })?;

        let mut updated = 0;
        for card in inner.cards.iter_mut() {
            if card.canonical_card_id.is_none()
                && card.deliberation_id == canonical_scope
                && card_ids.contains(&card.id)
            {
                card.canonical_card_id = Some(canonical_id);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn get_canonical(&self, id: Uuid) -> Result<Option<CanonicalValuesCard>> {
        let inner = self.inner.lock().await;
        Ok(inner.canonicals.iter().find(|c| c.id == id).cloned())
    }

    async fn find_canonical_by_source(
        &self,
        deliberation_id: DeliberationId,
        source_card_id: Uuid,
    ) -> Result<Option<CanonicalValuesCard>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .canonicals
            .iter()
            .find(|c| c.deliberation_id == deliberation_id && c.source_card_id == Some(source_card_id))
            .cloned())
    }

    async fn insert_canonical(&self, card: NewCanonicalCard) -> Result<CanonicalValuesCard> {
        if card.embedding.is_empty() {
            return Err(DedupError::invariant(
                "canonical card cannot be stored without an embedding",
            ));
        }

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.canonicals.iter().find(|c| {
            c.deliberation_id == card.deliberation_id && c.source_card_id == Some(card.source_card_id)
        }) {
            return Ok(existing.clone());
        }

        let stored = CanonicalValuesCard {
            id: Uuid::new_v4(),
            deliberation_id: card.deliberation_id,
            title: card.title,
            description: card.description,
            policies: card.policies,
            embedding: Some(card.embedding),
            source_card_id: Some(card.source_card_id),
            created_at: Utc::now(),
        };
        inner.canonicals.push(stored.clone());
        Ok(stored)
    }

    async fn search_canonical(
        &self,
        deliberation_id: DeliberationId,
        embedding: &[f32],
        limit: usize,
        max_distance: f64,
    ) -> Result<Vec<ScoredMatch<CanonicalValuesCard>>> {
        if take_failure(&self.failing_searches) {
            return Err(injected_failure("search"));
        }

        let inner = self.inner.lock().await;
        let rows = inner
            .canonicals
            .iter()
            .filter(|c| c.deliberation_id == deliberation_id)
            .filter_map(|c| {
                let stored = c.embedding.as_deref()?;
                Some((c.clone(), cosine_distance(stored, embedding)))
            });
        Ok(nearest(rows, limit, max_distance))
    }

    async fn list_contexts(&self, deliberation_id: DeliberationId) -> Result<Vec<Context>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .contexts
            .iter()
            .filter(|c| c.deliberation_id == deliberation_id)
            .cloned()
            .collect())
    }

    async fn search_contexts(
        &self,
        deliberation_id: DeliberationId,
        embedding: &[f32],
        limit: usize,
        max_distance: f64,
    ) -> Result<Vec<ScoredMatch<Context>>> {
        let inner = self.inner.lock().await;
        let rows = inner
            .contexts
            .iter()
            .filter(|c| c.deliberation_id == deliberation_id)
            .filter_map(|c| {
                let stored = c.embedding.as_deref()?;
                Some((c.clone(), cosine_distance(stored, embedding)))
            });
        Ok(nearest(rows, limit, max_distance))
    }

    async fn insert_context(
        &self,
        deliberation_id: DeliberationId,
        name: &str,
        embedding: &[f32],
    ) -> Result<Context> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .contexts
            .iter()
            .find(|c| c.deliberation_id == deliberation_id && c.name == name)
        {
            return Ok(existing.clone());
        }

        let context = Context {
            deliberation_id,
            name: name.to_string(),
            embedding: Some(embedding.to_vec()),
            created_at: Utc::now(),
        };
        inner.contexts.push(context.clone());
        Ok(context)
    }

    async fn canonicalization_pairs(
        &self,
        deliberation_id: Option<DeliberationId>,
    ) -> Result<Vec<CanonicalizationPair>> {
        let inner = self.inner.lock().await;
        let mut pairs: Vec<CanonicalizationPair> = inner
            .cards
            .iter()
            .filter(|c| deliberation_id.map_or(true, |d| c.deliberation_id == d))
            .filter_map(|card| {
                let canonical_id = card.canonical_card_id?;
                let canonical = inner.canonicals.iter().find(|c| c.id == canonical_id)?;
                Some(CanonicalizationPair {
                    card: card.clone(),
                    canonical: canonical.clone(),
                })
            })
            .collect();
        pairs.sort_by(|a, b| b.card.created_at.cmp(&a.card.created_at));
        Ok(pairs)
    }

    async fn stats(&self, deliberation_id: DeliberationId) -> Result<DeliberationStats> {
        let inner = self.inner.lock().await;
        let cards = inner.cards.iter().filter(|c| c.deliberation_id == deliberation_id);
        Ok(DeliberationStats {
            deliberation_id,
            total_cards: cards.clone().count() as i64,
            canonicalized_cards: cards.filter(|c| c.is_canonicalized()).count() as i64,
            canonical_cards: inner
                .canonicals
                .iter()
                .filter(|c| c.deliberation_id == deliberation_id)
                .count() as i64,
            contexts: inner
                .contexts
                .iter()
                .filter(|c| c.deliberation_id == deliberation_id)
                .count() as i64,
        })
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn load_step(&self, job_id: Uuid, step_name: &str) -> Result<Option<serde_json::Value>> {
        let inner = self.inner.lock().await;
        Ok(inner.steps.get(&(job_id, step_name.to_string())).cloned())
    }

    async fn save_step(
        &self,
        job_id: Uuid,
        step_name: &str,
        output: &serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .steps
            .entry((job_id, step_name.to_string()))
            .or_insert_with(|| output.clone());
        Ok(())
    }

    async fn clear_steps(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.steps.retain(|(id, _), _| *id != job_id);
        Ok(())
    }
}

#[async_trait]
impl ScopeLeaseStore for InMemoryStore {
    async fn try_acquire_scope_lease(
        &self,
        deliberation_id: DeliberationId,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        match inner.leases.get(&deliberation_id) {
            Some((current, expires_at)) if *current != holder && *expires_at > now => Ok(false),
            _ => {
                inner
                    .leases
                    .insert(deliberation_id, (holder, lease_expiry(now, ttl)));
                Ok(true)
            }
        }
    }

    async fn release_scope_lease(&self, deliberation_id: DeliberationId, holder: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.leases.get(&deliberation_id), Some((current, _)) if *current == holder) {
            inner.leases.remove(&deliberation_id);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue_job(&self, deliberation_id: DeliberationId, now: DateTime<Utc>) -> Result<Enqueued> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner
            .jobs
            .iter()
            .find(|j| j.deliberation_id == deliberation_id && j.status.is_active())
        {
            return Ok(Enqueued {
                job: active.clone(),
                newly_created: false,
            });
        }

        let job = DedupJob {
            id: Uuid::new_v4(),
            deliberation_id,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            available_at: now,
            lease_owner: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.push(job.clone());
        Ok(Enqueued {
            job,
            newly_created: true,
        })
    }

    async fn claim_next_job(
        &self,
        owner: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<DedupJob>> {
        let mut inner = self.inner.lock().await;
        let next = inner
            .jobs
            .iter_mut()
            .filter(|j| j.status.is_active() && j.available_at <= now)
            .min_by_key(|j| j.available_at);

        Ok(next.map(|job| {
            job.status = JobStatus::Running;
            job.available_at = lease_expiry(now, lease);
            job.lease_owner = Some(owner);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn mark_job_done(&self, job_id: Uuid, owner: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Running && j.lease_owner == Some(owner))
            .ok_or(DedupError::LeaseLost { job_id })?;
        job.status = JobStatus::Done;
        job.lease_owner = None;
        job.updated_at = now;
        Ok(())
    }

    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        owner: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Running && j.lease_owner == Some(owner))
            .ok_or(DedupError::LeaseLost { job_id })?;
        job.attempts = job.attempts.saturating_add(1);
        job.last_error = Some(error.to_string());
        job.lease_owner = None;
        job.updated_at = now;
        match retry_at {
            Some(at) => {
                job.status = JobStatus::Failed;
                job.available_at = at;
            }
            None => job.status = JobStatus::Dead,
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<DedupJob>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.iter().find(|j| j.id == job_id).cloned())
    }
}
