//! Per-deliberation deduplication run.
//!
//! A run fetches the deliberation's non-canonicalized cards, clusters them and
//! canonicalizes each cluster in turn. Every stage is a named step, so a job
//! that is retried after a crash or timeout picks up where the last attempt
//! stopped. Clusters are processed sequentially while the deliberation's scope
//! lease is held; that is what keeps two clusters from both creating a
//! canonical card for the same value.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::events::{DedupEvent, EventBus};
use super::steps::StepRunner;
use crate::config::DedupConfig;
use crate::dedup::{
    embed_text, select_representative, verify_partition, with_timeout, CanonicalAction,
    CanonicalizationService, ClusterEngine, ClusterResult, ClusterSettings, ClusterStrategy,
    ContextDeduplicator,
};
use crate::embedding::EmbeddingService;
use crate::error::{DedupError, Result};
use crate::judgment::JudgmentService;
use crate::models::{
    CanonicalizationPair, CardContent, DedupJob, DeliberationId, DeliberationStats, NewValuesCard,
    ValuesCard,
};
use crate::storage::{DedupStore, ScopeLeaseStore, ValuesStore};

/// Extra time a scope lease outlives the run budget.
const LEASE_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    /// No non-canonicalized cards; nothing was written and no event was sent.
    NothingToDo,
    Completed,
    /// At least one cluster failed. The others were canonicalized.
    PartiallyCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterFailure {
    pub cluster_index: usize,
    pub message: String,
    /// False when retrying the run cannot fix it, e.g. an invariant violation.
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationReport {
    pub deliberation_id: DeliberationId,
    pub job_id: Option<Uuid>,
    pub phase: RunPhase,
    pub candidates: usize,
    pub strategy: Option<ClusterStrategy>,
    pub clusters: Vec<ClusterResult>,
    pub failures: Vec<ClusterFailure>,
    pub replayed_steps: usize,
    pub duration_seconds: f64,
}

impl DeduplicationReport {
    fn nothing_to_do(deliberation_id: DeliberationId, job_id: Option<Uuid>) -> Self {
        Self {
            deliberation_id,
            job_id,
            phase: RunPhase::NothingToDo,
            candidates: 0,
            strategy: None,
            clusters: Vec::new(),
            failures: Vec::new(),
            replayed_steps: 0,
            duration_seconds: 0.0,
        }
    }

    pub fn canonicals_created(&self) -> usize {
        self.clusters
            .iter()
            .filter(|c| c.action == CanonicalAction::Created)
            .count()
    }

    pub fn cards_linked(&self) -> u64 {
        self.clusters.iter().map(|c| c.newly_linked).sum()
    }

    /// A cluster failure as an error, for callers that retry on it. A
    /// failure that retrying cannot fix wins over transient ones.
    pub fn failure_error(&self) -> Option<DedupError> {
        self.failures
            .iter()
            .find(|f| !f.retryable)
            .or_else(|| self.failures.first())
            .map(|f| DedupError::ClusterFailed {
                cluster_index: f.cluster_index,
                message: f.message.clone(),
                retryable: f.retryable,
            })
    }
}

/// Checkpointed output of the clustering step. Only ids are saved; members
/// are rebuilt from the checkpointed candidate list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterPlan {
    strategy: ClusterStrategy,
    clusters: Vec<Vec<Uuid>>,
}

pub struct DeduplicationPipeline {
    store: Arc<dyn DedupStore>,
    values: Arc<dyn ValuesStore>,
    embedder: Arc<dyn EmbeddingService>,
    judge: Arc<dyn JudgmentService>,
    engine: ClusterEngine,
    canonicalizer: CanonicalizationService,
    contexts: ContextDeduplicator,
    config: DedupConfig,
    events: EventBus,
}

impl DeduplicationPipeline {
    pub fn new<S>(
        store: Arc<S>,
        embedder: Arc<dyn EmbeddingService>,
        judge: Arc<dyn JudgmentService>,
        config: DedupConfig,
    ) -> Self
    where
        S: DedupStore + 'static,
    {
        let values: Arc<dyn ValuesStore> = store.clone();
        let engine = ClusterEngine::new(
            judge.clone(),
            embedder.clone(),
            ClusterSettings::from_config(&config),
        );
        let canonicalizer = CanonicalizationService::new(
            values.clone(),
            embedder.clone(),
            judge.clone(),
            config.clone(),
        );
        let contexts =
            ContextDeduplicator::new(values.clone(), embedder.clone(), judge.clone(), config.clone());

        Self {
            store,
            values,
            embedder,
            judge,
            engine,
            canonicalizer,
            contexts,
            config,
            events: EventBus::default(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> Arc<dyn DedupStore> {
        self.store.clone()
    }

    pub fn contexts(&self) -> &ContextDeduplicator {
        &self.contexts
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Validate and store a submitted card.
    pub async fn submit_card(&self, card: NewValuesCard) -> Result<ValuesCard> {
        let card = card.validate()?;
        if self.values.get_deliberation(card.deliberation_id).await?.is_none() {
            return Err(DedupError::NotFound {
                entity: "deliberation",
                id: card.deliberation_id.to_string(),
            });
        }
        let stored = self.values.insert_card(card).await?;
        debug!(card = %stored.id, deliberation_id = stored.deliberation_id, "Stored submitted card");
        Ok(stored)
    }

    /// Cards merged into a canonical card whose content differs from theirs.
    pub async fn review_pairs(
        &self,
        deliberation_id: Option<DeliberationId>,
    ) -> Result<Vec<CanonicalizationPair>> {
        let pairs = self.values.canonicalization_pairs(deliberation_id).await?;
        Ok(pairs.into_iter().filter(CanonicalizationPair::differs).collect())
    }

    pub async fn stats(&self, deliberation_id: DeliberationId) -> Result<DeliberationStats> {
        self.values.stats(deliberation_id).await
    }

    /// Embed and store vectors for cards that have none. Failures on single
    /// cards are logged and skipped; returns how many were embedded.
    #[instrument(skip(self))]
    pub async fn embed_pending_cards(&self, deliberation_id: DeliberationId) -> Result<usize> {
        let pending = self
            .values
            .fetch_cards_without_embedding(deliberation_id, self.config.candidate_limit)
            .await?;

        let mut embedded = 0;
        for card in &pending {
            let embedding = match embed_text(
                self.embedder.as_ref(),
                &card.embedding_text(),
                self.config.call_timeout(),
            )
            .await
            {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!(card = %card.id, error = %e, "Failed to embed card, skipping");
                    continue;
                }
            };

            match self.values.update_card_embedding(card.id, &embedding).await {
                Ok(()) => embedded += 1,
                Err(e) => warn!(card = %card.id, error = %e, "Failed to store card embedding"),
            }
        }

        info!(pending = pending.len(), embedded, "Embedded pending cards");
        Ok(embedded)
    }

    /// Run immediately without checkpoints, still holding the scope lease.
    #[instrument(skip(self))]
    pub async fn run_now(&self, deliberation_id: DeliberationId) -> Result<DeduplicationReport> {
        if self.values.get_deliberation(deliberation_id).await?.is_none() {
            return Err(DedupError::NotFound {
                entity: "deliberation",
                id: deliberation_id.to_string(),
            });
        }
        let mut steps = StepRunner::ephemeral(self.store.as_ref());
        self.run_leased(deliberation_id, None, &mut steps).await
    }

    /// Run a claimed job, resuming from its checkpoints.
    #[instrument(skip(self, job), fields(job_id = %job.id, deliberation_id = job.deliberation_id, attempts = job.attempts))]
    pub async fn run_job(&self, job: &DedupJob) -> Result<DeduplicationReport> {
        let mut steps = StepRunner::durable(self.store.as_ref(), job.id);
        self.run_leased(job.deliberation_id, Some(job.id), &mut steps).await
    }

    async fn run_leased(
        &self,
        deliberation_id: DeliberationId,
        job_id: Option<Uuid>,
        steps: &mut StepRunner<'_>,
    ) -> Result<DeduplicationReport> {
        let holder = Uuid::new_v4();
        let budget = self.config.max_run_duration();
        if !self
            .store
            .try_acquire_scope_lease(deliberation_id, holder, budget + LEASE_MARGIN)
            .await?
        {
            return Err(DedupError::ScopeBusy { deliberation_id });
        }

        let started = Instant::now();
        let result = with_timeout(
            "deduplication run",
            budget,
            self.execute(deliberation_id, job_id, steps),
        )
        .await;

        if let Err(e) = self.store.release_scope_lease(deliberation_id, holder).await {
            // The lease expires on its own.
            warn!(deliberation_id, error = %e, "Failed to release scope lease");
        }

        let mut report = result?;
        report.duration_seconds = started.elapsed().as_secs_f64();

        if report.phase == RunPhase::Completed {
            self.events.publish(DedupEvent::DeduplicateFinished {
                deliberation_id,
                canonicals_created: report.canonicals_created(),
                cards_linked: report.cards_linked(),
            });
        }
        Ok(report)
    }

    async fn execute(
        &self,
        deliberation_id: DeliberationId,
        job_id: Option<Uuid>,
        steps: &mut StepRunner<'_>,
    ) -> Result<DeduplicationReport> {
        let candidates: Vec<ValuesCard> = steps
            .run("fetch-candidates", self.fetch_candidates(deliberation_id))
            .await?;

        if candidates.is_empty() {
            info!(deliberation_id, "Nothing to do");
            let mut report = DeduplicationReport::nothing_to_do(deliberation_id, job_id);
            report.replayed_steps = steps.replayed();
            return Ok(report);
        }

        let plan: ClusterPlan = steps.run("cluster", self.plan_clusters(&candidates)).await?;
        let clusters = resolve_clusters(&candidates, &plan)?;

        let mut results = Vec::with_capacity(clusters.len());
        let mut failures = Vec::new();
        for (index, cluster) in clusters.iter().enumerate() {
            match self.process_cluster(steps, deliberation_id, index, cluster).await {
                Ok(result) => {
                    debug!(
                        cluster = index,
                        canonical = %result.canonical_card_id,
                        action = ?result.action,
                        newly_linked = result.newly_linked,
                        "Canonicalized cluster"
                    );
                    results.push(result);
                }
                Err(e) => {
                    let retryable = e.is_transient();
                    if retryable {
                        warn!(cluster = index, members = cluster.len(), error = %e, "Cluster failed");
                    } else {
                        error!(cluster = index, members = cluster.len(), error = %e, "Cluster failed permanently");
                    }
                    failures.push(ClusterFailure {
                        cluster_index: index,
                        message: e.to_string(),
                        retryable,
                    });
                }
            }
        }

        let report = DeduplicationReport {
            deliberation_id,
            job_id,
            phase: if failures.is_empty() {
                RunPhase::Completed
            } else {
                RunPhase::PartiallyCompleted
            },
            candidates: candidates.len(),
            strategy: Some(plan.strategy),
            clusters: results,
            failures,
            replayed_steps: steps.replayed(),
            duration_seconds: 0.0,
        };

        info!(
            deliberation_id,
            candidates = report.candidates,
            clusters = clusters.len(),
            canonicals_created = report.canonicals_created(),
            cards_linked = report.cards_linked(),
            failed_clusters = report.failures.len(),
            replayed_steps = report.replayed_steps,
            "Deduplication run finished"
        );
        Ok(report)
    }

    async fn fetch_candidates(&self, deliberation_id: DeliberationId) -> Result<Vec<ValuesCard>> {
        let limit = self.config.candidate_limit;
        let cards = self.values.fetch_non_canonicalized(deliberation_id, limit).await?;

        let needs_vectors = self.engine.settings().strategy_for(cards.len()) == ClusterStrategy::Dbscan
            && cards.iter().any(|c| c.embedding.is_none());
        if !needs_vectors {
            return Ok(cards);
        }

        if self.embed_pending_cards(deliberation_id).await? > 0 {
            return self.values.fetch_non_canonicalized(deliberation_id, limit).await;
        }
        Ok(cards)
    }

    async fn plan_clusters(&self, candidates: &[ValuesCard]) -> Result<ClusterPlan> {
        let outcome = self.engine.cluster(candidates, None).await?;
        self.cache_embeddings(outcome.computed_embeddings);

        Ok(ClusterPlan {
            strategy: outcome.strategy,
            clusters: outcome
                .clusters
                .iter()
                .map(|cluster| cluster.iter().map(|c| c.id).collect())
                .collect(),
        })
    }

    /// Non-critical: store vectors computed during clustering in the
    /// background. Failures are logged and never affect the run.
    fn cache_embeddings(&self, embeddings: Vec<(Uuid, Vec<f32>)>) {
        if embeddings.is_empty() {
            return;
        }
        let values = self.values.clone();
        tokio::spawn(async move {
            for (card_id, embedding) in embeddings {
                if let Err(e) = values.update_card_embedding(card_id, &embedding).await {
                    warn!(card = %card_id, error = %e, "Failed to cache card embedding");
                }
            }
        });
    }

    async fn process_cluster(
        &self,
        steps: &mut StepRunner<'_>,
        deliberation_id: DeliberationId,
        index: usize,
        cluster: &[ValuesCard],
    ) -> Result<ClusterResult> {
        let timeout = self.config.call_timeout();
        let representative_id: Uuid = steps
            .run(&format!("select-representative-{index}"), async {
                select_representative(self.judge.as_ref(), cluster, timeout)
                    .await
                    .map(|card| card.id)
            })
            .await?;

        let representative = cluster
            .iter()
            .find(|c| c.id == representative_id)
            .ok_or_else(|| {
                DedupError::invariant(format!(
                    "representative {representative_id} is not a member of cluster {index}"
                ))
            })?;

        steps
            .run(
                &format!("canonicalize-cluster-{index}"),
                self.canonicalizer
                    .canonicalize_cluster(deliberation_id, cluster, representative),
            )
            .await
    }
}

/// Rebuild cluster members from a plan and check the plan still partitions
/// the candidates.
fn resolve_clusters(candidates: &[ValuesCard], plan: &ClusterPlan) -> Result<Vec<Vec<ValuesCard>>> {
    let by_id: HashMap<Uuid, &ValuesCard> = candidates.iter().map(|c| (c.id, c)).collect();
    let clusters = plan
        .clusters
        .iter()
        .map(|ids| {
            ids.iter()
                .map(|id| {
                    by_id.get(id).map(|c| (*c).clone()).ok_or_else(|| {
                        DedupError::invariant(format!("cluster plan names unknown card {id}"))
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    verify_partition(candidates, &clusters)?;
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::SimpleEmbedder;
    use crate::judgment::MockJudge;
    use crate::models::NewCanonicalCard;
    use crate::storage::{CheckpointStore, InMemoryStore, JobStore};
    use chrono::Utc;
    use tracing_test::traced_test;

    async fn pipeline_with(judge: MockJudge) -> (Arc<InMemoryStore>, DeduplicationPipeline, DeliberationId) {
        let store = Arc::new(InMemoryStore::new());
        let deliberation = store.create_deliberation("pipeline").await.unwrap();
        let pipeline = DeduplicationPipeline::new(
            store.clone(),
            Arc::new(SimpleEmbedder::new_mock()),
            Arc::new(judge),
            DedupConfig::default(),
        );
        (store, pipeline, deliberation.id)
    }

    fn submission(deliberation_id: DeliberationId, title: &str) -> NewValuesCard {
        NewValuesCard {
            deliberation_id,
            chat_id: None,
            title: title.to_string(),
            description: format!("I care about {title}"),
            policies: vec![format!("MOMENTS when {title} is at stake")],
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_deliberation_is_nothing_to_do() {
        let (_store, pipeline, d) = pipeline_with(MockJudge::new()).await;
        let mut events = pipeline.events().subscribe();

        let report = pipeline.run_now(d).await.unwrap();
        assert_eq!(report.phase, RunPhase::NothingToDo);
        assert!(events.try_recv().is_err());
        assert!(logs_contain("Nothing to do"));
    }

    #[tokio::test]
    async fn test_unknown_deliberation_is_not_found() {
        let (_store, pipeline, _d) = pipeline_with(MockJudge::new()).await;
        assert!(matches!(
            pipeline.run_now(999).await,
            Err(DedupError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_cards() {
        let (_store, pipeline, d) = pipeline_with(MockJudge::new()).await;
        let mut card = submission(d, "honesty");
        card.policies.clear();
        assert!(matches!(
            pipeline.submit_card(card).await,
            Err(DedupError::Validation(_))
        ));
        assert!(matches!(
            pipeline.submit_card(submission(d + 1, "honesty")).await,
            Err(DedupError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_links_every_candidate_and_emits_event() {
        let (store, pipeline, d) = pipeline_with(MockJudge::new()).await;
        let mut events = pipeline.events().subscribe();
        for title in ["Honesty", "honesty", "Courage"] {
            pipeline.submit_card(submission(d, title)).await.unwrap();
        }

        let report = pipeline.run_now(d).await.unwrap();
        assert_eq!(report.phase, RunPhase::Completed);
        assert_eq!(report.strategy, Some(ClusterStrategy::Pairwise));
        assert_eq!(report.clusters.len(), 2);
        assert_eq!(report.canonicals_created(), 2);
        assert_eq!(report.cards_linked(), 3);
        assert!(store.all_cards(d).await.iter().all(ValuesCard::is_canonicalized));

        let event = events.try_recv().unwrap();
        assert_eq!(event.deliberation_id(), d);
    }

    #[tokio::test]
    async fn test_scope_lease_blocks_concurrent_run() {
        let (store, pipeline, d) = pipeline_with(MockJudge::new()).await;
        pipeline.submit_card(submission(d, "Honesty")).await.unwrap();
        let other = Uuid::new_v4();
        assert!(store
            .try_acquire_scope_lease(d, other, Duration::from_secs(60))
            .await
            .unwrap());

        assert!(matches!(
            pipeline.run_now(d).await,
            Err(DedupError::ScopeBusy { .. })
        ));

        store.release_scope_lease(d, other).await.unwrap();
        assert!(pipeline.run_now(d).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_cluster_is_isolated_and_resumed() {
        let (store, pipeline, d) = pipeline_with(MockJudge::new()).await;
        for title in ["Honesty", "Courage"] {
            pipeline.submit_card(submission(d, title)).await.unwrap();
        }
        let job = store.enqueue_job(d, Utc::now()).await.unwrap().job;

        store.fail_next_links(1);
        let first = pipeline.run_job(&job).await.unwrap();
        assert_eq!(first.phase, RunPhase::PartiallyCompleted);
        assert_eq!(first.failures.len(), 1);
        assert_eq!(first.clusters.len(), 1);
        assert!(matches!(
            first.failure_error(),
            Some(DedupError::ClusterFailed { cluster_index: 0, retryable: true, .. })
        ));

        let second = pipeline.run_job(&job).await.unwrap();
        assert_eq!(second.phase, RunPhase::Completed);
        assert!(second.replayed_steps >= 3);
        assert_eq!(store.all_canonicals(d).await.len(), 2);
        assert!(store.all_cards(d).await.iter().all(ValuesCard::is_canonicalized));
    }

    #[tokio::test]
    async fn test_job_checkpoints_are_written() {
        let (store, pipeline, d) = pipeline_with(MockJudge::new()).await;
        pipeline.submit_card(submission(d, "Honesty")).await.unwrap();
        let job = store.enqueue_job(d, Utc::now()).await.unwrap().job;

        pipeline.run_job(&job).await.unwrap();
        for step in [
            "fetch-candidates",
            "cluster",
            "select-representative-0",
            "canonicalize-cluster-0",
        ] {
            assert!(store.load_step(job.id, step).await.unwrap().is_some(), "missing {step}");
        }
    }

    #[test]
    fn test_permanent_cluster_failure_wins() {
        let mut report = DeduplicationReport::nothing_to_do(1, None);
        report.phase = RunPhase::PartiallyCompleted;
        report.failures = vec![
            ClusterFailure {
                cluster_index: 0,
                message: "database busy".to_string(),
                retryable: true,
            },
            ClusterFailure {
                cluster_index: 3,
                message: "Invariant violation: bad index".to_string(),
                retryable: false,
            },
        ];

        let error = report.failure_error().unwrap();
        assert!(matches!(error, DedupError::ClusterFailed { cluster_index: 3, .. }));
        assert!(!error.is_transient());

        report.failures.truncate(1);
        assert!(report.failure_error().unwrap().is_transient());
    }

    #[tokio::test]
    async fn test_embed_pending_cards() {
        let (store, pipeline, d) = pipeline_with(MockJudge::new()).await;
        for title in ["Honesty", "Courage"] {
            pipeline.submit_card(submission(d, title)).await.unwrap();
        }

        assert_eq!(pipeline.embed_pending_cards(d).await.unwrap(), 2);
        assert!(store.all_cards(d).await.iter().all(|c| c.embedding.is_some()));
        assert_eq!(pipeline.embed_pending_cards(d).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_embed_pending_cards_skips_linked_cards() {
        let (store, pipeline, d) = pipeline_with(MockJudge::new()).await;

        // Cards settled on the pairwise path keep a null embedding.
        let mut settled = Vec::new();
        for i in 0..pipeline.config().candidate_limit {
            settled.push(store.insert_card(submission(d, &format!("Settled {i}"))).await.unwrap());
        }
        let canonical = store
            .insert_canonical(NewCanonicalCard::from_representative(&settled[0], vec![1.0, 0.0]))
            .await
            .unwrap();
        let ids: Vec<Uuid> = settled.iter().map(|c| c.id).collect();
        store.link_cards(canonical.id, &ids).await.unwrap();

        for i in 0..21 {
            pipeline.submit_card(submission(d, &format!("Fresh {i}"))).await.unwrap();
        }

        assert_eq!(pipeline.embed_pending_cards(d).await.unwrap(), 21);
        let cards = store.all_cards(d).await;
        assert!(cards
            .iter()
            .filter(|c| c.canonical_card_id.is_none())
            .all(|c| c.embedding.is_some()));
        assert!(cards
            .iter()
            .filter(|c| c.canonical_card_id.is_some())
            .all(|c| c.embedding.is_none()));
    }

    #[tokio::test]
    async fn test_review_pairs_only_lists_rewordings() {
        let (_store, pipeline, d) = pipeline_with(MockJudge::new()).await;
        let mut long = submission(d, "Honesty");
        long.description = "I care about honesty in every conversation I have".to_string();
        pipeline.submit_card(long).await.unwrap();
        pipeline.submit_card(submission(d, "honesty")).await.unwrap();

        pipeline.run_now(d).await.unwrap();
        let pairs = pipeline.review_pairs(Some(d)).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].card.title, "honesty");
        assert_eq!(pairs[0].canonical.title, "Honesty");

        let stats = pipeline.stats(d).await.unwrap();
        assert_eq!(stats.total_cards, 2);
        assert_eq!(stats.pending_cards(), 0);
        assert_eq!(stats.canonical_cards, 1);
    }

    #[test]
    fn test_resolve_rejects_unknown_ids() {
        let plan = ClusterPlan {
            strategy: ClusterStrategy::Pairwise,
            clusters: vec![vec![Uuid::new_v4()]],
        };
        assert!(matches!(
            resolve_clusters(&[], &plan),
            Err(DedupError::InvariantViolation { .. })
        ));
    }
}
