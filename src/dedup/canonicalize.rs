use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::similarity::{search_similar_cards, SearchParams};
use super::{embed_text, judged};
use crate::config::DedupConfig;
use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::judgment::JudgmentService;
use crate::models::{CanonicalValuesCard, CardContent, DeliberationId, NewCanonicalCard, ValuesCard};
use crate::storage::ValuesStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalAction {
    /// Linked to a canonical card found by similarity search.
    LinkedExisting,
    /// Promoted the representative to a new canonical card.
    Created,
    /// A canonical card promoted from this cluster already existed (an
    /// earlier attempt created it and then failed).
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResult {
    pub canonical_card_id: Uuid,
    pub action: CanonicalAction,
    pub members: usize,
    /// Cards whose link was set by this call. Members linked earlier do not count.
    pub newly_linked: u64,
    /// Distance to the matched canonical card, for `LinkedExisting`.
    pub distance: Option<f64>,
}

/// Fetch-or-create the canonical card for a cluster and link every member.
///
/// Not safe to run concurrently for the same deliberation: two callers could
/// both find no match and create two canonical cards for one value. Callers
/// hold the deliberation's scope lease and process clusters one at a time.
pub struct CanonicalizationService {
    store: Arc<dyn ValuesStore>,
    embedder: Arc<dyn EmbeddingService>,
    judge: Arc<dyn JudgmentService>,
    config: DedupConfig,
}

impl CanonicalizationService {
    pub fn new(
        store: Arc<dyn ValuesStore>,
        embedder: Arc<dyn EmbeddingService>,
        judge: Arc<dyn JudgmentService>,
        config: DedupConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            judge,
            config,
        }
    }

    /// Embedding for the representative, reusing a stored one when present.
    async fn representative_embedding(&self, representative: &ValuesCard) -> Result<Vec<f32>> {
        match &representative.embedding {
            Some(embedding) if !embedding.is_empty() => Ok(embedding.clone()),
            _ => {
                embed_text(
                    self.embedder.as_ref(),
                    &representative.embedding_text(),
                    self.config.call_timeout(),
                )
                .await
            }
        }
    }

    /// A canonical card promoted from any member of the cluster.
    async fn previously_promoted(
        &self,
        deliberation_id: DeliberationId,
        representative: &ValuesCard,
        cluster: &[ValuesCard],
    ) -> Result<Option<CanonicalValuesCard>> {
        let members = std::iter::once(representative).chain(cluster.iter().filter(|c| c.id != representative.id));
        for member in members {
            if let Some(canonical) = self.store.find_canonical_by_source(deliberation_id, member.id).await? {
                return Ok(Some(canonical));
            }
        }
        Ok(None)
    }

    /// Existing canonical card that expresses the representative's value.
    ///
    /// Always queries storage; a match is never cached across attempts.
    pub async fn find_existing_canonical(
        &self,
        deliberation_id: DeliberationId,
        representative: &ValuesCard,
        embedding: &[f32],
    ) -> Result<Option<(CanonicalValuesCard, f64)>> {
        let params = SearchParams::canonical(&self.config).with_limit(self.config.match_candidates);
        let matches = search_similar_cards(self.store.as_ref(), deliberation_id, embedding, params).await?;

        if matches.is_empty() {
            debug!(representative = %representative.id, "No canonical card within distance");
            return Ok(None);
        }

        if !self.config.confirm_matches {
            return Ok(matches.into_iter().next().map(|m| (m.entity, m.distance)));
        }

        let canonicals: Vec<CanonicalValuesCard> = matches.iter().map(|m| m.entity.clone()).collect();
        let confirmed = judged(
            "duplicate confirmation",
            self.config.call_timeout(),
            self.judge.find_existing_duplicate(representative, &canonicals),
        )
        .await?;

        match confirmed {
            Some(index) => Ok(matches.into_iter().nth(index).map(|m| (m.entity, m.distance))),
            None => {
                debug!(
                    representative = %representative.id,
                    candidates = canonicals.len(),
                    "Judge rejected every nearby canonical card"
                );
                Ok(None)
            }
        }
    }

    pub async fn canonicalize_cluster(
        &self,
        deliberation_id: DeliberationId,
        cluster: &[ValuesCard],
        representative: &ValuesCard,
    ) -> Result<ClusterResult> {
        let member_ids: Vec<Uuid> = cluster.iter().map(|c| c.id).collect();

        if let Some(canonical) = self
            .previously_promoted(deliberation_id, representative, cluster)
            .await?
        {
            let newly_linked = self.store.link_cards(canonical.id, &member_ids).await?;
            info!(
                canonical = %canonical.id,
                newly_linked,
                "Resumed cluster with previously created canonical card"
            );
            return Ok(ClusterResult {
                canonical_card_id: canonical.id,
                action: CanonicalAction::Resumed,
                members: cluster.len(),
                newly_linked,
                distance: None,
            });
        }

        let embedding = self.representative_embedding(representative).await?;

        let (canonical, action, distance) = match self
            .find_existing_canonical(deliberation_id, representative, &embedding)
            .await?
        {
            Some((canonical, distance)) => (canonical, CanonicalAction::LinkedExisting, Some(distance)),
            None => {
                // The row is inserted with its embedding, so it is searchable
                // the moment it exists.
                let created = self
                    .store
                    .insert_canonical(NewCanonicalCard::from_representative(representative, embedding))
                    .await?;
                info!(
                    canonical = %created.id,
                    title = %created.title,
                    "Created canonical card"
                );
                (created, CanonicalAction::Created, None)
            }
        };

        let newly_linked = self.store.link_cards(canonical.id, &member_ids).await?;
        if (newly_linked as usize) < cluster.len() {
            warn!(
                canonical = %canonical.id,
                newly_linked,
                members = cluster.len(),
                "Some cluster members were already linked and kept their link"
            );
        }

        Ok(ClusterResult {
            canonical_card_id: canonical.id,
            action,
            members: cluster.len(),
            newly_linked,
            distance,
        })
    }
}
