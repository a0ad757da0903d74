use std::sync::Arc;
use tracing::{debug, info};

use super::similarity::{search_similar_contexts, SearchParams};
use super::{embed_text, judged};
use crate::config::DedupConfig;
use crate::embedding::EmbeddingService;
use crate::error::{DedupError, Result};
use crate::judgment::JudgmentService;
use crate::models::{Context, DeliberationId};
use crate::storage::ValuesStore;

/// Deduplicates context names within a deliberation.
///
/// Contexts are matched on name: an exact (case-insensitive) hit first, then
/// the judge over the nearest names by embedding.
pub struct ContextDeduplicator {
    store: Arc<dyn ValuesStore>,
    embedder: Arc<dyn EmbeddingService>,
    judge: Arc<dyn JudgmentService>,
    config: DedupConfig,
}

impl ContextDeduplicator {
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

    fn clean_name(name: &str) -> Result<&str> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DedupError::Validation("context name must not be empty".to_string()));
        }
        Ok(trimmed)
    }

    /// Name of an existing context in `deliberation_id` that means the same as
    /// `name`, if any.
    pub async fn fetch_duplicate_context(
        &self,
        name: &str,
        deliberation_id: DeliberationId,
    ) -> Result<Option<String>> {
        let name = Self::clean_name(name)?;
        let existing = self.store.list_contexts(deliberation_id).await?;
        if existing.is_empty() {
            return Ok(None);
        }

        if let Some(exact) = existing.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
            return Ok(Some(exact.name.clone()));
        }

        let embedding = embed_text(self.embedder.as_ref(), name, self.config.call_timeout()).await?;
        let nearby = search_similar_contexts(
            self.store.as_ref(),
            deliberation_id,
            &embedding,
            SearchParams::context(&self.config),
        )
        .await?;

        // Contexts stored without an embedding never show up in search, so
        // fall back to every name when nothing is near.
        let candidates: Vec<String> = if nearby.is_empty() {
            existing.into_iter().map(|c| c.name).collect()
        } else {
            nearby.into_iter().map(|m| m.entity.name).collect()
        };

        let answer = judged(
            "context equivalence",
            self.config.call_timeout(),
            self.judge.judge_context_equivalence(name, &candidates),
        )
        .await?;

        // Only names that were offered count as a match.
        let matched = answer.filter(|a| candidates.iter().any(|c| c == a));
        debug!(context = name, matched = ?matched, candidates = candidates.len(), "Context lookup");
        Ok(matched)
    }

    /// Existing equivalent context, or a new one created with its embedding.
    pub async fn canonicalize_context(&self, name: &str, deliberation_id: DeliberationId) -> Result<Context> {
        let name = Self::clean_name(name)?;

        if let Some(duplicate) = self.fetch_duplicate_context(name, deliberation_id).await? {
            let contexts = self.store.list_contexts(deliberation_id).await?;
            if let Some(context) = contexts.into_iter().find(|c| c.name == duplicate) {
                return Ok(context);
            }
        }

        let embedding = embed_text(self.embedder.as_ref(), name, self.config.call_timeout()).await?;
        let context = self.store.insert_context(deliberation_id, name, &embedding).await?;
        info!(deliberation_id, context = %context.name, "Created context");
        Ok(context)
    }
}
