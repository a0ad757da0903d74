use tracing::debug;

use crate::config::DedupConfig;
use crate::error::{DedupError, Result};
use crate::models::{CanonicalValuesCard, Context, DeliberationId, ScoredMatch};
use crate::storage::ValuesStore;

/// Bounds for a nearest-neighbor query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub limit: usize,
    pub max_distance: f64,
}

impl SearchParams {
    /// Tight: a hit here is treated as the same value.
    pub const CANONICAL: SearchParams = SearchParams {
        limit: 10,
        max_distance: 0.1,
    };

    /// Looser, since context names vary more before they mean something else.
    pub const CONTEXT: SearchParams = SearchParams {
        limit: 10,
        max_distance: 0.5,
    };

    pub fn canonical(config: &DedupConfig) -> Self {
        Self {
            limit: config.card_search_limit,
            max_distance: config.card_max_distance,
        }
    }

    pub fn context(config: &DedupConfig) -> Self {
        Self {
            limit: config.context_search_limit,
            max_distance: config.context_max_distance,
        }
    }

    pub fn with_limit(self, limit: usize) -> Self {
        Self { limit, ..self }
    }
}

/// Cosine distance (1 - cosine similarity). `None` for vectors that cannot be
/// compared: different lengths, empty, or zero magnitude.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }

    let similarity = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    Some(1.0 - similarity)
}

/// Check what storage returned instead of trusting it: right scope, within
/// bounds, ascending, and every entity searchable.
fn verify_matches<T>(
    matches: &[ScoredMatch<T>],
    params: SearchParams,
    what: &str,
    is_valid: impl Fn(&T) -> bool,
) -> Result<()> {
    if matches.len() > params.limit {
        return Err(DedupError::invariant(format!(
            "{what} search returned {} results for limit {}",
            matches.len(),
            params.limit
        )));
    }

    let mut previous = f64::NEG_INFINITY;
    for m in matches {
        if !m.distance.is_finite() || m.distance > params.max_distance {
            return Err(DedupError::invariant(format!(
                "{what} search returned distance {} above maximum {}",
                m.distance, params.max_distance
            )));
        }
        if m.distance < previous {
            return Err(DedupError::invariant(format!(
                "{what} search results are not ordered by distance"
            )));
        }
        if !is_valid(&m.entity) {
            return Err(DedupError::invariant(format!(
                "{what} search returned an entity without an embedding or from another deliberation"
            )));
        }
        previous = m.distance;
    }
    Ok(())
}

fn check_query(embedding: &[f32]) -> Result<()> {
    if embedding.is_empty() {
        return Err(DedupError::Validation(
            "cannot search with an empty embedding".to_string(),
        ));
    }
    Ok(())
}

/// Canonical cards in `deliberation_id` nearest to `embedding`.
///
/// An empty result is a valid answer. Fails with `InvariantViolation` if
/// storage hands back anything out of bounds, out of order, out of scope or
/// without an embedding.
pub async fn search_similar_cards(
    store: &dyn ValuesStore,
    deliberation_id: DeliberationId,
    embedding: &[f32],
    params: SearchParams,
) -> Result<Vec<ScoredMatch<CanonicalValuesCard>>> {
    check_query(embedding)?;
    let matches = store
        .search_canonical(deliberation_id, embedding, params.limit, params.max_distance)
        .await?;

    verify_matches(&matches, params, "canonical card", |c: &CanonicalValuesCard| {
        c.deliberation_id == deliberation_id && c.embedding.as_ref().is_some_and(|e| !e.is_empty())
    })?;

    debug!(
        deliberation_id,
        matches = matches.len(),
        nearest = matches.first().map(|m| m.distance),
        "Canonical card search"
    );
    Ok(matches)
}

/// Contexts in `deliberation_id` nearest to `embedding`.
pub async fn search_similar_contexts(
    store: &dyn ValuesStore,
    deliberation_id: DeliberationId,
    embedding: &[f32],
    params: SearchParams,
) -> Result<Vec<ScoredMatch<Context>>> {
    check_query(embedding)?;
    let matches = store
        .search_contexts(deliberation_id, embedding, params.limit, params.max_distance)
        .await?;

    verify_matches(&matches, params, "context", |c: &Context| {
        c.deliberation_id == deliberation_id && c.embedding.as_ref().is_some_and(|e| !e.is_empty())
    })?;

    debug!(deliberation_id, matches = matches.len(), "Context search");
    Ok(matches)
}
