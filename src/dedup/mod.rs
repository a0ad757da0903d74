//! Clustering, representative selection, similarity search and
//! canonicalization for values cards.

pub mod canonicalize;
pub mod cluster;
pub mod context;
pub mod representative;
pub mod similarity;

use std::future::Future;
use std::time::Duration;

use crate::embedding::EmbeddingService;
use crate::error::{DedupError, Result};
use crate::judgment::JudgmentError;

pub use canonicalize::{CanonicalAction, CanonicalizationService, ClusterResult};
pub use cluster::{verify_partition, ClusterEngine, ClusterOutcome, ClusterSettings, ClusterStrategy};
pub use context::ContextDeduplicator;
pub use representative::select_representative;
pub use similarity::{cosine_distance, search_similar_cards, search_similar_contexts, SearchParams};

/// Await an external call, giving up after `limit`.
pub(crate) async fn with_timeout<T, F>(what: &str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| DedupError::OperationTimeout {
            message: format!("{what} did not finish within {}s", limit.as_secs_f64()),
        })?
}

/// Same as `with_timeout` for judgment calls.
pub(crate) async fn judged<T, F>(what: &str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, JudgmentError>>,
{
    with_timeout(what, limit, async { call.await.map_err(DedupError::from) }).await
}

/// Embed `text`, rejecting empty vectors.
pub(crate) async fn embed_text(
    embedder: &dyn EmbeddingService,
    text: &str,
    limit: Duration,
) -> Result<Vec<f32>> {
    let embedding = with_timeout("embedding", limit, async {
        embedder
            .generate_embedding(text)
            .await
            .map_err(DedupError::Embedding)
    })
    .await?;

    if embedding.is_empty() {
        return Err(DedupError::Embedding(anyhow::anyhow!(
            "embedding service returned an empty vector"
        )));
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::SimpleEmbedder;

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let result: Result<()> = with_timeout("sleep", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DedupError::OperationTimeout { .. })));
    }

    #[tokio::test]
    async fn test_judged_maps_errors() {
        let result: Result<bool> = judged("judge", Duration::from_secs(1), async {
            Err(JudgmentError::Timeout)
        })
        .await;
        assert!(matches!(result, Err(DedupError::Judgment(JudgmentError::Timeout))));
    }

    #[tokio::test]
    async fn test_embed_text() {
        let embedder = SimpleEmbedder::new_mock();
        let embedding = embed_text(&embedder, "honesty", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(embedding.len(), 768);
    }
}
