use std::time::Duration;
use tracing::debug;

use super::judged;
use crate::error::{DedupError, Result};
use crate::judgment::JudgmentService;
use crate::models::ValuesCard;

/// Pick the card that best articulates the value a cluster shares.
///
/// A single-member cluster is its own representative and never reaches the
/// judge. Judge failures propagate so the caller's step is retried; there is
/// no fallback pick.
pub async fn select_representative(
    judge: &dyn JudgmentService,
    cluster: &[ValuesCard],
    timeout: Duration,
) -> Result<ValuesCard> {
    match cluster {
        [] => Err(DedupError::Validation(
            "cannot select a representative from an empty cluster".to_string(),
        )),
        [only] => Ok(only.clone()),
        _ => {
            let index = judged("representative selection", timeout, judge.select_best(cluster)).await?;
            let chosen = cluster.get(index).ok_or_else(|| {
                DedupError::invariant(format!(
                    "judge picked index {index} from a cluster of {}",
                    cluster.len()
                ))
            })?;
            debug!(
                representative = %chosen.id,
                cluster_size = cluster.len(),
                "Selected representative"
            );
            Ok(chosen.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judgment::MockJudge;
    use chrono::Utc;
    use uuid::Uuid;

    fn card(description: &str) -> ValuesCard {
        ValuesCard {
            id: Uuid::new_v4(),
            deliberation_id: 1,
            chat_id: None,
            title: "Honesty".to_string(),
            description: description.to_string(),
            policies: vec!["MOMENTS".to_string()],
            embedding: None,
            canonical_card_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_single_member_skips_judge() {
        let judge = MockJudge::with_failure();
        let only = card("only");
        let chosen = select_representative(&judge, &[only.clone()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(chosen.id, only.id);
    }

    #[tokio::test]
    async fn test_uses_judge_choice_deterministically() {
        let judge = MockJudge::new();
        let cluster = vec![card("short"), card("the longest description"), card("medium one")];
        let first = select_representative(&judge, &cluster, Duration::from_secs(1))
            .await
            .unwrap();
        let second = select_representative(&judge, &cluster, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.id, cluster[1].id);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_judge_failure_is_not_swallowed() {
        let judge = MockJudge::with_failure();
        let cluster = vec![card("a"), card("b")];
        let result = select_representative(&judge, &cluster, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DedupError::Judgment(_))));
    }

    #[tokio::test]
    async fn test_empty_cluster_is_rejected() {
        let judge = MockJudge::new();
        let result = select_representative(&judge, &[], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DedupError::Validation(_))));
    }
}
