use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::similarity::cosine_distance;
use super::{embed_text, judged};
use crate::config::DedupConfig;
use crate::embedding::EmbeddingService;
use crate::error::{DedupError, Result};
use crate::judgment::JudgmentService;
use crate::models::{CardContent, ValuesCard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStrategy {
    /// Ask the judge about pairs and merge with union-find.
    Pairwise,
    /// Density-based clustering over embeddings.
    Dbscan,
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub pairwise_threshold: usize,
    pub eps: f64,
    pub min_points: usize,
    pub call_timeout: Duration,
}

impl ClusterSettings {
    pub fn from_config(config: &DedupConfig) -> Self {
        Self {
            pairwise_threshold: config.pairwise_threshold,
            eps: config.dbscan_eps,
            min_points: config.dbscan_min_points,
            call_timeout: config.call_timeout(),
        }
    }

    pub fn strategy_for(&self, candidates: usize) -> ClusterStrategy {
        if candidates <= self.pairwise_threshold {
            ClusterStrategy::Pairwise
        } else {
            ClusterStrategy::Dbscan
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub strategy: ClusterStrategy,
    /// Non-empty, disjoint groups covering the input, ordered by the input
    /// position of their first member. Members keep input order.
    pub clusters: Vec<Vec<ValuesCard>>,
    /// Embeddings computed along the way, for the caller to cache.
    pub computed_embeddings: Vec<(Uuid, Vec<f32>)>,
    /// Judge calls made (pairwise only).
    pub judgments: usize,
}

/// Partitions candidate cards into groups that express the same value.
pub struct ClusterEngine {
    judge: Arc<dyn JudgmentService>,
    embedder: Arc<dyn EmbeddingService>,
    settings: ClusterSettings,
}

impl ClusterEngine {
    pub fn new(
        judge: Arc<dyn JudgmentService>,
        embedder: Arc<dyn EmbeddingService>,
        settings: ClusterSettings,
    ) -> Self {
        Self {
            judge,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub async fn cluster(
        &self,
        candidates: &[ValuesCard],
        context: Option<&str>,
    ) -> Result<ClusterOutcome> {
        let strategy = self.settings.strategy_for(candidates.len());
        if candidates.is_empty() {
            return Ok(ClusterOutcome {
                strategy,
                clusters: Vec::new(),
                computed_embeddings: Vec::new(),
                judgments: 0,
            });
        }

        let outcome = match strategy {
            ClusterStrategy::Pairwise => self.cluster_pairwise(candidates, context).await?,
            ClusterStrategy::Dbscan => self.cluster_dbscan(candidates).await?,
        };

        verify_partition(candidates, &outcome.clusters)?;

        info!(
            strategy = ?outcome.strategy,
            candidates = candidates.len(),
            clusters = outcome.clusters.len(),
            judgments = outcome.judgments,
            "Clustered candidate cards"
        );
        Ok(outcome)
    }

    /// Once a pair is merged it stays merged for the run. Pairs already in the
    /// same set are not asked about, so a later "not equivalent" answer
    /// involving a third card can never split a group.
    async fn cluster_pairwise(
        &self,
        candidates: &[ValuesCard],
        context: Option<&str>,
    ) -> Result<ClusterOutcome> {
        let n = candidates.len();
        let mut sets = DisjointSets::new(n);
        let mut judgments = 0;

        for i in 0..n {
            for j in (i + 1)..n {
                if sets.find(i) == sets.find(j) {
                    continue;
                }

                judgments += 1;
                let same = judged(
                    "equivalence judgment",
                    self.settings.call_timeout,
                    self.judge
                        .judge_equivalence(&candidates[i], &candidates[j], context),
                )
                .await?;

                if same {
                    debug!(a = %candidates[i].id, b = %candidates[j].id, "Merging equivalent cards");
                    sets.union(i, j);
                }
            }
        }

        Ok(ClusterOutcome {
            strategy: ClusterStrategy::Pairwise,
            clusters: sets.groups(candidates),
            computed_embeddings: Vec::new(),
            judgments,
        })
    }

    async fn cluster_dbscan(&self, candidates: &[ValuesCard]) -> Result<ClusterOutcome> {
        let mut cards = candidates.to_vec();
        let mut computed = Vec::new();

        for card in cards.iter_mut() {
            let has_embedding = card.embedding.as_ref().is_some_and(|e| !e.is_empty());
            if !has_embedding {
                let embedding = embed_text(
                    self.embedder.as_ref(),
                    &card.embedding_text(),
                    self.settings.call_timeout,
                )
                .await?;
                computed.push((card.id, embedding.clone()));
                card.embedding = Some(embedding);
            }
        }

        let points: Vec<&[f32]> = cards
            .iter()
            .map(|c| c.embedding.as_deref().unwrap_or_default())
            .collect();
        let labels = dbscan(&points, self.settings.eps, self.settings.min_points);

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut noise = Vec::new();
        for (index, label) in labels.iter().enumerate() {
            match label {
                Some(cluster) => groups.entry(*cluster).or_default().push(index),
                None => noise.push(vec![index]),
            }
        }

        // Noise points are cards without duplicates, not cards to drop.
        let mut index_groups: Vec<Vec<usize>> = groups.into_values().chain(noise).collect();
        index_groups.sort_by_key(|g| g[0]);

        let clusters = index_groups
            .into_iter()
            .map(|g| g.into_iter().map(|i| cards[i].clone()).collect())
            .collect();

        Ok(ClusterOutcome {
            strategy: ClusterStrategy::Dbscan,
            clusters,
            computed_embeddings: computed,
            judgments: 0,
        })
    }
}

/// Union-find over candidate indices.
struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    /// The smaller index becomes the root, keeping roots stable.
    fn union(&mut self, i: usize, j: usize) {
        let (pi, pj) = (self.find(i), self.find(j));
        if pi != pj {
            let (root, child) = if pi < pj { (pi, pj) } else { (pj, pi) };
            self.parent[child] = root;
        }
    }

    fn groups(&mut self, candidates: &[ValuesCard]) -> Vec<Vec<ValuesCard>> {
        let mut by_root: BTreeMap<usize, Vec<ValuesCard>> = BTreeMap::new();
        for (i, card) in candidates.iter().enumerate() {
            let root = self.find(i);
            by_root.entry(root).or_default().push(card.clone());
        }
        // Roots are the smallest member index, so key order is first-member order.
        by_root.into_values().collect()
    }
}

/// DBSCAN with cosine distance. Returns a cluster label per point, `None` for
/// noise. `min_points` counts the point itself. Labels are assigned in order
/// of the first core point that reaches them, and border points go to the
/// first cluster that reaches them.
pub(crate) fn dbscan(points: &[&[f32]], eps: f64, min_points: usize) -> Vec<Option<usize>> {
    let n = points.len();
    let neighbors = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| {
                i == j || cosine_distance(points[i], points[j]).is_some_and(|d| d <= eps)
            })
            .collect()
    };

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_label = 0;

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let seeds = neighbors(i);
        if seeds.len() < min_points {
            continue;
        }

        let label = next_label;
        next_label += 1;
        labels[i] = Some(label);

        let mut queue: VecDeque<usize> = seeds.into_iter().filter(|&j| j != i).collect();
        while let Some(j) = queue.pop_front() {
            if labels[j].is_none() {
                labels[j] = Some(label);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;

            let expansion = neighbors(j);
            if expansion.len() >= min_points {
                queue.extend(expansion.into_iter().filter(|&k| !visited[k] || labels[k].is_none()));
            }
        }
    }

    labels
}

/// Every input card appears in exactly one non-empty cluster and nothing else does.
pub fn verify_partition(input: &[ValuesCard], clusters: &[Vec<ValuesCard>]) -> Result<()> {
    let expected: HashSet<Uuid> = input.iter().map(|c| c.id).collect();
    let mut seen: HashSet<Uuid> = HashSet::with_capacity(input.len());

    for (index, cluster) in clusters.iter().enumerate() {
        if cluster.is_empty() {
            return Err(DedupError::invariant(format!("cluster {index} is empty")));
        }
        for card in cluster {
            if !expected.contains(&card.id) {
                return Err(DedupError::invariant(format!(
                    "cluster {index} contains unknown card {}",
                    card.id
                )));
            }
            if !seen.insert(card.id) {
                return Err(DedupError::invariant(format!(
                    "card {} appears in more than one cluster",
                    card.id
                )));
            }
        }
    }

    if seen.len() != expected.len() {
        return Err(DedupError::invariant(format!(
            "{} of {} cards were not assigned to a cluster",
            expected.len() - seen.len(),
            expected.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::SimpleEmbedder;
    use crate::judgment::MockJudge;
    use chrono::Utc;

    fn card(title: &str, embedding: Option<Vec<f32>>) -> ValuesCard {
        ValuesCard {
            id: Uuid::new_v4(),
            deliberation_id: 1,
            chat_id: None,
            title: title.to_string(),
            description: format!("About {title}"),
            policies: vec!["MOMENTS".to_string()],
            embedding,
            canonical_card_id: None,
            created_at: Utc::now(),
        }
    }

    fn engine(judge: MockJudge) -> ClusterEngine {
        ClusterEngine::new(
            Arc::new(judge),
            Arc::new(SimpleEmbedder::new_mock()),
            ClusterSettings::default(),
        )
    }

    fn ids(cluster: &[ValuesCard]) -> Vec<Uuid> {
        cluster.iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_strategy_threshold() {
        let settings = ClusterSettings::default();
        assert_eq!(settings.strategy_for(20), ClusterStrategy::Pairwise);
        assert_eq!(settings.strategy_for(21), ClusterStrategy::Dbscan);
    }

    #[tokio::test]
    async fn test_empty_input_gives_no_clusters() {
        let outcome = engine(MockJudge::new()).cluster(&[], None).await.unwrap();
        assert!(outcome.clusters.is_empty());
    }

    #[tokio::test]
    async fn test_pairwise_groups_by_judgment() {
        let cards = vec![
            card("Honesty", None),
            card("Curiosity", None),
            card("honesty", None),
            card("Courage", None),
        ];
        let outcome = engine(MockJudge::new()).cluster(&cards, None).await.unwrap();

        assert_eq!(outcome.strategy, ClusterStrategy::Pairwise);
        assert_eq!(outcome.clusters.len(), 3);
        assert_eq!(ids(&outcome.clusters[0]), vec![cards[0].id, cards[2].id]);
        assert_eq!(ids(&outcome.clusters[1]), vec![cards[1].id]);
        assert_eq!(ids(&outcome.clusters[2]), vec![cards[3].id]);
    }

    #[tokio::test]
    async fn test_pairwise_merge_is_transitive_and_skips_known_pairs() {
        // A~B and B~C but the judge says A!~C. Union-find keeps one group
        // and never asks about A,C because they are already merged.
        let rule = |a: &ValuesCard, b: &ValuesCard| {
            let pair = [a.title.as_str(), b.title.as_str()];
            matches!(pair, ["A", "B"] | ["B", "A"] | ["B", "C"] | ["C", "B"])
        };
        let judge = MockJudge::with_rule(rule);
        let cards = vec![card("A", None), card("B", None), card("C", None)];
        let outcome = engine(judge.clone()).cluster(&cards, None).await.unwrap();

        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(ids(&outcome.clusters[0]), ids(&cards));
        // (A,B) merged, (A,C) asked and refused, (B,C) merged.
        assert_eq!(judge.equivalence_calls(), 3);

        // All three equivalent: (A,B) and (A,C) merge, (B,C) is skipped.
        let judge = MockJudge::with_rule(|_, _| true);
        let outcome = engine(judge.clone()).cluster(&cards, None).await.unwrap();
        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(judge.equivalence_calls(), 2);
    }

    #[tokio::test]
    async fn test_pairwise_judge_failure_fails_clustering() {
        let cards = vec![card("A", None), card("B", None)];
        let result = engine(MockJudge::with_failure()).cluster(&cards, None).await;
        assert!(matches!(result, Err(DedupError::Judgment(_))));
    }

    fn near(axis: usize, dims: usize, jitter: f32) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[axis] = 1.0;
        v[(axis + 1) % dims] = jitter;
        v
    }

    #[tokio::test]
    async fn test_dbscan_separates_three_groups() {
        let mut cards = Vec::new();
        for (axis, size) in [(0usize, 10usize), (1, 10), (2, 5)] {
            for k in 0..size {
                let jitter = k as f32 * 0.01;
                cards.push(card(&format!("g{axis}-{k}"), Some(near(axis, 4, jitter))));
            }
        }
        // Interleave so group order is not input order.
        cards.swap(0, 24);

        let outcome = engine(MockJudge::with_failure()).cluster(&cards, None).await.unwrap();
        assert_eq!(outcome.strategy, ClusterStrategy::Dbscan);
        assert_eq!(outcome.clusters.len(), 3);

        let mut sizes: Vec<usize> = outcome.clusters.iter().map(|c| c.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![5, 10, 10]);
        for cluster in &outcome.clusters {
            let prefix = &cluster[0].title[..2];
            assert!(cluster.iter().all(|c| c.title.starts_with(prefix)));
        }
        assert!(outcome.computed_embeddings.is_empty());
    }

    #[tokio::test]
    async fn test_dbscan_noise_becomes_singletons_and_embeddings_are_reported() {
        // 21 cards without embeddings: mock embeddings are effectively random
        // so every card is its own cluster.
        let cards: Vec<ValuesCard> = (0..21).map(|i| card(&format!("value {i}"), None)).collect();
        let outcome = engine(MockJudge::new()).cluster(&cards, None).await.unwrap();

        assert_eq!(outcome.strategy, ClusterStrategy::Dbscan);
        assert_eq!(outcome.clusters.len(), 21);
        assert_eq!(outcome.computed_embeddings.len(), 21);
        assert!(outcome
            .clusters
            .iter()
            .all(|c| c.len() == 1 && c[0].embedding.is_some()));
        for (cluster, input) in outcome.clusters.iter().zip(&cards) {
            assert_eq!(cluster[0].id, input.id);
        }
    }

    #[test]
    fn test_dbscan_border_point_joins_first_cluster() {
        let a = [1.0f32, 0.0];
        let points: Vec<&[f32]> = vec![&a, &a, &a];
        assert_eq!(dbscan(&points, 0.1, 3), vec![Some(0), Some(0), Some(0)]);
        assert_eq!(dbscan(&points, 0.1, 4), vec![None, None, None]);
        assert_eq!(dbscan(&[], 0.1, 3), Vec::<Option<usize>>::new());
    }

    #[test]
    fn test_verify_partition_detects_problems() {
        let a = card("A", None);
        let b = card("B", None);
        let input = vec![a.clone(), b.clone()];

        assert!(verify_partition(&input, &[vec![a.clone()], vec![b.clone()]]).is_ok());
        assert!(verify_partition(&input, &[vec![a.clone()]]).is_err());
        assert!(verify_partition(&input, &[vec![a.clone(), b.clone()], vec![a.clone()]]).is_err());
        assert!(verify_partition(&input, &[vec![a.clone(), b.clone()], vec![]]).is_err());
        assert!(verify_partition(&input, &[vec![a, b, card("C", None)]]).is_err());
    }
}
