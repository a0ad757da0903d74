//! Property-based tests for clustering and similarity search.
//!
//! These use proptest to check the invariants every run relies on: clusters
//! partition their input, and search results are bounded and ordered.


use approx::assert_abs_diff_eq;
use chrono::Utc;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use test_helpers::{AxisEmbedder, AXIS_DIMENSIONS};
use tokio_test::block_on;
use uuid::Uuid;
use values_dedup::dedup::{cosine_distance, search_similar_cards, verify_partition};
use values_dedup::embedding::normalize;
use values_dedup::models::NewCanonicalCard;
use values_dedup::storage::ValuesStore;
use values_dedup::{ClusterEngine, ClusterSettings, InMemoryStore, MockJudge, SearchParams, ValuesCard};

fn card(title: String) -> ValuesCard {
    ValuesCard {
        id: Uuid::new_v4(),
        deliberation_id: 1,
        chat_id: None,
        title,
        description: "description".to_string(),
        policies: vec!["MOMENTS".to_string()],
        embedding: None,
        canonical_card_id: None,
        created_at: Utc::now(),
    }
}

prop_compose! {
    /// Cards labelled with a group and an index within it.
    fn arb_candidates()(groups in prop::collection::vec(0usize..4, 0..40)) -> Vec<ValuesCard> {
        groups
            .iter()
            .enumerate()
            .map(|(i, g)| card(format!("group-{g} card-{}", i % 10)))
            .collect()
    }
}

prop_compose! {
    fn arb_vector()(raw in prop::collection::vec(-1.0f32..1.0, 4)) -> Vec<f32> {
        let mut v = raw;
        // Keep away from the zero vector so distances are defined.
        v[0] += 2.0;
        normalize(&mut v);
        v
    }
}

fn engine() -> ClusterEngine {
    let judge = MockJudge::with_rule(|a, b| {
        a.title.split_whitespace().next() == b.title.split_whitespace().next()
    });
    ClusterEngine::new(Arc::new(judge), Arc::new(AxisEmbedder), ClusterSettings::default())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: every candidate lands in exactly one non-empty cluster, on
    /// both the pairwise and the DBSCAN path.
    #[test]
    fn prop_clusters_partition_candidates(candidates in arb_candidates()) {
        let outcome = block_on(engine().cluster(&candidates, None)).unwrap();

        prop_assert!(verify_partition(&candidates, &outcome.clusters).is_ok());
        prop_assert!(outcome.clusters.iter().all(|c| !c.is_empty()));

        let seen: usize = outcome.clusters.iter().map(Vec::len).sum();
        prop_assert_eq!(seen, candidates.len());
        let unique: HashSet<Uuid> = outcome.clusters.iter().flatten().map(|c| c.id).collect();
        prop_assert_eq!(unique.len(), candidates.len());
    }

    /// Property: on the pairwise path, cards the judge calls equivalent always
    /// share a cluster and cards it never links stay apart.
    #[test]
    fn prop_pairwise_groups_follow_judge(candidates in arb_candidates()) {
        prop_assume!(candidates.len() <= ClusterSettings::default().pairwise_threshold);
        let outcome = block_on(engine().cluster(&candidates, None)).unwrap();

        for cluster in &outcome.clusters {
            let labels: HashSet<&str> = cluster
                .iter()
                .filter_map(|c| c.title.split_whitespace().next())
                .collect();
            prop_assert_eq!(labels.len(), 1);
        }
        let distinct: HashSet<&str> = candidates
            .iter()
            .filter_map(|c| c.title.split_whitespace().next())
            .collect();
        prop_assert_eq!(outcome.clusters.len(), distinct.len());
    }

    /// Property: search results are scoped, bounded by limit and distance,
    /// and sorted nearest first.
    #[test]
    fn prop_search_is_bounded_and_ordered(
        stored in prop::collection::vec(arb_vector(), 0..30),
        query in arb_vector(),
        limit in 1usize..12,
        max_distance in 0.0f64..1.0,
    ) {
        let matches = block_on(async {
            let store = InMemoryStore::new();
            let deliberation = store.create_deliberation("search").await.unwrap();
            let other = store.create_deliberation("elsewhere").await.unwrap();
            for (i, embedding) in stored.iter().enumerate() {
                for d in [deliberation.id, other.id] {
                    store
                        .insert_canonical(NewCanonicalCard {
                            deliberation_id: d,
                            title: format!("canonical {i}"),
                            description: "d".to_string(),
                            policies: vec!["p".to_string()],
                            embedding: embedding.clone(),
                            source_card_id: Uuid::new_v4(),
                        })
                        .await
                        .unwrap();
                }
            }
            let params = SearchParams { limit, max_distance };
            search_similar_cards(&store, deliberation.id, &query, params).await.unwrap()
        });

        let within = stored
            .iter()
            .filter(|e| cosine_distance(e, &query).is_some_and(|d| d <= max_distance))
            .count();
        prop_assert_eq!(matches.len(), within.min(limit));
        prop_assert!(matches.windows(2).all(|w| w[0].distance <= w[1].distance));
        prop_assert!(matches.iter().all(|m| m.distance <= max_distance));
        prop_assert!(matches.iter().all(|m| m.entity.embedding.is_some()));
    }

    /// Property: cosine distance is symmetric and lies in [0, 2].
    #[test]
    fn prop_cosine_distance_is_symmetric(a in arb_vector(), b in arb_vector()) {
        let ab = cosine_distance(&a, &b).unwrap();
        let ba = cosine_distance(&b, &a).unwrap();
        assert_abs_diff_eq!(ab, ba, epsilon = 1e-12);
        prop_assert!((0.0..=2.0).contains(&ab));
        assert_abs_diff_eq!(cosine_distance(&a, &a).unwrap(), 0.0, epsilon = 1e-6);
    }
}

#[test]
fn test_axis_embedder_separates_groups() {
    let a = AxisEmbedder::embed("group-0 card-0");
    let b = AxisEmbedder::embed("group-0 card-9");
    let c = AxisEmbedder::embed("group-1 card-0");
    assert_eq!(a.len(), AXIS_DIMENSIONS);
    assert!(cosine_distance(&a, &b).unwrap() < 0.01);
    assert!(cosine_distance(&a, &c).unwrap() > 0.9);
}
