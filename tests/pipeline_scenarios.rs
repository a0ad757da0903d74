//! End-to-end deduplication runs over the in-memory store.


use std::collections::HashMap;
use std::sync::Arc;
use test_helpers::{AxisEmbedder, TestEnvironment};
use tracing_test::traced_test;
use values_dedup::storage::ValuesStore;
use values_dedup::{CanonicalAction, ClusterStrategy, RunPhase};

#[tokio::test]
#[traced_test]
async fn test_three_honesty_cards_become_one_canonical() {
    let env = TestEnvironment::new().await;
    env.submit("Honesty", "I value telling people the truth, even when it is hard.")
        .await;
    env.submit("honesty", "Telling the truth matters to me.").await;
    env.submit("HONESTY", "Being truthful.").await;

    let report = env.pipeline.run_now(env.deliberation_id).await.unwrap();

    assert_eq!(report.phase, RunPhase::Completed);
    assert_eq!(report.candidates, 3);
    assert_eq!(report.strategy, Some(ClusterStrategy::Pairwise));
    assert_eq!(report.clusters.len(), 1);
    assert_eq!(report.clusters[0].action, CanonicalAction::Created);
    assert_eq!(report.cards_linked(), 3);

    let canonicals = env.store.all_canonicals(env.deliberation_id).await;
    assert_eq!(canonicals.len(), 1);
    // The most complete articulation is promoted verbatim.
    assert_eq!(
        canonicals[0].description,
        "I value telling people the truth, even when it is hard."
    );
    assert!(canonicals[0].embedding.is_some());
    assert!(env
        .cards()
        .await
        .iter()
        .all(|c| c.canonical_card_id == Some(canonicals[0].id)));
}

#[tokio::test]
async fn test_paraphrased_honesty_cards_become_one_canonical() {
    let mentions_honesty = |a: &values_dedup::ValuesCard, b: &values_dedup::ValuesCard| {
        a.title.to_lowercase().contains("honest") && b.title.to_lowercase().contains("honest")
    };
    let env = TestEnvironment::build(
        Arc::new(values_dedup::SimpleEmbedder::new_mock()),
        values_dedup::MockJudge::with_rule(mentions_honesty),
        values_dedup::config::DedupConfig::default(),
    )
    .await;
    env.submit(
        "I value honesty because it builds trust",
        "Being honest with people lets them rely on what I say, even when the truth is hard.",
    )
    .await;
    env.submit("Honesty matters to me because lies compound", "Small lies grow.")
        .await;
    env.submit("I think honesty is important", "Truth first.").await;
    env.submit("Playfulness", "Keeping things light lets people open up.")
        .await;

    let report = env.pipeline.run_now(env.deliberation_id).await.unwrap();

    assert_eq!(report.phase, RunPhase::Completed);
    assert_eq!(report.clusters.len(), 2);
    let mut members: Vec<usize> = report.clusters.iter().map(|c| c.members).collect();
    members.sort_unstable();
    assert_eq!(members, vec![1, 3]);
    assert!(env.judge.equivalence_calls() > 0);

    let canonicals = env.store.all_canonicals(env.deliberation_id).await;
    assert_eq!(canonicals.len(), 2);
    assert!(canonicals
        .iter()
        .any(|c| c.title == "I value honesty because it builds trust"));
}

#[tokio::test]
async fn test_second_run_has_nothing_to_do() {
    let env = TestEnvironment::new().await;
    for title in ["Honesty", "honesty", "Honesty "] {
        env.submit(title, "Telling the truth matters to me.").await;
    }
    env.pipeline.run_now(env.deliberation_id).await.unwrap();

    let mut events = env.pipeline.events().subscribe();
    let rerun = env.pipeline.run_now(env.deliberation_id).await.unwrap();

    assert_eq!(rerun.phase, RunPhase::NothingToDo);
    assert!(rerun.clusters.is_empty());
    assert_eq!(rerun.canonicals_created(), 0);
    assert_eq!(env.canonical_count().await, 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_far_candidate_creates_new_canonical() {
    let env = TestEnvironment::new().await;
    env.submit("Honesty", "Telling the truth matters to me.").await;
    env.pipeline.run_now(env.deliberation_id).await.unwrap();

    env.submit("Playfulness", "Keeping things light lets people open up.")
        .await;
    let report = env.pipeline.run_now(env.deliberation_id).await.unwrap();

    assert_eq!(report.clusters.len(), 1);
    assert_eq!(report.clusters[0].action, CanonicalAction::Created);
    assert_eq!(report.clusters[0].distance, None);
    assert_eq!(env.canonical_count().await, 2);
}

#[tokio::test]
async fn test_near_candidate_links_to_existing_canonical() {
    let env = TestEnvironment::new().await;
    let first = env.submit("Honesty", "Telling the truth matters to me.").await;
    let first_report = env.pipeline.run_now(env.deliberation_id).await.unwrap();
    let canonical_id = first_report.clusters[0].canonical_card_id;

    // Same wording embeds to the same vector, so it lands at distance zero.
    let later = env.submit("Honesty", "Telling the truth matters to me.").await;
    let report = env.pipeline.run_now(env.deliberation_id).await.unwrap();

    assert_eq!(report.clusters[0].action, CanonicalAction::LinkedExisting);
    assert_eq!(report.clusters[0].canonical_card_id, canonical_id);
    assert_eq!(env.canonical_count().await, 1);
    assert!(env.judge.duplicate_calls() >= 1);

    let cards = env.cards().await;
    for id in [first.id, later.id] {
        let card = cards.iter().find(|c| c.id == id).unwrap();
        assert_eq!(card.canonical_card_id, Some(canonical_id));
    }
}

#[tokio::test]
#[traced_test]
async fn test_twenty_five_candidates_split_by_dbscan() {
    let env = TestEnvironment::with_embedder(Arc::new(AxisEmbedder)).await;
    let sizes = [10, 10, 5];
    for (group, size) in sizes.iter().enumerate() {
        for i in 0..*size {
            env.submit(
                &format!("group-{group} card-{i}"),
                &format!("Value {group}, phrased the {i}th way."),
            )
            .await;
        }
    }

    let report = env.pipeline.run_now(env.deliberation_id).await.unwrap();

    assert_eq!(report.candidates, 25);
    assert_eq!(report.strategy, Some(ClusterStrategy::Dbscan));
    assert_eq!(report.clusters.len(), 3);
    assert_eq!(report.canonicals_created(), 3);

    let mut members: Vec<usize> = report.clusters.iter().map(|c| c.members).collect();
    members.sort_unstable();
    assert_eq!(members, vec![5, 10, 10]);

    // Every group maps to exactly one canonical card and no canonical spans groups.
    let cards = env.cards().await;
    let mut canonical_by_group: HashMap<String, uuid::Uuid> = HashMap::new();
    for card in &cards {
        let group = card.title.split_whitespace().next().unwrap().to_string();
        let canonical = card.canonical_card_id.expect("every candidate is linked");
        let existing = canonical_by_group.entry(group).or_insert(canonical);
        assert_eq!(*existing, canonical);
    }
    assert_eq!(canonical_by_group.len(), 3);
    assert!(cards.iter().all(|c| c.embedding.is_some()));
}

#[tokio::test]
async fn test_runs_never_cross_deliberations() {
    let env = TestEnvironment::new().await;
    let other = env.store.create_deliberation("another").await.unwrap();

    env.submit("Honesty", "Telling the truth matters to me.").await;
    env.submit_to(other.id, "Honesty", "Telling the truth matters to me.")
        .await;

    env.pipeline.run_now(env.deliberation_id).await.unwrap();
    env.pipeline.run_now(other.id).await.unwrap();

    let here = env.store.all_canonicals(env.deliberation_id).await;
    let there = env.store.all_canonicals(other.id).await;
    assert_eq!(here.len(), 1);
    assert_eq!(there.len(), 1);
    assert_ne!(here[0].id, there[0].id);
    assert!(env
        .store
        .all_cards(other.id)
        .await
        .iter()
        .all(|c| c.canonical_card_id == Some(there[0].id)));
}

#[tokio::test]
async fn test_judge_outage_leaves_cards_untouched() {
    let env = TestEnvironment::build(
        Arc::new(values_dedup::SimpleEmbedder::new_mock()),
        values_dedup::MockJudge::with_failure(),
        values_dedup::config::DedupConfig::default(),
    )
    .await;
    env.submit("Honesty", "Telling the truth matters to me.").await;
    env.submit("Candor", "Saying what I think.").await;

    assert!(env.pipeline.run_now(env.deliberation_id).await.is_err());
    assert_eq!(env.canonical_count().await, 0);
    assert!(env.cards().await.iter().all(|c| c.canonical_card_id.is_none()));
}

#[tokio::test]
async fn test_contexts_are_deduplicated_per_deliberation() {
    let env = TestEnvironment::new().await;
    let contexts = env.pipeline.contexts();

    let created = contexts
        .canonicalize_context("When a friend asks for feedback", env.deliberation_id)
        .await
        .unwrap();
    let reused = contexts
        .canonicalize_context("when a friend asks for  feedback", env.deliberation_id)
        .await
        .unwrap();

    assert_eq!(created.name, reused.name);
    assert_eq!(env.store.list_contexts(env.deliberation_id).await.unwrap().len(), 1);
}
