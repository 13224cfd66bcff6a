use chrono::{DateTime, Duration, TimeZone, Utc};
use deal_aggregator::config::{ChannelConfig, ChannelsConfig, FunnelConfig};
use deal_aggregator::fetcher::{RawEntry, StaticSource};
use deal_aggregator::funnel::{MockScorer, MockVerifier, QualityFunnel};
use deal_aggregator::publisher::{PublisherRouter, RecordingPlatform};
use deal_aggregator::scraper::NoopScraper;
use deal_aggregator::store::{MemoryStateStore, StateManager, StateStore};
use deal_aggregator::types::Tier;
use deal_aggregator::{Pipeline, PipelineConfig};
use std::collections::HashMap;
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
}

fn channels() -> ChannelsConfig {
    ChannelsConfig {
        general: ChannelConfig {
            id: "general".to_string(),
            ttl_seconds: 48 * 3600,
        },
        premium: ChannelConfig {
            id: "premium".to_string(),
            ttl_seconds: 48 * 3600,
        },
    }
}

fn entry(guid: Option<&str>, link: &str, title: &str) -> RawEntry {
    RawEntry {
        guid: guid.map(str::to_string),
        link: link.to_string(),
        title: title.to_string(),
        summary: Some(format!("{title} at an unusually good price")),
        published_at: None,
        feed_url: "https://example.com/feed".to_string(),
    }
}

fn build_pipeline(
    store: Arc<MemoryStateStore>,
    entries: Vec<RawEntry>,
    scorer: Arc<MockScorer>,
    verifier: Option<Arc<MockVerifier>>,
    platform: Arc<RecordingPlatform>,
) -> Pipeline {
    let funnel_config = FunnelConfig {
        batch_pause_seconds: 0,
        ..FunnelConfig::default()
    };
    let verifier_dyn = verifier.map(|v| v as Arc<dyn deal_aggregator::DealVerifier>);
    let funnel = QualityFunnel::new(scorer, verifier_dyn, funnel_config);
    let router = PublisherRouter::new(platform.clone(), channels());
    Pipeline::new(
        Arc::new(StaticSource::new(entries)),
        Arc::new(NoopScraper),
        funnel,
        platform,
        router,
        StateManager::new(store, 5),
        PipelineConfig::default(),
    )
}

#[tokio::test]
async fn scorer_failure_still_marks_candidates_seen() {
    let store = Arc::new(MemoryStateStore::new());
    let scorer = Arc::new(MockScorer::failing());
    let platform = Arc::new(RecordingPlatform::new());
    let pipeline = build_pipeline(
        store.clone(),
        vec![entry(Some("g1"), "https://example.com/deal-1", "Lisbon")],
        scorer,
        None,
        platform.clone(),
    );

    let summary = pipeline.run(t0()).await.unwrap();
    assert_eq!(summary.analyzed, 1);
    assert_eq!(summary.published, 0);
    assert_eq!(summary.rejected, 1);

    let (state, _) = store.load().await.unwrap();
    let record = state.seen.get("g1").expect("failed analysis must still mark seen");
    assert_eq!(record.tier, Some(Tier::Reject));
    assert!(platform.sent.lock().await.is_empty());
}

#[tokio::test]
async fn cooldown_allows_exactly_one_run_to_analyze() {
    let store = Arc::new(MemoryStateStore::new());
    let platform = Arc::new(RecordingPlatform::new());

    let first_scorer = Arc::new(MockScorer::new(HashMap::new()));
    let first = build_pipeline(
        store.clone(),
        vec![entry(Some("a"), "https://example.com/a", "Azores")],
        first_scorer.clone(),
        None,
        platform.clone(),
    );
    first.run(t0()).await.unwrap();
    assert_eq!(first_scorer.calls(), 1);

    // A second run one minute later finds a new candidate but the slot is
    // taken; it must defer without marking anything seen.
    let second_scorer = Arc::new(MockScorer::new(HashMap::new()));
    let second = build_pipeline(
        store.clone(),
        vec![entry(Some("b"), "https://example.com/b", "Bali")],
        second_scorer.clone(),
        None,
        platform.clone(),
    );
    let summary = second.run(t0() + Duration::seconds(60)).await.unwrap();

    assert_eq!(summary.deferred, 1);
    assert_eq!(summary.analyzed, 0);
    assert_eq!(second_scorer.calls(), 0);

    let (state, _) = store.load().await.unwrap();
    assert!(state.seen.contains_key("a"));
    assert!(!state.seen.contains_key("b"), "deferred candidates stay unmarked");
}

#[tokio::test]
async fn same_guid_with_rotated_tracking_links_is_not_rescored() {
    let store = Arc::new(MemoryStateStore::new());
    let platform = Arc::new(RecordingPlatform::new());
    let scorer = Arc::new(MockScorer::new(HashMap::new()));

    let first = build_pipeline(
        store.clone(),
        vec![entry(
            Some("deal-guid"),
            "https://example.com/deal?utm_source=rss",
            "Madeira",
        )],
        scorer.clone(),
        None,
        platform.clone(),
    );
    first.run(t0()).await.unwrap();
    assert_eq!(scorer.calls(), 1);

    let second = build_pipeline(
        store.clone(),
        vec![entry(
            Some("deal-guid"),
            "https://example.com/deal?fbclid=xyz",
            "Madeira",
        )],
        scorer.clone(),
        None,
        platform.clone(),
    );
    let summary = second.run(t0() + Duration::minutes(10)).await.unwrap();

    assert_eq!(summary.fresh, 0);
    assert_eq!(scorer.calls(), 1, "no second scoring call for the same identity");
}

#[tokio::test]
async fn tracking_rotation_without_guid_still_dedupes_on_canonical_link() {
    let store = Arc::new(MemoryStateStore::new());
    let platform = Arc::new(RecordingPlatform::new());
    let scorer = Arc::new(MockScorer::new(HashMap::new()));

    let first = build_pipeline(
        store.clone(),
        vec![entry(None, "https://www.example.com/deal/?utm_medium=feed", "Rome")],
        scorer.clone(),
        None,
        platform.clone(),
    );
    first.run(t0()).await.unwrap();

    let second = build_pipeline(
        store.clone(),
        vec![entry(None, "https://example.com/deal?gclid=123", "Rome")],
        scorer.clone(),
        None,
        platform.clone(),
    );
    let summary = second.run(t0() + Duration::minutes(10)).await.unwrap();
    assert_eq!(summary.fresh, 0);
    assert_eq!(scorer.calls(), 1);
}

#[tokio::test]
async fn verified_hit_reaches_both_channels_with_button() {
    let store = Arc::new(MemoryStateStore::new());
    let platform = Arc::new(RecordingPlatform::new());
    let mut scores = HashMap::new();
    scores.insert("Azores".to_string(), 9.5);
    let scorer = Arc::new(MockScorer::new(scores));
    let verifier = Arc::new(MockVerifier::new(true));

    let pipeline = build_pipeline(
        store.clone(),
        vec![entry(Some("hit"), "https://example.com/azores", "Azores")],
        scorer,
        Some(verifier.clone()),
        platform.clone(),
    );
    let summary = pipeline.run(t0()).await.unwrap();

    assert_eq!(summary.published, 2);
    assert_eq!(verifier.calls(), 1);

    let sent = platform.sent.lock().await;
    let premium = sent.iter().find(|m| m.channel_id == "premium").unwrap();
    let general = sent.iter().find(|m| m.channel_id == "general").unwrap();
    assert!(premium.button.is_some(), "premium publish carries the action button");
    assert_eq!(
        premium.button.as_ref().unwrap().url,
        "https://example.com/azores"
    );
    assert!(general.button.is_none());
    drop(sent);

    let (state, _) = store.load().await.unwrap();
    assert_eq!(state.delete_queue.len(), 2);
    assert_eq!(state.digest_candidates.len(), 1);
    assert_eq!(state.seen.get("hit").unwrap().tier, Some(Tier::Hit));
}

#[tokio::test]
async fn medium_score_routes_general_only_without_verifier_call() {
    let store = Arc::new(MemoryStateStore::new());
    let platform = Arc::new(RecordingPlatform::new());
    let mut scores = HashMap::new();
    scores.insert("Bali".to_string(), 7.0);
    let scorer = Arc::new(MockScorer::new(scores));
    let verifier = Arc::new(MockVerifier::new(true));

    let pipeline = build_pipeline(
        store.clone(),
        vec![entry(Some("mid"), "https://example.com/bali", "Bali")],
        scorer,
        Some(verifier.clone()),
        platform.clone(),
    );
    let summary = pipeline.run(t0()).await.unwrap();

    assert_eq!(summary.published, 1);
    assert_eq!(verifier.calls(), 0, "medium tier never reaches the verifier");

    let sent = platform.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel_id, "general");
}

#[tokio::test]
async fn inactive_verification_demotes_hit_to_general_only() {
    let store = Arc::new(MemoryStateStore::new());
    let platform = Arc::new(RecordingPlatform::new());
    let mut scores = HashMap::new();
    scores.insert("Tokyo".to_string(), 9.2);
    let scorer = Arc::new(MockScorer::new(scores));
    let verifier = Arc::new(MockVerifier::new(false));

    let pipeline = build_pipeline(
        store.clone(),
        vec![entry(Some("stale-hit"), "https://example.com/tokyo", "Tokyo")],
        scorer,
        Some(verifier),
        platform.clone(),
    );
    pipeline.run(t0()).await.unwrap();

    let sent = platform.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel_id, "general");
    drop(sent);

    let (state, _) = store.load().await.unwrap();
    assert!(state.digest_candidates.is_empty());
}

#[tokio::test]
async fn verifier_error_suppresses_publish_but_marks_seen() {
    let store = Arc::new(MemoryStateStore::new());
    let platform = Arc::new(RecordingPlatform::new());
    let mut scores = HashMap::new();
    scores.insert("Dubai".to_string(), 9.8);
    let scorer = Arc::new(MockScorer::new(scores));
    let verifier = Arc::new(MockVerifier::failing());

    let pipeline = build_pipeline(
        store.clone(),
        vec![entry(Some("dubai"), "https://example.com/dubai", "Dubai")],
        scorer,
        Some(verifier),
        platform.clone(),
    );
    let summary = pipeline.run(t0()).await.unwrap();

    assert_eq!(summary.published, 0);
    assert_eq!(summary.rejected, 1);
    assert!(platform.sent.lock().await.is_empty());

    let (state, _) = store.load().await.unwrap();
    assert!(state.seen.contains_key("dubai"));
}

#[tokio::test]
async fn publish_failure_keeps_candidate_seen_without_queue_row() {
    let store = Arc::new(MemoryStateStore::new());
    let platform = Arc::new(RecordingPlatform::failing_sends());
    let mut scores = HashMap::new();
    scores.insert("Paris".to_string(), 7.5);
    let scorer = Arc::new(MockScorer::new(scores));

    let pipeline = build_pipeline(
        store.clone(),
        vec![entry(Some("paris"), "https://example.com/paris", "Paris")],
        scorer,
        None,
        platform.clone(),
    );
    let summary = pipeline.run(t0()).await.unwrap();

    assert_eq!(summary.published, 0);

    let (state, _) = store.load().await.unwrap();
    assert!(state.delete_queue.is_empty(), "failed sends are not queued");
    assert!(
        state.seen.contains_key("paris"),
        "candidate stays seen even though delivery failed"
    );
}

#[tokio::test]
async fn feed_order_is_preserved_within_a_run() {
    let store = Arc::new(MemoryStateStore::new());
    let platform = Arc::new(RecordingPlatform::new());
    let mut scores = HashMap::new();
    scores.insert("First".to_string(), 7.0);
    scores.insert("Second".to_string(), 7.0);
    let scorer = Arc::new(MockScorer::new(scores));

    let pipeline = build_pipeline(
        store.clone(),
        vec![
            entry(Some("one"), "https://example.com/one", "First"),
            entry(Some("two"), "https://example.com/two", "Second"),
        ],
        scorer,
        None,
        platform.clone(),
    );
    pipeline.run(t0()).await.unwrap();

    let sent = platform.sent.lock().await;
    assert_eq!(sent.len(), 2);
    assert!(sent[0].text.contains("First"));
    assert!(sent[1].text.contains("Second"));
}
