use crate::config::FunnelConfig;
use crate::types::{Candidate, Result, Tier};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One candidate formatted for the primary scorer. The `id` ties the
/// structured response back to the submitted batch.
#[derive(Debug, Clone)]
pub struct ScoringRequest {
    pub id: usize,
    pub title: String,
    pub excerpt: Option<String>,
    pub source_host: String,
}

/// Validated scorer output for one candidate.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredDeal {
    pub id: usize,
    pub score: f64,
    #[serde(default)]
    pub headline: Option<String>,
}

/// Validated verifier output for one hit-tier candidate.
#[derive(Debug, Clone, Deserialize)]
pub struct Verification {
    pub is_active: bool,
    pub verdict: String,
    pub market_note: String,
}

/// Primary quality scorer. Implementations must validate the provider's
/// response against the expected schema and surface any deviation as an error.
#[async_trait]
pub trait DealScorer: Send + Sync {
    async fn score_batch(&self, batch: &[ScoringRequest]) -> Result<Vec<ScoredDeal>>;
}

/// Real-time availability check, issued only for hit-tier candidates.
#[async_trait]
pub trait DealVerifier: Send + Sync {
    async fn verify(&self, title: &str, excerpt: Option<&str>) -> Result<Verification>;
}

/// Per-candidate funnel result. `failed` marks candidates whose scoring call
/// errored or whose id never came back; they route as rejects but still count
/// as analyzed.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub index: usize,
    pub tier: Tier,
    pub score: Option<f64>,
    pub headline: Option<String>,
    pub failed: bool,
}

pub fn classify(score: f64, config: &FunnelConfig) -> Tier {
    if score >= config.hit_threshold {
        Tier::Hit
    } else if score >= config.medium_threshold {
        Tier::Medium
    } else {
        Tier::Reject
    }
}

/// Scores candidates in batches and runs the second-stage verification for
/// hits. Cooldown discipline lives with the caller; by the time a batch
/// reaches this type the analysis slot has already been claimed.
pub struct QualityFunnel {
    scorer: Arc<dyn DealScorer>,
    verifier: Option<Arc<dyn DealVerifier>>,
    config: FunnelConfig,
}

impl QualityFunnel {
    pub fn new(
        scorer: Arc<dyn DealScorer>,
        verifier: Option<Arc<dyn DealVerifier>>,
        config: FunnelConfig,
    ) -> Self {
        Self {
            scorer,
            verifier,
            config,
        }
    }

    /// Submit every candidate for scoring. Returns exactly one result per
    /// candidate, in order; a chunk whose call fails comes back entirely
    /// as failed rejects.
    pub async fn score_all(&self, candidates: &[Candidate]) -> Vec<ScoredCandidate> {
        let mut results: Vec<ScoredCandidate> = (0..candidates.len())
            .map(|index| ScoredCandidate {
                index,
                tier: Tier::Reject,
                score: None,
                headline: None,
                failed: true,
            })
            .collect();

        let chunks: Vec<&[Candidate]> = candidates.chunks(self.config.batch_size).collect();
        let total_chunks = chunks.len();

        for (chunk_index, chunk) in chunks.into_iter().enumerate() {
            let base = chunk_index * self.config.batch_size;
            let requests: Vec<ScoringRequest> = chunk
                .iter()
                .enumerate()
                .map(|(offset, candidate)| ScoringRequest {
                    id: base + offset,
                    title: candidate.title.clone(),
                    excerpt: candidate.raw_excerpt.clone(),
                    source_host: candidate.source_host.clone(),
                })
                .collect();

            match self.scorer.score_batch(&requests).await {
                Ok(scored) => {
                    for deal in scored {
                        if deal.id < base || deal.id >= base + chunk.len() {
                            warn!("Scorer returned unknown candidate id {}", deal.id);
                            continue;
                        }
                        if !(0.0..=10.0).contains(&deal.score) {
                            warn!("Scorer returned out-of-range score {}", deal.score);
                            continue;
                        }
                        results[deal.id] = ScoredCandidate {
                            index: deal.id,
                            tier: classify(deal.score, &self.config),
                            score: Some(deal.score),
                            headline: deal.headline,
                            failed: false,
                        };
                    }
                }
                Err(e) => {
                    warn!(
                        "Scoring batch {}/{} failed, demoting {} candidates: {}",
                        chunk_index + 1,
                        total_chunks,
                        chunk.len(),
                        e
                    );
                }
            }

            if chunk_index + 1 < total_chunks {
                tokio::time::sleep(Duration::from_secs(self.config.batch_pause_seconds)).await;
            }
        }

        let scored = results.iter().filter(|r| !r.failed).count();
        info!(
            "Funnel scored {}/{} candidates across {} batch(es)",
            scored,
            candidates.len(),
            total_chunks
        );
        results
    }

    /// Run the availability check for a hit. `None` when no verifier is
    /// configured (the hit then routes to the general channel only).
    pub async fn verify(&self, candidate: &Candidate) -> Option<Result<Verification>> {
        let verifier = self.verifier.as_ref()?;
        Some(
            verifier
                .verify(&candidate.title, candidate.raw_excerpt.as_deref())
                .await,
        )
    }
}

/// Deterministic scorer for tests: scores come from a title lookup, with a
/// counter so tests can assert how many calls actually went out.
pub struct MockScorer {
    scores: HashMap<String, f64>,
    fail: bool,
    calls: AtomicUsize,
}

impl MockScorer {
    pub fn new(scores: HashMap<String, f64>) -> Self {
        Self {
            scores,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            scores: HashMap::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DealScorer for MockScorer {
    async fn score_batch(&self, batch: &[ScoringRequest]) -> Result<Vec<ScoredDeal>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(crate::types::AggregatorError::AiTransport(
                "mock scorer offline".to_string(),
            ));
        }
        Ok(batch
            .iter()
            .map(|request| ScoredDeal {
                id: request.id,
                score: *self.scores.get(&request.title).unwrap_or(&5.0),
                headline: Some(format!("{} (scored)", request.title)),
            })
            .collect())
    }
}

/// Scripted verifier for tests.
pub struct MockVerifier {
    active: bool,
    fail: bool,
    calls: AtomicUsize,
}

impl MockVerifier {
    pub fn new(active: bool) -> Self {
        Self {
            active,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            active: false,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DealVerifier for MockVerifier {
    async fn verify(&self, _title: &str, _excerpt: Option<&str>) -> Result<Verification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(crate::types::AggregatorError::AiTransport(
                "mock verifier offline".to_string(),
            ));
        }
        Ok(Verification {
            is_active: self.active,
            verdict: if self.active {
                "GENUINE BARGAIN".to_string()
            } else {
                "EXPIRED".to_string()
            },
            market_note: "scripted verdict".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candidate(title: &str) -> Candidate {
        Candidate {
            identity_key: format!("key-{title}"),
            canonical_link: format!("https://example.com/{title}"),
            title: title.to_string(),
            raw_excerpt: None,
            source_host: "example.com".to_string(),
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn classification_thresholds() {
        let config = FunnelConfig::default();
        assert_eq!(classify(5.9, &config), Tier::Reject);
        assert_eq!(classify(6.0, &config), Tier::Medium);
        assert_eq!(classify(8.9, &config), Tier::Medium);
        assert_eq!(classify(9.0, &config), Tier::Hit);
        assert_eq!(classify(9.5, &config), Tier::Hit);
    }

    #[tokio::test]
    async fn failed_batch_demotes_to_reject_but_keeps_results() {
        let funnel = QualityFunnel::new(
            Arc::new(MockScorer::failing()),
            None,
            FunnelConfig::default(),
        );
        let candidates = vec![candidate("a"), candidate("b")];
        let results = funnel.score_all(&candidates).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.failed && r.tier == Tier::Reject));
    }

    #[tokio::test]
    async fn scores_map_back_by_id_across_batches() {
        let mut scores = HashMap::new();
        scores.insert("a".to_string(), 9.5);
        scores.insert("b".to_string(), 7.0);
        scores.insert("c".to_string(), 2.0);

        let config = FunnelConfig {
            batch_size: 2,
            batch_pause_seconds: 0,
            ..FunnelConfig::default()
        };
        let scorer = Arc::new(MockScorer::new(scores));
        let funnel = QualityFunnel::new(scorer.clone(), None, config);

        let candidates = vec![candidate("a"), candidate("b"), candidate("c")];
        let results = funnel.score_all(&candidates).await;

        assert_eq!(results[0].tier, Tier::Hit);
        assert_eq!(results[1].tier, Tier::Medium);
        assert_eq!(results[2].tier, Tier::Reject);
        assert!(results.iter().all(|r| !r.failed));
        assert_eq!(scorer.calls(), 2);
    }
}
