//! One pipeline run to completion: fetch, canonicalize, dedup, funnel,
//! route, record, prune. Runs may overlap freely; everything they share goes
//! through the versioned state document.

use crate::canonical;
use crate::digest::DigestPublisher;
use crate::fetcher::EntrySource;
use crate::funnel::QualityFunnel;
use crate::publisher::{route, MessagePlatform, PublisherRouter};
use crate::scraper::ExcerptScraper;
use crate::store::{RunDelta, SlotClaim, StateManager};
use crate::sweeper::{sweep, SweepReport};
use crate::types::{
    AggregatorError, Candidate, DigestCandidate, Result, SeenRecord, Tier,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cooldown: Duration,
    pub retention: Duration,
    pub max_posts_per_run: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::minutes(3),
            retention: Duration::hours(336),
            max_posts_per_run: 0,
        }
    }
}

/// What one run did, for the caller and the logs.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub fetched: usize,
    pub fresh: usize,
    pub deferred: usize,
    pub analyzed: usize,
    pub published: usize,
    pub rejected: usize,
    pub pruned: usize,
    pub swept: SweepReport,
}

impl RunSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched: 0,
            fresh: 0,
            deferred: 0,
            analyzed: 0,
            published: 0,
            rejected: 0,
            pruned: 0,
            swept: SweepReport::default(),
        }
    }
}

pub struct Pipeline {
    source: Arc<dyn EntrySource>,
    scraper: Arc<dyn ExcerptScraper>,
    funnel: QualityFunnel,
    platform: Arc<dyn MessagePlatform>,
    router: PublisherRouter,
    state: StateManager,
    digest: Option<DigestPublisher>,
    config: PipelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn EntrySource>,
        scraper: Arc<dyn ExcerptScraper>,
        funnel: QualityFunnel,
        platform: Arc<dyn MessagePlatform>,
        router: PublisherRouter,
        state: StateManager,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            scraper,
            funnel,
            platform,
            router,
            state,
            digest: None,
            config,
        }
    }

    pub fn with_digest(mut self, digest: DigestPublisher) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Execute one ingestion run.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        info!(%run_id, "Starting ingestion run");

        let (mut state, mut generation) = self.state.load().await?;
        let mut summary = RunSummary::new(run_id);
        let mut delta = RunDelta {
            prune_before: Some(now - self.config.retention),
            ..RunDelta::default()
        };

        // Opportunistic sweep before new messages join the queue.
        let sweep_outcome = sweep(self.platform.as_ref(), &state.delete_queue, now).await;
        summary.swept = sweep_outcome.report;
        delta.removed_messages = sweep_outcome.removed;

        let entries = self.source.collect().await;
        summary.fetched = entries.len();

        let mut candidates = Vec::new();
        let mut keys_this_run = HashSet::new();
        for entry in entries {
            let canonical_link = canonical::canonicalize(&entry.link);
            let key = canonical::identity_key(entry.guid.as_deref(), &canonical_link);
            if state.seen.contains_key(&key) {
                debug!("Skipping already-analyzed entry {}", key);
                continue;
            }
            if !keys_this_run.insert(key.clone()) {
                continue;
            }
            let source_host = canonical::host_of(&entry.link);
            candidates.push(Candidate {
                identity_key: key,
                canonical_link,
                title: entry.title,
                raw_excerpt: entry.summary,
                source_host,
                discovered_at: now,
            });
        }
        if self.config.max_posts_per_run > 0 {
            candidates.truncate(self.config.max_posts_per_run);
        }
        summary.fresh = candidates.len();

        if candidates.is_empty() {
            info!(%run_id, "No new candidates this run");
            summary.pruned = self.state.commit(&mut state, &mut generation, &delta).await?;
            return Ok(summary);
        }

        // Claim the analysis slot before anything reaches the scorer.
        // Deferred candidates stay unmarked and come back next run.
        match self
            .state
            .claim_analysis_slot(&mut state, &mut generation, now, self.config.cooldown)
            .await?
        {
            SlotClaim::Deferred { remaining_seconds } => {
                info!(
                    %run_id,
                    "Cooldown has {}s remaining, deferring {} candidate(s)",
                    remaining_seconds,
                    candidates.len()
                );
                summary.deferred = candidates.len();
                summary.pruned = self.state.commit(&mut state, &mut generation, &delta).await?;
                return Ok(summary);
            }
            SlotClaim::Claimed => {}
        }

        // The claim may have pulled in a fresher snapshot; drop anything a
        // concurrent run got to first.
        candidates.retain(|c| !state.seen.contains_key(&c.identity_key));
        summary.fresh = candidates.len();

        for candidate in &mut candidates {
            if candidate.raw_excerpt.is_none() {
                candidate.raw_excerpt = self.scraper.excerpt(&candidate.canonical_link).await;
            }
        }

        let results = self.funnel.score_all(&candidates).await;
        summary.analyzed = results.len();

        for result in &results {
            let candidate = &candidates[result.index];

            // Submitted for analysis means seen, whatever came back.
            delta.analyzed.push((
                candidate.identity_key.clone(),
                SeenRecord {
                    first_seen_at: now,
                    last_analyzed_at: Some(now),
                    tier: Some(result.tier),
                },
            ));

            let mut effective_tier = result.tier;
            let mut verification = None;
            if result.tier == Tier::Hit && !result.failed {
                match self.funnel.verify(candidate).await {
                    Some(Ok(v)) => verification = Some(v),
                    Some(Err(e)) => {
                        warn!(
                            "Verification of '{}' failed, demoting to reject: {}",
                            candidate.title, e
                        );
                        effective_tier = Tier::Reject;
                    }
                    None => debug!("No verifier configured, hit stays on the general channel"),
                }
            }

            let decision = route(effective_tier, verification.as_ref().map(|v| v.is_active));
            if decision.is_none() {
                summary.rejected += 1;
                continue;
            }

            let published = self
                .router
                .publish(
                    candidate,
                    decision,
                    verification.as_ref(),
                    result.headline.as_deref(),
                    now,
                )
                .await;
            summary.published += published.len();
            delta.published.extend(published);

            if let Some(verification) = &verification {
                if verification.is_active {
                    delta.digest_candidates.push(DigestCandidate {
                        identity_key: candidate.identity_key.clone(),
                        title: candidate.title.clone(),
                        headline: result
                            .headline
                            .clone()
                            .unwrap_or_else(|| candidate.title.clone()),
                        link: candidate.canonical_link.clone(),
                        score: result.score.unwrap_or(0.0),
                        source_host: candidate.source_host.clone(),
                        verdict: verification.verdict.clone(),
                        market_note: verification.market_note.clone(),
                    });
                }
            }
        }

        summary.pruned = self.state.commit(&mut state, &mut generation, &delta).await?;
        info!(
            %run_id,
            fetched = summary.fetched,
            analyzed = summary.analyzed,
            published = summary.published,
            rejected = summary.rejected,
            pruned = summary.pruned,
            "Ingestion run complete"
        );
        Ok(summary)
    }

    /// Execute one standalone sweep pass.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let (mut state, mut generation) = self.state.load().await?;
        let outcome = sweep(self.platform.as_ref(), &state.delete_queue, now).await;
        if !outcome.removed.is_empty() {
            let delta = RunDelta {
                removed_messages: outcome.removed,
                ..RunDelta::default()
            };
            self.state.commit(&mut state, &mut generation, &delta).await?;
        }
        Ok(outcome.report)
    }

    /// Publish the accumulated digest and clear the candidate list.
    pub async fn publish_digest(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        let digest = self.digest.as_ref().ok_or_else(|| {
            AggregatorError::General("digest publishing is not configured".to_string())
        })?;

        let (mut state, mut generation) = self.state.load().await?;
        if state.digest_candidates.is_empty() {
            info!("No digest candidates accumulated, skipping");
            return Ok(None);
        }

        let page_url = digest.publish(&state.digest_candidates, now).await?;
        let delta = RunDelta {
            clear_digest: true,
            ..RunDelta::default()
        };
        self.state.commit(&mut state, &mut generation, &delta).await?;
        info!("Digest published at {}", page_url);
        Ok(Some(page_url))
    }
}
