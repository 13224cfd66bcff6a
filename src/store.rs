//! Durable state backend and the conflict-checked update cycles built on it.
//!
//! All cross-run state lives in one versioned JSON document. Concurrent runs
//! never lock each other out; they race on the generation token and the loser
//! reloads, merges, and retries. Two cycles exist: the cooldown claim (which
//! may legitimately turn into a deferral) and the end-of-run commit (which
//! merges this run's delta into whatever snapshot ends up winning).

use crate::types::{
    AggregatorError, DigestCandidate, PipelineState, PublishedMessage, Result, SeenRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub type Generation = i64;

/// Backend contract: plain read plus conditional write.
///
/// `save` with a generation that no longer matches the stored document must
/// fail with [`AggregatorError::StateConflict`] and leave the document
/// untouched. `None` means "the document does not exist yet".
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<(PipelineState, Option<Generation>)>;
    async fn save(
        &self,
        state: &PipelineState,
        generation: Option<Generation>,
    ) -> Result<Generation>;
}

/// Single-row versioned JSONB document in Postgres.
pub struct PgStateStore {
    pool: PgPool,
    key: String,
}

impl PgStateStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_state (
                id TEXT PRIMARY KEY,
                generation BIGINT NOT NULL,
                document JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            key: "default".to_string(),
        })
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load(&self) -> Result<(PipelineState, Option<Generation>)> {
        let row = sqlx::query("SELECT generation, document FROM pipeline_state WHERE id = $1")
            .bind(&self.key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let generation: i64 = row.try_get("generation")?;
                let document: serde_json::Value = row.try_get("document")?;
                let state = serde_json::from_value(document)?;
                Ok((state, Some(generation)))
            }
            None => {
                debug!("No persisted state yet, starting from the default document");
                Ok((PipelineState::default(), None))
            }
        }
    }

    async fn save(
        &self,
        state: &PipelineState,
        generation: Option<Generation>,
    ) -> Result<Generation> {
        let document = serde_json::to_value(state)?;
        let now = Utc::now();

        let affected = match generation {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO pipeline_state (id, generation, document, updated_at)
                    VALUES ($1, 1, $2, $3)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(&self.key)
                .bind(&document)
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE pipeline_state
                    SET generation = generation + 1, document = $2, updated_at = $3
                    WHERE id = $1 AND generation = $4
                    "#,
                )
                .bind(&self.key)
                .bind(&document)
                .bind(now)
                .bind(expected)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };

        if affected == 0 {
            return Err(AggregatorError::StateConflict);
        }
        Ok(generation.map(|g| g + 1).unwrap_or(1))
    }
}

/// Volatile store used in tests and when no database is configured.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Option<(PipelineState, Generation)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an initial document at generation 1.
    pub async fn seed(&self, state: PipelineState) {
        let mut inner = self.inner.lock().await;
        *inner = Some((state, 1));
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<(PipelineState, Option<Generation>)> {
        let inner = self.inner.lock().await;
        match inner.as_ref() {
            Some((state, generation)) => Ok((state.clone(), Some(*generation))),
            None => Ok((PipelineState::default(), None)),
        }
    }

    async fn save(
        &self,
        state: &PipelineState,
        generation: Option<Generation>,
    ) -> Result<Generation> {
        let mut inner = self.inner.lock().await;
        let current = inner.as_ref().map(|(_, g)| *g);
        if current != generation {
            return Err(AggregatorError::StateConflict);
        }
        let next = generation.map(|g| g + 1).unwrap_or(1);
        *inner = Some((state.clone(), next));
        Ok(next)
    }
}

/// Everything one run wants to fold into the persisted document.
///
/// A delta is applied to whichever snapshot wins the save race, so it must be
/// expressed as intent (keys marked, rows added or removed) rather than as a
/// full replacement document.
#[derive(Debug, Default, Clone)]
pub struct RunDelta {
    pub analyzed: Vec<(String, SeenRecord)>,
    pub published: Vec<PublishedMessage>,
    pub removed_messages: Vec<(String, i64)>,
    pub digest_candidates: Vec<DigestCandidate>,
    pub clear_digest: bool,
    pub analysis_time: Option<DateTime<Utc>>,
    pub prune_before: Option<DateTime<Utc>>,
}

impl RunDelta {
    pub fn is_empty(&self) -> bool {
        self.analyzed.is_empty()
            && self.published.is_empty()
            && self.removed_messages.is_empty()
            && self.digest_candidates.is_empty()
            && !self.clear_digest
            && self.analysis_time.is_none()
            && self.prune_before.is_none()
    }

    /// Fold this delta into `state`. Returns the number of pruned seen records.
    pub fn apply(&self, state: &mut PipelineState) -> usize {
        for (key, record) in &self.analyzed {
            state
                .seen
                .entry(key.clone())
                .and_modify(|existing| {
                    // Last successful writer wins on classification; the
                    // earliest sighting bounds retention.
                    existing.last_analyzed_at = record.last_analyzed_at;
                    existing.tier = record.tier;
                    if record.first_seen_at < existing.first_seen_at {
                        existing.first_seen_at = record.first_seen_at;
                    }
                })
                .or_insert_with(|| record.clone());
        }

        if let Some(time) = self.analysis_time {
            if time > state.funnel.last_ai_analysis_time {
                state.funnel.last_ai_analysis_time = time;
            }
        }

        state
            .delete_queue
            .retain(|m| !self.removed_messages.iter().any(|(channel, id)| {
                *channel == m.channel_id && *id == m.message_id
            }));
        state.delete_queue.extend(self.published.iter().cloned());

        if self.clear_digest {
            state.digest_candidates.clear();
        }
        for candidate in &self.digest_candidates {
            match state
                .digest_candidates
                .iter_mut()
                .find(|c| c.identity_key == candidate.identity_key)
            {
                Some(existing) if candidate.score > existing.score => *existing = candidate.clone(),
                Some(_) => {}
                None => state.digest_candidates.push(candidate.clone()),
            }
        }

        let mut pruned = 0;
        if let Some(cutoff) = self.prune_before {
            let before = state.seen.len();
            state.seen.retain(|_, record| record.first_seen_at >= cutoff);
            pruned = before - state.seen.len();
        }
        pruned
    }
}

/// Outcome of attempting to take the analysis slot.
#[derive(Debug)]
pub enum SlotClaim {
    Claimed,
    Deferred { remaining_seconds: i64 },
}

/// Bounded read-modify-write cycles over a [`StateStore`].
pub struct StateManager {
    store: Arc<dyn StateStore>,
    max_retries: u32,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    pub async fn load(&self) -> Result<(PipelineState, Option<Generation>)> {
        self.store.load().await
    }

    /// Advance the cooldown timestamp before any AI call goes out.
    ///
    /// Exactly one of the runs racing on this slot gets `Claimed`; the rest
    /// observe the fresh timestamp after reloading and come back `Deferred`.
    pub async fn claim_analysis_slot(
        &self,
        state: &mut PipelineState,
        generation: &mut Option<Generation>,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<SlotClaim> {
        for attempt in 0..=self.max_retries {
            let elapsed = now - state.funnel.last_ai_analysis_time;
            if elapsed < cooldown {
                return Ok(SlotClaim::Deferred {
                    remaining_seconds: (cooldown - elapsed).num_seconds(),
                });
            }

            let mut next = state.clone();
            next.funnel.last_ai_analysis_time = now;
            match self.store.save(&next, *generation).await {
                Ok(new_generation) => {
                    *state = next;
                    *generation = Some(new_generation);
                    return Ok(SlotClaim::Claimed);
                }
                Err(AggregatorError::StateConflict) => {
                    warn!(attempt, "Analysis slot claim hit a concurrent update, reloading");
                    let (fresh, fresh_generation) = self.store.load().await?;
                    *state = fresh;
                    *generation = fresh_generation;
                }
                Err(e) => return Err(e),
            }
        }
        Err(AggregatorError::StateConflict)
    }

    /// Persist a run's delta, merging into fresh snapshots on conflict.
    ///
    /// Returns the number of seen records pruned by the winning application.
    pub async fn commit(
        &self,
        state: &mut PipelineState,
        generation: &mut Option<Generation>,
        delta: &RunDelta,
    ) -> Result<usize> {
        for attempt in 0..=self.max_retries {
            let mut next = state.clone();
            let pruned = delta.apply(&mut next);
            match self.store.save(&next, *generation).await {
                Ok(new_generation) => {
                    if pruned > 0 {
                        info!("Pruned {} expired seen records", pruned);
                    }
                    *state = next;
                    *generation = Some(new_generation);
                    return Ok(pruned);
                }
                Err(AggregatorError::StateConflict) => {
                    warn!(attempt, "State save conflict, merging into fresh snapshot");
                    let (fresh, fresh_generation) = self.store.load().await?;
                    *state = fresh;
                    *generation = fresh_generation;
                }
                Err(e) => return Err(e),
            }
        }
        Err(AggregatorError::StateConflict)
    }
}
