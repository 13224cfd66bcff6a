use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One feed entry under evaluation in the current run.
///
/// Created per fetch cycle and discarded at the end of the run; the only
/// trace it leaves behind is a [`SeenRecord`] once it has been submitted for
/// analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub identity_key: String,
    pub canonical_link: String,
    pub title: String,
    pub raw_excerpt: Option<String>,
    pub source_host: String,
    pub discovered_at: DateTime<Utc>,
}

/// Quality classification produced by the primary scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Reject,
    Medium,
    Hit,
}

/// Persisted record of an identity key that has been through analysis.
///
/// Exists from the moment the candidate was submitted to the scorer,
/// regardless of the score it got back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenRecord {
    pub first_seen_at: DateTime<Utc>,
    pub last_analyzed_at: Option<DateTime<Utc>>,
    pub tier: Option<Tier>,
}

/// Process-wide funnel state shared across run instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelState {
    pub last_ai_analysis_time: DateTime<Utc>,
}

impl Default for FunnelState {
    fn default() -> Self {
        Self {
            last_ai_analysis_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// One message sent to a destination channel, queued for eventual deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedMessage {
    pub message_id: i64,
    pub channel_id: String,
    pub sent_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl PublishedMessage {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.sent_at + chrono::Duration::seconds(self.ttl_seconds)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// A verified hit retained for the periodic digest page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestCandidate {
    pub identity_key: String,
    pub title: String,
    pub headline: String,
    pub link: String,
    pub score: f64,
    pub source_host: String,
    pub verdict: String,
    pub market_note: String,
}

/// The single persisted document shared by all run instances.
///
/// Stored as one versioned JSON blob; every field carries a serde default so
/// documents written by older versions still load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default)]
    pub seen: HashMap<String, SeenRecord>,
    #[serde(default)]
    pub funnel: FunnelState,
    #[serde(default)]
    pub delete_queue: Vec<PublishedMessage>,
    #[serde(default)]
    pub digest_candidates: Vec<DigestCandidate>,
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Concurrent state update detected")]
    StateConflict,

    #[error("AI response violated the expected schema: {0}")]
    SchemaViolation(String),

    #[error("AI call failed: {0}")]
    AiTransport(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
