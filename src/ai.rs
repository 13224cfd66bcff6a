//! Provider-backed implementations of the scorer and verifier contracts.
//!
//! Both providers answer with JSON embedded in a completion envelope; the
//! payloads are deserialized into the strict funnel types and anything that
//! does not fit is a schema violation, never a silently defaulted field.

use crate::funnel::{DealScorer, DealVerifier, ScoredDeal, ScoringRequest, Verification};
use crate::types::{AggregatorError, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const MAX_ATTEMPTS: u32 = 4;

fn retry_backoff() -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: Duration::from_secs(2),
        initial_interval: Duration::from_secs(2),
        max_interval: Duration::from_secs(32),
        multiplier: 2.0,
        max_elapsed_time: Some(Duration::from_secs(120)),
        ..Default::default()
    }
}

/// POST a JSON body, retrying quota/availability failures with exponential
/// backoff. Anything else fails fast.
async fn post_json_with_retry(
    client: &Client,
    url: &str,
    body: &serde_json::Value,
    bearer: Option<&str>,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let mut backoff = retry_backoff();
    let mut last_error: Option<AggregatorError> = None;

    for attempt in 0..MAX_ATTEMPTS {
        let mut request = client.post(url).json(body).timeout(timeout);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        // Only quota/availability failures are worth another attempt.
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                let text = response.text().await.unwrap_or_default();
                if status.as_u16() != 429 && status.as_u16() != 503 {
                    return Err(AggregatorError::AiTransport(format!(
                        "HTTP {status}: {text}"
                    )));
                }
                last_error = Some(AggregatorError::AiTransport(format!(
                    "HTTP {status}: {text}"
                )));
            }
            Err(e) if e.is_timeout() || e.is_connect() => {
                last_error = Some(AggregatorError::Http(e));
            }
            Err(e) => return Err(AggregatorError::Http(e)),
        }

        if attempt + 1 < MAX_ATTEMPTS {
            if let Some(delay) = backoff.next_backoff() {
                warn!(
                    "AI call attempt {}/{} failed, retrying in {:?}",
                    attempt + 1,
                    MAX_ATTEMPTS,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| AggregatorError::AiTransport("retries exhausted".to_string())))
}

const SCORER_SYSTEM_PROMPT: &str = r#"You are a travel deal market analyst. You receive a numbered list of travel offers collected from deal feeds. For EVERY offer, judge how good it is for a bargain-hunting audience and answer with a single JSON object of the form:
{"results": [{"id": <input id>, "score": <0-10 number>, "headline": "<short journalistic one-liner, max 200 chars>"}]}

Scoring guide:
- 9-10: exceptional - error fares, business class at economy prices, once-a-season bargains.
- 6-8: solid, genuinely discounted offers worth sharing.
- 0-5: average pricing, advertising, or filler.

Judge prices relative to the offer's source market. Return one result per input id and nothing else."#;

/// Primary scorer backed by the Gemini generateContent API in JSON mode.
pub struct GeminiScorer {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiScorer {
    pub fn new(client: Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            model,
        }
    }
}

#[derive(Deserialize)]
struct ScorerEnvelope {
    results: Vec<ScoredDeal>,
}

#[async_trait]
impl DealScorer for GeminiScorer {
    async fn score_batch(&self, batch: &[ScoringRequest]) -> Result<Vec<ScoredDeal>> {
        let listing = batch
            .iter()
            .map(|request| {
                format!(
                    "OFFER ID: {}\nSource: {}\nTitle: {}\nDetails: {}",
                    request.id,
                    request.source_host,
                    request.title,
                    request.excerpt.as_deref().unwrap_or("No description.")
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n");

        let body = json!({
            "system_instruction": { "parts": [{ "text": SCORER_SYSTEM_PROMPT }] },
            "contents": [{ "role": "user", "parts": [{ "text": listing }] }],
            "generationConfig": { "response_mime_type": "application/json" }
        });
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        info!("Submitting batch of {} candidates to the scorer", batch.len());
        let envelope =
            post_json_with_retry(&self.client, &url, &body, None, Duration::from_secs(60)).await?;

        let text = envelope
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AggregatorError::SchemaViolation("response carried no candidate text".to_string())
            })?;

        let parsed: ScorerEnvelope = serde_json::from_str(text).map_err(|e| {
            AggregatorError::SchemaViolation(format!("scorer payload did not parse: {e}"))
        })?;

        for deal in &parsed.results {
            if !(0.0..=10.0).contains(&deal.score) {
                return Err(AggregatorError::SchemaViolation(format!(
                    "score {} outside 0-10",
                    deal.score
                )));
            }
        }
        Ok(parsed.results)
    }
}

const VERIFIER_SYSTEM_PROMPT: &str = r#"You are an uncompromising travel deal auditor. Given one high-scoring offer, check whether it is still bookable right now and whether the price genuinely beats the market. Be harsh: reserve enthusiasm for real standouts. Always answer with a single JSON object with exactly these keys: "is_active" (boolean), "verdict" (short string such as "GENUINE BARGAIN", "MARKET PRICE", "EXPIRED"), "market_note" (at most two concise sentences of market context)."#;

/// Second-stage availability check backed by the Perplexity chat API.
pub struct PerplexityVerifier {
    client: Client,
    api_key: String,
}

impl PerplexityVerifier {
    pub fn new(client: Client, api_key: String) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl DealVerifier for PerplexityVerifier {
    async fn verify(&self, title: &str, excerpt: Option<&str>) -> Result<Verification> {
        let body = json!({
            "model": "sonar",
            "messages": [
                { "role": "system", "content": VERIFIER_SYSTEM_PROMPT },
                { "role": "user", "content": format!(
                    "Offer title: {title}\nDetails: {}",
                    excerpt.unwrap_or("No description.")
                )}
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "schema": {
                        "type": "object",
                        "properties": {
                            "is_active": { "type": "boolean" },
                            "verdict": { "type": "string" },
                            "market_note": { "type": "string" }
                        },
                        "required": ["is_active", "verdict", "market_note"]
                    }
                }
            }
        });

        info!("Auditing hit-tier offer '{}'", truncate(title, 40));
        let envelope = post_json_with_retry(
            &self.client,
            "https://api.perplexity.ai/chat/completions",
            &body,
            Some(&self.api_key),
            Duration::from_secs(120),
        )
        .await?;

        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AggregatorError::SchemaViolation("response carried no message content".to_string())
            })?;

        serde_json::from_str(content).map_err(|e| {
            AggregatorError::SchemaViolation(format!("verifier payload did not parse: {e}"))
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
