use crate::config::ChannelsConfig;
use crate::funnel::Verification;
use crate::types::{AggregatorError, Candidate, PublishedMessage, Result, Tier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Inline call-to-action attached to a published message.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionButton {
    pub text: String,
    pub url: String,
}

/// Classified result of a delete call against the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Deleted,
    /// The message is already gone; nothing left to do.
    NotFound,
    /// The platform refuses to delete messages past its own age limit.
    TooOld,
    /// Worth another attempt on a later sweep.
    Retryable(String),
}

/// Destination platform contract: send a message, delete one by handle.
#[async_trait]
pub trait MessagePlatform: Send + Sync {
    async fn send(
        &self,
        channel_id: &str,
        text: &str,
        button: Option<&ActionButton>,
    ) -> Result<i64>;

    async fn delete(&self, channel_id: &str, message_id: i64) -> Result<DeleteOutcome>;
}

#[derive(Deserialize)]
struct TgResponse {
    ok: bool,
    #[serde(default)]
    result: Option<TgMessage>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct TgMessage {
    message_id: i64,
}

/// Telegram Bot API implementation.
pub struct TelegramPlatform {
    client: Client,
    bot_token: String,
}

impl TelegramPlatform {
    pub fn new(client: Client, bot_token: String) -> Self {
        Self { client, bot_token }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.bot_token, method)
    }
}

#[async_trait]
impl MessagePlatform for TelegramPlatform {
    async fn send(
        &self,
        channel_id: &str,
        text: &str,
        button: Option<&ActionButton>,
    ) -> Result<i64> {
        let mut payload = json!({
            "chat_id": channel_id,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });
        if let Some(button) = button {
            payload["reply_markup"] = json!({
                "inline_keyboard": [[ { "text": button.text, "url": button.url } ]]
            });
        }

        let response = self
            .client
            .post(self.endpoint("sendMessage"))
            .json(&payload)
            .send()
            .await?;
        let body: TgResponse = response.json().await?;

        if !body.ok {
            return Err(AggregatorError::Publish(
                body.description
                    .unwrap_or_else(|| "platform rejected the message".to_string()),
            ));
        }
        body.result
            .map(|m| m.message_id)
            .ok_or_else(|| AggregatorError::Publish("response carried no message id".to_string()))
    }

    async fn delete(&self, channel_id: &str, message_id: i64) -> Result<DeleteOutcome> {
        let response = self
            .client
            .post(self.endpoint("deleteMessage"))
            .json(&json!({ "chat_id": channel_id, "message_id": message_id }))
            .send()
            .await?;

        let status = response.status();
        let body: TgResponse = response.json().await?;
        if body.ok {
            return Ok(DeleteOutcome::Deleted);
        }

        let description = body.description.unwrap_or_default().to_lowercase();
        if status.as_u16() == 400 || status.as_u16() == 403 {
            if description.contains("message to delete not found") {
                return Ok(DeleteOutcome::NotFound);
            }
            if description.contains("message is too old") || description.contains("can't be deleted")
            {
                return Ok(DeleteOutcome::TooOld);
            }
        }
        Ok(DeleteOutcome::Retryable(format!("{status}: {description}")))
    }
}

/// Which channels a candidate goes to, given its tier and verification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingDecision {
    pub premium: bool,
    pub general: bool,
}

impl RoutingDecision {
    pub fn none() -> Self {
        Self {
            premium: false,
            general: false,
        }
    }

    pub fn is_none(&self) -> bool {
        !self.premium && !self.general
    }
}

/// Pure routing table. `verified_active` is `None` when verification was
/// skipped; a hit reaches the premium channel only on a confirmed-active
/// verdict.
pub fn route(tier: Tier, verified_active: Option<bool>) -> RoutingDecision {
    match tier {
        Tier::Reject => RoutingDecision::none(),
        Tier::Medium => RoutingDecision {
            premium: false,
            general: true,
        },
        Tier::Hit => match verified_active {
            Some(true) => RoutingDecision {
                premium: true,
                general: true,
            },
            _ => RoutingDecision {
                premium: false,
                general: true,
            },
        },
    }
}

/// Message body: AI headline when available, the feed title otherwise,
/// excerpt and link below.
pub fn format_message(candidate: &Candidate, headline: Option<&str>) -> String {
    let mut text = headline.unwrap_or(&candidate.title).to_string();
    if let Some(excerpt) = &candidate.raw_excerpt {
        text.push_str("\n\n");
        text.push_str(excerpt);
    }
    text.push_str("\n\n");
    text.push_str(&candidate.canonical_link);
    text
}

/// Sends accepted candidates to their channels and records the handles for
/// eventual cleanup. A failed send is logged and dropped; the candidate is
/// already marked seen upstream, so it will not be retried.
pub struct PublisherRouter {
    platform: std::sync::Arc<dyn MessagePlatform>,
    channels: ChannelsConfig,
}

impl PublisherRouter {
    pub fn new(platform: std::sync::Arc<dyn MessagePlatform>, channels: ChannelsConfig) -> Self {
        Self { platform, channels }
    }

    pub async fn publish(
        &self,
        candidate: &Candidate,
        decision: RoutingDecision,
        verification: Option<&Verification>,
        headline: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<PublishedMessage> {
        let mut published = Vec::new();
        let text = format_message(candidate, headline);

        if decision.premium {
            let mut premium_text = text.clone();
            if let Some(verification) = verification {
                premium_text.push_str(&format!(
                    "\n\n{} — {}",
                    verification.verdict, verification.market_note
                ));
            }
            let button = ActionButton {
                text: "👉 Check this deal".to_string(),
                url: candidate.canonical_link.clone(),
            };
            match self
                .platform
                .send(&self.channels.premium.id, &premium_text, Some(&button))
                .await
            {
                Ok(message_id) => {
                    info!("Published '{}' to the premium channel", candidate.title);
                    published.push(PublishedMessage {
                        message_id,
                        channel_id: self.channels.premium.id.clone(),
                        sent_at: now,
                        ttl_seconds: self.channels.premium.ttl_seconds,
                    });
                }
                Err(e) => error!(
                    "Premium publish failed for '{}': {}",
                    candidate.title, e
                ),
            }
        }

        if decision.general {
            match self
                .platform
                .send(&self.channels.general.id, &text, None)
                .await
            {
                Ok(message_id) => {
                    info!("Published '{}' to the general channel", candidate.title);
                    published.push(PublishedMessage {
                        message_id,
                        channel_id: self.channels.general.id.clone(),
                        sent_at: now,
                        ttl_seconds: self.channels.general.ttl_seconds,
                    });
                }
                Err(e) => error!(
                    "General publish failed for '{}': {}",
                    candidate.title, e
                ),
            }
        }

        published
    }
}

/// A message captured by the recording platform.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub channel_id: String,
    pub text: String,
    pub button: Option<ActionButton>,
}

/// In-memory platform for tests: records sends, scripts delete outcomes.
#[derive(Default)]
pub struct RecordingPlatform {
    pub sent: Mutex<Vec<SentMessage>>,
    pub deleted: Mutex<Vec<(String, i64)>>,
    delete_outcomes: Mutex<HashMap<i64, DeleteOutcome>>,
    next_id: AtomicI64,
    fail_sends: bool,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    pub fn failing_sends() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            fail_sends: true,
            ..Self::default()
        }
    }

    pub async fn script_delete(&self, message_id: i64, outcome: DeleteOutcome) {
        self.delete_outcomes.lock().await.insert(message_id, outcome);
    }
}

#[async_trait]
impl MessagePlatform for RecordingPlatform {
    async fn send(
        &self,
        channel_id: &str,
        text: &str,
        button: Option<&ActionButton>,
    ) -> Result<i64> {
        if self.fail_sends {
            return Err(AggregatorError::Publish("scripted send failure".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().await.push(SentMessage {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
            button: button.cloned(),
        });
        Ok(id)
    }

    async fn delete(&self, channel_id: &str, message_id: i64) -> Result<DeleteOutcome> {
        self.deleted
            .lock()
            .await
            .push((channel_id.to_string(), message_id));
        let outcome = self
            .delete_outcomes
            .lock()
            .await
            .get(&message_id)
            .cloned()
            .unwrap_or(DeleteOutcome::Deleted);
        if let DeleteOutcome::Retryable(reason) = &outcome {
            warn!("Scripted retryable delete for {}: {}", message_id, reason);
        }
        Ok(outcome)
    }
}
