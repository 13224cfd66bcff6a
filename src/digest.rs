//! Periodic summary page built from the verified hits of past runs.

use crate::config::ChannelConfig;
use crate::publisher::{ActionButton, MessagePlatform};
use crate::types::{AggregatorError, DigestCandidate, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const MAX_DIGEST_ENTRIES: usize = 25;

/// Page-hosting collaborator: turns structured content nodes into a public
/// page and returns its URL.
#[async_trait]
pub trait PageHost: Send + Sync {
    async fn create_page(&self, title: &str, content: &Value) -> Result<String>;
}

/// Telegraph implementation of [`PageHost`].
pub struct TelegraphHost {
    client: Client,
    access_token: String,
    author_name: String,
}

impl TelegraphHost {
    pub fn new(client: Client, access_token: String, author_name: String) -> Self {
        Self {
            client,
            access_token,
            author_name,
        }
    }
}

#[async_trait]
impl PageHost for TelegraphHost {
    async fn create_page(&self, title: &str, content: &Value) -> Result<String> {
        let response = self
            .client
            .post("https://api.telegra.ph/createPage")
            .json(&json!({
                "access_token": self.access_token,
                "title": title,
                "author_name": self.author_name,
                "content": content,
            }))
            .send()
            .await?;

        let body: Value = response.json().await?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(AggregatorError::Publish(format!(
                "page host rejected the digest: {error}"
            )));
        }
        body.pointer("/result/url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AggregatorError::Publish("page host returned no URL".to_string()))
    }
}

/// Pick the offers that make the digest: one entry per identity key (highest
/// score wins), ranked by score, capped, then presented alphabetically.
pub fn select_top(candidates: &[DigestCandidate]) -> Vec<DigestCandidate> {
    let mut unique: Vec<DigestCandidate> = Vec::new();
    for candidate in candidates {
        match unique
            .iter_mut()
            .find(|c| c.identity_key == candidate.identity_key)
        {
            Some(existing) if candidate.score > existing.score => *existing = candidate.clone(),
            Some(_) => {}
            None => unique.push(candidate.clone()),
        }
    }

    unique.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    unique.truncate(MAX_DIGEST_ENTRIES);
    unique.sort_by(|a, b| a.title.cmp(&b.title));
    unique
}

/// Render the selected offers as the page host's content nodes.
pub fn render_content(selected: &[DigestCandidate]) -> Value {
    let mut nodes = Vec::new();
    for candidate in selected {
        nodes.push(json!({ "tag": "h4", "children": [candidate.headline] }));
        nodes.push(json!({
            "tag": "p",
            "children": [
                { "tag": "b", "children": ["Verdict: "] },
                candidate.verdict
            ]
        }));
        nodes.push(json!({
            "tag": "p",
            "children": [
                { "tag": "i", "children": ["Analysis: "] },
                candidate.market_note
            ]
        }));
        nodes.push(json!({
            "tag": "p",
            "children": [{ "tag": "b", "children": ["Source: "] }, candidate.source_host]
        }));
        nodes.push(json!({
            "tag": "p",
            "children": [{
                "tag": "a",
                "attrs": { "href": candidate.link },
                "children": ["👉 Check this deal"]
            }]
        }));
        nodes.push(json!({ "tag": "hr" }));
    }
    Value::Array(nodes)
}

/// Publishes the digest page and announces it on the premium channel.
pub struct DigestPublisher {
    host: Arc<dyn PageHost>,
    platform: Arc<dyn MessagePlatform>,
    premium: ChannelConfig,
}

impl DigestPublisher {
    pub fn new(
        host: Arc<dyn PageHost>,
        platform: Arc<dyn MessagePlatform>,
        premium: ChannelConfig,
    ) -> Self {
        Self {
            host,
            platform,
            premium,
        }
    }

    /// Build the page from the given candidates and announce it. Returns the
    /// page URL; the caller clears the candidate list afterwards.
    pub async fn publish(
        &self,
        candidates: &[DigestCandidate],
        now: DateTime<Utc>,
    ) -> Result<String> {
        let selected = select_top(candidates);
        info!(
            "Publishing digest with {} of {} candidate offer(s)",
            selected.len(),
            candidates.len()
        );

        let title = format!("Deal Highlights ({})", now.format("%Y-%m-%d"));
        let content = render_content(&selected);
        let page_url = self.host.create_page(&title, &content).await?;

        let caption = "🔥 The week's verified deal highlights are ready. The best finds from \
                       the last few days, hand-checked — they tend to vanish fast.";
        let button = ActionButton {
            text: "💎 See the highlights".to_string(),
            url: page_url.clone(),
        };
        self.platform
            .send(&self.premium.id, caption, Some(&button))
            .await?;

        Ok(page_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, title: &str, score: f64) -> DigestCandidate {
        DigestCandidate {
            identity_key: key.to_string(),
            title: title.to_string(),
            headline: format!("{title}!"),
            link: format!("https://example.com/{key}"),
            score,
            source_host: "example.com".to_string(),
            verdict: "GENUINE BARGAIN".to_string(),
            market_note: "well below market".to_string(),
        }
    }

    #[test]
    fn selection_dedupes_by_key_keeping_top_score() {
        let selected = select_top(&[
            candidate("a", "Azores", 9.0),
            candidate("a", "Azores", 9.5),
            candidate("b", "Bali", 9.2),
        ]);
        assert_eq!(selected.len(), 2);
        let azores = selected.iter().find(|c| c.identity_key == "a").unwrap();
        assert_eq!(azores.score, 9.5);
    }

    #[test]
    fn selection_caps_and_alphabetizes() {
        let mut many: Vec<DigestCandidate> = (0..30)
            .map(|i| candidate(&format!("k{i}"), &format!("Deal {i:02}"), 9.0 + (i as f64) / 100.0))
            .collect();
        many.reverse();

        let selected = select_top(&many);
        assert_eq!(selected.len(), MAX_DIGEST_ENTRIES);
        // The five lowest scores fell off the bottom.
        assert!(selected.iter().all(|c| c.score >= 9.05));
        let titles: Vec<&str> = selected.iter().map(|c| c.title.as_str()).collect();
        let mut sorted = titles.clone();
        sorted.sort();
        assert_eq!(titles, sorted);
    }

    #[test]
    fn rendered_content_links_every_offer() {
        let content = render_content(&select_top(&[candidate("a", "Azores", 9.5)]));
        let rendered = content.to_string();
        assert!(rendered.contains("https://example.com/a"));
        assert!(rendered.contains("GENUINE BARGAIN"));
        assert!(rendered.contains("\"hr\""));
    }
}
