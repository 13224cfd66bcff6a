use crate::canonical;
use crate::config::FetchConfig;
use crate::types::{AggregatorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use futures::future::join_all;
use rand::Rng;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// One entry pulled from a feed, before canonicalization.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub guid: Option<String>,
    pub link: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_url: String,
}

/// Anything that can produce a batch of raw entries for one run.
#[async_trait]
pub trait EntrySource: Send + Sync {
    async fn collect(&self) -> Vec<RawEntry>;
}

/// Fetches and parses the configured feeds.
///
/// At most `per_host_concurrency` requests run against any single host, and a
/// jittered delay precedes every request so bursts against the same host
/// don't look automated. A feed that fails to fetch or parse is logged and
/// skipped; it never takes its siblings down with it.
pub struct FeedFetcher {
    client: Client,
    config: FetchConfig,
    sources: Vec<String>,
    host_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl FeedFetcher {
    pub fn new(config: FetchConfig, sources: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            client,
            config,
            sources,
            host_semaphores: Mutex::new(HashMap::new()),
        })
    }

    async fn semaphore_for(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.host_semaphores.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_host_concurrency)))
            .clone()
    }

    async fn jitter(&self) {
        let ms = rand::thread_rng().gen_range(self.config.jitter_min_ms..=self.config.jitter_max_ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn fetch_feed(&self, url: &str) -> Result<Vec<RawEntry>> {
        let host = canonical::host_of(url);
        let semaphore = self.semaphore_for(&host).await;

        let bytes = {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| AggregatorError::General("host semaphore closed".to_string()))?;
            self.jitter().await;
            let response = self.client.get(url).send().await?;
            response.error_for_status()?.bytes().await?
        };

        let feed = parser::parse(bytes.as_ref())
            .map_err(|e| AggregatorError::Parse(format!("{url}: {e}")))?;

        let mut entries = Vec::new();
        for entry in feed.entries {
            let link = match entry.links.first() {
                Some(link) => link.href.clone(),
                None => continue,
            };
            let title = match entry.title {
                Some(title) if !title.content.trim().is_empty() => title.content,
                _ => continue,
            };
            let guid = if entry.id.trim().is_empty() {
                None
            } else {
                Some(entry.id)
            };

            entries.push(RawEntry {
                guid,
                link,
                title,
                summary: entry.summary.map(|s| s.content),
                published_at: entry.published.map(|dt| dt.with_timezone(&Utc)),
                feed_url: url.to_string(),
            });
            if entries.len() >= self.config.max_per_feed {
                break;
            }
        }

        info!("Fetched {} entries from {}", entries.len(), url);
        Ok(entries)
    }
}

#[async_trait]
impl EntrySource for FeedFetcher {
    async fn collect(&self) -> Vec<RawEntry> {
        let fetches = self.sources.iter().map(|url| async move {
            match self.fetch_feed(url).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping feed {}: {}", url, e);
                    Vec::new()
                }
            }
        });

        let all: Vec<RawEntry> = join_all(fetches).await.into_iter().flatten().collect();
        debug!("Collected {} entries across {} feeds", all.len(), self.sources.len());
        all
    }
}

/// Fixed entry list, used by tests and dry runs.
pub struct StaticSource {
    entries: Vec<RawEntry>,
}

impl StaticSource {
    pub fn new(entries: Vec<RawEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl EntrySource for StaticSource {
    async fn collect(&self) -> Vec<RawEntry> {
        self.entries.clone()
    }
}

/// Read feed URLs from a plain text file, one per line, `#` comments allowed.
pub fn read_sources(path: &str) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
