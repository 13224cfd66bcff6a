use std::collections::HashSet;
use std::env;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Settings for the feed fetcher.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub per_host_concurrency: usize,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub max_per_feed: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36".to_string(),
            timeout_seconds: 15,
            per_host_concurrency: 2,
            jitter_min_ms: 120,
            jitter_max_ms: 400,
            max_per_feed: 8,
        }
    }
}

/// Settings for the quality funnel.
#[derive(Debug, Clone)]
pub struct FunnelConfig {
    pub cooldown_seconds: i64,
    pub medium_threshold: f64,
    pub hit_threshold: f64,
    pub batch_size: usize,
    pub batch_pause_seconds: u64,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 180,
            medium_threshold: 6.0,
            hit_threshold: 9.0,
            batch_size: 5,
            batch_pause_seconds: 1,
        }
    }
}

/// A destination channel and the lifetime of messages published to it.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub id: String,
    pub ttl_seconds: i64,
}

/// The two routing destinations.
#[derive(Debug, Clone)]
pub struct ChannelsConfig {
    pub general: ChannelConfig,
    pub premium: ChannelConfig,
}

/// Everything the binary needs, resolved from the environment with defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sources_file: String,
    pub database_url: Option<String>,
    pub bot_token: Option<String>,
    pub general_chat_id: Option<String>,
    pub premium_channel_id: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub perplexity_api_key: Option<String>,
    pub telegraph_token: Option<String>,
    pub fetch: FetchConfig,
    pub funnel: FunnelConfig,
    pub delete_after_hours: i64,
    pub dedup_ttl_hours: i64,
    pub max_posts_per_run: usize,
    pub state_save_retries: u32,
    pub excerpt_skip_hosts: HashSet<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let fetch = FetchConfig {
            timeout_seconds: env_or("HTTP_TIMEOUT", 15),
            per_host_concurrency: env_or("PER_HOST_CONCURRENCY", 2),
            jitter_min_ms: env_or("JITTER_MIN_MS", 120),
            jitter_max_ms: env_or("JITTER_MAX_MS", 400),
            max_per_feed: env_or("MAX_PER_FEED", 8),
            ..FetchConfig::default()
        };

        let funnel = FunnelConfig {
            cooldown_seconds: env_or("AI_COOLDOWN_SECONDS", 180),
            batch_size: env_or("AI_BATCH_SIZE", 5),
            batch_pause_seconds: env_or("AI_BATCH_WAIT_SECONDS", 1),
            ..FunnelConfig::default()
        };

        let excerpt_skip_hosts = env::var("EXCERPT_SKIP_HOSTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            sources_file: env::var("RSS_SOURCES_FILE")
                .unwrap_or_else(|_| "rss_sources.txt".to_string()),
            database_url: env_opt("DATABASE_URL"),
            bot_token: env_opt("TG_TOKEN"),
            general_chat_id: env_opt("TELEGRAM_CHAT_GROUP_ID"),
            premium_channel_id: env_opt("TELEGRAM_CHANNEL_ID"),
            gemini_api_key: env_opt("GEMINI_API_KEY"),
            gemini_model: env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            perplexity_api_key: env_opt("PERPLEXITY_API_KEY"),
            telegraph_token: env_opt("TELEGRAPH_TOKEN"),
            fetch,
            funnel,
            delete_after_hours: env_or("DELETE_AFTER_HOURS", 48),
            dedup_ttl_hours: env_or("DEDUP_TTL_HOURS", 336),
            max_posts_per_run: env_or("MAX_POSTS_PER_RUN", 0),
            state_save_retries: env_or("STATE_SAVE_RETRIES", 5),
            excerpt_skip_hosts,
        }
    }

    pub fn channels(&self) -> Option<ChannelsConfig> {
        let general = self.general_chat_id.clone()?;
        let premium = self.premium_channel_id.clone()?;
        let ttl = self.delete_after_hours * 3600;
        Some(ChannelsConfig {
            general: ChannelConfig { id: general, ttl_seconds: ttl },
            premium: ChannelConfig { id: premium, ttl_seconds: ttl },
        })
    }
}
