use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use deal_aggregator::ai::{GeminiScorer, PerplexityVerifier};
use deal_aggregator::digest::{DigestPublisher, TelegraphHost};
use deal_aggregator::fetcher::{read_sources, FeedFetcher};
use deal_aggregator::funnel::{DealScorer, DealVerifier, QualityFunnel};
use deal_aggregator::scraper::{ExcerptScraper, HttpExcerptScraper};
use deal_aggregator::store::{MemoryStateStore, PgStateStore, StateManager, StateStore};
use deal_aggregator::{
    AppConfig, Pipeline, PipelineConfig, PublisherRouter, TelegramPlatform,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "deal-aggregator", about = "Travel deal ingestion and routing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one ingestion run over the configured feeds.
    Run,
    /// Delete expired published messages.
    Sweep,
    /// Publish the accumulated digest page.
    Digest,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let store: Arc<dyn StateStore> = match &config.database_url {
        Some(url) => Arc::new(PgStateStore::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set; state will not survive this process");
            Arc::new(MemoryStateStore::new())
        }
    };
    let state = StateManager::new(store, config.state_save_retries);

    let client = reqwest::Client::builder()
        .user_agent(&config.fetch.user_agent)
        .timeout(Duration::from_secs(config.fetch.timeout_seconds))
        .build()?;

    let bot_token = config
        .bot_token
        .clone()
        .context("TG_TOKEN must be set")?;
    let channels = config
        .channels()
        .context("TELEGRAM_CHAT_GROUP_ID and TELEGRAM_CHANNEL_ID must be set")?;
    let platform = Arc::new(TelegramPlatform::new(client.clone(), bot_token));
    let router = PublisherRouter::new(platform.clone(), channels.clone());

    let gemini_key = config
        .gemini_api_key
        .clone()
        .context("GEMINI_API_KEY must be set")?;
    let scorer: Arc<dyn DealScorer> = Arc::new(GeminiScorer::new(
        client.clone(),
        gemini_key,
        config.gemini_model.clone(),
    ));
    let verifier: Option<Arc<dyn DealVerifier>> = match &config.perplexity_api_key {
        Some(key) => Some(Arc::new(PerplexityVerifier::new(client.clone(), key.clone()))),
        None => {
            warn!("PERPLEXITY_API_KEY not set; hits will skip verification");
            None
        }
    };
    let funnel = QualityFunnel::new(scorer, verifier, config.funnel.clone());

    let sources = read_sources(&config.sources_file)
        .with_context(|| format!("could not read {}", config.sources_file))?;
    info!("Loaded {} feed source(s)", sources.len());
    let fetcher = FeedFetcher::new(config.fetch.clone(), sources)?;

    let scraper: Arc<dyn ExcerptScraper> = Arc::new(HttpExcerptScraper::new(
        client.clone(),
        config.excerpt_skip_hosts.clone(),
    ));

    let pipeline_config = PipelineConfig {
        cooldown: chrono::Duration::seconds(config.funnel.cooldown_seconds),
        retention: chrono::Duration::hours(config.dedup_ttl_hours),
        max_posts_per_run: config.max_posts_per_run,
    };

    let mut pipeline = Pipeline::new(
        Arc::new(fetcher),
        scraper,
        funnel,
        platform.clone(),
        router,
        state,
        pipeline_config,
    );
    if let Some(token) = &config.telegraph_token {
        let host = Arc::new(TelegraphHost::new(
            client.clone(),
            token.clone(),
            "Deal Aggregator".to_string(),
        ));
        pipeline = pipeline.with_digest(DigestPublisher::new(
            host,
            platform.clone(),
            channels.premium.clone(),
        ));
    }

    let now = Utc::now();
    match cli.command {
        Command::Run => {
            let summary = pipeline.run(now).await?;
            info!(
                "Run finished: {} fetched, {} fresh, {} deferred, {} analyzed, {} published, {} rejected",
                summary.fetched,
                summary.fresh,
                summary.deferred,
                summary.analyzed,
                summary.published,
                summary.rejected
            );
        }
        Command::Sweep => {
            let report = pipeline.sweep_once(now).await?;
            info!(
                "Sweep finished: {} removed, {} kept for retry",
                report.deleted, report.errored
            );
        }
        Command::Digest => match pipeline.publish_digest(now).await? {
            Some(url) => info!("Digest published at {}", url),
            None => info!("Nothing to digest"),
        },
    }

    Ok(())
}
