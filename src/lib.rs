pub mod ai;
pub mod canonical;
pub mod config;
pub mod digest;
pub mod fetcher;
pub mod funnel;
pub mod pipeline;
pub mod publisher;
pub mod scraper;
pub mod store;
pub mod sweeper;
pub mod types;

pub use config::{AppConfig, ChannelConfig, ChannelsConfig, FetchConfig, FunnelConfig};
pub use fetcher::{EntrySource, FeedFetcher, RawEntry, StaticSource};
pub use funnel::{DealScorer, DealVerifier, QualityFunnel};
pub use pipeline::{Pipeline, PipelineConfig, RunSummary};
pub use publisher::{MessagePlatform, PublisherRouter, TelegramPlatform};
pub use store::{MemoryStateStore, PgStateStore, StateManager, StateStore};
pub use types::*;
