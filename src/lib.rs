pub mod api;
pub mod client;
pub mod config;

pub use api::aggregator::{AggregatorConfig, QuoteAggregator, QuoteFeed};
pub use api::base::{KisError, Result};
pub use api::quote::{Market, Quote, QuoteSource};
pub use api::ranking::{RankedInstrument, RankingCriteria};
pub use api::streaming::{StreamConfig, StreamManager, StreamStatus, SubscriptionHandle, Tick};
pub use api::token::{CredentialKind, MemoryTokenStore, TokenManager, TokenStore};
pub use client::KisClient;
pub use config::{KisConfig, KisConfigBuilder, ThrottleConfig};
