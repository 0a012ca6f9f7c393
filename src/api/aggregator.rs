use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::api::quote::{Market, Quote};
use crate::api::streaming::{StreamManager, SubscriptionHandle};
use crate::client::KisClient;

/// Pacing and retry knobs for the batched snapshot fetch. The defaults sit on
/// top of the request throttler: chunks go out sequentially with a small gap
/// to respect the provider's informal batch-rate expectations.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    /// Retries per chunk after the initial attempt.
    pub max_retries: u32,
    /// Backoff before retry n is `retry_backoff * 2^(n-1)`.
    pub retry_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            chunk_delay: Duration::from_millis(200),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

fn backoff_delay(config: &AggregatorConfig, attempt: u32) -> Duration {
    config.retry_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Combines the two quote sources for a caller-declared symbol set: an
/// immediate chunked REST snapshot plus live stream subscriptions, merged so
/// reads always prefer the stream.
pub struct QuoteAggregator {
    client: Arc<KisClient>,
    stream: Arc<StreamManager>,
    config: AggregatorConfig,
}

impl QuoteAggregator {
    pub fn new(client: Arc<KisClient>, stream: Arc<StreamManager>) -> Self {
        Self::with_config(client, stream, AggregatorConfig::default())
    }

    pub fn with_config(
        client: Arc<KisClient>,
        stream: Arc<StreamManager>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            client,
            stream,
            config,
        }
    }

    /// Declare interest in a symbol set: subscribe each symbol (reference
    /// counted across simultaneous callers by the stream manager), fetch the
    /// batch snapshot, and return the merged per-symbol accessor. Symbols the
    /// batch could not price are reported through the feed's failed set, not
    /// as an error.
    pub async fn watch(&self, symbols: &[impl AsRef<str>], market: Market) -> QuoteFeed {
        let symbols: Vec<String> = symbols
            .iter()
            .map(|s| match market {
                Market::Kr => s.as_ref().to_string(),
                Market::Us => s.as_ref().to_uppercase(),
            })
            .collect();

        let subscriptions: Vec<SubscriptionHandle> = symbols
            .iter()
            .map(|s| self.stream.acquire(s, market))
            .collect();

        let (snapshot, failed) =
            fetch_snapshot(&self.client, &self.config, &symbols, market).await;

        QuoteFeed {
            client: self.client.clone(),
            stream: self.stream.clone(),
            market,
            snapshot: RwLock::new(snapshot),
            failed: RwLock::new(failed),
            _subscriptions: subscriptions,
        }
    }
}

/// Chunked, sequential snapshot fetch with bounded retries. Only the symbols
/// still missing a usable price are refetched on each retry; symbols that
/// exhaust their retries land in the failed set.
async fn fetch_snapshot(
    client: &KisClient,
    config: &AggregatorConfig,
    symbols: &[String],
    market: Market,
) -> (HashMap<String, Quote>, HashSet<String>) {
    let mut snapshot = HashMap::new();
    let mut failed = HashSet::new();

    for (index, chunk) in symbols.chunks(config.chunk_size.max(1)).enumerate() {
        if index > 0 && !config.chunk_delay.is_zero() {
            tokio::time::sleep(config.chunk_delay).await;
        }

        let mut pending: Vec<String> = chunk.to_vec();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(
                config.attempt_timeout,
                client.get_batch_quotes(&pending, market),
            )
            .await
            {
                Ok(Ok(quotes)) => {
                    pending.retain(|symbol| match quotes.get(symbol) {
                        Some(Some(quote)) => {
                            snapshot.insert(symbol.clone(), quote.clone());
                            false
                        }
                        _ => true,
                    });
                    if pending.is_empty() {
                        break;
                    }
                    debug!(attempt, missing = pending.len(), "chunk returned unpriced symbols");
                }
                Ok(Err(e)) => warn!(attempt, error = %e, "batch chunk fetch failed"),
                Err(_) => warn!(attempt, "batch chunk attempt timed out"),
            }

            if attempt > config.max_retries {
                warn!(symbols = ?pending, "chunk retries exhausted");
                failed.extend(pending.drain(..));
                break;
            }
            tokio::time::sleep(backoff_delay(config, attempt)).await;
        }
    }

    (snapshot, failed)
}

/// Per-caller view over one watched symbol set.
pub struct QuoteFeed {
    client: Arc<KisClient>,
    stream: Arc<StreamManager>,
    market: Market,
    snapshot: RwLock<HashMap<String, Quote>>,
    failed: RwLock<HashSet<String>>,
    /// Held for the feed's lifetime; dropping the feed releases the
    /// subscriptions.
    _subscriptions: Vec<SubscriptionHandle>,
}

impl QuoteFeed {
    /// The current merged quote: a live tick wins over the batch snapshot
    /// regardless of age, the snapshot wins over nothing. `None` means no
    /// source has produced a usable price yet.
    pub fn get_quote(&self, symbol: &str) -> Option<Quote> {
        if let Some(tick) = self.stream.latest(symbol) {
            return Some(tick);
        }
        self.snapshot
            .read()
            .expect("snapshot map poisoned")
            .get(symbol)
            .cloned()
    }

    /// Symbols whose batch fetch exhausted its retries. Individually
    /// retriable via [`QuoteFeed::refetch`].
    pub fn failed_symbols(&self) -> HashSet<String> {
        self.failed.read().expect("failed set poisoned").clone()
    }

    /// Fetch one symbol outside the batch cycle. Success refreshes the
    /// snapshot and clears the symbol's failed mark.
    pub async fn refetch(&self, symbol: &str) -> crate::Result<Quote> {
        let quote = self.client.get_single_quote(symbol, self.market).await?;
        self.snapshot
            .write()
            .expect("snapshot map poisoned")
            .insert(quote.symbol.clone(), quote.clone());
        self.failed
            .write()
            .expect("failed set poisoned")
            .remove(&quote.symbol);
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pacing() {
        let config = AggregatorConfig::default();
        assert_eq!(config.chunk_size, 5);
        assert_eq!(config.chunk_delay, Duration::from_millis(200));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff, Duration::from_secs(1));
        assert_eq!(config.attempt_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_schedule_doubles() {
        let config = AggregatorConfig::default();
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
    }
}
