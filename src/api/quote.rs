use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::api::base::{parse_numeric, KisError, Result};
use crate::api::exchange::ExchangeCode;
use crate::client::KisClient;

/// Transaction ids for the quotation endpoints.
pub(crate) const TR_DOMESTIC_PRICE: &str = "FHKST01010100";
pub(crate) const TR_OVERSEAS_PRICE: &str = "HHDFS00000300";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Market {
    Kr,
    Us,
}

impl Market {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kr => "KR",
            Self::Us => "US",
        }
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a quote was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSource {
    Stream,
    Rest,
}

/// The freshest known price tuple for one (symbol, market) pair. Replaced
/// wholesale on every observation, never mutated in place.
#[derive(Debug, Clone)]
pub struct Quote {
    pub symbol: String,
    pub market: Market,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub observed_at: DateTime<Utc>,
    pub source: QuoteSource,
}

/// Output payload of the domestic current-price inquiry.
#[derive(Debug, Clone, Deserialize)]
pub struct DomesticPriceOutput {
    #[serde(default)]
    pub stck_prpr: String,
    #[serde(default)]
    pub prdy_vrss: String,
    #[serde(default)]
    pub prdy_ctrt: String,
    #[serde(default)]
    pub stck_bsop_date: Option<String>,
    #[serde(default)]
    pub stck_cntg_hour: Option<String>,
    #[serde(default)]
    pub bstp_kor_isnm: Option<String>,
}

impl DomesticPriceOutput {
    pub fn to_quote(&self, symbol: &str) -> Option<Quote> {
        let price = parse_numeric(&self.stck_prpr)?;
        if price <= 0.0 {
            return None;
        }
        let rate = parse_numeric(&self.prdy_ctrt).unwrap_or(0.0);
        let diff = parse_numeric(&self.prdy_vrss).unwrap_or(0.0);
        Some(Quote {
            symbol: symbol.to_string(),
            market: Market::Kr,
            price,
            change: signed_by_rate(diff, rate),
            change_percent: rate,
            observed_at: Utc::now(),
            source: QuoteSource::Rest,
        })
    }
}

/// Output payload of the overseas current-price inquiry. A correct symbol
/// queried on the wrong venue comes back as `rt_cd == "0"` with every field
/// empty, which is why these all default.
#[derive(Debug, Clone, Deserialize)]
pub struct OverseasPriceOutput {
    #[serde(default)]
    pub last: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub rate: String,
    #[serde(default)]
    pub tvol: String,
}

impl OverseasPriceOutput {
    pub fn is_empty(&self) -> bool {
        self.last.trim().is_empty()
    }

    pub fn to_quote(&self, symbol: &str) -> Option<Quote> {
        let price = parse_numeric(&self.last)?;
        if price <= 0.0 {
            return None;
        }
        let rate = parse_numeric(&self.rate).unwrap_or(0.0);
        let diff = parse_numeric(&self.diff).unwrap_or(0.0);
        Some(Quote {
            symbol: symbol.to_string(),
            market: Market::Us,
            price,
            change: signed_by_rate(diff, rate),
            change_percent: rate,
            observed_at: Utc::now(),
            source: QuoteSource::Rest,
        })
    }
}

/// The provider reports the day-over-day difference as an unsigned magnitude
/// next to a separately-signed rate; recombine them.
fn signed_by_rate(diff: f64, rate: f64) -> f64 {
    if rate < 0.0 {
        -diff.abs()
    } else {
        diff.abs()
    }
}

impl KisClient {
    /// Current price for a KRX-listed symbol.
    pub async fn get_domestic_price(&self, symbol: &str) -> Result<Quote> {
        let output: Option<DomesticPriceOutput> = self
            .get_api(
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                &[("FID_COND_MRKT_DIV_CODE", "J"), ("FID_INPUT_ISCD", symbol)],
                TR_DOMESTIC_PRICE,
            )
            .await?;

        output
            .as_ref()
            .and_then(|o| o.to_quote(symbol))
            .ok_or_else(|| KisError::NotFound {
                symbol: symbol.to_string(),
            })
    }

    /// Current price for a US-listed symbol, with the one-shot exchange
    /// disambiguation retry: an empty payload or business error on the
    /// guessed venue triggers exactly one attempt on the alternate venue; a
    /// second failure surfaces the original error.
    pub async fn get_overseas_price(&self, symbol: &str) -> Result<Quote> {
        let symbol = symbol.to_uppercase();
        let guess = self.exchange_resolver().resolve(&symbol);

        match self.overseas_attempt(&symbol, guess).await {
            Ok(quote) => Ok(quote),
            // Only ambiguity-shaped failures toggle the venue; transport
            // errors belong to the caller's retry policy.
            Err(original @ (KisError::NotFound { .. } | KisError::Upstream { .. })) => {
                let alternate = guess.toggled();
                warn!(
                    symbol = %symbol,
                    guessed = guess.rest_code(),
                    alternate = alternate.rest_code(),
                    "empty quote on guessed exchange, retrying alternate"
                );
                match self.overseas_attempt(&symbol, alternate).await {
                    Ok(quote) => Ok(quote),
                    Err(_) => Err(original),
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn overseas_attempt(&self, symbol: &str, exchange: ExchangeCode) -> Result<Quote> {
        let output: Option<OverseasPriceOutput> = self
            .get_api(
                "/uapi/overseas-price/v1/quotations/price",
                &[
                    ("AUTH", ""),
                    ("EXCD", exchange.rest_code()),
                    ("SYMB", symbol),
                ],
                TR_OVERSEAS_PRICE,
            )
            .await?;

        output
            .filter(|o| !o.is_empty())
            .and_then(|o| o.to_quote(symbol))
            .ok_or_else(|| KisError::NotFound {
                symbol: symbol.to_string(),
            })
    }

    /// Market-dispatching single-symbol fetch.
    pub async fn get_single_quote(&self, symbol: &str, market: Market) -> Result<Quote> {
        match market {
            Market::Kr => self.get_domestic_price(symbol).await,
            Market::Us => self.get_overseas_price(symbol).await,
        }
    }

    /// One batched quote call. The upstream returns a map keyed by symbol;
    /// symbols it could not price come back null and map to `None`.
    pub async fn get_batch_quotes(
        &self,
        symbols: &[impl AsRef<str>],
        market: Market,
    ) -> Result<HashMap<String, Option<Quote>>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let csv = symbols
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        let query = [("market", market.as_str()), ("symbols", csv.as_str())];

        let quotes = match market {
            Market::Kr => {
                let raw: HashMap<String, Option<DomesticPriceOutput>> =
                    self.get_unenveloped("/quote/batch", &query).await?;
                raw.into_iter()
                    .map(|(symbol, output)| {
                        let quote = output.as_ref().and_then(|o| o.to_quote(&symbol));
                        (symbol, quote)
                    })
                    .collect()
            }
            Market::Us => {
                let raw: HashMap<String, Option<OverseasPriceOutput>> =
                    self.get_unenveloped("/quote/batch", &query).await?;
                raw.into_iter()
                    .map(|(symbol, output)| {
                        let quote = output.as_ref().and_then(|o| o.to_quote(&symbol));
                        (symbol, quote)
                    })
                    .collect()
            }
        };
        Ok(quotes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_domestic_output_to_quote() {
        let output: DomesticPriceOutput = serde_json::from_value(json!({
            "stck_prpr": "73500",
            "prdy_vrss": "500",
            "prdy_ctrt": "0.68",
            "stck_bsop_date": "20260806",
            "stck_cntg_hour": "100000"
        }))
        .unwrap();

        let quote = output.to_quote("005930").unwrap();
        assert_eq!(quote.symbol, "005930");
        assert_eq!(quote.market, Market::Kr);
        assert_eq!(quote.price, 73500.0);
        assert_eq!(quote.change, 500.0);
        assert_eq!(quote.change_percent, 0.68);
        assert_eq!(quote.source, QuoteSource::Rest);
    }

    #[test]
    fn test_domestic_change_sign_follows_rate() {
        let output: DomesticPriceOutput = serde_json::from_value(json!({
            "stck_prpr": "73000",
            "prdy_vrss": "500",
            "prdy_ctrt": "-0.68"
        }))
        .unwrap();

        let quote = output.to_quote("005930").unwrap();
        assert_eq!(quote.change, -500.0);
        assert_eq!(quote.change_percent, -0.68);
    }

    #[test]
    fn test_zero_price_is_not_a_quote() {
        let output: DomesticPriceOutput = serde_json::from_value(json!({
            "stck_prpr": "0",
            "prdy_vrss": "0",
            "prdy_ctrt": "0.00"
        }))
        .unwrap();
        assert!(output.to_quote("005930").is_none());
    }

    #[test]
    fn test_overseas_output_with_commas() {
        let output: OverseasPriceOutput = serde_json::from_value(json!({
            "last": "1,234.56",
            "diff": "12.30",
            "rate": "1.01",
            "tvol": "48210000"
        }))
        .unwrap();

        let quote = output.to_quote("AAPL").unwrap();
        assert_eq!(quote.market, Market::Us);
        assert_eq!(quote.price, 1234.56);
        assert_eq!(quote.change, 12.30);
    }

    #[test]
    fn test_overseas_empty_payload_detected() {
        let output: OverseasPriceOutput = serde_json::from_value(json!({})).unwrap();
        assert!(output.is_empty());
        assert!(output.to_quote("WMT").is_none());
    }

    #[test]
    fn test_market_display() {
        assert_eq!(Market::Kr.to_string(), "KR");
        assert_eq!(Market::Us.to_string(), "US");
    }
}
