use std::collections::HashSet;

use once_cell::sync::Lazy;

/// US venues the provider distinguishes. The provider has no reliable
/// exchange-lookup endpoint and silently returns "not found" for a correct
/// symbol queried on the wrong venue, so the gateway guesses first and
/// retries once on the alternate (see `KisClient::get_overseas_price`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeCode {
    Nasdaq,
    Nyse,
    Amex,
}

impl ExchangeCode {
    /// Venue code used by the overseas REST quote endpoint (`EXCD`).
    pub fn rest_code(self) -> &'static str {
        match self {
            Self::Nasdaq => "NAS",
            Self::Nyse => "NYS",
            Self::Amex => "AMS",
        }
    }

    /// Realtime key prefix used by the streaming subscription (`tr_key`).
    pub fn stream_prefix(self) -> &'static str {
        match self {
            Self::Nasdaq => "DNAS",
            Self::Nyse => "DNYS",
            Self::Amex => "DAMS",
        }
    }

    /// The alternate venue tried when a quote comes back empty.
    pub fn toggled(self) -> Self {
        match self {
            Self::Nyse => Self::Nasdaq,
            Self::Nasdaq | Self::Amex => Self::Nyse,
        }
    }

    /// Strip a realtime key prefix, recovering the bare ticker: `DNASAAPL`
    /// becomes `AAPL`. Unprefixed keys pass through unchanged.
    pub fn strip_stream_prefix(key: &str) -> &str {
        for code in [Self::Nasdaq, Self::Nyse, Self::Amex] {
            if let Some(bare) = key.strip_prefix(code.stream_prefix()) {
                if !bare.is_empty() {
                    return bare;
                }
            }
        }
        key
    }
}

/// Maps a US ticker to its likely venue. Pluggable so the static table can be
/// replaced or extended without touching the retry logic.
pub trait ExchangeResolver: Send + Sync {
    fn resolve(&self, symbol: &str) -> ExchangeCode;
}

static NYSE_SYMBOLS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "JPM", "BAC", "WMT", "TGT", "KO", "MCD", "DIS", "NKE", "TM", "TSM", "HD", "V", "MA",
        "PFE",
    ]
    .into_iter()
    .collect()
});

/// Static symbol table with a NASDAQ default. Known large NYSE listings are
/// special-cased; everything else is guessed as NASDAQ and corrected by the
/// one-shot retry.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticExchangeTable;

impl ExchangeResolver for StaticExchangeTable {
    fn resolve(&self, symbol: &str) -> ExchangeCode {
        // Index tickers route through NYSE except the NASDAQ composite.
        match symbol {
            ".DJI" | ".SPX" | "SPX" | ".INX" => return ExchangeCode::Nyse,
            ".IXIC" | "COMP" | ".COMP" => return ExchangeCode::Nasdaq,
            _ => {}
        }
        if NYSE_SYMBOLS.contains(symbol) {
            ExchangeCode::Nyse
        } else {
            ExchangeCode::Nasdaq
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_nasdaq() {
        let table = StaticExchangeTable;
        assert_eq!(table.resolve("AAPL"), ExchangeCode::Nasdaq);
        assert_eq!(table.resolve("ZZZZ"), ExchangeCode::Nasdaq);
    }

    #[test]
    fn test_known_nyse_listings() {
        let table = StaticExchangeTable;
        assert_eq!(table.resolve("JPM"), ExchangeCode::Nyse);
        assert_eq!(table.resolve("WMT"), ExchangeCode::Nyse);
    }

    #[test]
    fn test_index_routing() {
        let table = StaticExchangeTable;
        assert_eq!(table.resolve(".DJI"), ExchangeCode::Nyse);
        assert_eq!(table.resolve(".IXIC"), ExchangeCode::Nasdaq);
    }

    #[test]
    fn test_toggle_covers_both_directions() {
        assert_eq!(ExchangeCode::Nasdaq.toggled(), ExchangeCode::Nyse);
        assert_eq!(ExchangeCode::Nyse.toggled(), ExchangeCode::Nasdaq);
        assert_eq!(ExchangeCode::Amex.toggled(), ExchangeCode::Nyse);
    }

    #[test]
    fn test_strip_stream_prefix() {
        assert_eq!(ExchangeCode::strip_stream_prefix("DNASAAPL"), "AAPL");
        assert_eq!(ExchangeCode::strip_stream_prefix("DNYSJPM"), "JPM");
        assert_eq!(ExchangeCode::strip_stream_prefix("005930"), "005930");
        // A key that is nothing but a prefix stays as-is.
        assert_eq!(ExchangeCode::strip_stream_prefix("DNAS"), "DNAS");
    }
}
