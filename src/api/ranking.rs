use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use serde_with::{serde_as, VecSkipError};

use crate::api::base::{parse_numeric, Result};
use crate::client::KisClient;

const TR_MARKET_CAP_RANK: &str = "FHPST01740000";
const TR_VOLUME_RANK: &str = "FHPST01710000";

/// Ranking dimensions offered for discovery. Kept in the gateway only because
/// the calls share the credential/throttle plumbing with the quote paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingCriteria {
    MarketCap,
    Volume,
}

/// One row of a ranking response. The provider's ranking payloads vary their
/// field names between endpoints, so the known aliases are mapped and the
/// remainder kept raw.
#[derive(Debug, Clone, Deserialize)]
pub struct RankedInstrument {
    #[serde(alias = "mksc_shrn_iscd", alias = "stck_shrn_iscd", alias = "iscd")]
    pub code: String,
    #[serde(default, alias = "hts_kor_isnm")]
    pub name: String,
    #[serde(default, alias = "stck_prpr")]
    pub price: String,
    #[serde(default, alias = "prdy_ctrt")]
    pub change_rate: String,
    #[serde(default, alias = "acml_vol")]
    pub volume: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl RankedInstrument {
    pub fn price_value(&self) -> Option<f64> {
        parse_numeric(&self.price)
    }
}

/// Ranking rows arrive as a bare list; individual malformed rows are skipped
/// rather than failing the whole response.
#[serde_as]
#[derive(Debug, Deserialize)]
pub(crate) struct RankingOutput(#[serde_as(as = "VecSkipError<_>")] pub Vec<RankedInstrument>);

impl KisClient {
    /// Fetch a discovery ranking, truncated client-side to `limit` rows.
    pub async fn get_ranking(
        &self,
        criteria: RankingCriteria,
        limit: usize,
    ) -> Result<Vec<RankedInstrument>> {
        let (path, tr_id, screen) = match criteria {
            RankingCriteria::MarketCap => (
                "/uapi/domestic-stock/v1/ranking/market-cap",
                TR_MARKET_CAP_RANK,
                "20174",
            ),
            RankingCriteria::Volume => (
                "/uapi/domestic-stock/v1/quotations/volume-rank",
                TR_VOLUME_RANK,
                "20171",
            ),
        };

        let output: Option<RankingOutput> = self
            .get_api(
                path,
                &[
                    ("fid_cond_mrkt_div_code", "J"),
                    ("fid_cond_scr_div_code", screen),
                    ("fid_div_cls_code", "0"),
                    ("fid_input_iscd", "0000"),
                    ("fid_trgt_cls_code", "0"),
                    ("fid_trgt_exls_cls_code", "0"),
                    ("fid_input_price_1", ""),
                    ("fid_input_price_2", ""),
                    ("fid_vol_cnt", ""),
                ],
                tr_id,
            )
            .await?;

        let mut rows = output.map(|o| o.0).unwrap_or_default();
        rows.truncate(limit);
        Ok(rows)
    }
}
