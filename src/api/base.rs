use serde::Deserialize;

/// Response envelope shared by every quotation/ranking endpoint.
///
/// The provider signals business failure through `rt_cd` while keeping the
/// HTTP status 200, so callers must check the envelope before trusting
/// `output`.
#[derive(Debug, Deserialize)]
pub struct KisResponse<T> {
    pub rt_cd: String,
    #[serde(default)]
    pub msg_cd: Option<String>,
    #[serde(default)]
    pub msg1: Option<String>,
    #[serde(default = "Option::default")]
    pub output: Option<T>,
}

impl<T> KisResponse<T> {
    pub fn is_success(&self) -> bool {
        self.rt_cd == "0"
    }

    /// Unwrap the envelope, turning `rt_cd != "0"` into `KisError::Upstream`.
    pub fn into_output(self) -> Result<Option<T>> {
        if self.is_success() {
            Ok(self.output)
        } else {
            Err(KisError::Upstream {
                code: self.msg_cd,
                message: self.msg1.unwrap_or_default(),
            })
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum KisError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("credential acquisition failed: {0}")]
    Credential(String),
    #[error("upstream error {code:?}: {message}")]
    Upstream {
        code: Option<String>,
        message: String,
    },
    #[error("no quote available for {symbol}")]
    NotFound { symbol: String },
    #[error("HTTP Error")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response (status {status}): {body}")]
    UnexpectedResponse { status: u16, body: String },
    #[error("JSON Error")]
    Json(#[from] serde_json::Error),
    #[error("Websocket Error")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, KisError>;

/// Parse one of the provider's stringly-typed numeric fields. Values may be
/// comma-grouped ("1,234.56") or padded; empty strings parse to `None`.
pub(crate) fn parse_numeric(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}
