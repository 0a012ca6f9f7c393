use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use reqwest::ClientBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::api::base::{KisError, KisResponse, Result};
use crate::api::exchange::{ExchangeResolver, StaticExchangeTable};
use crate::api::throttle::RateLimiter;
use crate::api::token::{
    CredentialKind, CredentialSource, IssuedCredential, TokenManager, TokenStore,
};
use crate::config::KisConfig;

/// Approval keys carry no `expires_in` in the handshake response; the
/// provider documents a 24-hour validity.
const APPROVAL_EXPIRES_IN_SECS: i64 = 86_400;

/// Entry point for the gateway's REST side. Owns the HTTP client, the
/// throttler, and the credential cache; the endpoint implementations live in
/// the `api` modules.
pub struct KisClient {
    pub(crate) client: reqwest::Client,
    config: KisConfig,
    throttle: Arc<RateLimiter>,
    tokens: Arc<TokenManager>,
    exchange: Arc<dyn ExchangeResolver>,
}

impl KisClient {
    /// Construct a client with no durable credential store.
    pub fn new(config: KisConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Construct a client backed by a durable credential store.
    pub fn with_store(config: KisConfig, store: Arc<dyn TokenStore>) -> Result<Self> {
        Self::build(config, Some(store))
    }

    fn build(config: KisConfig, store: Option<Arc<dyn TokenStore>>) -> Result<Self> {
        config.validate()?;
        let client = Self::create_client();
        let throttle = Arc::new(RateLimiter::new(&config.throttle));
        let source = HttpCredentialSource {
            client: client.clone(),
            base_url: config.base_url.clone(),
            app_key: config.app_key.clone(),
            app_secret: config.app_secret.clone(),
            throttle: throttle.clone(),
        };
        let tokens = Arc::new(TokenManager::new(Arc::new(source), store));

        Ok(Self {
            client,
            config,
            throttle,
            tokens,
            exchange: Arc::new(StaticExchangeTable),
        })
    }

    /// Replace the exchange resolver (the default is the static table).
    pub fn with_exchange_resolver(mut self, resolver: Arc<dyn ExchangeResolver>) -> Self {
        self.exchange = resolver;
        self
    }

    fn create_client() -> reqwest::Client {
        let mut headers = HeaderMap::new();

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::USER_AGENT, HeaderValue::from_static("kisquote-rs"));

        ClientBuilder::new()
            .default_headers(headers)
            .build()
            .expect("Could not create client")
    }

    pub fn config(&self) -> &KisConfig {
        &self.config
    }

    pub fn tokens(&self) -> Arc<TokenManager> {
        self.tokens.clone()
    }

    pub(crate) fn exchange_resolver(&self) -> &Arc<dyn ExchangeResolver> {
        &self.exchange
    }

    /// GET an enveloped quotation endpoint: bearer auth, app headers and the
    /// endpoint's `tr_id`, paced by the throttler. Returns the envelope's
    /// `output`, turning `rt_cd != "0"` into `KisError::Upstream`.
    pub(crate) async fn get_api<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        tr_id: &str,
    ) -> Result<Option<T>> {
        let token = self.tokens.get(CredentialKind::Rest).await?;
        let url = format!("{}{}", self.config.base_url, path);

        let response = self
            .throttle
            .add(|| async {
                self.client
                    .get(&url)
                    .query(query)
                    .header(header::AUTHORIZATION, format!("Bearer {}", token.value))
                    .header("appkey", &self.config.app_key)
                    .header("appsecret", &self.config.app_secret)
                    .header("tr_id", tr_id)
                    .send()
                    .await
            })
            .await?;

        let status = response.status();
        let text = response.text().await?;

        debug!(
            "kis GET {} tr_id={} status={} body={}",
            url,
            tr_id,
            status.as_u16(),
            text
        );

        if !status.is_success() {
            return Err(KisError::UnexpectedResponse {
                status: status.as_u16(),
                body: text,
            });
        }

        let envelope: KisResponse<T> = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(
                    error = %err,
                    "failed to parse response for {} (status {}): {}",
                    url,
                    status,
                    text
                );
                return Err(KisError::UnexpectedResponse {
                    status: status.as_u16(),
                    body: text,
                });
            }
        };

        envelope.into_output()
    }

    /// GET an endpoint that returns a bare JSON document rather than the
    /// `rt_cd` envelope (the batched quote map).
    pub(crate) async fn get_unenveloped<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let token = self.tokens.get(CredentialKind::Rest).await?;
        let url = format!("{}{}", self.config.base_url, path);

        let response = self
            .throttle
            .add(|| async {
                self.client
                    .get(&url)
                    .query(query)
                    .header(header::AUTHORIZATION, format!("Bearer {}", token.value))
                    .header("appkey", &self.config.app_key)
                    .header("appsecret", &self.config.app_secret)
                    .send()
                    .await
            })
            .await?;

        let status = response.status();
        let text = response.text().await?;

        debug!("kis GET {} status={} body={}", url, status.as_u16(), text);

        if !status.is_success() {
            return Err(KisError::UnexpectedResponse {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|err| {
            error!(error = %err, "failed to parse response for {}: {}", url, text);
            KisError::UnexpectedResponse {
                status: status.as_u16(),
                body: text,
            }
        })
    }
}

#[derive(Serialize)]
struct TokenGrantRequest<'a> {
    grant_type: &'a str,
    appkey: &'a str,
    appsecret: &'a str,
}

#[derive(Serialize)]
struct ApprovalRequest<'a> {
    grant_type: &'a str,
    appkey: &'a str,
    secretkey: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenGrantResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    approval_key: String,
}

/// Production [`CredentialSource`]: performs the token/approval handshakes
/// against the provider, paced by the same throttler as the quote traffic.
struct HttpCredentialSource {
    client: reqwest::Client,
    base_url: String,
    app_key: String,
    app_secret: String,
    throttle: Arc<RateLimiter>,
}

impl HttpCredentialSource {
    async fn post_handshake<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .throttle
            .add(|| async { self.client.post(&url).json(body).send().await })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            error!("credential handshake {} failed with status {}", url, status);
            return Err(KisError::UnexpectedResponse {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self, kind: CredentialKind) -> Result<IssuedCredential> {
        match kind {
            CredentialKind::Rest => {
                let body = TokenGrantRequest {
                    grant_type: "client_credentials",
                    appkey: &self.app_key,
                    appsecret: &self.app_secret,
                };
                let grant: TokenGrantResponse =
                    self.post_handshake("/oauth2/tokenP", &body).await?;
                Ok(IssuedCredential {
                    value: grant.access_token,
                    expires_in: grant.expires_in,
                })
            }
            CredentialKind::Streaming => {
                let body = ApprovalRequest {
                    grant_type: "client_credentials",
                    appkey: &self.app_key,
                    secretkey: &self.app_secret,
                };
                let approval: ApprovalResponse =
                    self.post_handshake("/oauth2/Approval", &body).await?;
                Ok(IssuedCredential {
                    value: approval.approval_key,
                    expires_in: APPROVAL_EXPIRES_IN_SECS,
                })
            }
        }
    }
}
