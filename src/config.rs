use std::env;
use std::time::Duration;

use crate::api::base::{KisError, Result};

pub const BASE_URL: &str = "https://openapi.koreainvestment.com:9443";
pub const WS_URL: &str = "wss://ops.koreainvestment.com:21000";

/// Outbound REST pacing. The defaults match the provider's published ceiling
/// of roughly 20 requests per second for standard accounts.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_concurrency: usize,
    pub min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            min_interval: Duration::from_millis(50),
        }
    }
}

/// Static configuration for a gateway instance.
#[derive(Debug, Clone)]
pub struct KisConfig {
    pub base_url: String,
    pub ws_url: String,
    pub app_key: String,
    pub app_secret: String,
    pub throttle: ThrottleConfig,
}

impl KisConfig {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            ws_url: WS_URL.to_string(),
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            throttle: ThrottleConfig::default(),
        }
    }

    /// Read configuration from the environment. `KIS_APP_KEY` and
    /// `KIS_APP_SECRET` are required; missing keys are a configuration error,
    /// surfaced immediately rather than at the first request.
    pub fn from_env() -> Result<Self> {
        let app_key = env::var("KIS_APP_KEY")
            .map_err(|_| KisError::Config("KIS_APP_KEY is not set".into()))?;
        let app_secret = env::var("KIS_APP_SECRET")
            .map_err(|_| KisError::Config("KIS_APP_SECRET is not set".into()))?;

        let mut config = Self::new(app_key, app_secret);
        if let Ok(url) = env::var("KIS_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = env::var("KIS_WS_URL") {
            config.ws_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_key.is_empty() {
            return Err(KisError::Config("app_key is empty".into()));
        }
        if self.app_secret.is_empty() {
            return Err(KisError::Config("app_secret is empty".into()));
        }
        Ok(())
    }
}

/// Builder for programmatic construction.
pub struct KisConfigBuilder {
    base_url: Option<String>,
    ws_url: Option<String>,
    app_key: Option<String>,
    app_secret: Option<String>,
    throttle: ThrottleConfig,
}

impl KisConfigBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            ws_url: None,
            app_key: None,
            app_secret: None,
            throttle: ThrottleConfig::default(),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    pub fn app_key(mut self, key: impl Into<String>) -> Self {
        self.app_key = Some(key.into());
        self
    }

    pub fn app_secret(mut self, secret: impl Into<String>) -> Self {
        self.app_secret = Some(secret.into());
        self
    }

    pub fn throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn build(self) -> Result<KisConfig> {
        let app_key = self
            .app_key
            .ok_or_else(|| KisError::Config("app_key is required".into()))?;
        let app_secret = self
            .app_secret
            .ok_or_else(|| KisError::Config("app_secret is required".into()))?;

        let config = KisConfig {
            base_url: self.base_url.unwrap_or_else(|| BASE_URL.to_string()),
            ws_url: self.ws_url.unwrap_or_else(|| WS_URL.to_string()),
            app_key,
            app_secret,
            throttle: self.throttle,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for KisConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_validation() {
        let err = KisConfigBuilder::new().build().unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("app_key is required"));

        let err = KisConfigBuilder::new().app_key("k").build().unwrap_err();
        let msg = format!("{}", err);
        assert!(msg.contains("app_secret is required"));
    }

    #[test]
    fn test_builder_defaults() {
        let config = KisConfigBuilder::new()
            .app_key("key")
            .app_secret("secret")
            .build()
            .unwrap();
        assert_eq!(config.base_url, BASE_URL);
        assert_eq!(config.ws_url, WS_URL);
        assert_eq!(config.throttle.max_concurrency, 10);
        assert_eq!(config.throttle.min_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_empty_key_rejected() {
        let config = KisConfig::new("", "secret");
        assert!(matches!(config.validate(), Err(KisError::Config(_))));
    }
}
