use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::api::base::{KisError, Result};

/// Safety margin applied to the in-memory tier.
const MEMORY_MARGIN_SECS: i64 = 60;
/// Safety margin applied to the durable tier. Wider, because a stored row's
/// exact remaining lifetime was issued by another process.
const DURABLE_MARGIN_SECS: i64 = 300;

/// The two independently-cached credential kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// REST bearer token (`POST /oauth2/tokenP`).
    Rest,
    /// Streaming approval key (`POST /oauth2/Approval`).
    Streaming,
}

/// A cached credential. Replaced wholesale on refresh, never mutated.
#[derive(Debug, Clone)]
pub struct Credential {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_valid(&self, margin: Duration) -> bool {
        Utc::now() < self.expires_at - margin
    }
}

/// A freshly-issued credential as returned by the provider's handshake.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub value: String,
    /// Remaining lifetime in seconds.
    pub expires_in: i64,
}

/// Performs the network handshake for a credential kind. Implemented by the
/// HTTP client; test code substitutes scripted sources.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, kind: CredentialKind) -> Result<IssuedCredential>;
}

/// A row in the external durable credential store.
#[derive(Debug, Clone)]
pub struct StoredToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// The durable tier, owned by an external collaborator. Rows are
/// insert-only: `save` appends, `load` returns the most recent unexpired row.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self, kind: CredentialKind) -> Result<Option<StoredToken>>;
    async fn save(&self, kind: CredentialKind, token: &str, expires_at: DateTime<Utc>)
        -> Result<()>;
}

/// Two-tier credential cache with single-flight refresh.
///
/// Lookup order: memory (60 s margin) → durable store (5 min margin) →
/// network handshake. Concurrent `get` calls during a handshake coalesce
/// behind one refresh lock; the cache is re-checked after acquisition so only
/// the first caller pays the round trip.
pub struct TokenManager {
    source: Arc<dyn CredentialSource>,
    store: Option<Arc<dyn TokenStore>>,
    cache: std::sync::Mutex<HashMap<CredentialKind, Credential>>,
    refresh_lock: AsyncMutex<()>,
}

impl TokenManager {
    pub fn new(source: Arc<dyn CredentialSource>, store: Option<Arc<dyn TokenStore>>) -> Self {
        Self {
            source,
            store,
            cache: std::sync::Mutex::new(HashMap::new()),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    /// Get a valid credential of the given kind, refreshing if necessary.
    /// Never blocks longer than one network round trip plus queueing.
    pub async fn get(&self, kind: CredentialKind) -> Result<Credential> {
        if let Some(cred) = self.cached(kind) {
            return Ok(cred);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(cred) = self.cached(kind) {
            return Ok(cred);
        }

        if let Some(cred) = self.from_store(kind).await {
            return Ok(cred);
        }

        info!(?kind, "fetching new credential");
        let issued = self
            .source
            .fetch(kind)
            .await
            .map_err(|e| match e {
                KisError::Config(msg) => KisError::Config(msg),
                other => KisError::Credential(other.to_string()),
            })?;

        let expires_at = Utc::now() + Duration::seconds(issued.expires_in);
        let cred = Credential {
            value: issued.value,
            expires_at,
        };
        self.cache
            .lock()
            .expect("credential cache poisoned")
            .insert(kind, cred.clone());

        if let Some(store) = &self.store {
            // Best-effort; the in-memory copy stays authoritative.
            if let Err(e) = store.save(kind, &cred.value, expires_at).await {
                warn!(?kind, error = %e, "failed to persist credential");
            } else {
                debug!(?kind, %expires_at, "credential persisted");
            }
        }

        Ok(cred)
    }

    fn cached(&self, kind: CredentialKind) -> Option<Credential> {
        let cache = self.cache.lock().expect("credential cache poisoned");
        cache
            .get(&kind)
            .filter(|c| c.is_valid(Duration::seconds(MEMORY_MARGIN_SECS)))
            .cloned()
    }

    async fn from_store(&self, kind: CredentialKind) -> Option<Credential> {
        let store = self.store.as_ref()?;
        match store.load(kind).await {
            Ok(Some(row)) => {
                let stored = Credential {
                    value: row.token,
                    expires_at: row.expires_at,
                };
                if stored.is_valid(Duration::seconds(DURABLE_MARGIN_SECS)) {
                    // The memory tier only gets a short confirmation window:
                    // the row's true remaining lifetime belongs to the store,
                    // so re-verify there once the window lapses.
                    let cred = Credential {
                        value: stored.value,
                        expires_at: Utc::now() + Duration::seconds(DURABLE_MARGIN_SECS),
                    };
                    self.cache
                        .lock()
                        .expect("credential cache poisoned")
                        .insert(kind, cred.clone());
                    debug!(?kind, "reusing stored credential");
                    Some(cred)
                } else {
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(?kind, error = %e, "failed to read stored credential");
                None
            }
        }
    }
}

/// Insert-only in-memory store, mirroring the external schema. Used in tests
/// and as a reference implementation of [`TokenStore`].
#[derive(Default)]
pub struct MemoryTokenStore {
    rows: AsyncMutex<Vec<(CredentialKind, StoredToken)>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self, kind: CredentialKind) -> Result<Option<StoredToken>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .rev()
            .find(|(k, row)| *k == kind && row.expires_at > Utc::now())
            .map(|(_, row)| row.clone()))
    }

    async fn save(
        &self,
        kind: CredentialKind,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.push((
            kind,
            StoredToken {
                token: token.to_string(),
                expires_at,
            },
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    struct CountingSource {
        calls: AtomicUsize,
        delay: StdDuration,
        fail: bool,
    }

    impl CountingSource {
        fn new(delay_ms: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: StdDuration::from_millis(delay_ms),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: StdDuration::ZERO,
                fail: true,
            }
        }
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn fetch(&self, kind: CredentialKind) -> Result<IssuedCredential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(KisError::UnexpectedResponse {
                    status: 500,
                    body: "handshake refused".into(),
                });
            }
            Ok(IssuedCredential {
                value: format!("{:?}-token-{}", kind, n),
                expires_in: 86_400,
            })
        }
    }

    #[tokio::test]
    async fn test_single_flight_handshake() {
        let source = Arc::new(CountingSource::new(30));
        let manager = Arc::new(TokenManager::new(source.clone(), None));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get(CredentialKind::Rest).await.unwrap()
            }));
        }
        let mut values = Vec::new();
        for h in handles {
            values.push(h.await.unwrap().value);
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| v == &values[0]));
    }

    #[tokio::test]
    async fn test_valid_credential_not_refetched() {
        let source = Arc::new(CountingSource::new(0));
        let manager = TokenManager::new(source.clone(), None);

        let first = manager.get(CredentialKind::Rest).await.unwrap();
        let second = manager.get(CredentialKind::Rest).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.value, second.value);
    }

    #[tokio::test]
    async fn test_kinds_cached_independently() {
        let source = Arc::new(CountingSource::new(0));
        let manager = TokenManager::new(source.clone(), None);

        let rest = manager.get(CredentialKind::Rest).await.unwrap();
        let streaming = manager.get(CredentialKind::Streaming).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_ne!(rest.value, streaming.value);
    }

    #[tokio::test]
    async fn test_durable_tier_skips_handshake() {
        let source = Arc::new(CountingSource::new(0));
        let store = Arc::new(MemoryTokenStore::new());
        store
            .save(
                CredentialKind::Rest,
                "stored-token",
                Utc::now() + Duration::hours(12),
            )
            .await
            .unwrap();

        let manager = TokenManager::new(source.clone(), Some(store));
        let cred = manager.get(CredentialKind::Rest).await.unwrap();

        assert_eq!(cred.value, "stored-token");
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        // Confirmation window, not the row's full lifetime.
        assert!(cred.expires_at <= Utc::now() + Duration::seconds(DURABLE_MARGIN_SECS + 5));
    }

    #[tokio::test]
    async fn test_nearly_expired_stored_row_ignored() {
        let source = Arc::new(CountingSource::new(0));
        let store = Arc::new(MemoryTokenStore::new());
        // Within the 5-minute durable margin: should not be trusted.
        store
            .save(
                CredentialKind::Rest,
                "stale-token",
                Utc::now() + Duration::seconds(120),
            )
            .await
            .unwrap();

        let manager = TokenManager::new(source.clone(), Some(store));
        let cred = manager.get(CredentialKind::Rest).await.unwrap();

        assert_ne!(cred.value, "stale-token");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_credential_persisted() {
        let source = Arc::new(CountingSource::new(0));
        let store = Arc::new(MemoryTokenStore::new());
        let manager = TokenManager::new(source, Some(store.clone()));

        let cred = manager.get(CredentialKind::Streaming).await.unwrap();
        let row = store.load(CredentialKind::Streaming).await.unwrap().unwrap();
        assert_eq!(row.token, cred.value);
    }

    #[tokio::test]
    async fn test_handshake_failure_propagates() {
        let source = Arc::new(CountingSource::failing());
        let manager = TokenManager::new(source, None);

        let err = manager.get(CredentialKind::Rest).await.unwrap_err();
        assert!(matches!(err, KisError::Credential(_)));
    }

    #[tokio::test]
    async fn test_store_save_failure_is_non_fatal() {
        struct FailingSaveStore;

        #[async_trait]
        impl TokenStore for FailingSaveStore {
            async fn load(&self, _kind: CredentialKind) -> Result<Option<StoredToken>> {
                Ok(None)
            }
            async fn save(
                &self,
                _kind: CredentialKind,
                _token: &str,
                _expires_at: DateTime<Utc>,
            ) -> Result<()> {
                Err(KisError::UnexpectedResponse {
                    status: 503,
                    body: "store down".into(),
                })
            }
        }

        let source = Arc::new(CountingSource::new(0));
        let manager = TokenManager::new(source, Some(Arc::new(FailingSaveStore)));

        // Save failure must not fail the get.
        let cred = manager.get(CredentialKind::Rest).await.unwrap();
        assert!(!cred.value.is_empty());
    }
}
