//! Cache-aside layer in front of a [`RateProvider`].
//!
//! Read path: fresh cache entry → return it. Miss, undecodable entry, or an
//! unreachable backend → ask the provider, then write the result back with
//! the TTL reset. Cache failures never fail a lookup; only provider failures
//! do. Concurrent fills of the same key resolve last-write-wins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use smalledger_core::{ConversionRate, CurrencyCode};

use super::cache::CacheBackend;
use super::provider::{RateError, RateProvider};

/// Default freshness window of a cached rate.
pub const DEFAULT_RATE_TTL: Duration = Duration::from_secs(60 * 60);

/// Rate lookups as seen by the ledger.
#[async_trait]
pub trait RateLookup: Send + Sync {
    async fn get_rates(
        &self,
        currency: &CurrencyCode,
        cancel: &CancellationToken,
    ) -> Result<ConversionRate, RateError>;
}

#[async_trait]
impl<T: RateLookup + ?Sized> RateLookup for Arc<T> {
    async fn get_rates(
        &self,
        currency: &CurrencyCode,
        cancel: &CancellationToken,
    ) -> Result<ConversionRate, RateError> {
        (**self).get_rates(currency, cancel).await
    }
}

pub struct RateCache<B, P> {
    backend: B,
    provider: P,
    ttl: Duration,
}

impl<B, P> RateCache<B, P> {
    pub fn new(backend: B, provider: P) -> Self {
        Self {
            backend,
            provider,
            ttl: DEFAULT_RATE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

pub fn cache_key(currency: &CurrencyCode) -> String {
    format!("rates:{currency}")
}

impl<B: CacheBackend, P> RateCache<B, P> {
    async fn cached(&self, key: &str, currency: &CurrencyCode) -> Option<ConversionRate> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<ConversionRate>(&bytes) {
                Ok(rate) => Some(rate),
                Err(e) => {
                    warn!(currency = %currency, error = %e, "discarding undecodable cached rate");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(currency = %currency, error = %e, "rate cache unavailable, treating as miss");
                None
            }
        }
    }

    async fn store(&self, key: &str, rate: &ConversionRate) {
        let bytes = match serde_json::to_vec(rate) {
            Ok(b) => b,
            Err(e) => {
                warn!(currency = %rate.currency, error = %e, "failed to encode rate for cache");
                return;
            }
        };

        if let Err(e) = self.backend.set(key, bytes, self.ttl).await {
            warn!(currency = %rate.currency, error = %e, "failed to write rate to cache");
        }
    }
}

#[async_trait]
impl<B, P> RateLookup for RateCache<B, P>
where
    B: CacheBackend,
    P: RateProvider,
{
    async fn get_rates(
        &self,
        currency: &CurrencyCode,
        cancel: &CancellationToken,
    ) -> Result<ConversionRate, RateError> {
        let key = cache_key(currency);

        if let Some(rate) = self.cached(&key, currency).await {
            debug!(currency = %currency, "rate cache hit");
            return Ok(rate);
        }

        debug!(currency = %currency, "rate cache miss");
        let rate = self.provider.fetch_rates(currency, cancel).await?;
        self.store(&key, &rate).await;
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::cache::{CacheError, InMemoryCacheBackend};
    use crate::resilience::ClientError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn code(s: &str) -> CurrencyCode {
        CurrencyCode::parse(s).unwrap()
    }

    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RateProvider for CountingProvider {
        async fn fetch_rates(
            &self,
            currency: &CurrencyCode,
            _cancel: &CancellationToken,
        ) -> Result<ConversionRate, RateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ClientError::Cancelled.into());
            }
            let mut rates = BTreeMap::new();
            rates.insert("EUR".to_string(), "0.92".to_string());
            Ok(ConversionRate::new(currency.clone(), rates))
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_lookups_fill_one_entry_per_currency() {
        let cache = Arc::new(RateCache::new(
            InMemoryCacheBackend::new(),
            CountingProvider::default(),
        ));
        let codes: Vec<_> = ["USD", "EUR", "GBP", "JPY", "CHF"].into_iter().map(code).collect();
        let fanout = crate::fanout::FanoutExecutor::new();
        let cancel = CancellationToken::new();

        let lookup: Arc<dyn RateLookup> = cache.clone();
        let results = crate::rates::fetch_all(lookup.clone(), &codes, &fanout, &cancel).await;
        assert!(results.iter().all(|(c, r)| r.as_ref().is_ok_and(|rate| &rate.currency == c)));

        for c in &codes {
            let raw = cache.backend().get(&cache_key(c)).await.unwrap().unwrap();
            let stored: ConversionRate = serde_json::from_slice(&raw).unwrap();
            assert_eq!(&stored.currency, c);
        }

        crate::rates::fetch_all(lookup, &codes, &fanout, &cancel).await;
        assert_eq!(cache.provider().calls.load(Ordering::SeqCst), codes.len());
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_hits_cache() {
        let cache = RateCache::new(InMemoryCacheBackend::new(), CountingProvider::default());
        let cancel = CancellationToken::new();

        let first = cache.get_rates(&code("USD"), &cancel).await.unwrap();
        let second = cache.get_rates(&code("USD"), &cancel).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.provider().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keys_are_per_currency() {
        let cache = RateCache::new(InMemoryCacheBackend::new(), CountingProvider::default());
        let cancel = CancellationToken::new();

        cache.get_rates(&code("USD"), &cancel).await.unwrap();
        let eur = cache.get_rates(&code("EUR"), &cancel).await.unwrap();

        assert_eq!(eur.currency, code("EUR"));
        assert_eq!(cache.provider().calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.backend().len(), 2);
    }

    #[tokio::test]
    async fn expired_entry_refetches() {
        let cache = RateCache::new(InMemoryCacheBackend::new(), CountingProvider::default())
            .with_ttl(Duration::from_millis(20));
        let cancel = CancellationToken::new();

        cache.get_rates(&code("USD"), &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.get_rates(&code("USD"), &cancel).await.unwrap();

        assert_eq!(cache.provider().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn corrupt_entry_falls_through_and_is_overwritten() {
        let backend = InMemoryCacheBackend::new();
        backend
            .set(&cache_key(&code("USD")), b"not json".to_vec(), DEFAULT_RATE_TTL)
            .await
            .unwrap();
        let cache = RateCache::new(backend, CountingProvider::default());
        let cancel = CancellationToken::new();

        cache.get_rates(&code("USD"), &cancel).await.unwrap();
        cache.get_rates(&code("USD"), &cancel).await.unwrap();

        assert_eq!(cache.provider().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_backend_degrades_to_provider() {
        let cache = RateCache::new(BrokenBackend, CountingProvider::default());
        let cancel = CancellationToken::new();

        let rate = cache.get_rates(&code("USD"), &cancel).await.unwrap();
        cache.get_rates(&code("USD"), &cancel).await.unwrap();

        assert_eq!(rate.rate_for(&code("EUR")), Some("0.92"));
        assert_eq!(cache.provider().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn provider_failure_is_not_cached() {
        let provider = CountingProvider {
            fail: true,
            ..Default::default()
        };
        let cache = RateCache::new(InMemoryCacheBackend::new(), provider);

        let err = cache
            .get_rates(&code("USD"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(cache.backend().is_empty());
    }
}
