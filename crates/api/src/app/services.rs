//! Infrastructure wiring: store, rate lookup, resilient client, ledger.
//!
//! Persistent backends are picked from configuration: `DATABASE_URL` selects
//! Postgres, `REDIS_URL` selects Redis for the rate cache (with the `redis`
//! feature). Anything unset falls back to its in-memory implementation, and so
//! does a Redis server that cannot be reached at startup.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use smalledger_infra::rates::{
    HttpRateProvider, InMemoryCacheBackend, RateCache, RateLookup,
};
use smalledger_infra::resilience::{CircuitBreaker, ClientError, ResilientClient};
use smalledger_infra::store::{InMemoryStore, PostgresStore, Store, StoreError};
use smalledger_infra::{FanoutExecutor, LedgerConfig, LedgerDeps, LedgerService};

const POSTGRES_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("rate client setup failed: {0}")]
    Client(#[from] ClientError),

    #[error("store setup failed: {0}")]
    Store(#[from] StoreError),
}

pub struct AppServices {
    pub ledger: LedgerService,
    pub rates: Arc<dyn RateLookup>,
    /// Executor for batch rate lookups, bounded by the HTTP client timeout.
    pub rate_fanout: FanoutExecutor,
    /// Breaker guarding the rate provider, exposed for health reporting.
    pub rate_breaker: Arc<CircuitBreaker>,
}

pub async fn build_services(config: &LedgerConfig) -> Result<AppServices, ServiceError> {
    let store: Arc<dyn Store> = match config.database_url.as_deref() {
        Some(url) => {
            let pg = PostgresStore::connect(url, POSTGRES_MAX_CONNECTIONS).await?;
            pg.migrate().await?;
            info!("using postgres store");
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    build_services_with_store(config, store).await
}

/// Wire everything except the store, which the caller provides.
pub async fn build_services_with_store(
    config: &LedgerConfig,
    store: Arc<dyn Store>,
) -> Result<AppServices, ServiceError> {
    let client = ResilientClient::new(config.client_config())?;
    let rate_breaker = Arc::clone(client.breaker());
    let provider = HttpRateProvider::new(client, config.currency_url.clone());
    let rates = build_rate_lookup(config, provider).await;

    let ledger = LedgerService::new(LedgerDeps {
        store,
        rates: Arc::clone(&rates),
        fanout: FanoutExecutor::new(),
        funds_check_timeout: config.funds_check_timeout,
    });

    Ok(AppServices {
        ledger,
        rates,
        rate_fanout: FanoutExecutor::new().with_deadline(config.http_timeout),
        rate_breaker,
    })
}

async fn build_rate_lookup(config: &LedgerConfig, provider: HttpRateProvider) -> Arc<dyn RateLookup> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => match smalledger_infra::rates::RedisCacheBackend::connect(url).await {
            Ok(backend) => {
                info!("using redis rate cache");
                Arc::new(RateCache::new(backend, provider).with_ttl(config.rate_cache_ttl))
            }
            Err(e) => {
                warn!(error = %e, "redis unreachable, falling back to in-memory rate cache");
                in_memory_rates(config, provider)
            }
        },
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("REDIS_URL set but redis feature not enabled, falling back to in-memory");
            in_memory_rates(config, provider)
        }
        None => in_memory_rates(config, provider),
    }
}

fn in_memory_rates(config: &LedgerConfig, provider: HttpRateProvider) -> Arc<dyn RateLookup> {
    Arc::new(RateCache::new(InMemoryCacheBackend::new(), provider).with_ttl(config.rate_cache_ttl))
}
