//! Conversion rates: remote provider, cache backends, and the cache-aside
//! lookup used to validate transfer currencies.

pub mod batch;
pub mod cache;
pub mod provider;
pub mod rate_cache;
#[cfg(feature = "redis")]
pub mod redis_cache;

pub use batch::fetch_all;
pub use cache::{CacheBackend, CacheError, InMemoryCacheBackend};
pub use provider::{HttpRateProvider, RateError, RateProvider};
pub use rate_cache::{DEFAULT_RATE_TTL, RateCache, RateLookup};
#[cfg(feature = "redis")]
pub use redis_cache::RedisCacheBackend;
