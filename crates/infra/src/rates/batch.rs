//! Parallel rate lookups for several base currencies.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use smalledger_core::{ConversionRate, CurrencyCode};

use super::provider::RateError;
use super::rate_cache::RateLookup;
use crate::fanout::{FanoutError, FanoutExecutor, FanoutTask};

pub type BatchResult = Result<ConversionRate, FanoutError<RateError>>;

/// Look up every currency concurrently through `lookup`.
///
/// Returns one entry per distinct currency, sorted by code. A failing
/// currency does not affect the others.
pub async fn fetch_all(
    lookup: Arc<dyn RateLookup>,
    currencies: &[CurrencyCode],
    fanout: &FanoutExecutor,
    cancel: &CancellationToken,
) -> Vec<(CurrencyCode, BatchResult)> {
    let mut unique = currencies.to_vec();
    unique.sort();
    unique.dedup();

    let tasks = unique
        .iter()
        .cloned()
        .map(|currency| {
            let lookup = Arc::clone(&lookup);
            let name = currency.to_string();
            FanoutTask::new(name, move |cancel: CancellationToken| async move {
                lookup.get_rates(&currency, &cancel).await
            })
        })
        .collect();

    let mut results: Vec<(CurrencyCode, BatchResult)> = fanout
        .run_all(tasks, cancel)
        .collect()
        .await
        .into_iter()
        .filter_map(|output| {
            CurrencyCode::parse(&output.name)
                .ok()
                .map(|code| (code, output.result))
        })
        .collect();

    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}
