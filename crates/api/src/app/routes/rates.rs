use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query, rejection::QueryRejection},
    http::StatusCode,
    response::IntoResponse,
};
use tokio_util::sync::CancellationToken;

use smalledger_infra::rates::fetch_all;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// `GET /rates?currencies=USD,EUR`: look up several base currencies at once.
/// Always `200`; per-currency failures are reported inline.
pub async fn get_rates(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<dto::RatesQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                rejection.body_text(),
            );
        }
    };

    let codes = match query.parse_codes() {
        Ok(c) => c,
        Err(response) => return response,
    };

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let results = fetch_all(
        Arc::clone(&services.rates),
        &codes,
        &services.rate_fanout,
        &cancel,
    )
    .await;

    let body: BTreeMap<String, dto::RateEntry> = results
        .into_iter()
        .map(|(code, result)| {
            let entry = match result {
                Ok(rate) => dto::RateEntry::Rates { rates: rate.rates },
                Err(e) => dto::RateEntry::Error {
                    error: e.to_string(),
                },
            };
            (code.to_string(), entry)
        })
        .collect();

    (StatusCode::OK, Json(body)).into_response()
}
