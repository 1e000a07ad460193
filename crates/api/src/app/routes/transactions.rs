use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tokio_util::sync::CancellationToken;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub async fn create_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Result<Json<dto::TransferRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                rejection.body_text(),
            );
        }
    };

    let header_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let transfer = match body.into_transfer(header_key) {
        Ok(t) => t,
        Err(response) => return response,
    };

    // Aborts in-flight lookups if the client goes away and this future is dropped.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    match services.ledger.process_transfer(transfer, &cancel).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::transfer_error_to_response(&e),
    }
}
