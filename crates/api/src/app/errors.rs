use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use smalledger_core::DomainError;
use smalledger_infra::TransferError;

pub fn transfer_error_to_response(err: &TransferError) -> axum::response::Response {
    let (status, code) = match err {
        TransferError::AccountNotFound { .. } => (StatusCode::NOT_FOUND, "account_not_found"),
        TransferError::InsufficientFunds { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_funds")
        }
        TransferError::DuplicateTransfer(_) => (StatusCode::CONFLICT, "duplicate_transfer"),
        TransferError::Currency(e) if e.is_circuit_open() => {
            (StatusCode::SERVICE_UNAVAILABLE, "rate_provider_unavailable")
        }
        TransferError::Currency(_) => (StatusCode::BAD_GATEWAY, "rate_provider_error"),
        TransferError::FundsCheckTimeout { .. } => {
            (StatusCode::GATEWAY_TIMEOUT, "funds_check_timeout")
        }
        TransferError::Cancelled => (StatusCode::GATEWAY_TIMEOUT, "cancelled"),
        TransferError::StoreUnavailable(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable")
        }
        TransferError::FundsCheckFailed { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "funds_check_failed")
        }
        TransferError::ApplyFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "apply_failed"),
        TransferError::CommitFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "commit_failed"),
        TransferError::Conflict(_) => (StatusCode::SERVICE_UNAVAILABLE, "transfer_conflict"),
    };

    if err.is_client_error() {
        tracing::info!(error = %err, code, "transfer rejected");
    } else {
        tracing::error!(error = %err, code, "transfer failed");
    }

    json_error(status, code, err.to_string())
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invariant_violation", msg)
        }
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
