use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use smalledger_core::{AccountId, CurrencyCode, IdempotencyKey, Transfer};
use smalledger_infra::resilience::CircuitSnapshot;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub currency: String,
    pub amount: i64,
    pub idempotency_key: Option<String>,
}

impl TransferRequest {
    /// Validate into a domain `Transfer`.
    ///
    /// The body's `idempotency_key` wins over `header_key`; a fresh key is
    /// generated when neither is given.
    pub fn into_transfer(
        self,
        header_key: Option<&str>,
    ) -> Result<Transfer, axum::response::Response> {
        let from: AccountId = self.from.parse().map_err(errors::domain_error_to_response)?;
        let to: AccountId = self.to.parse().map_err(errors::domain_error_to_response)?;
        let currency =
            CurrencyCode::parse(&self.currency).map_err(errors::domain_error_to_response)?;

        let idempotency_key = match self.idempotency_key.as_deref().or(header_key) {
            Some(raw) => raw
                .parse::<IdempotencyKey>()
                .map_err(errors::domain_error_to_response)?,
            None => IdempotencyKey::new(),
        };

        Transfer::new(from, to, currency, self.amount, idempotency_key)
            .map_err(errors::domain_error_to_response)
    }
}

#[derive(Debug, Deserialize)]
pub struct RatesQuery {
    /// Comma-separated base currencies, e.g. `USD,EUR`.
    pub currencies: String,
}

impl RatesQuery {
    pub fn parse_codes(&self) -> Result<Vec<CurrencyCode>, axum::response::Response> {
        let codes = self
            .currencies
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(CurrencyCode::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(errors::domain_error_to_response)?;

        if codes.is_empty() {
            return Err(errors::json_error(
                axum::http::StatusCode::BAD_REQUEST,
                "validation_error",
                "at least one currency is required",
            ));
        }
        Ok(codes)
    }
}

// -------------------------
// Response DTOs
// -------------------------

/// One entry of a batch rate lookup: either the rates or why they are missing.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RateEntry {
    Rates { rates: BTreeMap<String, String> },
    Error { error: String },
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub rate_provider: CircuitSnapshot,
}
