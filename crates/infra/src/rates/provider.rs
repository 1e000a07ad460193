//! Remote rate provider boundary and its HTTP implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use smalledger_core::{ConversionRate, CurrencyCode};

use crate::resilience::{ClientError, ResilientClient};

#[derive(Debug, Error)]
pub enum RateError {
    /// The resilient client gave up (circuit open, transport, 5xx, cancelled).
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Non-2xx status that the client does not retry (4xx).
    #[error("rate provider answered {status} for {currency}")]
    RemoteStatus {
        currency: CurrencyCode,
        status: StatusCode,
    },

    #[error("malformed rate payload for {currency}: {reason}")]
    Decode {
        currency: CurrencyCode,
        reason: String,
    },
}

impl RateError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RateError::Client(ClientError::CircuitOpen(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RateError::Client(ClientError::Cancelled))
    }
}

/// Source of conversion rates for a base currency.
#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn fetch_rates(
        &self,
        currency: &CurrencyCode,
        cancel: &CancellationToken,
    ) -> Result<ConversionRate, RateError>;
}

#[async_trait]
impl<T: RateProvider + ?Sized> RateProvider for Arc<T> {
    async fn fetch_rates(
        &self,
        currency: &CurrencyCode,
        cancel: &CancellationToken,
    ) -> Result<ConversionRate, RateError> {
        (**self).fetch_rates(currency, cancel).await
    }
}

/// `GET {base_url}/{CODE}` returning `{"rates": {"EUR": "0.92", ...}}`.
///
/// Rates may arrive as JSON strings or numbers; both are kept as decimal text.
#[derive(Debug, Clone)]
pub struct HttpRateProvider {
    client: ResilientClient,
    base_url: String,
}

impl HttpRateProvider {
    pub fn new(client: ResilientClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    fn url_for(&self, currency: &CurrencyCode) -> String {
        format!("{}/{}", self.base_url, currency)
    }
}

#[derive(Deserialize)]
struct RatesPayload {
    #[serde(alias = "conversion_rates")]
    rates: BTreeMap<String, RateValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RateValue {
    Text(String),
    Number(serde_json::Number),
}

impl RateValue {
    fn into_text(self) -> String {
        match self {
            RateValue::Text(s) => s,
            RateValue::Number(n) => n.to_string(),
        }
    }
}

pub(crate) fn decode_rates(currency: &CurrencyCode, body: &[u8]) -> Result<ConversionRate, RateError> {
    let payload: RatesPayload = serde_json::from_slice(body).map_err(|e| RateError::Decode {
        currency: currency.clone(),
        reason: e.to_string(),
    })?;

    let rates = payload
        .rates
        .into_iter()
        .map(|(code, value)| (code.to_ascii_uppercase(), value.into_text()))
        .collect();

    Ok(ConversionRate::new(currency.clone(), rates))
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    #[instrument(skip(self, cancel), fields(currency = %currency))]
    async fn fetch_rates(
        &self,
        currency: &CurrencyCode,
        cancel: &CancellationToken,
    ) -> Result<ConversionRate, RateError> {
        let url = self.url_for(currency);
        let response = self.client.get(&url, cancel).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RateError::RemoteStatus {
                currency: currency.clone(),
                status,
            });
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled.into()),
            body = response.bytes() => body.map_err(|e| RateError::Decode {
                currency: currency.clone(),
                reason: format!("failed to read body: {e}"),
            })?,
        };

        let rate = decode_rates(currency, &body)?;
        debug!(quoted = rate.rates.len(), "fetched conversion rates");
        Ok(rate)
    }
}
