//! Currency codes and conversion rates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// ISO-4217 style currency code: three ASCII letters, stored upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(format!(
                "currency code must be three letters, got {raw:?}"
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for CurrencyCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(value: CurrencyCode) -> Self {
        value.0
    }
}

/// Conversion rates quoted against one base currency.
///
/// Rates are kept as decimal strings exactly as the provider sent them; this
/// crate never does arithmetic on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRate {
    pub currency: CurrencyCode,
    pub rates: BTreeMap<String, String>,
}

impl ConversionRate {
    pub fn new(currency: CurrencyCode, rates: BTreeMap<String, String>) -> Self {
        Self { currency, rates }
    }

    /// Rate from `self.currency` into `target`, if quoted.
    pub fn rate_for(&self, target: &CurrencyCode) -> Option<&str> {
        self.rates.get(target.as_str()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_normalized_to_upper_case() {
        let code = CurrencyCode::parse(" usd ").unwrap();
        assert_eq!(code.as_str(), "USD");
    }

    #[test]
    fn rejects_wrong_length_and_non_letters() {
        assert!(CurrencyCode::parse("US").is_err());
        assert!(CurrencyCode::parse("USDT").is_err());
        assert!(CurrencyCode::parse("U5D").is_err());
        assert!(CurrencyCode::parse("").is_err());
    }

    #[test]
    fn deserializing_validates() {
        let ok: CurrencyCode = serde_json::from_str("\"eur\"").unwrap();
        assert_eq!(ok.as_str(), "EUR");
        assert!(serde_json::from_str::<CurrencyCode>("\"euro\"").is_err());
    }

    #[test]
    fn rate_lookup_uses_normalized_code() {
        let mut rates = BTreeMap::new();
        rates.insert("EUR".to_string(), "0.92".to_string());
        let rate = ConversionRate::new(CurrencyCode::parse("USD").unwrap(), rates);

        assert_eq!(rate.rate_for(&CurrencyCode::parse("eur").unwrap()), Some("0.92"));
        assert_eq!(rate.rate_for(&CurrencyCode::parse("GBP").unwrap()), None);
    }
}
